//! Layer entry metadata.

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use bitflags::bitflags;

bitflags! {
    /// Platform file attribute bits as the host engine expects them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FileAttributes: u32 {
        const READONLY      = 0x0000_0001;
        const HIDDEN        = 0x0000_0002;
        const SYSTEM        = 0x0000_0004;
        const DIRECTORY     = 0x0000_0010;
        const ARCHIVE       = 0x0000_0020;
        const NORMAL        = 0x0000_0080;
        const REPARSE_POINT = 0x0000_0400;
    }
}

/// Converts a `SystemTime` into FILETIME ticks (100ns intervals since 1601-01-01 UTC).
pub fn filetime_from_system_time(time: SystemTime) -> i64 {
    const FILETIME_UNIX_DIFF_SECS: u64 = 11_644_473_600;
    const INTERVALS_PER_SEC: u64 = 10_000_000;

    let duration: Duration = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);

    let intervals = duration.as_secs() * INTERVALS_PER_SEC
        + duration.subsec_nanos() as u64 / 100
        + FILETIME_UNIX_DIFF_SECS * INTERVALS_PER_SEC;

    intervals as i64
}

/// One file or directory found in the layer tree.
///
/// Produced per enumeration or placeholder lookup and never persisted.
/// Timestamps are FILETIME ticks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerEntry {
    pub name: String,
    pub full_path: PathBuf,
    /// Always 0 for directories.
    pub size: u64,
    pub is_directory: bool,
    pub creation_time: i64,
    pub last_access_time: i64,
    pub last_write_time: i64,
    pub change_time: i64,
    pub attributes: FileAttributes,
}

impl LayerEntry {
    /// Creates an entry, forcing the size and directory bit to agree with `is_directory`.
    pub fn new(
        name: impl Into<String>,
        full_path: impl Into<PathBuf>,
        is_directory: bool,
        size: u64,
        attributes: FileAttributes,
    ) -> Self {
        let mut attributes = attributes;
        attributes.set(FileAttributes::DIRECTORY, is_directory);

        Self {
            name: name.into(),
            full_path: full_path.into(),
            size: if is_directory { 0 } else { size },
            is_directory,
            creation_time: 0,
            last_access_time: 0,
            last_write_time: 0,
            change_time: 0,
            attributes,
        }
    }

    /// Sets the timestamps. The change time follows the last write time.
    pub fn with_times(mut self, creation: i64, last_access: i64, last_write: i64) -> Self {
        self.creation_time = creation;
        self.last_access_time = last_access;
        self.last_write_time = last_write;
        self.change_time = last_write;
        self
    }

    pub fn is_reparse_point(&self) -> bool {
        self.attributes.contains(FileAttributes::REPARSE_POINT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_forces_size_and_attribute() {
        let entry = LayerEntry::new("img", "/layer/img", true, 4096, FileAttributes::NORMAL);
        assert_eq!(entry.size, 0);
        assert!(entry.attributes.contains(FileAttributes::DIRECTORY));
    }

    #[test]
    fn test_file_clears_directory_attribute() {
        let entry = LayerEntry::new(
            "readme.txt",
            "/layer/readme.txt",
            false,
            10,
            FileAttributes::DIRECTORY | FileAttributes::READONLY,
        );
        assert_eq!(entry.size, 10);
        assert!(!entry.attributes.contains(FileAttributes::DIRECTORY));
        assert!(entry.attributes.contains(FileAttributes::READONLY));
    }

    #[test]
    fn test_change_time_follows_last_write() {
        let entry = LayerEntry::new("a", "/a", false, 1, FileAttributes::NORMAL).with_times(1, 2, 3);
        assert_eq!(entry.creation_time, 1);
        assert_eq!(entry.last_access_time, 2);
        assert_eq!(entry.last_write_time, 3);
        assert_eq!(entry.change_time, 3);
    }

    #[test]
    fn test_filetime_epoch() {
        assert_eq!(filetime_from_system_time(UNIX_EPOCH), 116_444_736_000_000_000);
        let later = UNIX_EPOCH + Duration::from_secs(1);
        assert_eq!(filetime_from_system_time(later), 116_444_736_010_000_000);
    }
}
