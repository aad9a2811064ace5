//! Placeholder records and on-disk state flags.

use bitflags::bitflags;
use super::entry::FileAttributes;

/// Maximum length of a content or provider identifier.
pub const PLACEHOLDER_ID_LENGTH: usize = 128;

/// An opaque provider-chosen identifier token, at most [`PLACEHOLDER_ID_LENGTH`] bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PlaceholderId(Vec<u8>);

impl PlaceholderId {
    /// Creates an identifier, truncating anything past the maximum length.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        let mut bytes = bytes.into();
        if bytes.len() > PLACEHOLDER_ID_LENGTH {
            tracing::warn!(
                "placeholder id of {} bytes truncated to {}",
                bytes.len(),
                PLACEHOLDER_ID_LENGTH
            );
            bytes.truncate(PLACEHOLDER_ID_LENGTH);
        }
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Zero-padded fixed-size form used by the engine's version info.
    pub fn to_fixed(&self) -> [u8; PLACEHOLDER_ID_LENGTH] {
        let mut fixed = [0u8; PLACEHOLDER_ID_LENGTH];
        fixed[..self.0.len()].copy_from_slice(&self.0);
        fixed
    }

    /// Reads an identifier back from its fixed-size form, dropping trailing zeros.
    pub fn from_fixed(fixed: &[u8; PLACEHOLDER_ID_LENGTH]) -> Self {
        let len = fixed.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        Self(fixed[..len].to_vec())
    }
}

impl From<&[u8]> for PlaceholderId {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }
}

/// Basic file metadata written into a placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileBasicInfo {
    pub is_directory: bool,
    pub file_size: i64,
    pub creation_time: i64,
    pub last_access_time: i64,
    pub last_write_time: i64,
    pub change_time: i64,
    pub file_attributes: FileAttributes,
}

/// Engine-ready representation of a layer entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderRecord {
    pub basic_info: FileBasicInfo,
    pub content_id: PlaceholderId,
    pub provider_id: PlaceholderId,
    pub symlink_target: Option<String>,
}

bitflags! {
    /// On-disk state of a file under the virtualization root.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OnDiskFileState: u32 {
        const PLACEHOLDER          = 0x01;
        const HYDRATED_PLACEHOLDER = 0x02;
        const DIRTY_PLACEHOLDER    = 0x04;
        const FULL                 = 0x08;
        const TOMBSTONE            = 0x10;
    }
}

bitflags! {
    /// States an update or delete is allowed to discard.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct UpdateType: u32 {
        const ALLOW_DIRTY_METADATA = 0x01;
        const ALLOW_DIRTY_DATA     = 0x02;
        const ALLOW_TOMBSTONE      = 0x04;
        const RESERVED1            = 0x08;
        const RESERVED2            = 0x10;
        const ALLOW_READ_ONLY      = 0x20;
    }
}

bitflags! {
    /// Why an update or delete was refused.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct UpdateFailureCause: u32 {
        const DIRTY_METADATA = 0x01;
        const DIRTY_DATA     = 0x02;
        const TOMBSTONE      = 0x04;
        const READ_ONLY      = 0x08;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_id_truncates() {
        let id = PlaceholderId::new(vec![7u8; 200]);
        assert_eq!(id.as_bytes().len(), PLACEHOLDER_ID_LENGTH);
    }

    #[test]
    fn test_placeholder_id_fixed_form() {
        let id = PlaceholderId::new(b"v1".to_vec());
        let fixed = id.to_fixed();
        assert_eq!(&fixed[..2], b"v1");
        assert!(fixed[2..].iter().all(|&b| b == 0));
        assert_eq!(PlaceholderId::from_fixed(&fixed), id);
    }

    #[test]
    fn test_empty_placeholder_id() {
        let id = PlaceholderId::default();
        assert!(id.is_empty());
        assert_eq!(PlaceholderId::from_fixed(&id.to_fixed()), id);
    }
}
