//! Read-only access to the layer tree.
//!
//! Paths handed in by the engine are relative to the virtualization root and
//! may use either separator. Missing files and directories are reported as
//! absence, never as errors that abort an enumeration.

use std::fs::{self, File, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use crate::error::{ReflectError, Result};
use crate::naming::NameCollation;
use crate::types::entry::{filetime_from_system_time, FileAttributes, LayerEntry};

fn is_separator(c: char) -> bool {
    c == '\\' || c == '/'
}

/// Splits a root-relative path into its components.
///
/// Returns `None` for paths that climb out of the root.
pub fn split_relative(relative_path: &str) -> Option<Vec<&str>> {
    let mut components = Vec::new();
    for component in relative_path.split(is_separator) {
        match component {
            "" | "." => {}
            ".." => return None,
            name => components.push(name),
        }
    }
    Some(components)
}

/// Splits a root-relative path into its parent path and final component.
pub fn split_parent(relative_path: &str) -> (&str, &str) {
    let trimmed = relative_path.trim_end_matches(is_separator);
    match trimmed.rfind(is_separator) {
        Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
        None => ("", trimmed),
    }
}

/// Replaces the final component of `relative_path` with `name`, keeping the
/// caller's parent path and separator byte-for-byte.
pub fn with_file_name(relative_path: &str, name: &str) -> String {
    let trimmed = relative_path.trim_end_matches(is_separator);
    match trimmed.rfind(is_separator) {
        Some(idx) => format!("{}{}", &trimmed[..=idx], name),
        None => name.to_string(),
    }
}

/// Read-only wrapper over the layer root.
pub struct LayerAccessor {
    root: PathBuf,
    collation: Arc<dyn NameCollation>,
}

impl LayerAccessor {
    pub fn new(root: impl Into<PathBuf>, collation: Arc<dyn NameCollation>) -> Self {
        Self {
            root: root.into(),
            collation,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn collation(&self) -> &Arc<dyn NameCollation> {
        &self.collation
    }

    /// Maps a root-relative path onto the layer.
    pub fn resolve(&self, relative_path: &str) -> Option<PathBuf> {
        let components = split_relative(relative_path)?;
        let mut path = self.root.clone();
        path.extend(components);
        Some(path)
    }

    pub fn file_exists(&self, relative_path: &str) -> bool {
        self.resolve(relative_path).is_some_and(|p| p.is_file())
    }

    pub fn directory_exists(&self, relative_path: &str) -> bool {
        self.resolve(relative_path).is_some_and(|p| p.is_dir())
    }

    /// Looks up one entry by scanning its parent directory with the name-match
    /// predicate, so the returned name is the one stored in the layer.
    pub fn get_entry(&self, relative_path: &str) -> Option<LayerEntry> {
        let (parent, name) = split_parent(relative_path);
        if name.is_empty() {
            return None;
        }
        self.list_children(parent)
            .find(|entry| self.collation.matches(&entry.name, name))
    }

    /// Lists the immediate children of a layer directory.
    ///
    /// The sequence is empty when the directory does not exist. Children whose
    /// metadata cannot be read are skipped.
    pub fn list_children(&self, relative_path: &str) -> impl Iterator<Item = LayerEntry> {
        let entries = self
            .resolve(relative_path)
            .and_then(|dir| fs::read_dir(dir).ok());

        entries
            .into_iter()
            .flatten()
            .filter_map(|dir_entry| dir_entry.ok())
            .filter_map(|dir_entry| {
                let name = dir_entry.file_name().to_string_lossy().into_owned();
                match entry_from_path(name, dir_entry.path()) {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        tracing::warn!("Skipping unreadable layer entry {:?}: {}", dir_entry.path(), e);
                        None
                    }
                }
            })
    }

    /// Opens a layer file for sequential reading.
    pub fn open_for_read(&self, relative_path: &str) -> Result<File> {
        let not_found = || ReflectError::NotFound {
            path: relative_path.to_string(),
        };
        let path = self.resolve(relative_path).ok_or_else(not_found)?;
        File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => not_found(),
            _ => ReflectError::from(e),
        })
    }

    /// Reads the raw target of a reparse point in the layer.
    pub fn reparse_target(&self, full_path: &Path) -> io::Result<PathBuf> {
        fs::read_link(full_path)
    }
}

/// Builds a layer entry from the file at `full_path` without following symlinks.
pub fn entry_from_path(name: String, full_path: PathBuf) -> io::Result<LayerEntry> {
    let link_metadata = fs::symlink_metadata(&full_path)?;
    let is_symlink = link_metadata.file_type().is_symlink();

    // Symlinks keep their own identity but report the target's kind and size.
    let metadata = if is_symlink {
        fs::metadata(&full_path).unwrap_or_else(|_| link_metadata.clone())
    } else {
        link_metadata.clone()
    };

    let attributes = platform_attributes(&link_metadata, &metadata, is_symlink);
    let is_directory = attributes.contains(FileAttributes::DIRECTORY);

    let last_write = metadata.modified().ok().map(filetime_from_system_time).unwrap_or(0);
    let last_access = metadata
        .accessed()
        .ok()
        .map(filetime_from_system_time)
        .unwrap_or(last_write);
    let creation = metadata
        .created()
        .ok()
        .map(filetime_from_system_time)
        .unwrap_or(last_write);

    Ok(LayerEntry::new(name, full_path, is_directory, metadata.len(), attributes)
        .with_times(creation, last_access, last_write))
}

#[cfg(windows)]
fn platform_attributes(link_metadata: &Metadata, _metadata: &Metadata, _is_symlink: bool) -> FileAttributes {
    use std::os::windows::fs::MetadataExt;
    FileAttributes::from_bits_retain(link_metadata.file_attributes())
}

#[cfg(not(windows))]
fn platform_attributes(link_metadata: &Metadata, metadata: &Metadata, is_symlink: bool) -> FileAttributes {
    let mut attributes = FileAttributes::empty();
    if metadata.is_dir() {
        attributes |= FileAttributes::DIRECTORY;
    }
    if is_symlink {
        attributes |= FileAttributes::REPARSE_POINT;
    }
    if link_metadata.permissions().readonly() {
        attributes |= FileAttributes::READONLY;
    }
    if attributes.is_empty() {
        attributes = FileAttributes::NORMAL;
    }
    attributes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::DefaultCollation;
    use std::io::Read;
    use tempfile::TempDir;

    fn layer() -> (TempDir, LayerAccessor) {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("docs/img")).unwrap();
        fs::write(dir.path().join("docs/readme.txt"), b"0123456789").unwrap();
        let accessor = LayerAccessor::new(dir.path(), Arc::new(DefaultCollation));
        (dir, accessor)
    }

    #[test]
    fn test_split_relative() {
        assert_eq!(split_relative("docs\\img").unwrap(), vec!["docs", "img"]);
        assert_eq!(split_relative("docs/./img/").unwrap(), vec!["docs", "img"]);
        assert!(split_relative("").unwrap().is_empty());
        assert!(split_relative("docs\\..\\..\\etc").is_none());
    }

    #[test]
    fn test_split_parent() {
        assert_eq!(split_parent("docs\\readme.txt"), ("docs", "readme.txt"));
        assert_eq!(split_parent("a/b/c"), ("a/b", "c"));
        assert_eq!(split_parent("top"), ("", "top"));
    }

    #[test]
    fn test_with_file_name_keeps_parent() {
        assert_eq!(with_file_name("Docs\\README.TXT", "readme.txt"), "Docs\\readme.txt");
        assert_eq!(with_file_name("README.TXT", "readme.txt"), "readme.txt");
    }

    #[test]
    fn test_exists() {
        let (_dir, layer) = layer();
        assert!(layer.file_exists("docs\\readme.txt"));
        assert!(!layer.file_exists("docs\\img"));
        assert!(layer.directory_exists("docs/img"));
        assert!(!layer.directory_exists("docs/readme.txt"));
        assert!(!layer.file_exists("missing.txt"));
    }

    #[test]
    fn test_get_entry_matches_case_insensitively() {
        let (_dir, layer) = layer();
        let entry = layer.get_entry("docs\\README.TXT").unwrap();
        assert_eq!(entry.name, "readme.txt");
        assert_eq!(entry.size, 10);
        assert!(!entry.is_directory);

        let entry = layer.get_entry("docs/img").unwrap();
        assert!(entry.is_directory);
        assert_eq!(entry.size, 0);
        assert!(entry.attributes.contains(FileAttributes::DIRECTORY));
    }

    #[test]
    fn test_get_entry_missing_parent() {
        let (_dir, layer) = layer();
        assert!(layer.get_entry("nope\\readme.txt").is_none());
        assert!(layer.get_entry("docs\\nope.txt").is_none());
        assert!(layer.get_entry("").is_none());
    }

    #[test]
    fn test_list_children_missing_directory_is_empty() {
        let (_dir, layer) = layer();
        assert_eq!(layer.list_children("missing").count(), 0);
        assert_eq!(layer.list_children("docs").count(), 2);
        assert_eq!(layer.list_children("").count(), 1);
    }

    #[test]
    fn test_open_for_read() {
        let (_dir, layer) = layer();
        let mut contents = String::new();
        layer
            .open_for_read("docs\\readme.txt")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "0123456789");

        assert!(matches!(
            layer.open_for_read("docs\\missing.txt"),
            Err(ReflectError::NotFound { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_is_reparse_point() {
        let (dir, layer) = layer();
        std::os::unix::fs::symlink(dir.path().join("docs/readme.txt"), dir.path().join("link")).unwrap();

        let entry = layer.get_entry("link").unwrap();
        assert!(entry.is_reparse_point());
        assert!(!entry.is_directory);
        assert_eq!(layer.reparse_target(&entry.full_path).unwrap(), dir.path().join("docs/readme.txt"));
    }
}
