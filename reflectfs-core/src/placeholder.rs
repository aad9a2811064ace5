//! Placeholder translation and symlink target resolution.
//!
//! A layer entry becomes a [`PlaceholderRecord`] for the engine. Reparse points
//! carry their target along; absolute targets that point into the layer are
//! rewritten to point at the same place under the scratch root.

use std::path::{Component, Path, PathBuf};
use crate::engine::{ApiLevel, DirectoryEntrySink};
use crate::error::{ReflectError, Result};
use crate::instance::VirtualizationInstance;
use crate::layer::LayerAccessor;
use crate::types::entry::LayerEntry;
use crate::types::placeholder::{FileBasicInfo, PlaceholderId, PlaceholderRecord};

/// Builds the engine-ready record for a layer entry.
pub fn translate(entry: &LayerEntry, content_id: PlaceholderId, provider_id: PlaceholderId) -> PlaceholderRecord {
    PlaceholderRecord {
        basic_info: basic_info(entry),
        content_id,
        provider_id,
        symlink_target: None,
    }
}

/// Basic metadata of a layer entry in the engine's layout.
pub fn basic_info(entry: &LayerEntry) -> FileBasicInfo {
    FileBasicInfo {
        is_directory: entry.is_directory,
        file_size: i64::try_from(entry.size).unwrap_or(i64::MAX),
        creation_time: entry.creation_time,
        last_access_time: entry.last_access_time,
        last_write_time: entry.last_write_time,
        change_time: entry.change_time,
        file_attributes: entry.attributes,
    }
}

/// Reads the target of a reparse-point entry and maps it into the scratch tree.
///
/// Returns `None` for entries that are not reparse points. Relative targets
/// are returned unchanged. Rooted targets are made relative to `layer_root`,
/// joined onto `scratch_root` and normalized.
pub fn resolve_symlink_target_if_needed(
    layer: &LayerAccessor,
    entry: &LayerEntry,
    full_layer_path: &Path,
    layer_root: &Path,
    scratch_root: &Path,
) -> Result<Option<String>> {
    if !entry.is_reparse_point() {
        return Ok(None);
    }

    let target = layer
        .reparse_target(full_layer_path)
        .map_err(|source| ReflectError::SymlinkTarget {
            path: full_layer_path.display().to_string(),
            source,
        })?;

    if !target.has_root() {
        return Ok(Some(target.to_string_lossy().into_owned()));
    }

    let relative = relative_to(&target, layer_root);
    let rewritten = normalize_lexically(&scratch_root.join(relative));
    tracing::debug!("Symlink {:?} -> {:?} rewritten to {:?}", full_layer_path, target, rewritten);

    Ok(Some(rewritten.to_string_lossy().into_owned()))
}

/// Path of `target` relative to the directory `base`, climbing with `..`
/// where the two diverge. Both are normalized first.
pub fn relative_to(target: &Path, base: &Path) -> PathBuf {
    let target = normalize_lexically(target);
    let base = normalize_lexically(base);

    let target_components: Vec<Component<'_>> = target.components().collect();
    let base_components: Vec<Component<'_>> = base.components().collect();

    let common = target_components
        .iter()
        .zip(base_components.iter())
        .take_while(|(a, b)| components_equal(a, b))
        .count();

    let mut relative = PathBuf::new();
    for _ in common..base_components.len() {
        relative.push("..");
    }
    for component in &target_components[common..] {
        relative.push(component.as_os_str());
    }
    relative
}

/// Resolves `.` and `..` components without touching the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let can_pop = matches!(normalized.components().next_back(), Some(Component::Normal(_)));
                if can_pop {
                    normalized.pop();
                } else if !normalized.has_root() {
                    normalized.push("..");
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

#[cfg(windows)]
fn components_equal(a: &Component<'_>, b: &Component<'_>) -> bool {
    a.as_os_str().to_string_lossy().to_lowercase() == b.as_os_str().to_string_lossy().to_lowercase()
}

#[cfg(not(windows))]
fn components_equal(a: &Component<'_>, b: &Component<'_>) -> bool {
    a == b
}

/// Writes placeholders and enumeration entries at the engine's capability level.
pub trait PlaceholderWriter: Send + Sync {
    /// Whether records written through this writer carry symlink targets.
    fn supports_symlinks(&self) -> bool;

    fn write_placeholder(
        &self,
        instance: &VirtualizationInstance,
        relative_path: &str,
        record: &PlaceholderRecord,
    ) -> Result<()>;

    /// Appends a record to an enumeration buffer. Returns false when full.
    fn add_entry(&self, sink: &mut dyn DirectoryEntrySink, file_name: &str, record: &PlaceholderRecord) -> bool;
}

/// Writer for engines with symlink placeholder support.
pub struct SymlinkAwareWriter;

impl PlaceholderWriter for SymlinkAwareWriter {
    fn supports_symlinks(&self) -> bool {
        true
    }

    fn write_placeholder(
        &self,
        instance: &VirtualizationInstance,
        relative_path: &str,
        record: &PlaceholderRecord,
    ) -> Result<()> {
        instance.write_placeholder_info2(relative_path, record)
    }

    fn add_entry(&self, sink: &mut dyn DirectoryEntrySink, file_name: &str, record: &PlaceholderRecord) -> bool {
        sink.add_with_symlink(file_name, &record.basic_info, record.symlink_target.as_deref())
    }
}

/// Writer for basic engines. Symlink targets are dropped; the reparse-point
/// attribute bit is passed through as-is.
pub struct BasicWriter;

impl PlaceholderWriter for BasicWriter {
    fn supports_symlinks(&self) -> bool {
        false
    }

    fn write_placeholder(
        &self,
        instance: &VirtualizationInstance,
        relative_path: &str,
        record: &PlaceholderRecord,
    ) -> Result<()> {
        instance.write_placeholder_info(relative_path, record)
    }

    fn add_entry(&self, sink: &mut dyn DirectoryEntrySink, file_name: &str, record: &PlaceholderRecord) -> bool {
        sink.add(file_name, &record.basic_info)
    }
}

/// Picks the writer for an engine capability level.
pub fn writer_for(level: ApiLevel) -> Box<dyn PlaceholderWriter> {
    if level.supports_symlinks() {
        Box::new(SymlinkAwareWriter)
    } else {
        Box::new(BasicWriter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DirectoryBufferHandle;
    use crate::naming::DefaultCollation;
    use crate::types::entry::FileAttributes;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSink {
        added: Vec<(String, Option<String>)>,
    }

    impl DirectoryEntrySink for RecordingSink {
        fn add(&mut self, file_name: &str, _basic_info: &FileBasicInfo) -> bool {
            self.added.push((file_name.to_string(), None));
            true
        }

        fn add_with_symlink(&mut self, file_name: &str, _basic_info: &FileBasicInfo, target: Option<&str>) -> bool {
            self.added.push((file_name.to_string(), target.map(str::to_string)));
            true
        }

        fn handle(&self) -> DirectoryBufferHandle {
            DirectoryBufferHandle(0)
        }
    }

    #[test]
    fn test_translate_copies_metadata() {
        let entry = LayerEntry::new("a.txt", "/l/a.txt", false, 42, FileAttributes::READONLY)
            .with_times(1, 2, 3);
        let record = translate(&entry, PlaceholderId::new(vec![0]), PlaceholderId::new(vec![1]));

        assert_eq!(record.basic_info.file_size, 42);
        assert!(!record.basic_info.is_directory);
        assert_eq!(record.basic_info.creation_time, 1);
        assert_eq!(record.basic_info.last_access_time, 2);
        assert_eq!(record.basic_info.last_write_time, 3);
        assert_eq!(record.basic_info.change_time, 3);
        assert!(record.basic_info.file_attributes.contains(FileAttributes::READONLY));
        assert_eq!(record.content_id.as_bytes(), &[0]);
        assert_eq!(record.provider_id.as_bytes(), &[1]);
        assert_eq!(record.symlink_target, None);
    }

    #[test]
    fn test_normalize_lexically() {
        assert_eq!(normalize_lexically(Path::new("/s/./b/../c")), PathBuf::from("/s/c"));
        assert_eq!(normalize_lexically(Path::new("/../a")), PathBuf::from("/a"));
        assert_eq!(normalize_lexically(Path::new("../a/./b")), PathBuf::from("../a/b"));
    }

    #[test]
    fn test_relative_to() {
        assert_eq!(relative_to(Path::new("/l/b/t.txt"), Path::new("/l")), PathBuf::from("b/t.txt"));
        assert_eq!(relative_to(Path::new("/x/other"), Path::new("/x/l")), PathBuf::from("../other"));
        assert_eq!(relative_to(Path::new("/l"), Path::new("/l")), PathBuf::new());
    }

    #[test]
    fn test_non_reparse_entry_has_no_target() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f.txt"), b"x").unwrap();
        let layer = LayerAccessor::new(dir.path(), Arc::new(DefaultCollation));
        let entry = layer.get_entry("f.txt").unwrap();

        let target = resolve_symlink_target_if_needed(&layer, &entry, &entry.full_path, dir.path(), Path::new("/s"))
            .unwrap();
        assert_eq!(target, None);
    }

    #[cfg(unix)]
    #[test]
    fn test_absolute_target_rewritten_under_scratch() {
        let layer_dir = TempDir::new().unwrap();
        let root = layer_dir.path();
        std::fs::create_dir_all(root.join("a")).unwrap();
        std::fs::create_dir_all(root.join("b")).unwrap();
        std::fs::write(root.join("b/target.txt"), b"t").unwrap();
        std::os::unix::fs::symlink(root.join("b/target.txt"), root.join("a/link")).unwrap();

        let layer = LayerAccessor::new(root, Arc::new(DefaultCollation));
        let entry = layer.get_entry("a/link").unwrap();
        let scratch = Path::new("/scratch");

        let target = resolve_symlink_target_if_needed(&layer, &entry, &entry.full_path, root, scratch).unwrap();
        assert_eq!(target.as_deref(), Some("/scratch/b/target.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_relative_target_unchanged() {
        let layer_dir = TempDir::new().unwrap();
        let root = layer_dir.path();
        std::fs::create_dir_all(root.join("b")).unwrap();
        std::fs::write(root.join("b/target.txt"), b"t").unwrap();
        std::fs::create_dir_all(root.join("a")).unwrap();
        std::os::unix::fs::symlink("../b/./target.txt", root.join("a/link")).unwrap();

        let layer = LayerAccessor::new(root, Arc::new(DefaultCollation));
        let entry = layer.get_entry("a/link").unwrap();

        let target =
            resolve_symlink_target_if_needed(&layer, &entry, &entry.full_path, root, Path::new("/scratch")).unwrap();
        assert_eq!(target.as_deref(), Some("../b/./target.txt"));
    }

    #[test]
    fn test_unreadable_target_is_error() {
        let entry = LayerEntry::new("ghost", "/definitely/not/here", false, 0, FileAttributes::REPARSE_POINT);
        let layer = LayerAccessor::new("/definitely", Arc::new(DefaultCollation));

        let result =
            resolve_symlink_target_if_needed(&layer, &entry, &entry.full_path, Path::new("/definitely"), Path::new("/s"));
        assert!(matches!(result, Err(ReflectError::SymlinkTarget { .. })));
    }

    #[test]
    fn test_writer_selection() {
        assert!(writer_for(ApiLevel::Additional).supports_symlinks());
        assert!(!writer_for(ApiLevel::Release).supports_symlinks());
    }

    #[test]
    fn test_basic_writer_drops_target_keeps_attribute() {
        let entry = LayerEntry::new("link", "/l/link", false, 0, FileAttributes::REPARSE_POINT);
        let mut record = translate(&entry, PlaceholderId::default(), PlaceholderId::default());
        record.symlink_target = Some("/s/x".to_string());

        let mut sink = RecordingSink::default();
        assert!(BasicWriter.add_entry(&mut sink, "link", &record));
        assert!(SymlinkAwareWriter.add_entry(&mut sink, "link", &record));

        assert_eq!(sink.added[0], ("link".to_string(), None));
        assert_eq!(sink.added[1], ("link".to_string(), Some("/s/x".to_string())));
        assert!(record.basic_info.file_attributes.contains(FileAttributes::REPARSE_POINT));
    }
}
