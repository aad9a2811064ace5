//! Virtualization lifecycle manager.
//!
//! Owns the running state of one virtualization instance and wraps every engine
//! command the provider needs. Commands that act on a running instance fail
//! with `NotStarted` before [`VirtualizationInstance::start`] and after
//! [`VirtualizationInstance::stop`].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use parking_lot::RwLock;
use uuid::Uuid;
use crate::engine::{
    ApiLevel, CommandCompletion, DirectoryBufferHandle, InstanceInfo, ProviderCallbacks, StartOptions,
    UpdateFailure, VirtualizationEngine, WriteBuffer,
};
use crate::error::{ReflectError, Result};
use crate::status::HResult;
use crate::types::notification::NotificationType;
use crate::types::placeholder::{
    OnDiskFileState, PlaceholderId, PlaceholderRecord, UpdateFailureCause, UpdateType,
};

/// A write buffer covering an aligned range of the file.
#[derive(Debug)]
pub struct AlignedWriteBuffer {
    pub buffer: WriteBuffer,
    pub aligned_offset: u64,
    pub aligned_length: u32,
}

/// Expands `[offset, offset + length)` outward to `alignment` boundaries.
///
/// An alignment of 0 or 1 leaves the range untouched.
pub fn align_range(offset: u64, length: u32, alignment: u32) -> (u64, u32) {
    let alignment = u64::from(alignment.max(1));
    let mask = !(alignment - 1);

    let aligned_offset = offset & mask;
    let end = offset.saturating_add(u64::from(length));
    let aligned_end = end.saturating_add(alignment - 1) & mask;
    let aligned_length = u32::try_from(aligned_end - aligned_offset).unwrap_or(u32::MAX);

    (aligned_offset, aligned_length)
}

/// One virtualization instance rooted at the scratch directory.
pub struct VirtualizationInstance {
    root: PathBuf,
    engine: Arc<dyn VirtualizationEngine>,
    options: StartOptions,
    running: RwLock<Option<InstanceInfo>>,
}

impl VirtualizationInstance {
    pub fn new(root: impl Into<PathBuf>, engine: Arc<dyn VirtualizationEngine>, options: StartOptions) -> Self {
        Self {
            root: root.into(),
            engine,
            options,
            running: RwLock::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn api_level(&self) -> ApiLevel {
        self.engine.api_level()
    }

    pub fn options(&self) -> &StartOptions {
        &self.options
    }

    /// Makes sure the root directory exists and is marked as a virtualization
    /// root. Returns the id it was marked with, or `None` if it already was one.
    pub fn prepare_root(&self) -> Result<Option<Uuid>> {
        if !self.root.exists() {
            fs::create_dir_all(&self.root)?;
            tracing::info!("Created virtualization root {:?}", self.root);
        } else if !self.root.is_dir() {
            return Err(ReflectError::engine("MarkDirectoryAsVirtualizationRoot", HResult::Directory));
        } else if self
            .engine
            .is_virtualization_root(&self.root)
            .map_err(|status| ReflectError::engine("IsVirtualizationRoot", status))?
        {
            tracing::debug!("{:?} is already a virtualization root", self.root);
            return Ok(None);
        }

        let instance_id = Uuid::new_v4();
        self.engine
            .mark_directory_as_virtualization_root(&self.root, instance_id)
            .map_err(|status| ReflectError::engine("MarkDirectoryAsVirtualizationRoot", status))?;
        tracing::info!("Marked {:?} as virtualization root {}", self.root, instance_id);

        Ok(Some(instance_id))
    }

    /// Starts virtualizing and records the instance identity.
    pub fn start(&self, callbacks: Arc<dyn ProviderCallbacks>) -> Result<InstanceInfo> {
        // Held across the engine call so early callbacks wait for the instance info.
        let mut running = self.running.write();
        if running.is_some() {
            return Err(ReflectError::AlreadyInitialized);
        }

        if self.api_level() == ApiLevel::Beta {
            tracing::error!("Only the deprecated ProjFS entry points are available on this system");
            return Err(ReflectError::engine("StartVirtualizing", HResult::VirtualizationUnavailable));
        }

        self.engine
            .start_virtualizing(&self.root, callbacks, &self.options)
            .map_err(|status| ReflectError::engine("StartVirtualizing", status))?;

        match self.engine.instance_info() {
            Ok(info) => {
                tracing::info!(
                    "Virtualization instance {} started, write alignment {}",
                    info.instance_id,
                    info.write_alignment
                );
                *running = Some(info);
                Ok(info)
            }
            Err(status) => {
                self.engine.stop_virtualizing();
                Err(ReflectError::engine("GetVirtualizationInstanceInfo", status))
            }
        }
    }

    /// Stops virtualizing. Fails if the instance is not running.
    pub fn stop(&self) -> Result<()> {
        let info = self.running.write().take().ok_or(ReflectError::NotStarted)?;
        self.engine.stop_virtualizing();
        tracing::info!("Virtualization instance {} stopped", info.instance_id);
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.running.read().is_some()
    }

    pub fn instance_info(&self) -> Result<InstanceInfo> {
        (*self.running.read()).ok_or(ReflectError::NotStarted)
    }

    pub fn instance_id(&self) -> Result<Uuid> {
        self.instance_info().map(|info| info.instance_id)
    }

    pub fn write_placeholder_info(&self, relative_path: &str, record: &PlaceholderRecord) -> Result<()> {
        self.instance_info()?;
        self.engine
            .write_placeholder_info(relative_path, record)
            .map_err(|status| ReflectError::engine("WritePlaceholderInfo", status))
    }

    /// Symlink-aware placeholder write. Only available at the additional API level.
    pub fn write_placeholder_info2(&self, relative_path: &str, record: &PlaceholderRecord) -> Result<()> {
        self.instance_info()?;
        if !self.api_level().supports_symlinks() {
            return Err(ReflectError::engine("WritePlaceholderInfo2", HResult::VirtualizationUnavailable));
        }
        self.engine
            .write_placeholder_info2(relative_path, record)
            .map_err(|status| ReflectError::engine("WritePlaceholderInfo2", status))
    }

    pub fn create_write_buffer(&self, size: u32) -> Result<WriteBuffer> {
        self.instance_info()?;
        let size = usize::try_from(size).map_err(|_| ReflectError::engine("AllocateAlignedBuffer", HResult::InvalidArg))?;
        self.engine
            .allocate_aligned_buffer(size)
            .map_err(|status| ReflectError::engine("AllocateAlignedBuffer", status))
    }

    /// Allocates a buffer for `length` bytes at `byte_offset`, widened to the
    /// instance's write alignment.
    pub fn create_write_buffer_aligned(&self, byte_offset: u64, length: u32) -> Result<AlignedWriteBuffer> {
        let info = self.instance_info()?;
        let (aligned_offset, aligned_length) = align_range(byte_offset, length, info.write_alignment);
        let buffer = self.create_write_buffer(aligned_length)?;

        Ok(AlignedWriteBuffer {
            buffer,
            aligned_offset,
            aligned_length,
        })
    }

    pub fn write_file_data(
        &self,
        data_stream_id: Uuid,
        buffer: &WriteBuffer,
        byte_offset: u64,
        length: u32,
    ) -> Result<()> {
        self.instance_info()?;
        if usize::try_from(length).map_or(true, |len| len > buffer.len()) {
            return Err(ReflectError::engine("WriteFileData", HResult::InvalidArg));
        }
        self.engine
            .write_file_data(data_stream_id, buffer, byte_offset, length)
            .map_err(|status| ReflectError::engine("WriteFileData", status))
    }

    pub fn delete_file(&self, relative_path: &str, update_flags: UpdateType) -> std::result::Result<(), UpdateFailure> {
        self.require_running_for_update()?;
        self.engine.delete_file(relative_path, update_flags)
    }

    pub fn update_file_if_needed(
        &self,
        relative_path: &str,
        record: &PlaceholderRecord,
        update_flags: UpdateType,
    ) -> std::result::Result<(), UpdateFailure> {
        self.require_running_for_update()?;
        self.engine.update_file_if_needed(relative_path, record, update_flags)
    }

    /// Purges the engine's negative path cache and returns how many entries it held.
    pub fn clear_negative_path_cache(&self) -> Result<u32> {
        self.instance_info()?;
        if !self.options.enable_negative_path_cache {
            tracing::warn!("Clearing negative path cache on an instance started without one");
        }
        self.engine
            .clear_negative_path_cache()
            .map_err(|status| ReflectError::engine("ClearNegativePathCache", status))
    }

    pub fn complete_command(&self, command_id: i32, status: HResult) -> Result<()> {
        self.complete(command_id, CommandCompletion::Plain(status))
    }

    pub fn complete_command_with_enumeration(&self, command_id: i32, handle: DirectoryBufferHandle) -> Result<()> {
        self.complete(command_id, CommandCompletion::WithEnumeration(HResult::Ok, handle))
    }

    pub fn complete_command_with_mask(&self, command_id: i32, notification_mask: NotificationType) -> Result<()> {
        self.complete(
            command_id,
            CommandCompletion::WithNotificationMask(HResult::Ok, notification_mask),
        )
    }

    /// Converts an existing directory under the root into a hydrated placeholder.
    pub fn mark_directory_as_placeholder(
        &self,
        target: &Path,
        content_id: &PlaceholderId,
        provider_id: &PlaceholderId,
    ) -> Result<()> {
        let info = self.instance_info()?;
        self.engine
            .mark_directory_as_placeholder(&self.root, target, content_id, provider_id, info.instance_id)
            .map_err(|status| ReflectError::engine("MarkDirectoryAsPlaceholder", status))
    }

    /// On-disk state of a file under the root. Works whether or not the instance runs.
    pub fn on_disk_file_state(&self, full_path: &Path) -> Result<OnDiskFileState> {
        self.engine
            .on_disk_file_state(full_path)
            .map_err(|status| ReflectError::engine("GetOnDiskFileState", status))
    }

    fn complete(&self, command_id: i32, completion: CommandCompletion) -> Result<()> {
        self.instance_info()?;
        self.engine
            .complete_command(command_id, completion)
            .map_err(|status| ReflectError::engine("CompleteCommand", status))
    }

    fn require_running_for_update(&self) -> std::result::Result<(), UpdateFailure> {
        if self.is_started() {
            Ok(())
        } else {
            Err(UpdateFailure {
                status: HResult::Handle,
                cause: UpdateFailureCause::empty(),
            })
        }
    }
}

impl std::fmt::Debug for VirtualizationInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualizationInstance")
            .field("root", &self.root)
            .field("api_level", &self.api_level())
            .field("running", &*self.running.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_range() {
        assert_eq!(align_range(0, 100, 512), (0, 512));
        assert_eq!(align_range(600, 100, 512), (512, 512));
        assert_eq!(align_range(500, 100, 512), (0, 1024));
        assert_eq!(align_range(1024, 512, 512), (1024, 512));
        assert_eq!(align_range(7, 3, 0), (7, 3));
        assert_eq!(align_range(7, 3, 1), (7, 3));
    }
}
