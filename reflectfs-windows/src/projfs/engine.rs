//! `VirtualizationEngine` over ProjectedFSLib.

use std::ffi::c_void;
use std::fs::OpenOptions;
use std::os::windows::fs::OpenOptionsExt;
use std::os::windows::io::AsRawHandle;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;
use log::{debug, info, warn};
use parking_lot::RwLock;
use reflectfs_core::engine::{
    ApiLevel, BufferStorage, CommandCompletion, EngineResult, InstanceInfo, ProviderCallbacks, StartOptions,
    UpdateFailure, VirtualizationEngine, WriteBuffer,
};
use reflectfs_core::types::placeholder::{
    OnDiskFileState, PlaceholderId, PlaceholderRecord, UpdateFailureCause, UpdateType,
};
use reflectfs_core::HResult;
use uuid::Uuid;
use windows::core::{HSTRING, PCWSTR};
use windows::Win32::Foundation::HANDLE;
use windows::Win32::Storage::FileSystem::{
    FileAttributeTagInfo, GetFileInformationByHandleEx, FILE_ATTRIBUTE_REPARSE_POINT, FILE_ATTRIBUTE_TAG_INFO,
    FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OPEN_REPARSE_POINT, FILE_READ_ATTRIBUTES,
};
use windows::Win32::Storage::ProjectedFileSystem::*;
use super::library::{library, FreeAlignedBufferFn, ProjFsLibrary};
use super::{callbacks, convert};
use crate::error::{WindowsError, WindowsResult};

const PLACEHOLDER_INFO_SIZE: u32 = std::mem::size_of::<PRJ_PLACEHOLDER_INFO>() as u32;

/// Reparse tag ProjFS stamps on virtualization roots and placeholders.
const IO_REPARSE_TAG_PROJFS: u32 = 0x9000_001C;

/// Reparse tag of `path` itself (links are not followed), or `None` when it
/// is not a reparse point.
fn reparse_tag(path: &Path) -> WindowsResult<Option<u32>> {
    let file = OpenOptions::new()
        .access_mode(FILE_READ_ATTRIBUTES.0)
        .custom_flags((FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OPEN_REPARSE_POINT).0)
        .open(path)?;

    let mut info = FILE_ATTRIBUTE_TAG_INFO::default();
    unsafe {
        GetFileInformationByHandleEx(
            HANDLE(file.as_raw_handle()),
            FileAttributeTagInfo,
            &mut info as *mut _ as *mut c_void,
            std::mem::size_of::<FILE_ATTRIBUTE_TAG_INFO>() as u32,
        )
    }?;

    if info.FileAttributes & FILE_ATTRIBUTE_REPARSE_POINT.0 == 0 {
        Ok(None)
    } else {
        Ok(Some(info.ReparseTag))
    }
}

/// Running virtualization context and the registry token of its callbacks.
struct Running {
    context: PRJ_NAMESPACE_VIRTUALIZATION_CONTEXT,
    token: usize,
}

// The context is an opaque handle that ProjFS allows on any thread.
unsafe impl Send for Running {}
unsafe impl Sync for Running {}

/// ProjFS-backed virtualization engine.
pub struct ProjFsEngine {
    api: &'static ProjFsLibrary,
    level: ApiLevel,
    running: RwLock<Option<Running>>,
}

impl ProjFsEngine {
    /// Creates an engine at the highest capability level the installed
    /// ProjectedFSLib supports.
    pub fn new() -> WindowsResult<Self> {
        let api = library()?;
        Ok(Self {
            api,
            level: api.level,
            running: RwLock::new(None),
        })
    }

    /// Creates an engine limited to `level`, which the installed ProjectedFSLib
    /// must support.
    pub fn with_level(level: ApiLevel) -> WindowsResult<Self> {
        let api = library()?;
        if level == ApiLevel::Beta || level > api.level {
            return Err(WindowsError::Unsupported {
                message: format!("API level {:?} not available, library provides {:?}", level, api.level),
            });
        }
        Ok(Self {
            api,
            level,
            running: RwLock::new(None),
        })
    }

    fn context(&self) -> EngineResult<PRJ_NAMESPACE_VIRTUALIZATION_CONTEXT> {
        self.running
            .read()
            .as_ref()
            .map(|running| running.context)
            .ok_or(HResult::Handle)
    }

    fn update_failure(err: &windows::core::Error, cause: PRJ_UPDATE_FAILURE_CAUSES) -> UpdateFailure {
        UpdateFailure {
            status: convert::status_from_error(err),
            cause: UpdateFailureCause::from_bits_retain(cause.0 as u32),
        }
    }
}

impl std::fmt::Debug for ProjFsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjFsEngine")
            .field("level", &self.level)
            .field("running", &self.running.read().is_some())
            .finish()
    }
}

/// Buffer from `PrjAllocateAlignedBuffer`, freed on drop.
struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    free: FreeAlignedBufferFn,
}

// ProjFS aligned buffers are plain heap memory with no thread affinity.
unsafe impl Send for AlignedBuffer {}

impl BufferStorage for AlignedBuffer {
    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe { (self.free)(self.ptr.as_ptr() as *const c_void) };
    }
}

impl VirtualizationEngine for ProjFsEngine {
    fn api_level(&self) -> ApiLevel {
        self.level
    }

    fn is_virtualization_root(&self, root: &Path) -> EngineResult<bool> {
        // Junctions and symlinks carry other tags and still need marking.
        let tag = reparse_tag(root).map_err(|e| e.status())?;
        Ok(tag == Some(IO_REPARSE_TAG_PROJFS))
    }

    fn mark_directory_as_virtualization_root(&self, root: &Path, instance_id: Uuid) -> EngineResult<()> {
        let guid = convert::guid_from_uuid(instance_id);
        let root = HSTRING::from(root.as_os_str());
        unsafe {
            (self.api.mark_directory_as_placeholder)(PCWSTR(root.as_ptr()), PCWSTR::null(), std::ptr::null(), &guid)
        }
        .ok()
        .map_err(|e| convert::status_from_error(&e))
    }

    fn start_virtualizing(
        &self,
        root: &Path,
        callbacks: Arc<dyn ProviderCallbacks>,
        options: &StartOptions,
    ) -> EngineResult<()> {
        let mut running = self.running.write();
        if running.is_some() {
            return Err(HResult::AlreadyInitialized);
        }

        let callback_table = callbacks::table(&options.optional_callbacks);

        let roots: Vec<HSTRING> = options
            .notification_mappings
            .iter()
            .map(|mapping| HSTRING::from(mapping.notification_root.as_str()))
            .collect();
        let mut mappings: Vec<PRJ_NOTIFICATION_MAPPING> = options
            .notification_mappings
            .iter()
            .zip(&roots)
            .map(|(mapping, root)| PRJ_NOTIFICATION_MAPPING {
                NotificationBitMask: PRJ_NOTIFY_TYPES(mapping.notification_mask.bits() as _),
                NotificationRoot: PCWSTR(root.as_ptr()),
            })
            .collect();

        let start_options = PRJ_STARTVIRTUALIZING_OPTIONS {
            Flags: if options.enable_negative_path_cache {
                PRJ_FLAG_USE_NEGATIVE_PATH_CACHE
            } else {
                PRJ_FLAG_NONE
            },
            PoolThreadCount: options.pool_thread_count,
            ConcurrentThreadCount: options.concurrent_thread_count,
            NotificationMappings: if mappings.is_empty() {
                std::ptr::null_mut()
            } else {
                mappings.as_mut_ptr()
            },
            NotificationMappingsCount: mappings.len() as u32,
        };

        let token = callbacks::register(callbacks);
        let root_name = HSTRING::from(root.as_os_str());
        let mut context = PRJ_NAMESPACE_VIRTUALIZATION_CONTEXT::default();
        let result = unsafe {
            (self.api.start_virtualizing)(
                PCWSTR(root_name.as_ptr()),
                &callback_table,
                token as *const c_void,
                &start_options,
                &mut context,
            )
        }
        .ok();

        match result {
            Ok(()) => {
                info!("PrjStartVirtualizing on {:?} (token {})", root, token);
                *running = Some(Running { context, token });
                Ok(())
            }
            Err(e) => {
                callbacks::unregister(token);
                Err(convert::status_from_error(&e))
            }
        }
    }

    fn stop_virtualizing(&self) {
        if let Some(running) = self.running.write().take() {
            unsafe { (self.api.stop_virtualizing)(running.context) };
            callbacks::unregister(running.token);
            debug!("PrjStopVirtualizing (token {})", running.token);
        }
    }

    fn instance_info(&self) -> EngineResult<InstanceInfo> {
        let context = self.context()?;
        let mut info = PRJ_VIRTUALIZATION_INSTANCE_INFO::default();
        unsafe { (self.api.get_instance_info)(context, &mut info) }
            .ok()
            .map_err(|e| convert::status_from_error(&e))?;

        Ok(InstanceInfo {
            instance_id: convert::uuid_from_guid(&info.InstanceID),
            write_alignment: info.WriteAlignment,
        })
    }

    fn write_placeholder_info(&self, relative_path: &str, record: &PlaceholderRecord) -> EngineResult<()> {
        let context = self.context()?;
        let info = convert::placeholder_info(record);
        let name = HSTRING::from(relative_path);
        unsafe { (self.api.write_placeholder_info)(context, PCWSTR(name.as_ptr()), &info, PLACEHOLDER_INFO_SIZE) }
            .ok()
            .map_err(|e| convert::status_from_error(&e))
    }

    fn write_placeholder_info2(&self, relative_path: &str, record: &PlaceholderRecord) -> EngineResult<()> {
        let write = self
            .api
            .write_placeholder_info2
            .filter(|_| self.level.supports_symlinks())
            .ok_or(HResult::VirtualizationUnavailable)?;
        let context = self.context()?;
        let info = convert::placeholder_info(record);
        let name = HSTRING::from(relative_path);
        let target = record.symlink_target.as_deref().map(HSTRING::from);
        let extended = target.as_ref().map(convert::symlink_info);

        unsafe {
            write(
                context,
                PCWSTR(name.as_ptr()),
                &info,
                PLACEHOLDER_INFO_SIZE,
                extended.as_ref().map_or(std::ptr::null(), |e| e as *const PRJ_EXTENDED_INFO),
            )
        }
        .ok()
        .map_err(|e| convert::status_from_error(&e))
    }

    fn allocate_aligned_buffer(&self, size: usize) -> EngineResult<WriteBuffer> {
        let context = self.context()?;
        let ptr = unsafe { (self.api.allocate_aligned_buffer)(context, size) };
        let ptr = NonNull::new(ptr as *mut u8).ok_or(HResult::OutOfMemory)?;
        Ok(WriteBuffer::new(Box::new(AlignedBuffer {
            ptr,
            len: size,
            free: self.api.free_aligned_buffer,
        })))
    }

    fn write_file_data(
        &self,
        data_stream_id: Uuid,
        buffer: &WriteBuffer,
        byte_offset: u64,
        length: u32,
    ) -> EngineResult<()> {
        let context = self.context()?;
        let guid = convert::guid_from_uuid(data_stream_id);
        unsafe {
            (self.api.write_file_data)(
                context,
                &guid,
                buffer.as_slice().as_ptr() as *const c_void,
                byte_offset,
                length,
            )
        }
        .ok()
        .map_err(|e| convert::status_from_error(&e))
    }

    fn delete_file(&self, relative_path: &str, update_flags: UpdateType) -> Result<(), UpdateFailure> {
        let context = self.context().map_err(|status| UpdateFailure {
            status,
            cause: UpdateFailureCause::empty(),
        })?;
        let name = HSTRING::from(relative_path);
        let mut cause = PRJ_UPDATE_FAILURE_CAUSES::default();
        unsafe {
            (self.api.delete_file)(
                context,
                PCWSTR(name.as_ptr()),
                PRJ_UPDATE_TYPES(update_flags.bits() as _),
                &mut cause,
            )
        }
        .ok()
        .map_err(|e| Self::update_failure(&e, cause))
    }

    fn update_file_if_needed(
        &self,
        relative_path: &str,
        record: &PlaceholderRecord,
        update_flags: UpdateType,
    ) -> Result<(), UpdateFailure> {
        let context = self.context().map_err(|status| UpdateFailure {
            status,
            cause: UpdateFailureCause::empty(),
        })?;
        let info = convert::placeholder_info(record);
        let name = HSTRING::from(relative_path);
        let mut cause = PRJ_UPDATE_FAILURE_CAUSES::default();
        unsafe {
            (self.api.update_file_if_needed)(
                context,
                PCWSTR(name.as_ptr()),
                &info,
                PLACEHOLDER_INFO_SIZE,
                PRJ_UPDATE_TYPES(update_flags.bits() as _),
                &mut cause,
            )
        }
        .ok()
        .map_err(|e| Self::update_failure(&e, cause))
    }

    fn clear_negative_path_cache(&self) -> EngineResult<u32> {
        let context = self.context()?;
        let mut total = 0u32;
        unsafe { (self.api.clear_negative_path_cache)(context, &mut total) }
            .ok()
            .map_err(|e| convert::status_from_error(&e))?;
        Ok(total)
    }

    fn complete_command(&self, command_id: i32, completion: CommandCompletion) -> EngineResult<()> {
        let context = self.context()?;
        let mut parameters = PRJ_COMPLETE_COMMAND_EXTENDED_PARAMETERS::default();

        let (status, extended) = match completion {
            CommandCompletion::Plain(status) => (status, std::ptr::null()),
            CommandCompletion::WithEnumeration(status, handle) => {
                parameters.CommandType = PRJ_COMPLETE_COMMAND_TYPE_ENUMERATION;
                parameters.Anonymous.Enumeration.DirEntryBufferHandle = callbacks::raw_buffer_handle(handle);
                (status, &parameters as *const _)
            }
            CommandCompletion::WithNotificationMask(status, mask) => {
                parameters.CommandType = PRJ_COMPLETE_COMMAND_TYPE_NOTIFICATION;
                parameters.Anonymous.Notification.NotificationMask = PRJ_NOTIFY_TYPES(mask.bits() as _);
                (status, &parameters as *const _)
            }
        };

        unsafe { (self.api.complete_command)(context, command_id, convert::hresult(status), extended) }
            .ok()
            .map_err(|e| convert::status_from_error(&e))
    }

    fn mark_directory_as_placeholder(
        &self,
        root: &Path,
        target: &Path,
        content_id: &PlaceholderId,
        provider_id: &PlaceholderId,
        instance_id: Uuid,
    ) -> EngineResult<()> {
        let version = convert::version_info(content_id, provider_id);
        let guid = convert::guid_from_uuid(instance_id);
        let root = HSTRING::from(root.as_os_str());
        let target = HSTRING::from(target.as_os_str());
        unsafe {
            (self.api.mark_directory_as_placeholder)(
                PCWSTR(root.as_ptr()),
                PCWSTR(target.as_ptr()),
                &version,
                &guid,
            )
        }
        .ok()
        .map_err(|e| convert::status_from_error(&e))
    }

    fn on_disk_file_state(&self, full_path: &Path) -> EngineResult<OnDiskFileState> {
        let path = HSTRING::from(full_path.as_os_str());
        let mut state = PRJ_FILE_STATE::default();
        unsafe { (self.api.get_on_disk_file_state)(PCWSTR(path.as_ptr()), &mut state) }
            .ok()
            .map_err(|e| convert::status_from_error(&e))?;
        Ok(OnDiskFileState::from_bits_retain(state.0 as u32))
    }
}

impl Drop for ProjFsEngine {
    fn drop(&mut self) {
        if self.running.read().is_some() {
            warn!("ProjFS engine dropped while virtualizing; stopping");
            self.stop_virtualizing();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reflectfs_core::types::entry::FileAttributes;
    use reflectfs_core::types::placeholder::FileBasicInfo;
    use tempfile::TempDir;

    #[test]
    fn test_plain_directory_has_no_reparse_tag() {
        let dir = TempDir::new().unwrap();
        assert_eq!(reparse_tag(dir.path()).unwrap(), None);
    }

    #[test]
    fn test_missing_path_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = reparse_tag(&dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, WindowsError::IoError { .. }));
        assert_eq!(err.status(), HResult::FileNotFound);
    }

    #[test]
    fn test_directory_link_is_not_a_virtualization_root() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("target");
        std::fs::create_dir(&target).unwrap();
        let link = dir.path().join("link");
        // Creating symlinks needs developer mode or elevation.
        if std::os::windows::fs::symlink_dir(&target, &link).is_err() {
            return;
        }

        let tag = reparse_tag(&link).unwrap();
        assert!(tag.is_some());
        assert_ne!(tag, Some(IO_REPARSE_TAG_PROJFS));
    }

    #[test]
    fn test_level_above_library_is_rejected() {
        let Ok(engine) = ProjFsEngine::new() else {
            return;
        };
        assert!(ProjFsEngine::with_level(ApiLevel::Beta).is_err());
        if engine.api_level() == ApiLevel::Release {
            assert!(ProjFsEngine::with_level(ApiLevel::Additional).is_err());
        }
        let basic = ProjFsEngine::with_level(ApiLevel::Release).unwrap();
        assert_eq!(basic.api_level(), ApiLevel::Release);
        let record = PlaceholderRecord {
            basic_info: FileBasicInfo {
                is_directory: false,
                file_size: 0,
                creation_time: 0,
                last_access_time: 0,
                last_write_time: 0,
                change_time: 0,
                file_attributes: FileAttributes::NORMAL,
            },
            content_id: PlaceholderId::new(vec![0]),
            provider_id: PlaceholderId::new(vec![1]),
            symlink_target: Some("target".to_string()),
        };
        assert_eq!(basic.write_placeholder_info2("a", &record), Err(HResult::VirtualizationUnavailable));
    }
}
