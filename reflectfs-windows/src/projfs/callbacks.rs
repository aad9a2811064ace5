//! Native callback trampolines.
//!
//! ProjFS calls plain `extern "system"` functions. The instance context passed
//! at start is a token into a process-wide registry of provider callbacks, so a
//! callback that races with stop finds no entry instead of a dangling pointer.

use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use dashmap::DashMap;
use log::{error, warn};
use reflectfs_core::engine::{CallbackData, DirectoryBufferHandle, DirectoryEntrySink, OptionalCallbacks, ProviderCallbacks};
use reflectfs_core::types::placeholder::FileBasicInfo;
use reflectfs_core::HResult;
use windows::core::{GUID, HRESULT, HSTRING, PCWSTR};
use windows::Win32::Foundation::{BOOLEAN, ERROR_INSUFFICIENT_BUFFER};
use windows::Win32::Storage::ProjectedFileSystem::*;
use super::convert;
use super::library::{library, ProjFsLibrary};

type Registry = DashMap<usize, Arc<dyn ProviderCallbacks>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

static NEXT_TOKEN: AtomicUsize = AtomicUsize::new(1);

/// Registers callbacks and returns the token to pass as instance context.
pub(crate) fn register(callbacks: Arc<dyn ProviderCallbacks>) -> usize {
    let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
    registry().insert(token, callbacks);
    token
}

pub(crate) fn unregister(token: usize) {
    registry().remove(&token);
}

/// Callback table for the optional callbacks the provider implements.
pub(crate) fn table(optional: &OptionalCallbacks) -> PRJ_CALLBACKS {
    PRJ_CALLBACKS {
        StartDirectoryEnumerationCallback: Some(start_directory_enumeration),
        EndDirectoryEnumerationCallback: Some(end_directory_enumeration),
        GetDirectoryEnumerationCallback: Some(get_directory_enumeration),
        GetPlaceholderInfoCallback: Some(get_placeholder_info),
        GetFileDataCallback: Some(get_file_data),
        QueryFileNameCallback: if optional.query_file_name { Some(query_file_name) } else { None },
        NotificationCallback: if optional.notification { Some(notification) } else { None },
        CancelCommandCallback: if optional.cancel_command { Some(cancel_command) } else { None },
    }
}

/// Resolves the provider for a callback and runs `f` with the decoded data.
/// Null data, an unknown token or a panic all yield `InternalError`.
unsafe fn dispatch<F>(callback_data: *const PRJ_CALLBACK_DATA, name: &str, f: F) -> HRESULT
where
    F: FnOnce(&dyn ProviderCallbacks, &PRJ_CALLBACK_DATA, CallbackData) -> HResult,
{
    let Some(raw) = callback_data.as_ref() else {
        return convert::hresult(HResult::InvalidArg);
    };

    let token = raw.InstanceContext as usize;
    let Some(callbacks) = registry().get(&token).map(|entry| Arc::clone(entry.value())) else {
        warn!("{} for unknown instance token {}", name, token);
        return convert::hresult(HResult::InternalError);
    };

    let data = convert::callback_data(raw);
    match catch_unwind(AssertUnwindSafe(|| f(callbacks.as_ref(), raw, data))) {
        Ok(status) => convert::hresult(status),
        Err(_) => {
            error!("{} panicked", name);
            convert::hresult(HResult::InternalError)
        }
    }
}

unsafe extern "system" fn start_directory_enumeration(
    callback_data: *const PRJ_CALLBACK_DATA,
    enumeration_id: *const GUID,
) -> HRESULT {
    let Some(enumeration_id) = enumeration_id.as_ref() else {
        return convert::hresult(HResult::InvalidArg);
    };
    let id = convert::uuid_from_guid(enumeration_id);
    dispatch(callback_data, "StartDirectoryEnumeration", |callbacks, _, data| {
        callbacks.start_directory_enumeration(&data, id)
    })
}

unsafe extern "system" fn end_directory_enumeration(
    callback_data: *const PRJ_CALLBACK_DATA,
    enumeration_id: *const GUID,
) -> HRESULT {
    let Some(enumeration_id) = enumeration_id.as_ref() else {
        return convert::hresult(HResult::InvalidArg);
    };
    let id = convert::uuid_from_guid(enumeration_id);
    dispatch(callback_data, "EndDirectoryEnumeration", |callbacks, _, data| {
        callbacks.end_directory_enumeration(&data, id)
    })
}

unsafe extern "system" fn get_directory_enumeration(
    callback_data: *const PRJ_CALLBACK_DATA,
    enumeration_id: *const GUID,
    search_expression: PCWSTR,
    dir_entry_buffer_handle: PRJ_DIR_ENTRY_BUFFER_HANDLE,
) -> HRESULT {
    let Some(enumeration_id) = enumeration_id.as_ref() else {
        return convert::hresult(HResult::InvalidArg);
    };
    let id = convert::uuid_from_guid(enumeration_id);
    let filter = (!search_expression.is_null()).then(|| convert::string_from_pcwstr(search_expression));

    dispatch(callback_data, "GetDirectoryEnumeration", |callbacks, raw, data| {
        let api = match library() {
            Ok(api) => api,
            Err(e) => {
                error!("GetDirectoryEnumeration without a usable ProjectedFSLib: {}", e);
                return HResult::InternalError;
            }
        };
        let mut sink = ProjFsDirSink::new(api, dir_entry_buffer_handle);
        callbacks.get_directory_enumeration(&data, id, filter.as_deref(), convert::is_restart_scan(raw), &mut sink)
    })
}

unsafe extern "system" fn get_placeholder_info(callback_data: *const PRJ_CALLBACK_DATA) -> HRESULT {
    dispatch(callback_data, "GetPlaceholderInfo", |callbacks, _, data| {
        callbacks.get_placeholder_info(&data)
    })
}

unsafe extern "system" fn get_file_data(
    callback_data: *const PRJ_CALLBACK_DATA,
    byte_offset: u64,
    length: u32,
) -> HRESULT {
    dispatch(callback_data, "GetFileData", |callbacks, _, data| {
        callbacks.get_file_data(&data, byte_offset, length)
    })
}

unsafe extern "system" fn query_file_name(callback_data: *const PRJ_CALLBACK_DATA) -> HRESULT {
    dispatch(callback_data, "QueryFileName", |callbacks, _, data| callbacks.query_file_name(&data))
}

unsafe extern "system" fn notification(
    callback_data: *const PRJ_CALLBACK_DATA,
    is_directory: BOOLEAN,
    notification: PRJ_NOTIFICATION,
    destination_file_name: PCWSTR,
    operation_parameters: *mut PRJ_NOTIFICATION_PARAMETERS,
) -> HRESULT {
    let Some(decoded) = convert::notification(notification, destination_file_name, operation_parameters) else {
        warn!("Unhandled notification kind {}", notification.0);
        return convert::hresult(HResult::Ok);
    };

    dispatch(callback_data, "Notification", |callbacks, _, data| {
        let response = callbacks.notify(&data, is_directory.as_bool(), &decoded);
        if let Some(mask) = response.notification_mask {
            convert::store_notification_mask(&decoded, operation_parameters, mask);
        }
        response.status
    })
}

unsafe extern "system" fn cancel_command(callback_data: *const PRJ_CALLBACK_DATA) {
    dispatch(callback_data, "CancelCommand", |callbacks, _, data| {
        callbacks.cancel_command(&data);
        HResult::Ok
    });
}

/// Enumeration results buffer owned by ProjFS for the duration of one callback.
pub struct ProjFsDirSink {
    api: &'static ProjFsLibrary,
    handle: PRJ_DIR_ENTRY_BUFFER_HANDLE,
}

impl ProjFsDirSink {
    pub(crate) fn new(api: &'static ProjFsLibrary, handle: PRJ_DIR_ENTRY_BUFFER_HANDLE) -> Self {
        Self { api, handle }
    }

    fn accepted(result: windows::core::Result<()>, file_name: &str) -> bool {
        match result {
            Ok(()) => true,
            Err(e) if e.code() == HRESULT::from_win32(ERROR_INSUFFICIENT_BUFFER.0) => false,
            Err(e) => {
                error!("Filling directory entry {} failed: {}", file_name, e);
                false
            }
        }
    }
}

impl DirectoryEntrySink for ProjFsDirSink {
    fn add(&mut self, file_name: &str, basic_info: &FileBasicInfo) -> bool {
        let info = convert::file_basic_info(basic_info);
        let name = HSTRING::from(file_name);
        let result = unsafe { (self.api.fill_dir_entry_buffer)(PCWSTR(name.as_ptr()), &info, self.handle) }.ok();
        Self::accepted(result, file_name)
    }

    fn add_with_symlink(
        &mut self,
        file_name: &str,
        basic_info: &FileBasicInfo,
        symlink_target: Option<&str>,
    ) -> bool {
        let Some(fill) = self.api.fill_dir_entry_buffer2 else {
            return self.add(file_name, basic_info);
        };
        let info = convert::file_basic_info(basic_info);
        let name = HSTRING::from(file_name);
        let target = symlink_target.map(HSTRING::from);
        let extended = target.as_ref().map(convert::symlink_info);

        let result = unsafe {
            fill(
                self.handle,
                PCWSTR(name.as_ptr()),
                &info,
                extended.as_ref().map_or(std::ptr::null(), |e| e as *const PRJ_EXTENDED_INFO),
            )
        }
        .ok();
        Self::accepted(result, file_name)
    }

    fn handle(&self) -> DirectoryBufferHandle {
        DirectoryBufferHandle(self.handle.0 as usize)
    }
}

/// Raw buffer handle for a sink handle recorded earlier.
pub(crate) fn raw_buffer_handle(handle: DirectoryBufferHandle) -> PRJ_DIR_ENTRY_BUFFER_HANDLE {
    PRJ_DIR_ENTRY_BUFFER_HANDLE(handle.0 as *mut c_void)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counting;

    impl ProviderCallbacks for Counting {
        fn start_directory_enumeration(&self, _data: &CallbackData, _id: uuid::Uuid) -> HResult {
            HResult::Ok
        }
        fn get_directory_enumeration(
            &self,
            _data: &CallbackData,
            _id: uuid::Uuid,
            _filter: Option<&str>,
            _restart: bool,
            _sink: &mut dyn DirectoryEntrySink,
        ) -> HResult {
            HResult::Ok
        }
        fn end_directory_enumeration(&self, _data: &CallbackData, _id: uuid::Uuid) -> HResult {
            HResult::Ok
        }
        fn get_placeholder_info(&self, data: &CallbackData) -> HResult {
            if data.file_path == "boom" {
                panic!("boom");
            }
            HResult::FileNotFound
        }
        fn get_file_data(&self, _data: &CallbackData, _offset: u64, _length: u32) -> HResult {
            HResult::Ok
        }
        fn query_file_name(&self, _data: &CallbackData) -> HResult {
            HResult::Ok
        }
        fn notify(
            &self,
            _data: &CallbackData,
            _is_directory: bool,
            _notification: &reflectfs_core::types::notification::Notification,
        ) -> reflectfs_core::engine::NotificationResponse {
            reflectfs_core::engine::NotificationResponse::status(HResult::Ok)
        }
        fn cancel_command(&self, _data: &CallbackData) {}
    }

    fn raw_data(token: usize, path: &HSTRING) -> PRJ_CALLBACK_DATA {
        let mut raw = PRJ_CALLBACK_DATA::default();
        raw.Size = std::mem::size_of::<PRJ_CALLBACK_DATA>() as u32;
        raw.FilePathName = PCWSTR(path.as_ptr());
        raw.InstanceContext = token as *mut c_void;
        raw
    }

    #[test]
    fn test_trampoline_routes_by_token() {
        let token = register(Arc::new(Counting));
        let path = HSTRING::from("a.txt");
        let raw = raw_data(token, &path);

        let hr = unsafe { get_placeholder_info(&raw) };
        assert_eq!(hr, convert::hresult(HResult::FileNotFound));

        unregister(token);
        let hr = unsafe { get_placeholder_info(&raw) };
        assert_eq!(hr, convert::hresult(HResult::InternalError));
    }

    #[test]
    fn test_panic_becomes_internal_error() {
        let token = register(Arc::new(Counting));
        let path = HSTRING::from("boom");
        let raw = raw_data(token, &path);

        let hr = unsafe { get_placeholder_info(&raw) };
        assert_eq!(hr, convert::hresult(HResult::InternalError));
        unregister(token);
    }

    #[test]
    fn test_null_callback_data() {
        let hr = unsafe { get_placeholder_info(std::ptr::null()) };
        assert_eq!(hr, convert::hresult(HResult::InvalidArg));
    }
}
