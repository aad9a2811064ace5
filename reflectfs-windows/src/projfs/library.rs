//! ProjectedFSLib entry points resolved at run time.
//!
//! Nothing in this crate links `ProjectedFSLib.dll` statically. The DLL is only
//! present when the optional ProjFS feature is enabled, and the `*2` exports only
//! exist on builds that support symlink placeholders, so every entry point is
//! looked up with `GetProcAddress` and called through the table below.

use std::ffi::c_void;
use std::sync::OnceLock;
use log::{debug, info};
use reflectfs_core::engine::ApiLevel;
use windows::core::{s, w, GUID, HRESULT, PCSTR, PCWSTR};
use windows::Win32::Foundation::{BOOLEAN, HMODULE};
use windows::Win32::Storage::ProjectedFileSystem::*;
use windows::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryW};
use crate::error::{WindowsError, WindowsResult};

pub(crate) type StartVirtualizingFn = unsafe extern "system" fn(
    PCWSTR,
    *const PRJ_CALLBACKS,
    *const c_void,
    *const PRJ_STARTVIRTUALIZING_OPTIONS,
    *mut PRJ_NAMESPACE_VIRTUALIZATION_CONTEXT,
) -> HRESULT;
pub(crate) type StopVirtualizingFn = unsafe extern "system" fn(PRJ_NAMESPACE_VIRTUALIZATION_CONTEXT);
pub(crate) type GetInstanceInfoFn =
    unsafe extern "system" fn(PRJ_NAMESPACE_VIRTUALIZATION_CONTEXT, *mut PRJ_VIRTUALIZATION_INSTANCE_INFO) -> HRESULT;
pub(crate) type WritePlaceholderInfoFn = unsafe extern "system" fn(
    PRJ_NAMESPACE_VIRTUALIZATION_CONTEXT,
    PCWSTR,
    *const PRJ_PLACEHOLDER_INFO,
    u32,
) -> HRESULT;
pub(crate) type WritePlaceholderInfo2Fn = unsafe extern "system" fn(
    PRJ_NAMESPACE_VIRTUALIZATION_CONTEXT,
    PCWSTR,
    *const PRJ_PLACEHOLDER_INFO,
    u32,
    *const PRJ_EXTENDED_INFO,
) -> HRESULT;
pub(crate) type AllocateAlignedBufferFn =
    unsafe extern "system" fn(PRJ_NAMESPACE_VIRTUALIZATION_CONTEXT, usize) -> *mut c_void;
pub(crate) type FreeAlignedBufferFn = unsafe extern "system" fn(*const c_void);
pub(crate) type WriteFileDataFn = unsafe extern "system" fn(
    PRJ_NAMESPACE_VIRTUALIZATION_CONTEXT,
    *const GUID,
    *const c_void,
    u64,
    u32,
) -> HRESULT;
pub(crate) type DeleteFileFn = unsafe extern "system" fn(
    PRJ_NAMESPACE_VIRTUALIZATION_CONTEXT,
    PCWSTR,
    PRJ_UPDATE_TYPES,
    *mut PRJ_UPDATE_FAILURE_CAUSES,
) -> HRESULT;
pub(crate) type UpdateFileIfNeededFn = unsafe extern "system" fn(
    PRJ_NAMESPACE_VIRTUALIZATION_CONTEXT,
    PCWSTR,
    *const PRJ_PLACEHOLDER_INFO,
    u32,
    PRJ_UPDATE_TYPES,
    *mut PRJ_UPDATE_FAILURE_CAUSES,
) -> HRESULT;
pub(crate) type ClearNegativePathCacheFn =
    unsafe extern "system" fn(PRJ_NAMESPACE_VIRTUALIZATION_CONTEXT, *mut u32) -> HRESULT;
pub(crate) type CompleteCommandFn = unsafe extern "system" fn(
    PRJ_NAMESPACE_VIRTUALIZATION_CONTEXT,
    i32,
    HRESULT,
    *const PRJ_COMPLETE_COMMAND_EXTENDED_PARAMETERS,
) -> HRESULT;
pub(crate) type MarkDirectoryAsPlaceholderFn =
    unsafe extern "system" fn(PCWSTR, PCWSTR, *const PRJ_PLACEHOLDER_VERSION_INFO, *const GUID) -> HRESULT;
pub(crate) type GetOnDiskFileStateFn = unsafe extern "system" fn(PCWSTR, *mut PRJ_FILE_STATE) -> HRESULT;
pub(crate) type FillDirEntryBufferFn =
    unsafe extern "system" fn(PCWSTR, *const PRJ_FILE_BASIC_INFO, PRJ_DIR_ENTRY_BUFFER_HANDLE) -> HRESULT;
pub(crate) type FillDirEntryBuffer2Fn = unsafe extern "system" fn(
    PRJ_DIR_ENTRY_BUFFER_HANDLE,
    PCWSTR,
    *const PRJ_FILE_BASIC_INFO,
    *const PRJ_EXTENDED_INFO,
) -> HRESULT;
pub(crate) type FileNameCompareFn = unsafe extern "system" fn(PCWSTR, PCWSTR) -> i32;
pub(crate) type FileNameMatchFn = unsafe extern "system" fn(PCWSTR, PCWSTR) -> BOOLEAN;
pub(crate) type ContainsWildCardsFn = unsafe extern "system" fn(PCWSTR) -> BOOLEAN;

/// Function table for the loaded `ProjectedFSLib.dll`.
///
/// The module is never unloaded, so the pointers stay valid for the life of
/// the process.
pub(crate) struct ProjFsLibrary {
    pub level: ApiLevel,
    pub start_virtualizing: StartVirtualizingFn,
    pub stop_virtualizing: StopVirtualizingFn,
    pub get_instance_info: GetInstanceInfoFn,
    pub write_placeholder_info: WritePlaceholderInfoFn,
    pub allocate_aligned_buffer: AllocateAlignedBufferFn,
    pub free_aligned_buffer: FreeAlignedBufferFn,
    pub write_file_data: WriteFileDataFn,
    pub delete_file: DeleteFileFn,
    pub update_file_if_needed: UpdateFileIfNeededFn,
    pub clear_negative_path_cache: ClearNegativePathCacheFn,
    pub complete_command: CompleteCommandFn,
    pub mark_directory_as_placeholder: MarkDirectoryAsPlaceholderFn,
    pub get_on_disk_file_state: GetOnDiskFileStateFn,
    pub fill_dir_entry_buffer: FillDirEntryBufferFn,
    pub file_name_compare: FileNameCompareFn,
    pub file_name_match: FileNameMatchFn,
    pub contains_wild_cards: ContainsWildCardsFn,
    pub write_placeholder_info2: Option<WritePlaceholderInfo2Fn>,
    pub fill_dir_entry_buffer2: Option<FillDirEntryBuffer2Fn>,
}

impl std::fmt::Debug for ProjFsLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjFsLibrary").field("level", &self.level).finish()
    }
}

/// Why the table could not be built. Kept as plain data so the outcome can be
/// cached once per process.
#[derive(Debug, Clone)]
enum LoadFailure {
    NotEnabled(String),
    BetaOnly,
    MissingExport(&'static str),
}

impl From<&LoadFailure> for WindowsError {
    fn from(failure: &LoadFailure) -> Self {
        match failure {
            LoadFailure::NotEnabled(message) => WindowsError::NotEnabled {
                message: message.clone(),
            },
            LoadFailure::BetaOnly => WindowsError::Unsupported {
                message: "ProjFS requires Windows 10 version 1809 or later".to_string(),
            },
            LoadFailure::MissingExport(name) => WindowsError::Unsupported {
                message: format!("ProjectedFSLib.dll does not export {}", name),
            },
        }
    }
}

pub(crate) fn load_module() -> WindowsResult<HMODULE> {
    unsafe { LoadLibraryW(w!("ProjectedFSLib.dll")) }.map_err(|e| WindowsError::NotEnabled {
        message: format!("could not load ProjectedFSLib.dll: {}", e),
    })
}

pub(crate) fn has_export(module: HMODULE, name: PCSTR) -> bool {
    unsafe { GetProcAddress(module, name) }.is_some()
}

unsafe fn export<T: Copy>(module: HMODULE, name: PCSTR) -> Option<T> {
    GetProcAddress(module, name).map(|f| std::mem::transmute_copy(&f))
}

macro_rules! require {
    ($module:expr, $name:literal) => {
        unsafe { export($module, s!($name)) }.ok_or(LoadFailure::MissingExport($name))?
    };
}

fn resolve() -> Result<ProjFsLibrary, LoadFailure> {
    let module = load_module().map_err(|e| LoadFailure::NotEnabled(e.to_string()))?;

    if !has_export(module, s!("PrjStartVirtualizing")) {
        return Err(LoadFailure::BetaOnly);
    }

    let write_placeholder_info2 = unsafe { export(module, s!("PrjWritePlaceholderInfo2")) };
    let fill_dir_entry_buffer2 = unsafe { export(module, s!("PrjFillDirEntryBuffer2")) };
    let level = match (&write_placeholder_info2, &fill_dir_entry_buffer2) {
        (Some(_), Some(_)) => ApiLevel::Additional,
        _ => ApiLevel::Release,
    };

    Ok(ProjFsLibrary {
        level,
        start_virtualizing: require!(module, "PrjStartVirtualizing"),
        stop_virtualizing: require!(module, "PrjStopVirtualizing"),
        get_instance_info: require!(module, "PrjGetVirtualizationInstanceInfo"),
        write_placeholder_info: require!(module, "PrjWritePlaceholderInfo"),
        allocate_aligned_buffer: require!(module, "PrjAllocateAlignedBuffer"),
        free_aligned_buffer: require!(module, "PrjFreeAlignedBuffer"),
        write_file_data: require!(module, "PrjWriteFileData"),
        delete_file: require!(module, "PrjDeleteFile"),
        update_file_if_needed: require!(module, "PrjUpdateFileIfNeeded"),
        clear_negative_path_cache: require!(module, "PrjClearNegativePathCache"),
        complete_command: require!(module, "PrjCompleteCommand"),
        mark_directory_as_placeholder: require!(module, "PrjMarkDirectoryAsPlaceholder"),
        get_on_disk_file_state: require!(module, "PrjGetOnDiskFileState"),
        fill_dir_entry_buffer: require!(module, "PrjFillDirEntryBuffer"),
        file_name_compare: require!(module, "PrjFileNameCompare"),
        file_name_match: require!(module, "PrjFileNameMatch"),
        contains_wild_cards: require!(module, "PrjDoesNameContainWildCards"),
        write_placeholder_info2,
        fill_dir_entry_buffer2,
    })
}

/// Loads `ProjectedFSLib.dll` on first use and returns its function table.
pub(crate) fn library() -> WindowsResult<&'static ProjFsLibrary> {
    static LIBRARY: OnceLock<Result<ProjFsLibrary, LoadFailure>> = OnceLock::new();

    LIBRARY
        .get_or_init(|| {
            let resolved = resolve();
            match &resolved {
                Ok(library) => info!("Resolved ProjectedFSLib.dll, API level {:?}", library.level),
                Err(failure) => debug!("ProjectedFSLib.dll unusable: {:?}", failure),
            }
            resolved
        })
        .as_ref()
        .map_err(WindowsError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_agrees_with_detected_level() {
        match crate::projfs::detect_api_level() {
            Ok(ApiLevel::Beta) => assert!(matches!(library(), Err(WindowsError::Unsupported { .. }))),
            Ok(level) => assert_eq!(library().unwrap().level, level),
            Err(_) => assert!(library().is_err()),
        }
    }

    #[test]
    fn test_failure_maps_to_windows_error() {
        let err = WindowsError::from(&LoadFailure::MissingExport("PrjStartVirtualizing"));
        assert!(err.to_string().contains("PrjStartVirtualizing"));
        assert!(matches!(
            WindowsError::from(&LoadFailure::NotEnabled("x".to_string())),
            WindowsError::NotEnabled { .. }
        ));
        assert!(matches!(WindowsError::from(&LoadFailure::BetaOnly), WindowsError::Unsupported { .. }));
    }
}
