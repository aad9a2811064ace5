//! Conversions between core types and ProjFS structures.

use reflectfs_core::engine::CallbackData;
use reflectfs_core::types::notification::{Notification, NotificationType};
use reflectfs_core::types::placeholder::{FileBasicInfo, PlaceholderId, PlaceholderRecord};
use reflectfs_core::HResult;
use uuid::Uuid;
use windows::core::{GUID, HRESULT, HSTRING, PCWSTR};
use windows::Win32::Foundation::BOOLEAN;
use windows::Win32::Storage::ProjectedFileSystem::*;

pub(crate) fn guid_from_uuid(id: Uuid) -> GUID {
    GUID::from_u128(id.as_u128())
}

pub(crate) fn uuid_from_guid(guid: &GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

pub(crate) fn hresult(status: HResult) -> HRESULT {
    HRESULT(status.code())
}

pub(crate) fn status_from_error(err: &windows::core::Error) -> HResult {
    HResult::from_code(err.code().0)
}

/// Copies a possibly-null wide string.
pub(crate) unsafe fn string_from_pcwstr(s: PCWSTR) -> String {
    if s.is_null() {
        String::new()
    } else {
        String::from_utf16_lossy(s.as_wide())
    }
}

pub(crate) fn file_basic_info(info: &FileBasicInfo) -> PRJ_FILE_BASIC_INFO {
    PRJ_FILE_BASIC_INFO {
        IsDirectory: BOOLEAN::from(info.is_directory),
        FileSize: info.file_size,
        CreationTime: info.creation_time,
        LastAccessTime: info.last_access_time,
        LastWriteTime: info.last_write_time,
        ChangeTime: info.change_time,
        FileAttributes: info.file_attributes.bits(),
    }
}

pub(crate) fn version_info(content_id: &PlaceholderId, provider_id: &PlaceholderId) -> PRJ_PLACEHOLDER_VERSION_INFO {
    PRJ_PLACEHOLDER_VERSION_INFO {
        ProviderID: provider_id.to_fixed(),
        ContentID: content_id.to_fixed(),
    }
}

pub(crate) fn placeholder_info(record: &PlaceholderRecord) -> PRJ_PLACEHOLDER_INFO {
    let mut info = PRJ_PLACEHOLDER_INFO::default();
    info.FileBasicInfo = file_basic_info(&record.basic_info);
    info.VersionInfo = version_info(&record.content_id, &record.provider_id);
    info
}

/// Symlink extended info. `target` must outlive every use of the result.
pub(crate) fn symlink_info(target: &HSTRING) -> PRJ_EXTENDED_INFO {
    let mut info = PRJ_EXTENDED_INFO::default();
    info.InfoType = PRJ_EXT_INFO_TYPE_SYMLINK;
    info.NextInfoOffset = 0;
    info.Anonymous.Symlink.TargetName = PCWSTR(target.as_ptr());
    info
}

/// Builds the core view of a callback's data block.
pub(crate) unsafe fn callback_data(raw: &PRJ_CALLBACK_DATA) -> CallbackData {
    let mut data = CallbackData::new(raw.CommandId, string_from_pcwstr(raw.FilePathName));
    data.data_stream_id = uuid_from_guid(&raw.DataStreamId);
    data.triggering_process_id = raw.TriggeringProcessId;
    data.triggering_process_name = string_from_pcwstr(raw.TriggeringProcessImageFileName);
    if let Some(version) = raw.VersionInfo.as_ref() {
        data.content_id = PlaceholderId::from_fixed(&version.ContentID);
        data.provider_id = PlaceholderId::from_fixed(&version.ProviderID);
    }
    data
}

pub(crate) fn is_restart_scan(raw: &PRJ_CALLBACK_DATA) -> bool {
    (raw.Flags.0 & PRJ_CB_DATA_FLAG_ENUM_RESTART_SCAN.0) != 0
}

/// Decodes a notification and its parameters. Returns `None` for kinds the
/// provider never registers for.
pub(crate) unsafe fn notification(
    kind: PRJ_NOTIFICATION,
    destination: PCWSTR,
    parameters: *const PRJ_NOTIFICATION_PARAMETERS,
) -> Option<Notification> {
    let destination = || string_from_pcwstr(destination);

    let notification = match kind {
        PRJ_NOTIFICATION_FILE_OPENED => Notification::FileOpened,
        PRJ_NOTIFICATION_NEW_FILE_CREATED => Notification::NewFileCreated,
        PRJ_NOTIFICATION_FILE_OVERWRITTEN => Notification::FileOverwritten,
        PRJ_NOTIFICATION_PRE_DELETE => Notification::PreDelete,
        PRJ_NOTIFICATION_PRE_RENAME => Notification::PreRename { destination: destination() },
        PRJ_NOTIFICATION_PRE_SET_HARDLINK => Notification::PreCreateHardlink { destination: destination() },
        PRJ_NOTIFICATION_FILE_RENAMED => Notification::FileRenamed { destination: destination() },
        PRJ_NOTIFICATION_HARDLINK_CREATED => Notification::HardlinkCreated { destination: destination() },
        PRJ_NOTIFICATION_FILE_HANDLE_CLOSED_NO_MODIFICATION => Notification::FileHandleClosedNoModification,
        PRJ_NOTIFICATION_FILE_HANDLE_CLOSED_FILE_MODIFIED => Notification::FileHandleClosedFileModified,
        PRJ_NOTIFICATION_FILE_HANDLE_CLOSED_FILE_DELETED => {
            let is_file_modified = parameters
                .as_ref()
                .map(|p| p.FileDeletedOnHandleClose.IsFileModified.as_bool())
                .unwrap_or(false);
            Notification::FileHandleClosedFileDeleted { is_file_modified }
        }
        PRJ_NOTIFICATION_FILE_PRE_CONVERT_TO_FULL => Notification::FilePreConvertToFull,
        _ => return None,
    };
    Some(notification)
}

/// Writes a new notification mask into the out-parameter of categories that have one.
pub(crate) unsafe fn store_notification_mask(
    notification: &Notification,
    parameters: *mut PRJ_NOTIFICATION_PARAMETERS,
    mask: NotificationType,
) {
    let Some(parameters) = parameters.as_mut() else {
        return;
    };
    let mask = PRJ_NOTIFY_TYPES(mask.bits() as _);
    match notification {
        Notification::FileRenamed { .. } => parameters.FileRenamed.NotificationMask = mask,
        n if n.has_mask_parameter() => parameters.PostCreate.NotificationMask = mask,
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reflectfs_core::types::entry::FileAttributes;

    #[test]
    fn test_guid_round_trip() {
        let id = Uuid::new_v4();
        assert_eq!(uuid_from_guid(&guid_from_uuid(id)), id);
    }

    #[test]
    fn test_placeholder_info_layout() {
        let record = PlaceholderRecord {
            basic_info: FileBasicInfo {
                is_directory: false,
                file_size: 10,
                creation_time: 1,
                last_access_time: 2,
                last_write_time: 3,
                change_time: 4,
                file_attributes: FileAttributes::NORMAL,
            },
            content_id: PlaceholderId::new(vec![0]),
            provider_id: PlaceholderId::new(vec![1]),
            symlink_target: None,
        };

        let info = placeholder_info(&record);
        assert_eq!(info.FileBasicInfo.FileSize, 10);
        assert!(!info.FileBasicInfo.IsDirectory.as_bool());
        assert_eq!(info.VersionInfo.ContentID[0], 0);
        assert_eq!(info.VersionInfo.ProviderID[0], 1);
    }

    #[test]
    fn test_notification_decoding() {
        let mut parameters = PRJ_NOTIFICATION_PARAMETERS::default();
        parameters.FileDeletedOnHandleClose.IsFileModified = BOOLEAN::from(true);
        let decoded = unsafe {
            notification(
                PRJ_NOTIFICATION_FILE_HANDLE_CLOSED_FILE_DELETED,
                PCWSTR::null(),
                &parameters,
            )
        };
        assert_eq!(decoded, Some(Notification::FileHandleClosedFileDeleted { is_file_modified: true }));

        let target = HSTRING::from("b.txt");
        let decoded = unsafe { notification(PRJ_NOTIFICATION_PRE_RENAME, PCWSTR(target.as_ptr()), std::ptr::null()) };
        assert_eq!(decoded, Some(Notification::PreRename { destination: "b.txt".to_string() }));
    }
}
