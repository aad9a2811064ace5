//! Notification categories, registrations and handler outcomes.

use bitflags::bitflags;

bitflags! {
    /// Notification categories a provider can register for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NotificationType: u32 {
        const SUPPRESS_NOTIFICATIONS             = 0x0000_0001;
        const FILE_OPENED                        = 0x0000_0002;
        const NEW_FILE_CREATED                   = 0x0000_0004;
        const FILE_OVERWRITTEN                   = 0x0000_0008;
        const PRE_DELETE                         = 0x0000_0010;
        const PRE_RENAME                         = 0x0000_0020;
        const PRE_CREATE_HARDLINK                = 0x0000_0040;
        const FILE_RENAMED                       = 0x0000_0080;
        const HARDLINK_CREATED                   = 0x0000_0100;
        const FILE_HANDLE_CLOSED_NO_MODIFICATION = 0x0000_0200;
        const FILE_HANDLE_CLOSED_FILE_MODIFIED   = 0x0000_0400;
        const FILE_HANDLE_CLOSED_FILE_DELETED    = 0x0000_0800;
        const FILE_PRE_CONVERT_TO_FULL           = 0x0000_1000;
        /// Keep whatever mask is already in effect for the file.
        const USE_EXISTING_MASK                  = 0xFFFF_FFFF;
    }
}

impl NotificationType {
    /// Every category the reflector registers when notifications are on.
    pub fn reflector_set() -> Self {
        NotificationType::FILE_OPENED
            | NotificationType::NEW_FILE_CREATED
            | NotificationType::FILE_OVERWRITTEN
            | NotificationType::PRE_DELETE
            | NotificationType::PRE_RENAME
            | NotificationType::PRE_CREATE_HARDLINK
            | NotificationType::FILE_RENAMED
            | NotificationType::HARDLINK_CREATED
            | NotificationType::FILE_HANDLE_CLOSED_NO_MODIFICATION
            | NotificationType::FILE_HANDLE_CLOSED_FILE_MODIFIED
            | NotificationType::FILE_HANDLE_CLOSED_FILE_DELETED
            | NotificationType::FILE_PRE_CONVERT_TO_FULL
    }
}

/// Registers a set of categories for a root-relative path scope.
/// An empty root covers the whole virtualization root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationMapping {
    pub notification_mask: NotificationType,
    pub notification_root: String,
}

impl NotificationMapping {
    pub fn new(notification_mask: NotificationType, notification_root: impl Into<String>) -> Self {
        Self {
            notification_mask,
            notification_root: notification_root.into(),
        }
    }
}

/// A single notification delivered by the engine, with its per-category payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    FileOpened,
    NewFileCreated,
    FileOverwritten,
    PreDelete,
    PreRename { destination: String },
    PreCreateHardlink { destination: String },
    FileRenamed { destination: String },
    HardlinkCreated { destination: String },
    FileHandleClosedNoModification,
    FileHandleClosedFileModified,
    FileHandleClosedFileDeleted { is_file_modified: bool },
    FilePreConvertToFull,
}

impl Notification {
    /// The category bit this notification belongs to.
    pub fn category(&self) -> NotificationType {
        match self {
            Notification::FileOpened => NotificationType::FILE_OPENED,
            Notification::NewFileCreated => NotificationType::NEW_FILE_CREATED,
            Notification::FileOverwritten => NotificationType::FILE_OVERWRITTEN,
            Notification::PreDelete => NotificationType::PRE_DELETE,
            Notification::PreRename { .. } => NotificationType::PRE_RENAME,
            Notification::PreCreateHardlink { .. } => NotificationType::PRE_CREATE_HARDLINK,
            Notification::FileRenamed { .. } => NotificationType::FILE_RENAMED,
            Notification::HardlinkCreated { .. } => NotificationType::HARDLINK_CREATED,
            Notification::FileHandleClosedNoModification => {
                NotificationType::FILE_HANDLE_CLOSED_NO_MODIFICATION
            }
            Notification::FileHandleClosedFileModified => {
                NotificationType::FILE_HANDLE_CLOSED_FILE_MODIFIED
            }
            Notification::FileHandleClosedFileDeleted { .. } => {
                NotificationType::FILE_HANDLE_CLOSED_FILE_DELETED
            }
            Notification::FilePreConvertToFull => NotificationType::FILE_PRE_CONVERT_TO_FULL,
        }
    }

    /// True for categories whose handler may veto the operation.
    pub fn is_pre_operation(&self) -> bool {
        matches!(
            self,
            Notification::FileOpened
                | Notification::PreDelete
                | Notification::PreRename { .. }
                | Notification::PreCreateHardlink { .. }
                | Notification::FilePreConvertToFull
        )
    }

    /// True for categories carrying a notification-mask out-parameter.
    pub fn has_mask_parameter(&self) -> bool {
        matches!(
            self,
            Notification::FileOpened
                | Notification::NewFileCreated
                | Notification::FileOverwritten
                | Notification::FileRenamed { .. }
        )
    }
}

/// What a notification handler decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationOutcome {
    /// Let the operation proceed.
    Allow,
    /// Veto a pre-operation.
    Deny,
    /// Allow and replace the file's notification mask.
    SetMask(NotificationType),
}

impl NotificationOutcome {
    /// Allow while keeping the mask already in effect.
    pub fn keep_mask() -> Self {
        NotificationOutcome::SetMask(NotificationType::USE_EXISTING_MASK)
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, NotificationOutcome::Deny)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reflector_set_has_twelve_categories() {
        assert_eq!(NotificationType::reflector_set().bits().count_ones(), 12);
        assert!(!NotificationType::reflector_set().contains(NotificationType::SUPPRESS_NOTIFICATIONS));
    }

    #[test]
    fn test_use_existing_mask_value() {
        assert_eq!(NotificationType::USE_EXISTING_MASK.bits(), 0xFFFF_FFFF);
        assert_eq!(
            NotificationOutcome::keep_mask(),
            NotificationOutcome::SetMask(NotificationType::USE_EXISTING_MASK)
        );
    }

    #[test]
    fn test_category_classification() {
        assert!(Notification::PreDelete.is_pre_operation());
        assert!(!Notification::PreDelete.has_mask_parameter());
        assert!(Notification::FileRenamed { destination: "b".into() }.has_mask_parameter());
        assert!(!Notification::FileRenamed { destination: "b".into() }.is_pre_operation());
        assert_eq!(
            Notification::FileHandleClosedFileDeleted { is_file_modified: true }.category(),
            NotificationType::FILE_HANDLE_CLOSED_FILE_DELETED
        );
    }
}
