//! Notification routing and policy.

use crate::engine::CallbackData;
use crate::signal::TestSignaler;
use crate::types::notification::{Notification, NotificationMapping, NotificationOutcome, NotificationType};

/// Decides what happens for each notification the engine delivers.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotificationRouter {
    active: bool,
    deny_deletes: bool,
}

impl NotificationRouter {
    pub fn new(active: bool, deny_deletes: bool) -> Self {
        Self { active, deny_deletes }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn deny_deletes(&self) -> bool {
        self.deny_deletes
    }

    /// Registrations passed to the engine at start: every category over the
    /// whole root when active, nothing otherwise.
    pub fn mappings(&self) -> Vec<NotificationMapping> {
        if self.active {
            vec![NotificationMapping::new(NotificationType::reflector_set(), "")]
        } else {
            Vec::new()
        }
    }

    /// Logs a notification, signals its test event and returns the decision.
    pub fn handle(
        &self,
        data: &CallbackData,
        is_directory: bool,
        notification: &Notification,
        signaler: &TestSignaler,
    ) -> NotificationOutcome {
        tracing::info!(
            "{:?} [{}] directory={}",
            notification,
            data.file_path,
            is_directory
        );
        tracing::info!(
            "  Notification triggered by [{} {}]",
            data.triggering_process_name,
            data.triggering_process_id
        );

        if let Err(e) = signaler.signal_if_test_mode(test_event_name(notification)) {
            tracing::error!("Test signal for {:?} failed: {}", notification.category(), e);
        }

        self.decide(notification)
    }

    fn decide(&self, notification: &Notification) -> NotificationOutcome {
        match notification {
            Notification::PreDelete if self.deny_deletes => NotificationOutcome::Deny,
            n if n.has_mask_parameter() => NotificationOutcome::keep_mask(),
            _ => NotificationOutcome::Allow,
        }
    }
}

/// Test event set for a notification. Both handle-closed-with-change
/// variants share one event.
pub fn test_event_name(notification: &Notification) -> &'static str {
    match notification {
        Notification::FileOpened => "FileOpened",
        Notification::NewFileCreated => "NewFileCreated",
        Notification::FileOverwritten => "FileOverwritten",
        Notification::PreDelete => "PreDelete",
        Notification::PreRename { .. } => "PreRename",
        Notification::PreCreateHardlink { .. } => "PreCreateHardlink",
        Notification::FileRenamed { .. } => "FileRenamed",
        Notification::HardlinkCreated { .. } => "HardlinkCreated",
        Notification::FileHandleClosedNoModification => "FileHandleClosedNoModification",
        Notification::FileHandleClosedFileModified | Notification::FileHandleClosedFileDeleted { .. } => {
            "FileHandleClosedFileModifiedOrDeleted"
        }
        Notification::FilePreConvertToFull => "FilePreConvertToFull",
    }
}
