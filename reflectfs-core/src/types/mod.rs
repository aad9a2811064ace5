//! Common types shared by the provider components.

pub mod config;
pub mod entry;
pub mod notification;
pub mod placeholder;

pub use config::{LogLevel, ProviderOptions};
pub use entry::{filetime_from_system_time, FileAttributes, LayerEntry};
pub use notification::{Notification, NotificationMapping, NotificationOutcome, NotificationType};
pub use placeholder::{
    FileBasicInfo, OnDiskFileState, PlaceholderId, PlaceholderRecord, UpdateFailureCause,
    UpdateType, PLACEHOLDER_ID_LENGTH,
};
