//! Host virtualization engine binding.
//!
//! The engine owns on-disk placeholder state and dispatches callbacks; the
//! provider reaches it only through [`VirtualizationEngine`]. The engine in
//! turn calls the provider through [`ProviderCallbacks`], handing it a
//! [`DirectoryEntrySink`] for enumeration results.

use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;
use crate::status::HResult;
use crate::types::notification::{Notification, NotificationMapping, NotificationType};
use crate::types::placeholder::{
    FileBasicInfo, OnDiskFileState, PlaceholderId, PlaceholderRecord, UpdateFailureCause, UpdateType,
};

/// Result of an engine call; the error is the engine's status code.
pub type EngineResult<T> = std::result::Result<T, HResult>;

/// Host OS builds introducing each capability level.
pub mod build_numbers {
    pub const BETA: u32 = 17134;
    pub const RELEASE: u32 = 17763;
    pub const ADDITIONAL: u32 = 19041;
}

/// Capability level the host engine advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ApiLevel {
    /// Pre-release entry points only.
    Beta,
    /// Basic level: no symlink placeholders.
    Release,
    /// Adds symlink-aware placeholder writes and directory fills.
    Additional,
}

impl ApiLevel {
    /// Level available on a given OS build, if any.
    pub fn from_build_number(build: u32) -> Option<Self> {
        match build {
            b if b >= build_numbers::ADDITIONAL => Some(ApiLevel::Additional),
            b if b >= build_numbers::RELEASE => Some(ApiLevel::Release),
            b if b >= build_numbers::BETA => Some(ApiLevel::Beta),
            _ => None,
        }
    }

    pub fn supports_symlinks(self) -> bool {
        self >= ApiLevel::Additional
    }
}

/// Identity and alignment reported by a running instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceInfo {
    pub instance_id: Uuid,
    pub write_alignment: u32,
}

/// Which optional callbacks the provider implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OptionalCallbacks {
    pub query_file_name: bool,
    pub notification: bool,
    pub cancel_command: bool,
}

/// Options passed to the engine at start.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StartOptions {
    pub pool_thread_count: u32,
    pub concurrent_thread_count: u32,
    pub enable_negative_path_cache: bool,
    pub notification_mappings: Vec<NotificationMapping>,
    pub optional_callbacks: OptionalCallbacks,
}

/// Per-callback context supplied by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackData {
    pub command_id: i32,
    /// Path relative to the virtualization root.
    pub file_path: String,
    pub data_stream_id: Uuid,
    pub content_id: PlaceholderId,
    pub provider_id: PlaceholderId,
    pub triggering_process_id: u32,
    pub triggering_process_name: String,
}

impl CallbackData {
    pub fn new(command_id: i32, file_path: impl Into<String>) -> Self {
        Self {
            command_id,
            file_path: file_path.into(),
            ..Self::default()
        }
    }
}

/// Opaque handle to an engine-owned directory entry buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirectoryBufferHandle(pub usize);

/// Destination buffer for enumeration results, owned by the engine.
pub trait DirectoryEntrySink {
    /// Appends an entry. Returns false when the buffer cannot hold it.
    fn add(&mut self, file_name: &str, basic_info: &FileBasicInfo) -> bool;

    /// Appends an entry carrying a symlink target. Only usable on engines
    /// that support symlinks.
    fn add_with_symlink(
        &mut self,
        file_name: &str,
        basic_info: &FileBasicInfo,
        symlink_target: Option<&str>,
    ) -> bool;

    /// Handle used to complete a pended enumeration later.
    fn handle(&self) -> DirectoryBufferHandle;
}

/// Backing memory of a write buffer.
pub trait BufferStorage: Send {
    fn as_slice(&self) -> &[u8];
    fn as_mut_slice(&mut self) -> &mut [u8];
}

/// Heap-backed storage for engines without alignment requirements.
pub struct HeapBuffer(Vec<u8>);

impl HeapBuffer {
    pub fn new(size: usize) -> Self {
        Self(vec![0u8; size])
    }
}

impl BufferStorage for HeapBuffer {
    fn as_slice(&self) -> &[u8] {
        &self.0
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// A buffer allocated by the engine for file data writes.
pub struct WriteBuffer {
    storage: Box<dyn BufferStorage>,
}

impl WriteBuffer {
    pub fn new(storage: Box<dyn BufferStorage>) -> Self {
        Self { storage }
    }

    pub fn heap(size: usize) -> Self {
        Self::new(Box::new(HeapBuffer::new(size)))
    }

    pub fn len(&self) -> usize {
        self.storage.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        self.storage.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.storage.as_mut_slice()
    }
}

impl std::fmt::Debug for WriteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBuffer").field("len", &self.len()).finish()
    }
}

/// Failure of a delete or update, with the reason the engine gave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateFailure {
    pub status: HResult,
    pub cause: UpdateFailureCause,
}

/// How to complete a command the provider returned `Pending` for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCompletion {
    Plain(HResult),
    WithEnumeration(HResult, DirectoryBufferHandle),
    WithNotificationMask(HResult, NotificationType),
}

/// The host engine's command surface.
pub trait VirtualizationEngine: Send + Sync {
    /// Capability level, resolved once when the binding is created.
    fn api_level(&self) -> ApiLevel;

    /// Whether `root` is already marked as a virtualization root.
    fn is_virtualization_root(&self, root: &Path) -> EngineResult<bool>;

    fn mark_directory_as_virtualization_root(&self, root: &Path, instance_id: Uuid) -> EngineResult<()>;

    fn start_virtualizing(
        &self,
        root: &Path,
        callbacks: Arc<dyn ProviderCallbacks>,
        options: &StartOptions,
    ) -> EngineResult<()>;

    fn stop_virtualizing(&self);

    fn instance_info(&self) -> EngineResult<InstanceInfo>;

    fn write_placeholder_info(&self, relative_path: &str, record: &PlaceholderRecord) -> EngineResult<()>;

    /// Symlink-aware variant; only called on engines that support symlinks.
    fn write_placeholder_info2(&self, relative_path: &str, record: &PlaceholderRecord) -> EngineResult<()>;

    fn allocate_aligned_buffer(&self, size: usize) -> EngineResult<WriteBuffer>;

    fn write_file_data(
        &self,
        data_stream_id: Uuid,
        buffer: &WriteBuffer,
        byte_offset: u64,
        length: u32,
    ) -> EngineResult<()>;

    fn delete_file(&self, relative_path: &str, update_flags: UpdateType) -> Result<(), UpdateFailure>;

    fn update_file_if_needed(
        &self,
        relative_path: &str,
        record: &PlaceholderRecord,
        update_flags: UpdateType,
    ) -> Result<(), UpdateFailure>;

    /// Returns the number of entries that were cached.
    fn clear_negative_path_cache(&self) -> EngineResult<u32>;

    fn complete_command(&self, command_id: i32, completion: CommandCompletion) -> EngineResult<()>;

    fn mark_directory_as_placeholder(
        &self,
        root: &Path,
        target: &Path,
        content_id: &PlaceholderId,
        provider_id: &PlaceholderId,
        instance_id: Uuid,
    ) -> EngineResult<()>;

    fn on_disk_file_state(&self, full_path: &Path) -> EngineResult<OnDiskFileState>;
}

/// Reply to a notification callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationResponse {
    pub status: HResult,
    /// New notification mask for categories with a mask out-parameter.
    pub notification_mask: Option<NotificationType>,
}

impl NotificationResponse {
    pub fn status(status: HResult) -> Self {
        Self {
            status,
            notification_mask: None,
        }
    }
}

/// Callbacks the engine invokes on the provider, from arbitrary threads.
///
/// Every method returns a status on all paths.
pub trait ProviderCallbacks: Send + Sync {
    fn start_directory_enumeration(&self, data: &CallbackData, enumeration_id: Uuid) -> HResult;

    fn get_directory_enumeration(
        &self,
        data: &CallbackData,
        enumeration_id: Uuid,
        filter: Option<&str>,
        restart: bool,
        sink: &mut dyn DirectoryEntrySink,
    ) -> HResult;

    fn end_directory_enumeration(&self, data: &CallbackData, enumeration_id: Uuid) -> HResult;

    fn get_placeholder_info(&self, data: &CallbackData) -> HResult;

    fn get_file_data(&self, data: &CallbackData, byte_offset: u64, length: u32) -> HResult;

    fn query_file_name(&self, data: &CallbackData) -> HResult;

    fn notify(
        &self,
        data: &CallbackData,
        is_directory: bool,
        notification: &Notification,
    ) -> NotificationResponse;

    fn cancel_command(&self, data: &CallbackData);
}
