//! The reflector provider and its callback dispatcher.
//!
//! [`ReflectProvider`] owns the virtualization instance and answers every
//! engine callback from the layer tree. Callbacks arrive on engine worker
//! threads; the only state they share is the enumeration registry, the
//! cancelled-command set and the counters, all of which are concurrent.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use dashmap::DashSet;
use uuid::Uuid;
use crate::engine::{
    ApiLevel, CallbackData, DirectoryEntrySink, NotificationResponse, OptionalCallbacks, ProviderCallbacks,
    StartOptions, VirtualizationEngine,
};
use crate::enumeration::{ActiveEnumeration, EnumerationRegistry};
use crate::error::{ReflectError, Result};
use crate::hydration;
use crate::instance::{AlignedWriteBuffer, VirtualizationInstance};
use crate::layer::{split_parent, with_file_name, LayerAccessor};
use crate::naming::{DefaultCollation, NameCollation};
use crate::notifications::NotificationRouter;
use crate::placeholder::{self, PlaceholderWriter};
use crate::signal::{EventSignal, NoopSignal, TestSignaler, PROVIDER_TEST_PROCEED};
use crate::stats::{ProviderStats, StatsSnapshot};
use crate::status::HResult;
use crate::types::config::ProviderOptions;
use crate::types::entry::LayerEntry;
use crate::types::notification::{Notification, NotificationOutcome};
use crate::types::placeholder::{PlaceholderId, PlaceholderRecord};

/// Content identifier stamped on every placeholder.
pub const CONTENT_ID: &[u8] = &[0];

/// Provider identifier stamped on every placeholder.
pub const PROVIDER_ID: &[u8] = &[1];

/// Projects a layer directory into a virtualization root.
pub struct ReflectProvider {
    dispatcher: Arc<Dispatcher>,
}

impl ReflectProvider {
    /// Creates a provider with the portable name collation and no test signalling target.
    pub fn new(options: ProviderOptions, engine: Arc<dyn VirtualizationEngine>) -> Result<Self> {
        Self::with_platform(options, engine, Arc::new(DefaultCollation), Box::new(NoopSignal))
    }

    /// Creates a provider using platform-supplied name collation and event signalling.
    ///
    /// The virtualization root is created and marked if needed.
    pub fn with_platform(
        options: ProviderOptions,
        engine: Arc<dyn VirtualizationEngine>,
        collation: Arc<dyn NameCollation>,
        event_signal: Box<dyn EventSignal>,
    ) -> Result<Self> {
        options
            .validate()
            .map_err(|errors| ReflectError::InvalidConfig { errors })?;

        let router = NotificationRouter::new(options.notifications_active(), options.deny_deletes);
        let start_options = StartOptions {
            pool_thread_count: options.pool_thread_count,
            concurrent_thread_count: options.concurrent_thread_count,
            enable_negative_path_cache: options.enable_negative_path_cache,
            notification_mappings: router.mappings(),
            optional_callbacks: OptionalCallbacks {
                query_file_name: true,
                notification: router.is_active(),
                cancel_command: true,
            },
        };

        let instance = VirtualizationInstance::new(&options.scratch_root, engine, start_options);
        instance.prepare_root()?;

        let writer = placeholder::writer_for(instance.api_level());
        tracing::debug!(
            "Engine API level {:?}, symlink placeholders {}",
            instance.api_level(),
            if writer.supports_symlinks() { "enabled" } else { "disabled" }
        );

        let dispatcher = Dispatcher {
            layer: LayerAccessor::new(&options.layer_root, Arc::clone(&collation)),
            registry: EnumerationRegistry::new(collation),
            signaler: TestSignaler::new(options.test_mode, event_signal),
            chunk_size: options.chunk_size,
            instance,
            writer,
            router,
            options,
            cancelled: DashSet::new(),
            stats: ProviderStats::new(),
            operation_id: AtomicU64::new(0),
        };

        tracing::info!(
            "Created instance. Layer [{}], Scratch [{}]",
            dispatcher.options.layer_root.display(),
            dispatcher.options.scratch_root.display()
        );
        if dispatcher.options.test_mode {
            tracing::info!("Provider set in TEST MODE.");
        }

        Ok(Self {
            dispatcher: Arc::new(dispatcher),
        })
    }

    /// Starts virtualizing and, in test mode, signals that tests may proceed.
    ///
    /// A fatal signalling failure stops the instance again.
    pub fn start(&self) -> Result<()> {
        tracing::info!("Starting provider...");

        let callbacks: Arc<dyn ProviderCallbacks> = Arc::new(CallbackContext {
            dispatcher: Arc::downgrade(&self.dispatcher),
        });
        self.dispatcher.instance.start(callbacks)?;

        if let Err(e) = self.dispatcher.signaler.signal_if_test_mode(PROVIDER_TEST_PROCEED) {
            if let Err(stop_err) = self.dispatcher.instance.stop() {
                tracing::warn!("Failed to stop after signalling failure: {}", stop_err);
            }
            return Err(e);
        }

        tracing::info!("Provider started");
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        self.dispatcher.instance.stop()
    }

    pub fn is_started(&self) -> bool {
        self.dispatcher.instance.is_started()
    }

    pub fn options(&self) -> &ProviderOptions {
        &self.dispatcher.options
    }

    pub fn api_level(&self) -> ApiLevel {
        self.dispatcher.instance.api_level()
    }

    /// The lifecycle manager, for placeholder maintenance and command completion.
    pub fn instance(&self) -> &VirtualizationInstance {
        &self.dispatcher.instance
    }

    pub fn test_mode(&self) -> bool {
        self.dispatcher.signaler.is_enabled()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.dispatcher.stats.snapshot()
    }

    /// Callback entry points as the engine sees them.
    pub fn callbacks(&self) -> Arc<dyn ProviderCallbacks> {
        Arc::clone(&self.dispatcher) as Arc<dyn ProviderCallbacks>
    }
}

impl Drop for ReflectProvider {
    fn drop(&mut self) {
        if self.dispatcher.instance.is_started() {
            if let Err(e) = self.dispatcher.instance.stop() {
                tracing::warn!("Failed to stop virtualization on drop: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for ReflectProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReflectProvider")
            .field("layer_root", &self.dispatcher.options.layer_root)
            .field("scratch_root", &self.dispatcher.options.scratch_root)
            .field("started", &self.is_started())
            .finish()
    }
}

/// Callback table handed to the engine. Holds the dispatcher weakly so the
/// engine's reference does not keep the provider alive.
struct CallbackContext {
    dispatcher: Weak<Dispatcher>,
}

impl CallbackContext {
    fn with<R>(&self, gone: R, f: impl FnOnce(&Dispatcher) -> R) -> R {
        match self.dispatcher.upgrade() {
            Some(dispatcher) => f(&dispatcher),
            None => {
                tracing::error!("Callback received after provider was dropped");
                gone
            }
        }
    }
}

impl ProviderCallbacks for CallbackContext {
    fn start_directory_enumeration(&self, data: &CallbackData, enumeration_id: Uuid) -> HResult {
        self.with(HResult::InternalError, |d| d.start_directory_enumeration(data, enumeration_id))
    }

    fn get_directory_enumeration(
        &self,
        data: &CallbackData,
        enumeration_id: Uuid,
        filter: Option<&str>,
        restart: bool,
        sink: &mut dyn DirectoryEntrySink,
    ) -> HResult {
        self.with(HResult::InternalError, |d| {
            d.get_directory_enumeration(data, enumeration_id, filter, restart, sink)
        })
    }

    fn end_directory_enumeration(&self, data: &CallbackData, enumeration_id: Uuid) -> HResult {
        self.with(HResult::InternalError, |d| d.end_directory_enumeration(data, enumeration_id))
    }

    fn get_placeholder_info(&self, data: &CallbackData) -> HResult {
        self.with(HResult::InternalError, |d| d.get_placeholder_info(data))
    }

    fn get_file_data(&self, data: &CallbackData, byte_offset: u64, length: u32) -> HResult {
        self.with(HResult::InternalError, |d| d.get_file_data(data, byte_offset, length))
    }

    fn query_file_name(&self, data: &CallbackData) -> HResult {
        self.with(HResult::InternalError, |d| d.query_file_name(data))
    }

    fn notify(&self, data: &CallbackData, is_directory: bool, notification: &Notification) -> NotificationResponse {
        self.with(NotificationResponse::status(HResult::InternalError), |d| {
            d.notify(data, is_directory, notification)
        })
    }

    fn cancel_command(&self, data: &CallbackData) {
        self.with((), |d| d.cancel_command(data))
    }
}

/// Answers engine callbacks from the layer.
struct Dispatcher {
    options: ProviderOptions,
    layer: LayerAccessor,
    registry: EnumerationRegistry,
    instance: VirtualizationInstance,
    writer: Box<dyn PlaceholderWriter>,
    router: NotificationRouter,
    signaler: TestSignaler,
    chunk_size: usize,
    /// Commands the engine asked to cancel that have not finished yet.
    cancelled: DashSet<i32>,
    stats: ProviderStats,
    operation_id: AtomicU64,
}

impl Dispatcher {
    fn next_operation_id(&self) -> u64 {
        self.operation_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn finish(&self, callback: &str, op_id: u64, hr: HResult) -> HResult {
        if hr.is_failed() {
            self.stats.increment_failures();
        }
        tracing::debug!("<---- {}[{}]: hr={}", callback, op_id, hr);
        hr
    }

    fn log_trigger(&self, data: &CallbackData) {
        tracing::debug!(
            "  triggered by [{} {}]",
            data.triggering_process_name,
            data.triggering_process_id
        );
    }

    /// Translates an entry and attaches its rewritten symlink target.
    fn record_for(&self, entry: &LayerEntry, full_layer_path: &Path) -> Result<PlaceholderRecord> {
        let mut record = placeholder::translate(entry, PlaceholderId::new(CONTENT_ID), PlaceholderId::new(PROVIDER_ID));
        record.symlink_target = placeholder::resolve_symlink_target_if_needed(
            &self.layer,
            entry,
            full_layer_path,
            &self.options.layer_root,
            &self.options.scratch_root,
        )?;
        Ok(record)
    }

    /// Adds entries from the cursor until the sink is full or the session is
    /// exhausted. The cursor only moves past entries the sink accepted.
    fn fill(&self, op_id: u64, session: &mut ActiveEnumeration, sink: &mut dyn DirectoryEntrySink) -> HResult {
        let mut added: u64 = 0;
        let mut hr = HResult::Ok;

        while let Some(entry) = session.current() {
            let record = match self.record_for(entry, &entry.full_path) {
                Ok(record) => record,
                Err(e) => {
                    tracing::error!("GetDirectoryEnumeration[{}]: {}", op_id, e);
                    hr = HResult::InternalError;
                    break;
                }
            };

            if self.writer.add_entry(sink, &entry.name, &record) {
                tracing::debug!(
                    "  Added {} dir={} target={:?}",
                    entry.name,
                    entry.is_directory,
                    record.symlink_target
                );
                added += 1;
                session.move_next();
            } else {
                tracing::debug!("  NOT added {} dir={}", entry.name, entry.is_directory);
                if added == 0 {
                    hr = HResult::InsufficientBuffer;
                }
                break;
            }
        }

        self.stats.add_entries_returned(added);
        tracing::debug!("  Added entries: {}", added);
        hr
    }

    fn hydrate(&self, op_id: u64, data: &CallbackData, byte_offset: u64, length: u32) -> HResult {
        let desired = u32::try_from(self.chunk_size).unwrap_or(u32::MAX).min(length);

        let AlignedWriteBuffer {
            mut buffer,
            aligned_offset,
            aligned_length,
        } = match self.instance.create_write_buffer_aligned(byte_offset, desired) {
            Ok(aligned) => aligned,
            Err(e) => {
                tracing::error!("GetFileData[{}]: {}", op_id, e);
                return match e.status() {
                    HResult::OutOfMemory => HResult::OutOfMemory,
                    _ => HResult::InternalError,
                };
            }
        };

        let chunk_size = usize::try_from(aligned_length).unwrap_or(usize::MAX).min(buffer.len());
        let mut write_offset = aligned_offset;

        let hr = hydration::hydrate_range(&self.layer, &data.file_path, aligned_offset, chunk_size, |chunk| {
            if self.cancelled.contains(&data.command_id) {
                tracing::info!("GetFileData[{}]: command {} cancelled", op_id, data.command_id);
                return false;
            }

            let Some(destination) = buffer.as_mut_slice().get_mut(..chunk.len()) else {
                return false;
            };
            destination.copy_from_slice(chunk);

            // chunk.len() is bounded by the buffer length, which fits in u32.
            let written = chunk.len() as u32;
            match self
                .instance
                .write_file_data(data.data_stream_id, &buffer, write_offset, written)
            {
                Ok(()) => {
                    write_offset += u64::from(written);
                    true
                }
                Err(e) => {
                    tracing::error!("WriteFileData failed: {}", e);
                    false
                }
            }
        });

        match hr {
            HResult::Ok => {
                self.stats.increment_files_hydrated();
                self.stats.add_bytes_hydrated(write_offset - aligned_offset);
                HResult::Ok
            }
            HResult::OutOfMemory => HResult::OutOfMemory,
            _ => HResult::InternalError,
        }
    }
}

impl ProviderCallbacks for Dispatcher {
    fn start_directory_enumeration(&self, data: &CallbackData, enumeration_id: Uuid) -> HResult {
        let op_id = self.next_operation_id();
        tracing::debug!(
            "----> StartDirectoryEnumeration[{}]: Path={}, EnumId={}",
            op_id,
            data.file_path,
            enumeration_id
        );
        self.log_trigger(data);

        let hr = match self.registry.start(enumeration_id, self.layer.list_children(&data.file_path)) {
            Ok(count) => {
                self.stats.increment_enumerations_started();
                tracing::debug!("  {} entries in [{}]", count, data.file_path);
                HResult::Ok
            }
            Err(e) => {
                tracing::error!("StartDirectoryEnumeration[{}]: {}", op_id, e);
                HResult::InternalError
            }
        };

        self.finish("StartDirectoryEnumeration", op_id, hr)
    }

    fn get_directory_enumeration(
        &self,
        data: &CallbackData,
        enumeration_id: Uuid,
        filter: Option<&str>,
        restart: bool,
        sink: &mut dyn DirectoryEntrySink,
    ) -> HResult {
        let op_id = self.next_operation_id();
        tracing::debug!(
            "----> GetDirectoryEnumeration[{}]: Path={}, EnumId={}, Filter={:?}, Restart={}",
            op_id,
            data.file_path,
            enumeration_id,
            filter,
            restart
        );

        let hr = match self
            .registry
            .continue_with(enumeration_id, filter, restart, |session| self.fill(op_id, session, sink))
        {
            Ok(hr) => hr,
            Err(e) => {
                tracing::error!(fatal = true, "GetDirectoryEnumeration[{}]: {}", op_id, e);
                HResult::InternalError
            }
        };

        self.finish("GetDirectoryEnumeration", op_id, hr)
    }

    fn end_directory_enumeration(&self, data: &CallbackData, enumeration_id: Uuid) -> HResult {
        let op_id = self.next_operation_id();
        tracing::debug!(
            "----> EndDirectoryEnumeration[{}]: Path={}, EnumId={}",
            op_id,
            data.file_path,
            enumeration_id
        );

        let hr = match self.registry.end(enumeration_id) {
            Ok(()) => HResult::Ok,
            Err(e) => {
                tracing::error!("EndDirectoryEnumeration[{}]: {}", op_id, e);
                HResult::InternalError
            }
        };

        self.finish("EndDirectoryEnumeration", op_id, hr)
    }

    fn get_placeholder_info(&self, data: &CallbackData) -> HResult {
        let op_id = self.next_operation_id();
        tracing::debug!("----> GetPlaceholderInfo[{}]: Path={}", op_id, data.file_path);
        self.log_trigger(data);

        let hr = match self.layer.get_entry(&data.file_path) {
            None => HResult::FileNotFound,
            Some(entry) => match self.record_for(&entry, &entry.full_path) {
                Err(e) => {
                    tracing::error!("GetPlaceholderInfo[{}]: {}", op_id, e);
                    HResult::InternalError
                }
                Ok(record) => {
                    // The layer's spelling of the name, under the caller's parent path.
                    let placeholder_path = with_file_name(&data.file_path, &entry.name);
                    match self.writer.write_placeholder(&self.instance, &placeholder_path, &record) {
                        Ok(()) => {
                            self.stats.increment_placeholders_written();
                            HResult::Ok
                        }
                        Err(e) => {
                            tracing::error!("GetPlaceholderInfo[{}]: {}", op_id, e);
                            e.status()
                        }
                    }
                }
            },
        };

        self.finish("GetPlaceholderInfo", op_id, hr)
    }

    fn get_file_data(&self, data: &CallbackData, byte_offset: u64, length: u32) -> HResult {
        let op_id = self.next_operation_id();
        tracing::debug!(
            "----> GetFileData[{}]: Path={}, Offset={}, Length={}",
            op_id,
            data.file_path,
            byte_offset,
            length
        );
        self.log_trigger(data);

        let hr = if self.layer.file_exists(&data.file_path) {
            self.hydrate(op_id, data, byte_offset, length)
        } else {
            HResult::FileNotFound
        };

        self.cancelled.remove(&data.command_id);
        self.finish("GetFileData", op_id, hr)
    }

    fn query_file_name(&self, data: &CallbackData) -> HResult {
        let op_id = self.next_operation_id();
        tracing::debug!("----> QueryFileName[{}]: Path={}", op_id, data.file_path);

        let (parent, name) = split_parent(&data.file_path);
        let collation = self.layer.collation();
        let found = self
            .layer
            .list_children(parent)
            .any(|child| collation.matches(&child.name, name));

        let hr = if found { HResult::Ok } else { HResult::FileNotFound };
        self.finish("QueryFileName", op_id, hr)
    }

    fn notify(&self, data: &CallbackData, is_directory: bool, notification: &Notification) -> NotificationResponse {
        let op_id = self.next_operation_id();
        tracing::debug!(
            "----> Notification[{}]: Path={}, Category={:?}",
            op_id,
            data.file_path,
            notification.category()
        );
        self.stats.increment_notifications();

        let response = match self.router.handle(data, is_directory, notification, &self.signaler) {
            NotificationOutcome::Allow => NotificationResponse::status(HResult::Ok),
            NotificationOutcome::Deny => NotificationResponse::status(HResult::AccessDenied),
            NotificationOutcome::SetMask(mask) => NotificationResponse {
                status: HResult::Ok,
                notification_mask: Some(mask),
            },
        };

        self.finish("Notification", op_id, response.status);
        response
    }

    fn cancel_command(&self, data: &CallbackData) {
        tracing::debug!("CancelCommand: CommandId={}", data.command_id);
        self.cancelled.insert(data.command_id);
    }
}
