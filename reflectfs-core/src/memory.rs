//! In-process engine and directory buffer.
//!
//! [`MemoryEngine`] implements [`VirtualizationEngine`] by recording every
//! command it receives, and [`MemorySink`] is a directory-entry buffer with a
//! configurable capacity. Together they drive the provider without a host
//! engine, which is how the provider is tested on every platform.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use parking_lot::Mutex;
use uuid::Uuid;
use crate::engine::{
    ApiLevel, CommandCompletion, DirectoryBufferHandle, DirectoryEntrySink, EngineResult, InstanceInfo,
    ProviderCallbacks, StartOptions, UpdateFailure, VirtualizationEngine, WriteBuffer,
};
use crate::status::HResult;
use crate::types::placeholder::{
    FileBasicInfo, OnDiskFileState, PlaceholderId, PlaceholderRecord, UpdateFailureCause, UpdateType,
};

#[derive(Default)]
struct MemoryState {
    roots: HashSet<PathBuf>,
    root: Option<PathBuf>,
    running: bool,
    instance_id: Uuid,
    start_options: Option<StartOptions>,
    callbacks: Option<Arc<dyn ProviderCallbacks>>,
    placeholders: BTreeMap<String, PlaceholderRecord>,
    directory_placeholders: Vec<PathBuf>,
    writes: HashMap<Uuid, Vec<(u64, Vec<u8>)>>,
    completions: Vec<(i32, CommandCompletion)>,
    negative_cache_entries: u32,
    start_failure: Option<HResult>,
    info_failure: Option<HResult>,
    writes_before_failure: Option<usize>,
    stop_calls: usize,
}

/// Engine double that keeps all state in memory.
pub struct MemoryEngine {
    level: ApiLevel,
    write_alignment: u32,
    state: Mutex<MemoryState>,
}

impl MemoryEngine {
    pub fn new(level: ApiLevel) -> Self {
        Self {
            level,
            write_alignment: 1,
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn with_write_alignment(mut self, alignment: u32) -> Self {
        self.write_alignment = alignment;
        self
    }

    /// Makes the next start fail with `status`.
    pub fn fail_start_with(&self, status: HResult) {
        self.state.lock().start_failure = Some(status);
    }

    /// Makes instance info queries fail with `status`.
    pub fn fail_instance_info_with(&self, status: HResult) {
        self.state.lock().info_failure = Some(status);
    }

    /// Lets `count` file data writes succeed, then fails the rest.
    pub fn fail_writes_after(&self, count: usize) {
        self.state.lock().writes_before_failure = Some(count);
    }

    pub fn set_negative_cache_entries(&self, count: u32) {
        self.state.lock().negative_cache_entries = count;
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn stop_calls(&self) -> usize {
        self.state.lock().stop_calls
    }

    pub fn start_options(&self) -> Option<StartOptions> {
        self.state.lock().start_options.clone()
    }

    /// Callbacks registered by the last start.
    pub fn callbacks(&self) -> Option<Arc<dyn ProviderCallbacks>> {
        self.state.lock().callbacks.clone()
    }

    pub fn placeholder(&self, relative_path: &str) -> Option<PlaceholderRecord> {
        self.state.lock().placeholders.get(relative_path).cloned()
    }

    pub fn placeholder_paths(&self) -> Vec<String> {
        self.state.lock().placeholders.keys().cloned().collect()
    }

    /// Offsets and lengths of every write to a data stream, in order.
    pub fn writes(&self, data_stream_id: Uuid) -> Vec<(u64, usize)> {
        self.state
            .lock()
            .writes
            .get(&data_stream_id)
            .map(|writes| writes.iter().map(|(offset, data)| (*offset, data.len())).collect())
            .unwrap_or_default()
    }

    /// Bytes written to a data stream, laid out at their offsets.
    pub fn file_data(&self, data_stream_id: Uuid) -> Vec<u8> {
        let state = self.state.lock();
        let mut contents = Vec::new();
        for (offset, data) in state.writes.get(&data_stream_id).into_iter().flatten() {
            let start = usize::try_from(*offset).unwrap_or(usize::MAX);
            let end = start.saturating_add(data.len());
            if contents.len() < end {
                contents.resize(end, 0);
            }
            contents[start..end].copy_from_slice(data);
        }
        contents
    }

    pub fn completions(&self) -> Vec<(i32, CommandCompletion)> {
        self.state.lock().completions.clone()
    }

    pub fn directory_placeholders(&self) -> Vec<PathBuf> {
        self.state.lock().directory_placeholders.clone()
    }

    fn store_placeholder(&self, relative_path: &str, record: PlaceholderRecord) -> EngineResult<()> {
        if relative_path.is_empty() {
            return Err(HResult::InvalidArg);
        }
        self.state
            .lock()
            .placeholders
            .insert(relative_path.to_string(), record);
        Ok(())
    }
}

impl VirtualizationEngine for MemoryEngine {
    fn api_level(&self) -> ApiLevel {
        self.level
    }

    fn is_virtualization_root(&self, root: &Path) -> EngineResult<bool> {
        Ok(self.state.lock().roots.contains(root))
    }

    fn mark_directory_as_virtualization_root(&self, root: &Path, instance_id: Uuid) -> EngineResult<()> {
        let mut state = self.state.lock();
        if !state.roots.insert(root.to_path_buf()) {
            return Err(HResult::ReparsePointEncountered);
        }
        state.instance_id = instance_id;
        Ok(())
    }

    fn start_virtualizing(
        &self,
        root: &Path,
        callbacks: Arc<dyn ProviderCallbacks>,
        options: &StartOptions,
    ) -> EngineResult<()> {
        let mut state = self.state.lock();
        if let Some(status) = state.start_failure.take() {
            return Err(status);
        }
        if state.running {
            return Err(HResult::AlreadyInitialized);
        }
        if state.instance_id.is_nil() {
            state.instance_id = Uuid::new_v4();
        }
        state.running = true;
        state.root = Some(root.to_path_buf());
        state.start_options = Some(options.clone());
        state.callbacks = Some(callbacks);
        Ok(())
    }

    fn stop_virtualizing(&self) {
        let mut state = self.state.lock();
        state.running = false;
        state.callbacks = None;
        state.stop_calls += 1;
    }

    fn instance_info(&self) -> EngineResult<InstanceInfo> {
        let state = self.state.lock();
        if let Some(status) = state.info_failure {
            return Err(status);
        }
        if !state.running {
            return Err(HResult::Handle);
        }
        Ok(InstanceInfo {
            instance_id: state.instance_id,
            write_alignment: self.write_alignment,
        })
    }

    fn write_placeholder_info(&self, relative_path: &str, record: &PlaceholderRecord) -> EngineResult<()> {
        let mut record = record.clone();
        record.symlink_target = None;
        self.store_placeholder(relative_path, record)
    }

    fn write_placeholder_info2(&self, relative_path: &str, record: &PlaceholderRecord) -> EngineResult<()> {
        if !self.level.supports_symlinks() {
            return Err(HResult::VirtualizationUnavailable);
        }
        self.store_placeholder(relative_path, record.clone())
    }

    fn allocate_aligned_buffer(&self, size: usize) -> EngineResult<WriteBuffer> {
        Ok(WriteBuffer::heap(size))
    }

    fn write_file_data(
        &self,
        data_stream_id: Uuid,
        buffer: &WriteBuffer,
        byte_offset: u64,
        length: u32,
    ) -> EngineResult<()> {
        let mut state = self.state.lock();
        if let Some(remaining) = state.writes_before_failure.as_mut() {
            if *remaining == 0 {
                return Err(HResult::Handle);
            }
            *remaining -= 1;
        }

        let length = usize::try_from(length).map_err(|_| HResult::InvalidArg)?;
        let data = buffer.as_slice().get(..length).ok_or(HResult::InvalidArg)?;
        state
            .writes
            .entry(data_stream_id)
            .or_default()
            .push((byte_offset, data.to_vec()));
        Ok(())
    }

    fn delete_file(&self, relative_path: &str, _update_flags: UpdateType) -> Result<(), UpdateFailure> {
        match self.state.lock().placeholders.remove(relative_path) {
            Some(_) => Ok(()),
            None => Err(UpdateFailure {
                status: HResult::FileNotFound,
                cause: UpdateFailureCause::empty(),
            }),
        }
    }

    fn update_file_if_needed(
        &self,
        relative_path: &str,
        record: &PlaceholderRecord,
        _update_flags: UpdateType,
    ) -> Result<(), UpdateFailure> {
        let mut state = self.state.lock();
        match state.placeholders.get_mut(relative_path) {
            Some(existing) => {
                if existing != record {
                    *existing = record.clone();
                }
                Ok(())
            }
            None => Err(UpdateFailure {
                status: HResult::FileNotFound,
                cause: UpdateFailureCause::empty(),
            }),
        }
    }

    fn clear_negative_path_cache(&self) -> EngineResult<u32> {
        Ok(std::mem::take(&mut self.state.lock().negative_cache_entries))
    }

    fn complete_command(&self, command_id: i32, completion: CommandCompletion) -> EngineResult<()> {
        self.state.lock().completions.push((command_id, completion));
        Ok(())
    }

    fn mark_directory_as_placeholder(
        &self,
        _root: &Path,
        target: &Path,
        _content_id: &PlaceholderId,
        _provider_id: &PlaceholderId,
        _instance_id: Uuid,
    ) -> EngineResult<()> {
        self.state
            .lock()
            .directory_placeholders
            .push(target.to_path_buf());
        Ok(())
    }

    fn on_disk_file_state(&self, full_path: &Path) -> EngineResult<OnDiskFileState> {
        let state = self.state.lock();
        let relative = state
            .root
            .as_deref()
            .and_then(|root| full_path.strip_prefix(root).ok())
            .ok_or(HResult::FileNotFound)?;
        let key = relative.to_string_lossy().replace('\\', "/");

        if state.placeholders.keys().any(|path| path.replace('\\', "/") == key) {
            Ok(OnDiskFileState::PLACEHOLDER)
        } else {
            Err(HResult::FileNotFound)
        }
    }
}

/// One entry accepted by a [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkEntry {
    pub file_name: String,
    pub basic_info: FileBasicInfo,
    pub symlink_target: Option<String>,
}

/// Directory-entry buffer that accepts a limited number of entries.
#[derive(Debug, Default)]
pub struct MemorySink {
    capacity: Option<usize>,
    entries: Vec<SinkEntry>,
}

impl MemorySink {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            entries: Vec::new(),
        }
    }

    pub fn entries(&self) -> &[SinkEntry] {
        &self.entries
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.file_name.clone()).collect()
    }

    fn push(&mut self, file_name: &str, basic_info: &FileBasicInfo, symlink_target: Option<&str>) -> bool {
        if self.capacity.is_some_and(|capacity| self.entries.len() >= capacity) {
            return false;
        }
        self.entries.push(SinkEntry {
            file_name: file_name.to_string(),
            basic_info: *basic_info,
            symlink_target: symlink_target.map(str::to_string),
        });
        true
    }
}

impl DirectoryEntrySink for MemorySink {
    fn add(&mut self, file_name: &str, basic_info: &FileBasicInfo) -> bool {
        self.push(file_name, basic_info, None)
    }

    fn add_with_symlink(
        &mut self,
        file_name: &str,
        basic_info: &FileBasicInfo,
        symlink_target: Option<&str>,
    ) -> bool {
        self.push(file_name, basic_info, symlink_target)
    }

    fn handle(&self) -> DirectoryBufferHandle {
        DirectoryBufferHandle(self as *const Self as usize)
    }
}
