use std::sync::atomic::{AtomicU64, Ordering};

/// Provider activity counters
#[derive(Debug, Default)]
pub struct ProviderStats {
    enumerations_started: AtomicU64,
    entries_returned: AtomicU64,
    placeholders_written: AtomicU64,
    files_hydrated: AtomicU64,
    bytes_hydrated: AtomicU64,
    notifications: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time copy of [`ProviderStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub enumerations_started: u64,
    pub entries_returned: u64,
    pub placeholders_written: u64,
    pub files_hydrated: u64,
    pub bytes_hydrated: u64,
    pub notifications: u64,
    pub failures: u64,
}

impl ProviderStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_enumerations_started(&self) {
        self.enumerations_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_entries_returned(&self, entries: u64) {
        self.entries_returned.fetch_add(entries, Ordering::Relaxed);
    }

    pub fn increment_placeholders_written(&self) {
        self.placeholders_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_files_hydrated(&self) {
        self.files_hydrated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_hydrated(&self, bytes: u64) {
        self.bytes_hydrated.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn increment_notifications(&self) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_failures(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_enumerations_started(&self) -> u64 {
        self.enumerations_started.load(Ordering::Relaxed)
    }

    pub fn get_entries_returned(&self) -> u64 {
        self.entries_returned.load(Ordering::Relaxed)
    }

    pub fn get_placeholders_written(&self) -> u64 {
        self.placeholders_written.load(Ordering::Relaxed)
    }

    pub fn get_files_hydrated(&self) -> u64 {
        self.files_hydrated.load(Ordering::Relaxed)
    }

    pub fn get_bytes_hydrated(&self) -> u64 {
        self.bytes_hydrated.load(Ordering::Relaxed)
    }

    pub fn get_notifications(&self) -> u64 {
        self.notifications.load(Ordering::Relaxed)
    }

    pub fn get_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            enumerations_started: self.get_enumerations_started(),
            entries_returned: self.get_entries_returned(),
            placeholders_written: self.get_placeholders_written(),
            files_hydrated: self.get_files_hydrated(),
            bytes_hydrated: self.get_bytes_hydrated(),
            notifications: self.get_notifications(),
            failures: self.get_failures(),
        }
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "enumerations={} entries={} placeholders={} files_hydrated={} bytes_hydrated={} notifications={} failures={}",
            self.enumerations_started,
            self.entries_returned,
            self.placeholders_written,
            self.files_hydrated,
            self.bytes_hydrated,
            self.notifications,
            self.failures
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = ProviderStats::new();
        stats.increment_enumerations_started();
        stats.add_entries_returned(3);
        stats.add_entries_returned(2);
        stats.add_bytes_hydrated(10);
        stats.increment_failures();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.enumerations_started, 1);
        assert_eq!(snapshot.entries_returned, 5);
        assert_eq!(snapshot.bytes_hydrated, 10);
        assert_eq!(snapshot.failures, 1);
        assert_eq!(snapshot.placeholders_written, 0);
        assert!(snapshot.to_string().contains("entries=5"));
    }
}
