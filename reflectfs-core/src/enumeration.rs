//! Enumeration session registry.
//!
//! Each directory enumeration the engine starts gets a session holding a sorted
//! snapshot of the directory's children taken at start time, a cursor, and the
//! filter captured on the first continue-call (or replaced on restart). The
//! dispatcher resumes a session across repeated continue-calls until the engine
//! ends it.

use std::sync::Arc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;
use crate::error::{ReflectError, Result};
use crate::naming::{is_match_all, NameCollation};
use crate::types::entry::LayerEntry;

/// One in-progress directory listing.
pub struct ActiveEnumeration {
    /// Snapshot sorted in collation order; never changes after creation.
    entries: Arc<[LayerEntry]>,
    index: usize,
    filter: Option<String>,
    filter_captured: bool,
    collation: Arc<dyn NameCollation>,
}

impl ActiveEnumeration {
    /// Creates a session over `entries`, sorting them with `collation`.
    pub fn new(entries: impl IntoIterator<Item = LayerEntry>, collation: Arc<dyn NameCollation>) -> Self {
        let mut entries: Vec<LayerEntry> = entries.into_iter().collect();
        entries.sort_by(|a, b| collation.compare(&a.name, &b.name));

        Self {
            entries: entries.into(),
            index: 0,
            filter: None,
            filter_captured: false,
            collation,
        }
    }

    /// Entry at the cursor, if any.
    pub fn current(&self) -> Option<&LayerEntry> {
        self.entries.get(self.index)
    }

    pub fn is_current_valid(&self) -> bool {
        self.index < self.entries.len()
    }

    /// Advances past the current entry and any entries the filter rejects.
    pub fn move_next(&mut self) -> bool {
        if self.is_current_valid() {
            self.index += 1;
        }
        self.skip_filtered();
        self.is_current_valid()
    }

    /// Rewinds to the start and replaces the filter, even with an empty one.
    pub fn restart(&mut self, filter: Option<&str>) {
        self.index = 0;
        self.filter = normalize_filter(filter);
        self.filter_captured = true;
        self.skip_filtered();
    }

    /// Captures the filter on the first call of an enumeration; later calls
    /// keep the filter already captured.
    pub fn try_save_filter(&mut self, filter: Option<&str>) -> bool {
        if self.filter_captured {
            return false;
        }
        self.filter = normalize_filter(filter);
        self.filter_captured = true;
        self.skip_filtered();
        true
    }

    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    /// Cursor position within the snapshot.
    pub fn position(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn skip_filtered(&mut self) {
        while let Some(entry) = self.entries.get(self.index) {
            let keep = match &self.filter {
                None => true,
                Some(pattern) => self.collation.matches(&entry.name, pattern),
            };
            if keep {
                break;
            }
            self.index += 1;
        }
    }
}

fn normalize_filter(filter: Option<&str>) -> Option<String> {
    filter.filter(|f| !is_match_all(f)).map(str::to_string)
}

/// Concurrent map of enumeration sessions keyed by the engine's session id.
///
/// Sessions for different ids never block each other. Each session sits behind
/// its own lock; an overlapping call on the same id fails with `SessionBusy`
/// instead of waiting.
pub struct EnumerationRegistry {
    sessions: DashMap<Uuid, Arc<Mutex<ActiveEnumeration>>>,
    collation: Arc<dyn NameCollation>,
}

impl EnumerationRegistry {
    pub fn new(collation: Arc<dyn NameCollation>) -> Self {
        Self {
            sessions: DashMap::new(),
            collation,
        }
    }

    /// Registers a session over a snapshot of `entries`. Returns the entry count.
    ///
    /// The listing is collected and sorted before any map shard is locked.
    pub fn start(&self, id: Uuid, entries: impl IntoIterator<Item = LayerEntry>) -> Result<usize> {
        let session = ActiveEnumeration::new(entries, Arc::clone(&self.collation));
        let count = session.len();

        match self.sessions.entry(id) {
            Entry::Occupied(_) => Err(ReflectError::DuplicateSession { id }),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(session)));
                Ok(count)
            }
        }
    }

    /// Positions the session for a continue-call and runs `f` on it.
    ///
    /// With `restart` the cursor rewinds and `filter` replaces the saved
    /// filter; otherwise `filter` is only adopted if none was captured yet.
    pub fn continue_with<R>(
        &self,
        id: Uuid,
        filter: Option<&str>,
        restart: bool,
        f: impl FnOnce(&mut ActiveEnumeration) -> R,
    ) -> Result<R> {
        let session = self
            .sessions
            .get(&id)
            .map(|s| Arc::clone(s.value()))
            .ok_or(ReflectError::SessionNotFound { id })?;

        let mut session = session
            .try_lock()
            .ok_or(ReflectError::SessionBusy { id })?;

        if restart {
            session.restart(filter);
        } else {
            session.try_save_filter(filter);
        }

        Ok(f(&mut *session))
    }

    /// Removes and discards a session.
    pub fn end(&self, id: Uuid) -> Result<()> {
        self.sessions
            .remove(&id)
            .map(|_| ())
            .ok_or(ReflectError::SessionNotFound { id })
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::DefaultCollation;
    use crate::types::entry::FileAttributes;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn entry(name: &str, is_directory: bool) -> LayerEntry {
        LayerEntry::new(name, format!("/layer/{}", name), is_directory, 1, FileAttributes::NORMAL)
    }

    fn entries() -> Vec<LayerEntry> {
        vec![
            entry("zebra.txt", false),
            entry("docs", true),
            entry("Banana.txt", false),
            entry("apple.md", false),
        ]
    }

    fn names(session: &mut ActiveEnumeration) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(entry) = session.current() {
            out.push(entry.name.clone());
            session.move_next();
        }
        out
    }

    fn registry() -> EnumerationRegistry {
        EnumerationRegistry::new(Arc::new(DefaultCollation))
    }

    #[test]
    fn test_session_is_sorted() {
        let mut session = ActiveEnumeration::new(entries(), Arc::new(DefaultCollation));
        assert_eq!(names(&mut session), vec!["apple.md", "Banana.txt", "docs", "zebra.txt"]);
        assert!(!session.is_current_valid());
        assert!(!session.move_next());
    }

    #[test]
    fn test_filter_skips_non_matching() {
        let mut session = ActiveEnumeration::new(entries(), Arc::new(DefaultCollation));
        assert!(session.try_save_filter(Some("*.txt")));
        assert_eq!(names(&mut session), vec!["Banana.txt", "zebra.txt"]);
    }

    #[test]
    fn test_match_all_filters_are_no_filter() {
        let mut session = ActiveEnumeration::new(entries(), Arc::new(DefaultCollation));
        session.restart(Some("*"));
        assert_eq!(session.filter(), None);
        session.restart(Some("   "));
        assert_eq!(session.filter(), None);
        assert_eq!(names(&mut session).len(), 4);
    }

    #[test]
    fn test_filter_persists_without_restart() {
        let registry = registry();
        let id = Uuid::new_v4();
        registry.start(id, entries()).unwrap();

        let first = registry
            .continue_with(id, Some("*.txt"), false, |s| {
                let name = s.current().map(|e| e.name.clone());
                s.move_next();
                name
            })
            .unwrap();
        assert_eq!(first.as_deref(), Some("Banana.txt"));

        // Second call supplies no filter; the captured one stays in force.
        let rest = registry.continue_with(id, None, false, |s| {
            assert_eq!(s.filter(), Some("*.txt"));
            names(s)
        });
        assert_eq!(rest.unwrap(), vec!["zebra.txt"]);
    }

    #[test]
    fn test_later_filter_ignored_without_restart() {
        let registry = registry();
        let id = Uuid::new_v4();
        registry.start(id, entries()).unwrap();

        registry.continue_with(id, Some("*.md"), false, |_| ()).unwrap();
        let rest = registry.continue_with(id, Some("*.txt"), false, names).unwrap();
        assert_eq!(rest, vec!["apple.md"]);
    }

    #[test]
    fn test_restart_replaces_filter_even_when_empty() {
        let registry = registry();
        let id = Uuid::new_v4();
        registry.start(id, entries()).unwrap();

        let filtered = registry.continue_with(id, Some("*.txt"), false, names).unwrap();
        assert_eq!(filtered.len(), 2);

        let all = registry.continue_with(id, None, true, names).unwrap();
        assert_eq!(all, vec!["apple.md", "Banana.txt", "docs", "zebra.txt"]);

        let again = registry.continue_with(id, Some("d*"), true, names).unwrap();
        assert_eq!(again, vec!["docs"]);
    }

    #[test]
    fn test_restart_first_then_plain_call() {
        let registry = registry();
        let id = Uuid::new_v4();
        registry.start(id, entries()).unwrap();

        registry.continue_with(id, Some("*.md"), true, |_| ()).unwrap();
        // Filter was captured by the restart, a later plain call cannot replace it.
        let rest = registry.continue_with(id, Some("*.txt"), false, names).unwrap();
        assert_eq!(rest, vec!["apple.md"]);
    }

    #[test]
    fn test_duplicate_session_rejected() {
        let registry = registry();
        let id = Uuid::new_v4();
        assert_eq!(registry.start(id, entries()).unwrap(), 4);
        assert!(matches!(
            registry.start(id, Vec::new()),
            Err(ReflectError::DuplicateSession { .. })
        ));
        // Snapshot untouched.
        assert_eq!(registry.continue_with(id, None, false, |s| s.len()).unwrap(), 4);
    }

    #[test]
    fn test_missing_session() {
        let registry = registry();
        let id = Uuid::new_v4();
        assert!(matches!(
            registry.continue_with(id, None, false, |_| ()),
            Err(ReflectError::SessionNotFound { .. })
        ));
        assert!(matches!(registry.end(id), Err(ReflectError::SessionNotFound { .. })));
    }

    #[test]
    fn test_end_discards_session() {
        let registry = registry();
        let id = Uuid::new_v4();
        registry.start(id, entries()).unwrap();
        assert!(registry.contains(id));
        registry.end(id).unwrap();
        assert!(registry.is_empty());
        assert!(registry.continue_with(id, None, false, |_| ()).is_err());
    }

    #[test]
    fn test_overlapping_call_on_same_session_fails() {
        let registry = registry();
        let id = Uuid::new_v4();
        registry.start(id, entries()).unwrap();

        let nested = registry
            .continue_with(id, None, false, |_| registry.continue_with(id, None, false, |_| ()))
            .unwrap();
        assert!(matches!(nested, Err(ReflectError::SessionBusy { .. })));
    }

    #[test]
    fn test_independent_sessions() {
        let registry = registry();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        registry.start(a, entries()).unwrap();
        registry.start(b, vec![entry("only", false)]).unwrap();

        let inner = registry
            .continue_with(a, None, false, |_| registry.continue_with(b, None, false, names))
            .unwrap()
            .unwrap();
        assert_eq!(inner, vec!["only"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_start_lists_outside_registry_lock() {
        let registry = Arc::new(registry());
        let (listing_tx, listing_rx) = mpsc::channel();
        let (resume_tx, resume_rx) = mpsc::channel::<()>();
        let first = Uuid::new_v4();

        let worker = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let inner = Arc::clone(&registry);
                let listing = (0..3).map(move |i| {
                    if i == 0 {
                        // Reads every shard while the listing is in progress.
                        listing_tx.send(inner.len()).unwrap();
                        resume_rx.recv().unwrap();
                    }
                    entry(&format!("f{}", i), false)
                });
                registry.start(first, listing)
            })
        };

        assert_eq!(listing_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);

        // Another session starts while the first listing is still paused.
        let (done_tx, done_rx) = mpsc::channel();
        {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let started = registry.start(Uuid::new_v4(), vec![entry("other", false)]);
                done_tx.send(started.is_ok()).unwrap();
            });
        }
        assert!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap());

        resume_tx.send(()).unwrap();
        assert_eq!(worker.join().unwrap().unwrap(), 3);
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(first));
    }
}
