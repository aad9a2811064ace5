//! Test-mode synchronization signals.
//!
//! In test mode the provider sets named events created by an external test
//! harness: once after start, and once per notification category.

use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use crate::error::{ReflectError, Result};

/// Well-known event set after virtualization starts.
pub const PROVIDER_TEST_PROCEED: &str = "ProviderTestProceed";

/// Why a named event could not be set.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalError {
    #[error("event does not exist")]
    NotFound,

    #[error("access to event denied")]
    AccessDenied,

    #[error("{0}")]
    Other(String),
}

/// Sets a named, externally created event.
pub trait EventSignal: Send + Sync {
    fn signal(&self, event_name: &str) -> std::result::Result<(), SignalError>;
}

/// Signal target for platforms without named events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSignal;

impl EventSignal for NoopSignal {
    fn signal(&self, event_name: &str) -> std::result::Result<(), SignalError> {
        tracing::debug!("No event signalling on this platform, skipping {}", event_name);
        Err(SignalError::NotFound)
    }
}

/// Signals events while test mode is on.
///
/// A missing event turns test mode off for the rest of the run. Any other
/// failure is returned as a fatal error.
pub struct TestSignaler {
    enabled: AtomicBool,
    target: Box<dyn EventSignal>,
}

impl TestSignaler {
    pub fn new(enabled: bool, target: Box<dyn EventSignal>) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            target,
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, Box::new(NoopSignal))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn signal_if_test_mode(&self, event_name: &str) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        match self.target.signal(event_name) {
            Ok(()) => {
                tracing::debug!("Signalled test event {}", event_name);
                Ok(())
            }
            Err(SignalError::NotFound) => {
                tracing::error!(
                    "Test mode specified but wait event {} does not exist. Clearing test mode.",
                    event_name
                );
                self.enabled.store(false, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                tracing::error!(fatal = true, "Opening event {}: {}", event_name, e);
                Err(ReflectError::TestSignal {
                    event: event_name.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

impl std::fmt::Debug for TestSignaler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestSignaler")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Scripted {
        result: std::result::Result<(), SignalError>,
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl EventSignal for Scripted {
        fn signal(&self, event_name: &str) -> std::result::Result<(), SignalError> {
            self.seen.lock().push(event_name.to_string());
            self.result.clone()
        }
    }

    fn signaler(result: std::result::Result<(), SignalError>) -> (TestSignaler, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let target = Scripted {
            result,
            seen: Arc::clone(&seen),
        };
        (TestSignaler::new(true, Box::new(target)), seen)
    }

    #[test]
    fn test_disabled_never_signals() {
        let signaler = TestSignaler::disabled();
        assert!(signaler.signal_if_test_mode(PROVIDER_TEST_PROCEED).is_ok());
        assert!(!signaler.is_enabled());
    }

    #[test]
    fn test_success() {
        let (signaler, seen) = signaler(Ok(()));
        signaler.signal_if_test_mode(PROVIDER_TEST_PROCEED).unwrap();
        signaler.signal_if_test_mode("PreDelete").unwrap();
        assert_eq!(*seen.lock(), vec![PROVIDER_TEST_PROCEED, "PreDelete"]);
        assert!(signaler.is_enabled());
    }

    #[test]
    fn test_missing_event_clears_test_mode() {
        let (signaler, seen) = signaler(Err(SignalError::NotFound));
        assert!(signaler.signal_if_test_mode(PROVIDER_TEST_PROCEED).is_ok());
        assert!(!signaler.is_enabled());

        signaler.signal_if_test_mode("FileOpened").unwrap();
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_access_denied_is_fatal() {
        let (signaler, _) = signaler(Err(SignalError::AccessDenied));
        let err = signaler.signal_if_test_mode(PROVIDER_TEST_PROCEED).unwrap_err();
        assert!(matches!(err, ReflectError::TestSignal { .. }));
        assert!(signaler.is_enabled());
    }

    #[test]
    fn test_other_failure_is_fatal() {
        let (signaler, _) = signaler(Err(SignalError::Other("boom".into())));
        let err = signaler.signal_if_test_mode("X").unwrap_err();
        assert_eq!(err.to_string(), "Test signal 'X' failed: boom");
    }
}
