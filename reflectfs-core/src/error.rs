//! Error types for the ReflectFS provider.

use crate::status::HResult;
use thiserror::Error;
use uuid::Uuid;

/// Error type for all ReflectFS operations.
#[derive(Debug, Error)]
pub enum ReflectError {
    /// File or directory not found in the layer.
    #[error("Path not found in layer: {path}")]
    NotFound {
        path: String
    },

    /// An enumeration session with this id is already registered.
    #[error("Enumeration session already exists: {id}")]
    DuplicateSession {
        id: Uuid
    },

    /// No enumeration session with this id is registered.
    #[error("Enumeration session not found: {id}")]
    SessionNotFound {
        id: Uuid
    },

    /// Two overlapping calls presented the same session id.
    #[error("Enumeration session is in use by another call: {id}")]
    SessionBusy {
        id: Uuid
    },

    /// The virtualization instance was started twice.
    #[error("Virtualization instance is already started")]
    AlreadyInitialized,

    /// The operation needs a running virtualization instance.
    #[error("Virtualization instance is not started")]
    NotStarted,

    /// A host engine call failed.
    #[error("Engine call '{operation}' failed: {status}")]
    Engine {
        operation: String,
        status: HResult
    },

    /// A symbolic link target could not be read from the layer.
    #[error("Failed to read symlink target of {path}: {source}")]
    SymlinkTarget {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Signalling a test synchronization event failed fatally.
    #[error("Test signal '{event}' failed: {reason}")]
    TestSignal {
        event: String,
        reason: String
    },

    /// Invalid provider configuration.
    #[error("Invalid configuration: {}", .errors.join("; "))]
    InvalidConfig {
        errors: Vec<String>
    },

    /// I/O error from the underlying system.
    #[error("I/O error")]
    Io {
        #[from]
        #[source]
        source: std::io::Error,
    },
}

impl ReflectError {
    /// Returns the status code reported to the host engine for this error.
    ///
    /// Registry errors indicate a protocol violation and all surface as
    /// `InternalError`.
    pub fn status(&self) -> HResult {
        match self {
            ReflectError::NotFound { .. } => HResult::FileNotFound,
            ReflectError::AlreadyInitialized => HResult::AlreadyInitialized,
            ReflectError::NotStarted => HResult::Handle,
            ReflectError::Engine { status, .. } => *status,
            ReflectError::InvalidConfig { .. } => HResult::InvalidArg,
            ReflectError::Io { source } if source.kind() == std::io::ErrorKind::OutOfMemory => {
                HResult::OutOfMemory
            }
            ReflectError::DuplicateSession { .. }
            | ReflectError::SessionNotFound { .. }
            | ReflectError::SessionBusy { .. }
            | ReflectError::SymlinkTarget { .. }
            | ReflectError::TestSignal { .. }
            | ReflectError::Io { .. } => HResult::InternalError,
        }
    }

    pub(crate) fn engine(operation: &str, status: HResult) -> Self {
        ReflectError::Engine {
            operation: operation.to_string(),
            status,
        }
    }
}

/// Result type alias for ReflectFS operations.
pub type Result<T> = std::result::Result<T, ReflectError>;
