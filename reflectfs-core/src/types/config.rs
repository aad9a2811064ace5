//! Configuration types for ReflectFS.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use crate::error::{ReflectError, Result};

/// Upper bound for a single hydration chunk.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// Log level for the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    /// Log everything including per-callback tracing
    Debug,
    /// Log lifecycle events
    Info,
    /// Log recoverable problems
    Warn,
    /// Only log errors
    Error,
    /// Only log failures that stop the provider
    Fatal,
}

impl LogLevel {
    /// Returns the string representation of the log level.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        }
    }

    /// The `tracing` level this maps onto. Fatal has no level of its own.
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Fatal => "error",
            other => other.as_str(),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "fatal" => Ok(LogLevel::Fatal),
            _ => Err(format!("Unknown log level: {}", s)),
        }
    }
}

/// Options for one reflector provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderOptions {
    /// Source tree being projected
    pub layer_root: PathBuf,

    /// Virtualization root exposed to clients
    pub scratch_root: PathBuf,

    /// Register every notification category
    pub enable_notifications: bool,

    /// Veto every pre-delete notification
    pub deny_deletes: bool,

    /// Signal named test events; implies notifications
    pub test_mode: bool,

    /// Logging level
    pub log_level: LogLevel,

    /// Engine worker pool size (0 lets the engine decide)
    pub pool_thread_count: u32,

    /// Engine concurrency limit (0 lets the engine decide)
    pub concurrent_thread_count: u32,

    /// Let the engine cache paths the provider reported as missing
    pub enable_negative_path_cache: bool,

    /// Hydration chunk ceiling in bytes
    pub chunk_size: usize,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            layer_root: PathBuf::new(),
            scratch_root: PathBuf::new(),
            enable_notifications: false,
            deny_deletes: false,
            test_mode: false,
            log_level: LogLevel::Info,
            pool_thread_count: 0,
            concurrent_thread_count: 0,
            enable_negative_path_cache: false,
            chunk_size: MAX_CHUNK_SIZE,
        }
    }
}

impl ProviderOptions {
    /// Creates options for the given roots with default settings.
    pub fn new(layer_root: impl Into<PathBuf>, scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            layer_root: layer_root.into(),
            scratch_root: scratch_root.into(),
            ..Self::default()
        }
    }

    /// Loads options from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| ReflectError::InvalidConfig {
            errors: vec![format!("{}: {}", path.display(), e)],
        })
    }

    /// Whether notifications are registered, either explicitly or through test mode.
    pub fn notifications_active(&self) -> bool {
        self.enable_notifications || self.test_mode
    }

    /// Validates the configuration.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.layer_root.as_os_str().is_empty() {
            errors.push("Layer root must be specified".to_string());
        } else if !self.layer_root.is_dir() {
            errors.push(format!("Layer root is not a directory: {:?}", self.layer_root));
        }

        if self.scratch_root.as_os_str().is_empty() {
            errors.push("Scratch root must be specified".to_string());
        }

        if !self.layer_root.as_os_str().is_empty()
            && !self.scratch_root.as_os_str().is_empty()
            && (self.scratch_root.starts_with(&self.layer_root)
                || self.layer_root.starts_with(&self.scratch_root))
        {
            errors.push(format!(
                "Layer root {:?} and scratch root {:?} must not contain one another",
                self.layer_root, self.scratch_root
            ));
        }

        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            errors.push(format!(
                "Chunk size must be between 1 and {} bytes, got {}",
                MAX_CHUNK_SIZE, self.chunk_size
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_log_level_parse() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("fatal".parse::<LogLevel>().unwrap(), LogLevel::Fatal);
        assert!("verbose".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_fatal_maps_to_error_filter() {
        assert_eq!(LogLevel::Fatal.as_filter_directive(), "error");
        assert_eq!(LogLevel::Debug.as_filter_directive(), "debug");
        assert_eq!(LogLevel::Fatal.to_string(), "fatal");
    }

    #[test]
    fn test_test_mode_implies_notifications() {
        let mut options = ProviderOptions::new("layer", "scratch");
        assert!(!options.notifications_active());
        options.test_mode = true;
        assert!(options.notifications_active());
    }

    #[test]
    fn test_validate_ok() {
        let layer = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let options = ProviderOptions::new(layer.path(), scratch.path().join("virt"));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let options = ProviderOptions {
            chunk_size: 0,
            ..ProviderOptions::default()
        };
        let errors = options.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_validate_rejects_nested_roots() {
        let layer = TempDir::new().unwrap();
        let options = ProviderOptions::new(layer.path(), layer.path().join("scratch"));
        let errors = options.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("must not contain"));
    }

    #[test]
    fn test_from_file_partial_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reflectfs.json");
        let mut file = File::create(&path).unwrap();
        write!(file, r#"{{"layer_root": "L", "scratch_root": "S", "deny_deletes": true}}"#).unwrap();
        drop(file);

        let options = ProviderOptions::from_file(&path).unwrap();
        assert_eq!(options.layer_root, PathBuf::from("L"));
        assert!(options.deny_deletes);
        assert_eq!(options.chunk_size, MAX_CHUNK_SIZE);
        assert_eq!(options.log_level, LogLevel::Info);
    }

    #[test]
    fn test_from_file_invalid_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            ProviderOptions::from_file(&path),
            Err(ReflectError::InvalidConfig { .. })
        ));
    }
}
