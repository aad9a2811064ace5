use std::fmt;
use std::error::Error;
use reflectfs_core::HResult;

/// Windows-specific error types for ReflectFS
#[derive(Debug)]
pub enum WindowsError {
    /// I/O operation failed
    IoError {
        message: String,
        code: u32,
    },

    /// ProjFS API error
    ProjFSError {
        message: String,
        hresult: i32,
    },

    /// ProjectedFSLib.dll could not be loaded; the optional feature is off
    NotEnabled {
        message: String,
    },

    /// The installed ProjFS lacks the entry points the provider needs
    Unsupported {
        message: String,
    },
}

impl WindowsError {
    /// Status code closest to this error.
    pub fn status(&self) -> HResult {
        match self {
            WindowsError::IoError { code, .. } => HResult::from_win32(*code),
            WindowsError::ProjFSError { hresult, .. } => HResult::from_code(*hresult),
            WindowsError::NotEnabled { .. } | WindowsError::Unsupported { .. } => {
                HResult::VirtualizationUnavailable
            }
        }
    }
}

impl fmt::Display for WindowsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowsError::IoError { message, code } => {
                write!(f, "I/O error (code {}): {}", code, message)
            }
            WindowsError::ProjFSError { message, hresult } => {
                write!(f, "ProjFS error (HRESULT 0x{:08X}): {}", hresult, message)
            }
            WindowsError::NotEnabled { message } => {
                write!(f, "ProjFS is not enabled: {}", message)
            }
            WindowsError::Unsupported { message } => {
                write!(f, "Unsupported: {}", message)
            }
        }
    }
}

impl Error for WindowsError {}

impl From<std::io::Error> for WindowsError {
    fn from(err: std::io::Error) -> Self {
        WindowsError::IoError {
            message: err.to_string(),
            code: err.raw_os_error().unwrap_or(0) as u32,
        }
    }
}

impl From<windows::core::Error> for WindowsError {
    fn from(err: windows::core::Error) -> Self {
        WindowsError::ProjFSError {
            message: err.message(),
            hresult: err.code().0,
        }
    }
}

/// Result type for Windows operations
pub type WindowsResult<T> = Result<T, WindowsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let err = WindowsError::ProjFSError {
            message: "x".to_string(),
            hresult: HResult::AccessDenied.code(),
        };
        assert_eq!(err.status(), HResult::AccessDenied);

        let err = WindowsError::NotEnabled { message: "x".to_string() };
        assert_eq!(err.status(), HResult::VirtualizationUnavailable);
        assert!(err.to_string().starts_with("ProjFS is not enabled"));
    }
}
