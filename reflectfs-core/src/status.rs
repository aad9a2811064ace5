//! Host status codes returned across the engine boundary.

use std::fmt;

/// Status codes understood by the host virtualization engine.
///
/// The numeric values are the host's HRESULTs. Codes the provider never chooses
/// itself but may receive from an engine call are carried through `Other`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum HResult {
    #[default]
    Ok,
    Pending,
    OutOfMemory,
    InsufficientBuffer,
    FileNotFound,
    PathNotFound,
    AccessDenied,
    Handle,
    InvalidArg,
    DirNotEmpty,
    Directory,
    VirtualizationUnavailable,
    VirtualizationInvalidOp,
    AlreadyInitialized,
    InternalError,
    ReparsePointEncountered,
    CannotDelete,
    Other(i32),
}

const KNOWN: &[(HResult, u32)] = &[
    (HResult::Ok, 0x0000_0000),
    (HResult::Pending, 0x8007_03E5),
    (HResult::OutOfMemory, 0x8007_000E),
    (HResult::InsufficientBuffer, 0x8007_007A),
    (HResult::FileNotFound, 0x8007_0002),
    (HResult::PathNotFound, 0x8007_0003),
    (HResult::AccessDenied, 0x8007_0005),
    (HResult::Handle, 0x8007_0006),
    (HResult::InvalidArg, 0x8007_0057),
    (HResult::DirNotEmpty, 0x8007_0091),
    (HResult::Directory, 0x8007_010B),
    (HResult::VirtualizationUnavailable, 0x8007_0171),
    (HResult::VirtualizationInvalidOp, 0x8007_0181),
    (HResult::AlreadyInitialized, 0x8007_04DF),
    (HResult::InternalError, 0x8007_054F),
    (HResult::ReparsePointEncountered, 0x8007_112B),
    (HResult::CannotDelete, 0xD000_0121),
];

impl HResult {
    /// Returns the raw HRESULT value.
    pub fn code(self) -> i32 {
        match self {
            HResult::Other(code) => code,
            known => KNOWN
                .iter()
                .find(|(status, _)| *status == known)
                .map(|(_, code)| *code as i32)
                .unwrap_or_default(),
        }
    }

    /// Maps a raw HRESULT back onto a named status where one exists.
    pub fn from_code(code: i32) -> Self {
        KNOWN
            .iter()
            .find(|(_, known)| *known as i32 == code)
            .map(|(status, _)| *status)
            .unwrap_or(HResult::Other(code))
    }

    /// Builds the HRESULT the host uses for a Win32 error code.
    pub fn from_win32(error: u32) -> Self {
        if error == 0 {
            return HResult::Ok;
        }
        Self::from_code(((error & 0x0000_FFFF) | 0x8007_0000) as i32)
    }

    pub fn is_ok(self) -> bool {
        self == HResult::Ok
    }

    /// True for any failure severity code.
    pub fn is_failed(self) -> bool {
        self.code() < 0
    }
}

impl fmt::Display for HResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HResult::Other(code) => write!(f, "0x{:08X}", *code as u32),
            named => write!(f, "{:?} (0x{:08X})", named, named.code() as u32),
        }
    }
}

impl From<i32> for HResult {
    fn from(code: i32) -> Self {
        HResult::from_code(code)
    }
}

impl From<HResult> for i32 {
    fn from(status: HResult) -> Self {
        status.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes_round_trip() {
        for (status, code) in KNOWN {
            assert_eq!(status.code(), *code as i32);
            assert_eq!(HResult::from_code(*code as i32), *status);
        }
    }

    #[test]
    fn test_unknown_code_passes_through() {
        let status = HResult::from_code(0x8007_0020u32 as i32);
        assert_eq!(status, HResult::Other(0x8007_0020u32 as i32));
        assert_eq!(status.code(), 0x8007_0020u32 as i32);
        assert!(status.is_failed());
    }

    #[test]
    fn test_from_win32() {
        assert_eq!(HResult::from_win32(0), HResult::Ok);
        assert_eq!(HResult::from_win32(2), HResult::FileNotFound);
        assert_eq!(HResult::from_win32(122), HResult::InsufficientBuffer);
        assert_eq!(HResult::from_win32(1359), HResult::InternalError);
    }

    #[test]
    fn test_failure_severity() {
        assert!(!HResult::Ok.is_failed());
        assert!(HResult::Pending.is_failed());
        assert!(HResult::CannotDelete.is_failed());
        assert!(HResult::Ok.is_ok());
    }

    #[test]
    fn test_display() {
        assert_eq!(HResult::FileNotFound.to_string(), "FileNotFound (0x80070002)");
        assert_eq!(HResult::Other(1).to_string(), "0x00000001");
    }
}
