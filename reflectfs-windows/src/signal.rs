use log::debug;
use reflectfs_core::signal::{EventSignal, SignalError};
use windows::core::{HRESULT, HSTRING};
use windows::Win32::Foundation::{CloseHandle, ERROR_ACCESS_DENIED, ERROR_FILE_NOT_FOUND};
use windows::Win32::System::Threading::{OpenEventW, SetEvent, EVENT_MODIFY_STATE};

/// Sets named events created by an external test harness.
#[derive(Debug, Default, Clone, Copy)]
pub struct NamedEventSignal;

fn signal_error(err: windows::core::Error) -> SignalError {
    let code = err.code();
    if code == HRESULT::from_win32(ERROR_FILE_NOT_FOUND.0) {
        SignalError::NotFound
    } else if code == HRESULT::from_win32(ERROR_ACCESS_DENIED.0) {
        SignalError::AccessDenied
    } else {
        SignalError::Other(err.to_string())
    }
}

impl EventSignal for NamedEventSignal {
    fn signal(&self, event_name: &str) -> Result<(), SignalError> {
        let handle = unsafe { OpenEventW(EVENT_MODIFY_STATE, false, &HSTRING::from(event_name)) }
            .map_err(signal_error)?;

        let result = unsafe { SetEvent(handle) }.map_err(signal_error);
        if let Err(e) = unsafe { CloseHandle(handle) } {
            debug!("CloseHandle for event {} failed: {}", event_name, e);
        }
        result
    }
}
