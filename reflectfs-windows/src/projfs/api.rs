//! ProjFS availability and capability detection.

use log::{debug, info};
use reflectfs_core::engine::ApiLevel;
use windows::core::s;
use windows::Win32::Foundation::FreeLibrary;
use super::library::{has_export, load_module};
use crate::error::{WindowsError, WindowsResult};

/// Probes `ProjectedFSLib.dll` for the entry points each capability level adds.
pub fn detect_api_level() -> WindowsResult<ApiLevel> {
    let module = load_module()?;
    let exports = |name| has_export(module, name);

    let level = if exports(s!("PrjStartVirtualizing")) {
        if exports(s!("PrjWritePlaceholderInfo2")) && exports(s!("PrjFillDirEntryBuffer2")) {
            Some(ApiLevel::Additional)
        } else {
            Some(ApiLevel::Release)
        }
    } else if exports(s!("PrjStartVirtualizationInstance")) {
        Some(ApiLevel::Beta)
    } else {
        None
    };

    if let Err(e) = unsafe { FreeLibrary(module) } {
        debug!("FreeLibrary(ProjectedFSLib.dll) failed: {}", e);
    }

    level.ok_or_else(|| WindowsError::Unsupported {
        message: "ProjectedFSLib.dll exports no known virtualization entry point".to_string(),
    })
}

/// Verifies that ProjFS is present and new enough to run the provider.
pub fn verify_projfs_available() -> WindowsResult<ApiLevel> {
    info!("Verifying ProjFS availability...");

    let level = detect_api_level()?;
    if level == ApiLevel::Beta {
        return Err(WindowsError::Unsupported {
            message: "ProjFS requires Windows 10 version 1809 or later".to_string(),
        });
    }

    info!("ProjFS is available, API level {:?}", level);
    Ok(level)
}
