//! # ReflectFS Windows
//!
//! ProjFS binding for the reflector provider. Implements the engine traits of
//! `reflectfs-core` on top of `ProjectedFSLib.dll`, and supplies the native name
//! collation and the named-event test signal.
//!
//! Everything here is Windows-only; on other targets the crate is empty.

#[cfg(windows)]
pub mod error;
#[cfg(windows)]
pub mod projfs;
#[cfg(windows)]
pub mod signal;

#[cfg(windows)]
pub use error::{WindowsError, WindowsResult};
#[cfg(windows)]
pub use projfs::{detect_api_level, verify_projfs_available, ProjFsCollation, ProjFsEngine};
#[cfg(windows)]
pub use signal::NamedEventSignal;
