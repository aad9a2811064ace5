//! # ReflectFS Core
//!
//! The core library for ReflectFS - a reflector-style projected filesystem provider.
//! A read-only "layer" directory tree is projected into a "scratch" virtualization
//! root on demand: directory listings, placeholder metadata and file contents are
//! produced only when the host virtualization engine asks for them.
//!
//! ## Overview
//!
//! The host engine (ProjFS on Windows) calls the provider on its own worker threads
//! for every filesystem event under the scratch root. The provider answers from the
//! layer tree:
//!
//! - Directory enumeration through resumable sessions keyed by the engine's id
//! - Placeholder metadata, including symbolic-link targets rewritten for the scratch root
//! - Lazy hydration of file contents in bounded chunks
//! - Optional notifications with a deny-delete policy and test signalling
//!
//! ## Basic Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use reflectfs_core::{ProviderOptions, ReflectProvider};
//!
//! fn run(engine: Arc<dyn reflectfs_core::engine::VirtualizationEngine>) -> reflectfs_core::Result<()> {
//!     let options = ProviderOptions::new("C:\\layer", "C:\\scratch");
//!     let provider = ReflectProvider::new(options, engine)?;
//!     provider.start()?;
//!     // ... serve until shutdown
//!     provider.stop()
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`layer`]: read-only access to the layer tree
//! - [`naming`]: canonical name ordering and wildcard matching
//! - [`enumeration`]: enumeration session registry
//! - [`placeholder`]: placeholder translation and symlink target resolution
//! - [`hydration`]: chunked file content streaming
//! - [`engine`]: the host engine binding interface
//! - [`instance`]: virtualization lifecycle manager
//! - [`provider`]: the callback dispatcher
//! - [`notifications`]: notification routing and policy
//! - [`memory`]: in-memory engine and directory sink for exercising the provider without a host
//!
//! The Windows binding lives in `reflectfs-windows`.

pub mod engine;
pub mod enumeration;
pub mod error;
pub mod hydration;
pub mod instance;
pub mod layer;
pub mod memory;
pub mod naming;
pub mod notifications;
pub mod placeholder;
pub mod provider;
pub mod signal;
pub mod stats;
pub mod status;
pub mod types;

pub use error::{ReflectError, Result};
pub use provider::ReflectProvider;
pub use status::HResult;
pub use types::config::{LogLevel, ProviderOptions};
