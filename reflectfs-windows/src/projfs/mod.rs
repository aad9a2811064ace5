pub mod api;
pub mod callbacks;
pub mod collation;
mod convert;
pub mod engine;
mod library;

pub use api::{detect_api_level, verify_projfs_available};
pub use collation::ProjFsCollation;
pub use engine::ProjFsEngine;
