//! Strata - role-gated multi-device sync engine
//!
//! Device registration gated by a role/permission model, a serialized sync
//! queue with deterministic conflict resolution, and read-side completion
//! statistics.

pub mod auth;
pub mod error;
pub mod events;
pub mod queue;
pub mod registry;
pub mod storage;
pub mod tracker;
pub mod types;

pub use error::{Result, StrataError};
pub use storage::Storage;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
