//! `runlane` Core Library
//!
//! Shared functionality for `runlane` components:
//! - Configuration resolution and hierarchy
//! - Session-key lineage helpers
//! - Model references and thinking levels
//! - `SQLite` helpers and common error types

pub mod config;
pub mod db;
pub mod error;
pub mod model_ref;
pub mod session_key;
pub mod thinking;
pub mod tracing_init;

pub use config::{CleanupPolicy, Config, DropPolicy, QueueMode};
pub use error::{Error, Result};
pub use thinking::ThinkLevel;
