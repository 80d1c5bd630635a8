//! `SQLite` storage for sub-agent run records.

mod db;
mod models;
mod queries_runs;
mod store;

pub use db::{Database, DatabaseError};
pub use models::*;
pub use store::{MemoryRunStore, RunStore, StoreError};
