//! Database connection and initialization.

pub use runlane_core::db::DatabaseError;

runlane_core::define_database!(Database, "Run database migrations complete");
