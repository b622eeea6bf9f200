//! Database connection and initialization.

pub use speeddata_core::db::DatabaseError;

speeddata_core::define_database!(Database, "Registry migrations complete");
