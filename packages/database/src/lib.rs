#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Local record stores for mirrored archive metadata.
//!
//! Each product type gets its own `DuckDB` file holding an `exposures`
//! table keyed by the record's natural key, a `coverage` table of
//! fully-ingested night spans, and a `_meta` table for sync
//! bookkeeping. Uniqueness is enforced by the storage layer (PRIMARY
//! KEY + `ON CONFLICT DO NOTHING`), so concurrent upserts of the same
//! key are safe and duplicates are an expected, silently-counted
//! outcome.

pub mod paths;
pub mod store;

pub use store::{RecordStore, UpsertOutcome};

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// `DuckDB` error (connection, statement, or constraint).
    #[error("database error: {0}")]
    DuckDb(#[from] duckdb::Error),

    /// I/O error (creating the data directory).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A worker panicked while holding the store lock.
    #[error("store connection lock poisoned")]
    LockPoisoned,

    /// Data conversion error.
    #[error("data conversion error: {message}")]
    Conversion {
        /// Description of what went wrong.
        message: String,
    },
}
