//! Error types for the loader
//!
//! Every per-file failure is fatal for that file and is surfaced to the
//! dispatcher as-is. Connection errors are fatal for the whole run.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure while loading a single file
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed record in {path} at line {line}: {reason}")]
    Format {
        path: PathBuf,
        line: u64,
        reason: String,
    },

    #[error("not all records inserted for {path} (batch {batch}, expected: {expected}, got: {affected})")]
    Integrity {
        path: PathBuf,
        batch: usize,
        expected: u64,
        affected: u64,
    },

    #[error("error executing query to load file {path} (batch {batch}): {source}")]
    Query {
        path: PathBuf,
        batch: usize,
        #[source]
        source: sqlx::Error,
    },

    #[error("load of {path} cancelled")]
    Cancelled { path: PathBuf },

    #[error("invalid load configuration: {0}")]
    Config(String),

    #[error("file loader task failed: {0}")]
    Worker(String),
}

impl LoadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LoadError::Cancelled { .. })
    }
}

/// Failure to obtain a verified database connection
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("timed out connecting to database {database} after {after:?}")]
    Timeout { database: String, after: Duration },

    #[error("cannot connect to database {database}: {reason}")]
    Fatal { database: String, reason: String },
}

/// Failure while applying or reverting schema migrations
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("migration state is dirty at version {0}; fix it manually before stepping")]
    Dirty(i64),

    #[error("migration {0} has no down migration")]
    Irreversible(i64),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("database error: {0}")]
    Connection(#[from] sqlx::Error),
}
