//! Connection acquisition with a bounded retry loop
//!
//! The database is frequently still starting when the loader launches (for
//! example in a compose stack), so acquisition keeps retrying until either a
//! verified connection is available or the overall deadline passes. A missing
//! database is not something waiting can fix and ends the loop at once.

use async_trait::async_trait;
use sqlx::postgres::PgConnectOptions;
use sqlx::{ConnectOptions, Connection};
use thiserror::Error;
use tracing::{debug, info};

use super::pool::Pool;
use crate::config::AcquireConfig;
use crate::error::ConnectError;

/// Postgres SQLSTATE for "database does not exist"
const INVALID_CATALOG_NAME: &str = "3D000";

/// Outcome of a single failed open or ping attempt
#[derive(Error, Debug)]
pub enum AttemptError {
    /// Worth retrying: the server may not be up yet
    #[error(transparent)]
    Transient(#[from] sqlx::Error),

    /// Retrying cannot succeed
    #[error("{0}")]
    Fatal(String),
}

/// Opens and verifies database handles
#[async_trait]
pub trait Connector: Send + Sync {
    type Handle: Send + Sync;

    /// Name of the target database, for error messages
    fn database(&self) -> &str;

    /// Create a handle; may not touch the network
    async fn open(&self) -> Result<Self::Handle, AttemptError>;

    /// Verify the handle can reach the database
    async fn ping(&self, handle: &Self::Handle) -> Result<(), AttemptError>;
}

/// Obtain a verified handle, racing the retry loop against `config.timeout`
pub async fn acquire<C: Connector>(
    connector: &C,
    config: AcquireConfig,
) -> Result<C::Handle, ConnectError> {
    debug!(
        database = connector.database(),
        timeout = ?config.timeout,
        interval = ?config.retry_interval,
        "connecting to database"
    );

    tokio::select! {
        result = retry_until_connected(connector, config) => {
            result.map_err(|reason| ConnectError::Fatal {
                database: connector.database().to_string(),
                reason,
            })
        }
        _ = tokio::time::sleep(config.timeout) => Err(ConnectError::Timeout {
            database: connector.database().to_string(),
            after: config.timeout,
        }),
    }
}

async fn retry_until_connected<C: Connector>(
    connector: &C,
    config: AcquireConfig,
) -> Result<C::Handle, String> {
    let mut opened: Option<C::Handle> = None;
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let handle = match opened.take() {
            Some(handle) => Some(handle),
            None => match connector.open().await {
                Ok(handle) => Some(handle),
                Err(AttemptError::Fatal(reason)) => return Err(reason),
                Err(AttemptError::Transient(e)) => {
                    debug!(attempt, error = %e, "error opening database connection");
                    None
                }
            },
        };

        if let Some(handle) = handle {
            match connector.ping(&handle).await {
                Ok(()) => {
                    info!(database = connector.database(), attempt, "connected to database");
                    return Ok(handle);
                }
                Err(AttemptError::Fatal(reason)) => return Err(reason),
                Err(AttemptError::Transient(e)) => {
                    debug!(attempt, error = %e, "error pinging database");
                    opened = Some(handle);
                }
            }
        }

        tokio::time::sleep(config.retry_interval).await;
    }
}

/// Connector producing a bb8-backed Postgres [`Pool`]
pub struct PgConnector {
    connect_options: PgConnectOptions,
    database: String,
    pool_size: u32,
}

impl PgConnector {
    pub fn new(connect_options: PgConnectOptions, pool_size: u32) -> Self {
        let database = connect_options
            .get_database()
            .unwrap_or("postgres")
            .to_string();
        Self {
            connect_options,
            database,
            pool_size,
        }
    }

    fn classify(&self, err: sqlx::Error) -> AttemptError {
        if let sqlx::Error::Database(db_err) = &err
            && db_err.code().as_deref() == Some(INVALID_CATALOG_NAME)
        {
            return AttemptError::Fatal(format!("database {} does not exist", self.database));
        }
        AttemptError::Transient(err)
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Handle = Pool;

    fn database(&self) -> &str {
        &self.database
    }

    async fn open(&self) -> Result<Pool, AttemptError> {
        Ok(Pool::postgres(self.connect_options.clone(), self.pool_size))
    }

    async fn ping(&self, _pool: &Pool) -> Result<(), AttemptError> {
        // A dedicated connection surfaces the server's error directly instead
        // of the pool's generic timeout.
        let mut conn = self
            .connect_options
            .connect()
            .await
            .map_err(|e| self.classify(e))?;
        conn.ping().await.map_err(|e| self.classify(e))?;
        conn.close().await.map_err(|e| self.classify(e))?;
        Ok(())
    }
}
