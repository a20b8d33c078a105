//! Adapter between bb8 and the sqlx::Postgres driver.
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection};

use crate::config::{CONNECT_TIMEOUT, PING_TIMEOUT};
use crate::coordination::BatchSink;
use crate::formats::Record;

pub type Bb8Connection<'a> = bb8::PooledConnection<'a, ConnectionManager>;

/// Inner pool variants
#[derive(Debug, Clone)]
enum PoolInner {
    Postgres(bb8::Pool<ConnectionManager>),
    #[cfg(test)]
    Sqlite(sqlx::SqlitePool),
}

/// Connection that can be either Postgres or SQLite
pub enum PoolConnection {
    Postgres(Bb8Connection<'static>),
    #[cfg(test)]
    Sqlite(sqlx::pool::PoolConnection<sqlx::Sqlite>),
}

impl std::ops::Deref for PoolConnection {
    type Target = PgConnection;

    fn deref(&self) -> &Self::Target {
        match self {
            PoolConnection::Postgres(conn) => conn,
            #[cfg(test)]
            PoolConnection::Sqlite(_) => panic!("Cannot deref SQLite connection as PgConnection"),
        }
    }
}

impl std::ops::DerefMut for PoolConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            PoolConnection::Postgres(conn) => conn,
            #[cfg(test)]
            PoolConnection::Sqlite(_) => panic!("Cannot deref SQLite connection as PgConnection"),
        }
    }
}

/// Shared handle to the destination database
///
/// Every in-flight batch checks a connection out of the pool for the duration
/// of one statement, so the pool should be sized to the largest number of
/// files loaded at once.
#[derive(Debug, Clone)]
pub struct Pool {
    inner: PoolInner,
}

fn run_error(e: bb8::RunError<sqlx::Error>) -> sqlx::Error {
    match e {
        bb8::RunError::User(e) => e,
        bb8::RunError::TimedOut => sqlx::Error::PoolTimedOut,
    }
}

impl Pool {
    /// Build a lazily-connecting Postgres pool; no connection is opened here
    pub fn postgres(connect_options: PgConnectOptions, max_size: u32) -> Self {
        let bb8_pool = bb8::Builder::new()
            .max_size(max_size.max(1))
            .connection_timeout(CONNECT_TIMEOUT)
            .build_unchecked(ConnectionManager::new(connect_options));

        Pool {
            inner: PoolInner::Postgres(bb8_pool),
        }
    }

    /// Create an in-memory SQLite pool for testing
    ///
    /// Limited to one connection: every new connection to `sqlite::memory:`
    /// would otherwise see its own empty database.
    #[cfg(test)]
    pub async fn sqlite_in_memory() -> Result<Self, sqlx::Error> {
        let sqlite_pool = sqlx::sqlite::SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Ok(Pool {
            inner: PoolInner::Sqlite(sqlite_pool),
        })
    }

    pub async fn acquire(&self) -> Result<PoolConnection, sqlx::Error> {
        match &self.inner {
            PoolInner::Postgres(pool) => {
                let conn = pool.get_owned().await.map_err(run_error)?;
                Ok(PoolConnection::Postgres(conn))
            }
            #[cfg(test)]
            PoolInner::Sqlite(pool) => {
                let conn = pool.acquire().await?;
                Ok(PoolConnection::Sqlite(conn))
            }
        }
    }

    /// Check if this pool is using PostgreSQL (returns false for SQLite)
    pub fn is_postgres(&self) -> bool {
        matches!(&self.inner, PoolInner::Postgres(_))
    }

    /// Fetch `(text, text)` rows from a query with a single bind parameter
    pub async fn fetch_pairs_with_bind(
        &self,
        sql: &str,
        bind_value: &str,
    ) -> Result<Vec<(String, String)>, sqlx::Error> {
        match &self.inner {
            PoolInner::Postgres(pool) => {
                let mut conn = pool.get().await.map_err(run_error)?;
                let rows = sqlx::query_as::<_, (String, String)>(sql)
                    .bind(bind_value)
                    .fetch_all(&mut *conn)
                    .await?;
                Ok(rows)
            }
            #[cfg(test)]
            PoolInner::Sqlite(pool) => {
                let sqlite_sql = convert_to_sqlite_placeholders(sql);
                let rows = sqlx::query_as::<_, (String, String)>(&sqlite_sql)
                    .bind(bind_value)
                    .fetch_all(pool)
                    .await?;
                Ok(rows)
            }
        }
    }

    /// Execute a statement without parameters (test fixtures)
    #[cfg(test)]
    pub async fn execute_query(&self, sql: &str) -> Result<(), sqlx::Error> {
        match &self.inner {
            PoolInner::Postgres(pool) => {
                let mut conn = pool.get().await.map_err(run_error)?;
                sqlx::query(sql).execute(&mut *conn).await?;
                Ok(())
            }
            PoolInner::Sqlite(pool) => {
                sqlx::query(sql).execute(pool).await?;
                Ok(())
            }
        }
    }

    /// Count rows of a table (test assertions)
    #[cfg(test)]
    pub async fn count_rows(&self, table: &str) -> Result<i64, sqlx::Error> {
        let sql = format!("SELECT COUNT(*) FROM {}", table);
        match &self.inner {
            PoolInner::Postgres(pool) => {
                let mut conn = pool.get().await.map_err(run_error)?;
                let (count,): (i64,) = sqlx::query_as(&sql).fetch_one(&mut *conn).await?;
                Ok(count)
            }
            PoolInner::Sqlite(pool) => {
                let (count,): (i64,) = sqlx::query_as(&sql).fetch_one(pool).await?;
                Ok(count)
            }
        }
    }
}

#[async_trait]
impl BatchSink for Pool {
    async fn insert(&self, sql: &str, records: &[Record]) -> Result<u64, sqlx::Error> {
        match &self.inner {
            PoolInner::Postgres(pool) => {
                let mut conn = pool.get().await.map_err(run_error)?;
                let mut query = sqlx::query(sql);
                for record in records {
                    for field in &record.fields {
                        query = query.bind(field.as_str());
                    }
                }
                let result = query.execute(&mut *conn).await?;
                Ok(result.rows_affected())
            }
            #[cfg(test)]
            PoolInner::Sqlite(pool) => {
                let sqlite_sql = convert_to_sqlite_placeholders(sql);
                let mut query = sqlx::query(&sqlite_sql);
                for record in records {
                    for field in &record.fields {
                        query = query.bind(field.as_str());
                    }
                }
                let result = query.execute(pool).await?;
                Ok(result.rows_affected())
            }
        }
    }
}

/// Convert Postgres-style placeholders ($1, $2, ...) to SQLite-style (?, ?, ...)
#[cfg(test)]
fn convert_to_sqlite_placeholders(sql: &str) -> String {
    let mut result = String::new();
    let mut chars = sql.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' {
            while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                chars.next();
            }
            result.push('?');
        } else {
            result.push(ch);
        }
    }

    result
}

// Wrap the connect options so that we can implement the bb8::ManageConnection trait.
pub struct ConnectionManager {
    connect_options: PgConnectOptions,
}

impl ConnectionManager {
    /// Create a new `ConnectionManager` with the specified connect options.
    pub fn new(connect_options: PgConnectOptions) -> Self {
        Self { connect_options }
    }
}

impl bb8::ManageConnection for ConnectionManager {
    type Connection = PgConnection;
    type Error = sqlx::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        tokio::time::timeout(CONNECT_TIMEOUT, self.connect_options.connect())
            .await
            .map_err(|_| sqlx::Error::PoolTimedOut)?
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        tokio::time::timeout(PING_TIMEOUT, conn.ping())
            .await
            // Convert tokio timeouts into sqlx pool timeouts. bb8 will retry a different connection on ping failure.
            .map_err(|_| sqlx::Error::PoolTimedOut)
            // Make sure that we also look at the actual ping result
            .and_then(|result| result)?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        // sqlx::PgConnection provides no non-async way to check for closed/broken connections.
        false
    }
}
