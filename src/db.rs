//! Shared SQLite plumbing for the account store and the usage ledger.
//!
//! Both stores are single files opened by many short-lived processes at once.
//! Writers serialize through `BEGIN IMMEDIATE`, which takes SQLite's write
//! lock up front (waiting up to the busy timeout) instead of upgrading a read
//! transaction mid-way and failing with `SQLITE_BUSY`.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, SqlitePool};

/// How long a writer waits for another process's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (creating if missing) the database at `path` and apply `schema`.
///
/// `schema` must be idempotent (`CREATE TABLE IF NOT EXISTS ...`).
///
/// # Errors
///
/// Returns an error if the file cannot be opened or the schema fails.
pub async fn open_pool(path: &Path, schema: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT)
        .pragma("trusted_schema", "OFF")
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    sqlx::raw_sql(schema).execute(&pool).await?;
    tracing::debug!(path = %path.display(), "database ready");
    Ok(pool)
}

/// Render a timestamp for storage: RFC 3339 UTC with fixed microsecond
/// precision, so text order matches time order.
pub fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp.
///
/// # Errors
///
/// Returns [`sqlx::Error::Decode`] if the text is not RFC 3339.
pub fn parse_time(text: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

/// A write transaction started with `BEGIN IMMEDIATE`.
///
/// Must be finished with [`ImmediateTx::commit`] or
/// [`ImmediateTx::rollback`]. If dropped while still open, the connection is
/// closed instead of returned to the pool, which rolls the transaction back.
pub struct ImmediateTx {
    conn: PoolConnection<Sqlite>,
    open: bool,
}

impl ImmediateTx {
    /// Acquire a connection and take the database write lock.
    ///
    /// # Errors
    ///
    /// Returns an error if no connection is available or the lock is not
    /// granted within the busy timeout.
    pub async fn begin(pool: &SqlitePool) -> Result<Self, sqlx::Error> {
        let mut conn = pool.acquire().await?;
        sqlx::raw_sql("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(Self { conn, open: true })
    }

    /// Connection to run statements on inside the transaction.
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }

    /// Commit the transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails; the transaction is then rolled
    /// back when `self` drops.
    pub async fn commit(mut self) -> Result<(), sqlx::Error> {
        sqlx::raw_sql("COMMIT").execute(&mut *self.conn).await?;
        self.open = false;
        Ok(())
    }

    /// Roll the transaction back.
    ///
    /// # Errors
    ///
    /// Returns an error if the rollback statement fails; the connection is
    /// then discarded.
    pub async fn rollback(mut self) -> Result<(), sqlx::Error> {
        sqlx::raw_sql("ROLLBACK").execute(&mut *self.conn).await?;
        self.open = false;
        Ok(())
    }
}

impl Drop for ImmediateTx {
    fn drop(&mut self) {
        if self.open {
            self.conn.close_on_drop();
        }
    }
}
