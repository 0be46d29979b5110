//! A SQLite backed [`JobStore`](queuectl::store::JobStore) for queuectl.
//!
//! The store keeps every job in a single `jobs` table of a SQLite database file. The database is
//! opened in WAL mode so that readers never block the worker claiming the next job, and every
//! write runs inside a `BEGIN IMMEDIATE` transaction or as a single statement. Any number of
//! processes can open the same file: SQLite's write lock is what makes claims exclusive.
//!
//! Writes that lose the race for the database lock are retried with a short, jittered linear
//! backoff. Once [`StoreOptions::max_attempts`] is exhausted the operation fails with
//! [`StoreError::Contention`].
//!
//! # Example
//!
//! ```no_run
//! # use queuectl::prelude::*;
//! use queuectl_sqlx::SqliteJobStore;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let store = SqliteJobStore::open("queuectl.db").await.unwrap();
//! let config = JsonFileConfig::new("queuectl_config.json");
//!
//! JobBuilder::new("echo hello")
//!     .enqueue_to(&store, &config)
//!     .await
//!     .unwrap();
//! # }
//! ```
use std::{future::Future, ops::Deref, path::Path, time::Duration};

use chrono::TimeDelta;
use queuectl::{
    backoff::{BackoffStrategy, Jitter, Linear, Strategy},
    store::StoreError,
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Sqlite, SqliteConnection, SqlitePool, Transaction,
};

mod backend;
pub mod env;
mod query;
mod types;

const CREATE_JOBS_TABLE: &str = "CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    command TEXT NOT NULL,
    state TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    next_run_at TEXT
)";

const CREATE_CLAIM_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS jobs_state_created_at ON jobs (state, created_at)";

/// SQLite result codes meaning another connection holds a conflicting lock.
///
/// `SQLITE_BUSY`, `SQLITE_LOCKED` and their extended variants.
const CONTENTION_CODES: [&str; 5] = ["5", "6", "261", "262", "517"];

/// Tuning for a [`SqliteJobStore`].
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// How long SQLite itself waits on a locked database before reporting it busy.
    pub busy_timeout: Duration,
    pub max_connections: u32,
    /// Attempts made at an operation that keeps hitting a locked database.
    pub max_attempts: u32,
    /// Step of the linear backoff between contended attempts.
    pub retry_step: TimeDelta,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(100),
            max_connections: 8,
            max_attempts: 10,
            retry_step: TimeDelta::milliseconds(20),
        }
    }
}

/// A SQLite implementation of [`JobStore`](queuectl::store::JobStore).
#[derive(Clone, Debug)]
pub struct SqliteJobStore {
    pool: SqlitePool,
    options: StoreOptions,
}

impl SqliteJobStore {
    /// Opens, creating if needed, the database at `path` and brings its schema up to date.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with(path, StoreOptions::default()).await
    }

    pub async fn open_with(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self, StoreError> {
        let connect = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(options.busy_timeout);
        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections)
            .connect_with(connect)
            .await
            .map_err(map_err)?;
        Self::from_pool(pool, options).await
    }

    /// Wraps an existing pool, bringing the schema up to date.
    pub async fn from_pool(pool: SqlitePool, options: StoreOptions) -> Result<Self, StoreError> {
        let this = Self { pool, options };
        this.migrate().await?;
        Ok(this)
    }

    /// Creates the `jobs` table, or adds the `next_run_at` column to a table created without it.
    ///
    /// Existing rows are left untouched.
    async fn migrate(&self) -> Result<(), StoreError> {
        self.with_contention_retry(move || async move {
            let mut tx = self.begin_immediate().await?;
            migrate_schema(&mut tx).await?;
            tx.commit().await
        })
        .await
    }

    /// Starts a transaction holding the database write lock.
    ///
    /// The transaction is rolled back if it is dropped before being committed.
    pub(crate) async fn begin_immediate(&self) -> sqlx::Result<Transaction<'static, Sqlite>> {
        self.pool.begin_with("BEGIN IMMEDIATE").await
    }

    /// Runs `operation` until it succeeds, fails with something other than lock contention, or
    /// [`StoreOptions::max_attempts`] is used up.
    pub(crate) async fn with_contention_retry<T, F, Fut>(&self, mut operation: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = sqlx::Result<T>> + Send,
        T: Send,
    {
        let backoff = BackoffStrategy::linear(self.options.retry_step)
            .with_max(self.options.retry_step * 10)
            .with_jitter(Jitter::Relative(0.5));
        let max_attempts = self.options.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if is_contention(&error) && attempt < max_attempts => {
                    let delay = backoff_delay(&backoff, attempt);
                    tracing::debug!(attempt, ?delay, "Database is locked, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) if is_contention(&error) => {
                    tracing::warn!(attempts = attempt, "Giving up on locked database: {error}");
                    return Err(StoreError::Contention {
                        attempts: attempt,
                        source: Box::new(error),
                    });
                }
                Err(error) => return Err(map_err(error)),
            }
        }
    }
}

fn backoff_delay(backoff: &BackoffStrategy<Linear>, attempt: u32) -> Duration {
    backoff.backoff(attempt).to_std().unwrap_or_default()
}

impl Deref for SqliteJobStore {
    type Target = SqlitePool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

async fn migrate_schema(conn: &mut SqliteConnection) -> sqlx::Result<()> {
    sqlx::query(CREATE_JOBS_TABLE).execute(&mut *conn).await?;
    let (next_run_at_columns,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM pragma_table_info('jobs') WHERE name = 'next_run_at'",
    )
    .fetch_one(&mut *conn)
    .await?;
    if next_run_at_columns == 0 {
        tracing::info!("Adding next_run_at column to existing jobs table");
        sqlx::query("ALTER TABLE jobs ADD COLUMN next_run_at TEXT")
            .execute(&mut *conn)
            .await?;
    }
    sqlx::query(CREATE_CLAIM_INDEX).execute(&mut *conn).await?;
    Ok(())
}

pub(crate) fn is_contention(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(error) => {
            error
                .code()
                .is_some_and(|code| CONTENTION_CODES.contains(&&*code))
                || error.message().contains("database is locked")
        }
        _ => false,
    }
}

pub(crate) fn map_err(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Decode(Box::new(error))
        }
        error => StoreError::Storage(Box::new(error)),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A store on a fresh database file that outlives the test.
    pub(crate) async fn scratch_store() -> SqliteJobStore {
        SqliteJobStore::open(scratch_path()).await.unwrap()
    }

    /// Like [`scratch_store`], giving up on a locked database after two quick attempts.
    pub(crate) async fn impatient_store(path: &std::path::Path) -> SqliteJobStore {
        let options = StoreOptions {
            busy_timeout: Duration::from_millis(10),
            max_attempts: 2,
            retry_step: TimeDelta::milliseconds(1),
            ..StoreOptions::default()
        };
        SqliteJobStore::open_with(path, options).await.unwrap()
    }

    pub(crate) fn scratch_path() -> std::path::PathBuf {
        tempfile::Builder::new()
            .prefix("queuectl-")
            .suffix(".db")
            .tempfile()
            .unwrap()
            .into_temp_path()
            .keep()
            .unwrap()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn only_lock_errors_are_contention() {
        assert!(!is_contention(&sqlx::Error::PoolTimedOut));
        assert!(!is_contention(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn decode_errors_map_to_decode() {
        assert!(matches!(
            map_err(sqlx::Error::ColumnNotFound("state".to_owned())),
            StoreError::Decode(_)
        ));
        assert!(matches!(
            map_err(sqlx::Error::PoolTimedOut),
            StoreError::Storage(_)
        ));
    }

    #[test]
    fn contention_backoff_grows_and_is_bounded() {
        let step = TimeDelta::milliseconds(20);
        let backoff = BackoffStrategy::linear(step).with_max(step * 10);

        assert_eq!(backoff_delay(&backoff, 1), Duration::from_millis(20));
        assert_eq!(backoff_delay(&backoff, 3), Duration::from_millis(60));
        assert_eq!(backoff_delay(&backoff, 50), Duration::from_millis(200));
    }
}
