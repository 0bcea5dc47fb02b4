//! Embedded SQLite database management
//!
//! One database file holds every durable table the hub owns. A single
//! connection enforces the serialized-writer model, and
//! `journal_mode=WAL` + `synchronous=FULL` make each committed write
//! durable before the call returns.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use thiserror::Error;
use tracing::info;

use super::kv::KvTable;

/// Durable table names owned by the core
pub mod table {
    /// All non-terminal tasks plus completed tasks pending purge
    pub const TASK_QUEUE: &str = "task_queue";
    /// Dead-letter tasks retained for operator retry
    pub const TASK_DEAD_LETTER: &str = "task_dead_letter";
    /// Runtime key/value config overrides
    pub const CONFIG: &str = "agentcom_config";
    /// Violation cooldown entries keyed by agent id
    pub const SESSION_BACKOFF: &str = "session_backoff";

    /// Every table created at startup
    pub const ALL: [&str; 4] = [TASK_QUEUE, TASK_DEAD_LETTER, CONFIG, SESSION_BACKOFF];
}

/// Storage-layer error types
///
/// `Corrupted` means the table structure or a stored record could not be
/// read back; the core reports it and never auto-deletes data.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error on {table}: {message}")]
    Database { table: String, message: String },

    #[error("table corrupted: {table}: {message}")]
    Corrupted { table: String, message: String },

    #[error("failed to open database: {message}")]
    Open { message: String },
}

/// Storage result type
pub type StorageResult<T> = Result<T, StorageError>;

/// Handle to the hub's SQLite database
#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Opens (creating if missing) the database at `path` and ensures all
    /// core tables exist.
    ///
    /// # Errors
    /// Returns `StorageError::Open` if the file cannot be opened or the
    /// schema cannot be created.
    pub async fn open(path: &Path) -> StorageResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        let db = Self::connect(options).await?;
        info!(path = %path.display(), "database opened");
        Ok(db)
    }

    /// Opens an in-memory database, used by tests and ephemeral hubs.
    ///
    /// # Errors
    /// Returns `StorageError::Open` on connection failure.
    pub async fn open_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::new().in_memory(true);
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> StorageResult<Self> {
        // One connection: the actors serialize their own writes, and a
        // single writer keeps WAL checkpointing trivial.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Open {
                message: e.to_string(),
            })?;

        let db = Self { pool };
        db.create_tables().await?;
        Ok(db)
    }

    async fn create_tables(&self) -> StorageResult<()> {
        for name in table::ALL {
            let sql =
                format!("CREATE TABLE IF NOT EXISTS {name} (id TEXT PRIMARY KEY, record TEXT NOT NULL)");
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Open {
                    message: format!("creating {name}: {e}"),
                })?;
        }
        Ok(())
    }

    /// A typed handle on one durable table
    #[must_use]
    pub fn table(&self, name: &'static str) -> KvTable {
        KvTable::new(self.pool.clone(), name)
    }

    /// Closes the underlying pool, flushing the WAL
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
