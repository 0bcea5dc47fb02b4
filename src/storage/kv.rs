//! Keyed JSON record store over one SQLite table
//!
//! The adapter every durable component builds on: atomic upsert, lookup,
//! delete, and a fold for startup index rebuilds. Structural corruption is
//! reported as an error value, never a panic.

use super::database::{StorageError, StorageResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::{Pool, Row, Sqlite};

/// Pure SQL generation for the keyed record tables
mod sql {
    pub(super) fn upsert(table: &str) -> String {
        format!("INSERT OR REPLACE INTO {table} (id, record) VALUES (?, ?)")
    }

    pub(super) fn select_by_id(table: &str) -> String {
        format!("SELECT record FROM {table} WHERE id = ?")
    }

    pub(super) fn delete_by_id(table: &str) -> String {
        format!("DELETE FROM {table} WHERE id = ?")
    }

    pub(super) fn select_all(table: &str) -> String {
        format!("SELECT id, record FROM {table}")
    }

    pub(super) fn count(table: &str) -> String {
        format!("SELECT COUNT(*) AS n FROM {table}")
    }
}

/// Handle on one durable `{id -> record}` table
#[derive(Clone)]
pub struct KvTable {
    pool: Pool<Sqlite>,
    name: &'static str,
}

impl KvTable {
    pub(super) fn new(pool: Pool<Sqlite>, name: &'static str) -> Self {
        Self { pool, name }
    }

    /// The table identifier, used in corruption reports
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    fn db_error(&self, e: sqlx::Error) -> StorageError {
        StorageError::Database {
            table: self.name.to_string(),
            message: e.to_string(),
        }
    }

    fn corrupt(&self, message: String) -> StorageError {
        StorageError::Corrupted {
            table: self.name.to_string(),
            message,
        }
    }

    /// Inserts or replaces the record under `id`. Durable on return.
    ///
    /// # Errors
    /// `StorageError::Database` on write failure, `Corrupted` if the record
    /// cannot be encoded.
    pub async fn insert<T: Serialize>(&self, id: &str, record: &T) -> StorageResult<()> {
        let encoded = serde_json::to_string(record)
            .map_err(|e| self.corrupt(format!("encoding {id}: {e}")))?;
        sqlx::query(&sql::upsert(self.name))
            .bind(id)
            .bind(encoded)
            .execute(&self.pool)
            .await
            .map_err(|e| self.db_error(e))?;
        Ok(())
    }

    /// Looks up the record under `id`
    ///
    /// # Errors
    /// `StorageError::Database` on read failure, `Corrupted` if the stored
    /// record does not decode.
    pub async fn get<T: DeserializeOwned>(&self, id: &str) -> StorageResult<Option<T>> {
        let row = sqlx::query(&sql::select_by_id(self.name))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| self.db_error(e))?;

        match row {
            None => Ok(None),
            Some(row) => {
                let raw: String = row
                    .try_get("record")
                    .map_err(|e| self.corrupt(format!("reading {id}: {e}")))?;
                let record = serde_json::from_str(&raw)
                    .map_err(|e| self.corrupt(format!("decoding {id}: {e}")))?;
                Ok(Some(record))
            }
        }
    }

    /// Deletes the record under `id`; returns whether a row existed
    ///
    /// # Errors
    /// `StorageError::Database` on write failure.
    pub async fn delete(&self, id: &str) -> StorageResult<bool> {
        let result = sqlx::query(&sql::delete_by_id(self.name))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| self.db_error(e))?;
        Ok(result.rows_affected() > 0)
    }

    /// Folds over every record in the table. Used at startup to rebuild
    /// in-memory indices. Returns the number of records visited.
    ///
    /// # Errors
    /// `StorageError::Database` on read failure, `Corrupted` when any row
    /// fails to decode.
    pub async fn for_each<T, F>(&self, mut visit: F) -> StorageResult<usize>
    where
        T: DeserializeOwned,
        F: FnMut(String, T),
    {
        let rows = sqlx::query(&sql::select_all(self.name))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.db_error(e))?;

        let mut visited = 0;
        for row in rows {
            let id: String = row
                .try_get("id")
                .map_err(|e| self.corrupt(format!("reading id column: {e}")))?;
            let raw: String = row
                .try_get("record")
                .map_err(|e| self.corrupt(format!("reading {id}: {e}")))?;
            let record = serde_json::from_str(&raw)
                .map_err(|e| self.corrupt(format!("decoding {id}: {e}")))?;
            visit(id, record);
            visited += 1;
        }
        Ok(visited)
    }

    /// Number of records in the table
    ///
    /// # Errors
    /// `StorageError::Database` on read failure.
    pub async fn count(&self) -> StorageResult<u64> {
        let row = sqlx::query(&sql::count(self.name))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.db_error(e))?;
        let n: i64 = row
            .try_get("n")
            .map_err(|e| self.corrupt(format!("reading count: {e}")))?;
        Ok(u64::try_from(n).unwrap_or(0))
    }

    /// Explicit durability fence: checkpoints the WAL to the main file.
    /// Individual writes are already synchronous; this is for shutdown.
    ///
    /// # Errors
    /// `StorageError::Database` on checkpoint failure.
    pub async fn sync(&self) -> StorageResult<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .map_err(|e| self.db_error(e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{Database, table};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        label: String,
        count: u32,
    }

    #[tokio::test]
    async fn insert_get_delete_round_trip() {
        let db = Database::open_in_memory().await.unwrap();
        let kv = db.table(table::TASK_QUEUE);

        let record = Record {
            label: "first".to_string(),
            count: 3,
        };
        kv.insert("r1", &record).await.unwrap();
        assert_eq!(kv.get::<Record>("r1").await.unwrap(), Some(record.clone()));

        // Upsert replaces in place.
        let updated = Record {
            count: 4,
            ..record
        };
        kv.insert("r1", &updated).await.unwrap();
        assert_eq!(kv.get::<Record>("r1").await.unwrap(), Some(updated));

        assert!(kv.delete("r1").await.unwrap());
        assert!(!kv.delete("r1").await.unwrap());
        assert_eq!(kv.get::<Record>("r1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn fold_visits_every_record() {
        let db = Database::open_in_memory().await.unwrap();
        let kv = db.table(table::CONFIG);

        for i in 0..5 {
            let record = Record {
                label: format!("r{i}"),
                count: i,
            };
            kv.insert(&format!("id{i}"), &record).await.unwrap();
        }

        let mut seen = Vec::new();
        let visited = kv
            .for_each::<Record, _>(|id, record| seen.push((id, record.count)))
            .await
            .unwrap();
        assert_eq!(visited, 5);
        assert_eq!(kv.count().await.unwrap(), 5);
        seen.sort();
        assert_eq!(seen[0].0, "id0");
    }

    #[tokio::test]
    async fn survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.db");

        {
            let db = Database::open(&path).await.unwrap();
            let kv = db.table(table::TASK_QUEUE);
            kv.insert(
                "persisted",
                &Record {
                    label: "stay".to_string(),
                    count: 1,
                },
            )
            .await
            .unwrap();
            kv.sync().await.unwrap();
            db.close().await;
        }

        let db = Database::open(&path).await.unwrap();
        let kv = db.table(table::TASK_QUEUE);
        let record = kv.get::<Record>("persisted").await.unwrap().unwrap();
        assert_eq!(record.label, "stay");
    }
}
