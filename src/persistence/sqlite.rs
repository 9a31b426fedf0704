//! SQLite-based implementation of the persistence layer.
//!
//! Records are kept in a single `parcelpost_messages` table keyed by message id.
//! Batches produced by the message store are applied inside one transaction so
//! a crash never leaves half of a batch on disk.

use std::{collections::HashMap, future::Future, pin::Pin};

use sqlx::{
    sqlite::{SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
use tokio_stream::StreamExt;

use crate::error::Error;

use super::{PersistOp, Persistence};

/// Persistence backed by a SQLite database.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

/// A stored record as read back from the database.
#[derive(sqlx::FromRow)]
struct StoredRecord {
    key: String,
    record: String,
}

impl SqlitePersistence {
    /// Opens (creating if missing) the database at `path`.
    pub async fn connect(path: impl AsRef<str>) -> Result<Self, Error> {
        let opts = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .auto_vacuum(SqliteAutoVacuum::Full);

        let pool = SqlitePoolOptions::new().connect_with(opts).await?;

        Self::new(pool).await
    }

    /// Wraps an existing pool.
    ///
    /// This method will create the required table if it doesn't exist.
    pub async fn new(pool: SqlitePool) -> Result<Self, Error> {
        sqlx::query(
            "
            CREATE TABLE IF NOT EXISTS parcelpost_messages (
                key TEXT UNIQUE NOT NULL,
                record TEXT NOT NULL,

                PRIMARY KEY (key)
            )
            ",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl Persistence for SqlitePersistence {
    fn put(
        &self,
        key: &str,
        record: String,
    ) -> Pin<Box<dyn Future<Output = eyre::Result<()>> + Send + 'static>> {
        let self_clone = self.clone();
        let key = key.to_owned();
        Box::pin(async move {
            sqlx::query(
                "
                INSERT OR REPLACE INTO parcelpost_messages (key, record)
                VALUES ($1, $2)
                ",
            )
            .bind(key)
            .bind(record)
            .execute(&self_clone.pool)
            .await?;

            Ok(())
        })
    }

    fn delete(&self, key: &str) -> Pin<Box<dyn Future<Output = eyre::Result<()>> + Send + 'static>> {
        let self_clone = self.clone();
        let key = key.to_owned();
        Box::pin(async move {
            sqlx::query(
                "
                DELETE FROM parcelpost_messages
                WHERE key = $1
                ",
            )
            .bind(key)
            .execute(&self_clone.pool)
            .await?;

            Ok(())
        })
    }

    fn get_all(
        &self,
    ) -> Pin<Box<dyn Future<Output = eyre::Result<HashMap<String, String>>> + Send + 'static>> {
        let self_clone = self.clone();
        Box::pin(async move {
            let mut stream = sqlx::query_as::<_, StoredRecord>(
                "SELECT key, record FROM parcelpost_messages",
            )
            .fetch(&self_clone.pool);

            let mut records = HashMap::new();

            while let Some(row) = stream.next().await.transpose()? {
                records.insert(row.key, row.record);
            }

            Ok(records)
        })
    }

    fn apply<'a>(
        &'a self,
        batch: Vec<PersistOp>,
    ) -> Pin<Box<dyn Future<Output = eyre::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;

            for op in batch {
                match op {
                    PersistOp::Put { key, record } => {
                        sqlx::query(
                            "
                            INSERT OR REPLACE INTO parcelpost_messages (key, record)
                            VALUES ($1, $2)
                            ",
                        )
                        .bind(key)
                        .bind(record)
                        .execute(tx.as_mut())
                        .await?;
                    }
                    PersistOp::Delete { key } => {
                        sqlx::query("DELETE FROM parcelpost_messages WHERE key = $1")
                            .bind(key)
                            .execute(tx.as_mut())
                            .await?;
                    }
                }
            }

            tx.commit().await?;

            Ok(())
        })
    }
}
