// src/persistence.rs

use crate::models::{DownloadBatchId, DownloadBatchTitle, DownloadFileId, FilePath, FilePersistenceType};
use crate::status::Status;
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

/// Persisted projection of a `DownloadBatch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadsBatchPersisted {
    pub batch_id: DownloadBatchId,
    pub title: DownloadBatchTitle,
    pub status: Status,
    pub storage_root: PathBuf,
    pub downloaded_date_time_ms: Option<i64>,
    pub notification_seen: bool,
}

/// Persisted projection of a `DownloadFile`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadsFilePersisted {
    pub batch_id: DownloadBatchId,
    pub file_id: DownloadFileId,
    pub file_name: String,
    pub file_path: FilePath,
    pub url: String,
    pub total_size: Option<u64>,
    pub persistence_type: FilePersistenceType,
}

/// Durable store of batches and their files; the source of truth across restarts.
#[async_trait]
pub trait DownloadsPersistence: Send + Sync {
    /// Writes a batch and all of its files atomically.
    async fn persist_batch(
        &self,
        batch: &DownloadsBatchPersisted,
        files: &[DownloadsFilePersisted],
    ) -> Result<(), PersistenceError>;

    /// Every batch, in the order they were first persisted.
    async fn load_batches(&self) -> Result<Vec<DownloadsBatchPersisted>, PersistenceError>;

    async fn load_batch(
        &self,
        batch_id: &DownloadBatchId,
    ) -> Result<Option<DownloadsBatchPersisted>, PersistenceError>;

    async fn persist_file(&self, file: &DownloadsFilePersisted) -> Result<(), PersistenceError>;

    async fn load_files(
        &self,
        batch_id: &DownloadBatchId,
    ) -> Result<Vec<DownloadsFilePersisted>, PersistenceError>;

    /// Removes a batch and its files atomically.
    async fn delete(&self, batch_id: &DownloadBatchId) -> Result<(), PersistenceError>;

    async fn update_status(
        &self,
        batch_id: &DownloadBatchId,
        status: Status,
        downloaded_date_time_ms: Option<i64>,
    ) -> Result<(), PersistenceError>;

    async fn update_notification_seen(
        &self,
        batch_id: &DownloadBatchId,
        seen: bool,
    ) -> Result<(), PersistenceError>;
}

/// SQLite-backed `DownloadsPersistence`.
#[derive(Clone)]
pub struct SqliteDownloadsPersistence {
    conn: Connection,
}

impl SqliteDownloadsPersistence {
    /// Opens (creating if needed) the database file and its tables.
    pub async fn open(db_path: &Path) -> Result<Self, PersistenceError> {
        let conn = Connection::open(db_path).await?;
        let persistence = Self { conn };
        persistence.setup_database().await?;
        Ok(persistence)
    }

    pub async fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory().await?;
        let persistence = Self { conn };
        persistence.setup_database().await?;
        Ok(persistence)
    }

    async fn setup_database(&self) -> Result<(), PersistenceError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "PRAGMA foreign_keys = ON;
                     CREATE TABLE IF NOT EXISTS batches (
                        batch_id              TEXT PRIMARY KEY NOT NULL,
                        title                 TEXT NOT NULL,
                        status                TEXT NOT NULL,
                        storage_root          TEXT NOT NULL,
                        downloaded_date_time  INTEGER,
                        notification_seen     INTEGER NOT NULL DEFAULT 0
                     );
                     CREATE TABLE IF NOT EXISTS files (
                        batch_id          TEXT NOT NULL REFERENCES batches(batch_id) ON DELETE CASCADE,
                        file_id           TEXT NOT NULL,
                        file_name         TEXT NOT NULL,
                        file_path         TEXT NOT NULL,
                        url               TEXT NOT NULL,
                        total_size        INTEGER,
                        persistence_type  TEXT NOT NULL,
                        PRIMARY KEY (batch_id, file_id)
                     );
                     CREATE INDEX IF NOT EXISTS files_by_batch ON files(batch_id);",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
struct CorruptValue(String);

fn corrupt(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(CorruptValue(message)),
    )
}

fn batch_from_row(row: &Row<'_>) -> Result<DownloadsBatchPersisted, rusqlite::Error> {
    let status: String = row.get(2)?;
    let storage_root: String = row.get(3)?;
    Ok(DownloadsBatchPersisted {
        batch_id: DownloadBatchId::new(row.get::<_, String>(0)?),
        title: DownloadBatchTitle::new(row.get::<_, String>(1)?),
        status: status.parse().map_err(|e| corrupt(2, e))?,
        storage_root: PathBuf::from(storage_root),
        downloaded_date_time_ms: row.get(4)?,
        notification_seen: row.get(5)?,
    })
}

fn file_from_row(row: &Row<'_>) -> Result<DownloadsFilePersisted, rusqlite::Error> {
    let file_path: String = row.get(3)?;
    let total_size: Option<i64> = row.get(5)?;
    let persistence_type: String = row.get(6)?;
    Ok(DownloadsFilePersisted {
        batch_id: DownloadBatchId::new(row.get::<_, String>(0)?),
        file_id: DownloadFileId::new(row.get::<_, String>(1)?),
        file_name: row.get(2)?,
        file_path: FilePath::new(file_path),
        url: row.get(4)?,
        total_size: total_size.and_then(|size| u64::try_from(size).ok()),
        persistence_type: persistence_type.parse().map_err(|e| corrupt(6, e))?,
    })
}

const UPSERT_BATCH: &str = "INSERT INTO batches
        (batch_id, title, status, storage_root, downloaded_date_time, notification_seen)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
     ON CONFLICT(batch_id) DO UPDATE SET
        title = excluded.title,
        status = excluded.status,
        storage_root = excluded.storage_root,
        downloaded_date_time = excluded.downloaded_date_time,
        notification_seen = excluded.notification_seen";

const UPSERT_FILE: &str = "INSERT INTO files
        (batch_id, file_id, file_name, file_path, url, total_size, persistence_type)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
     ON CONFLICT(batch_id, file_id) DO UPDATE SET
        file_name = excluded.file_name,
        file_path = excluded.file_path,
        url = excluded.url,
        total_size = excluded.total_size,
        persistence_type = excluded.persistence_type";

struct FileParams {
    batch_id: String,
    file_id: String,
    file_name: String,
    file_path: String,
    url: String,
    total_size: Option<i64>,
    persistence_type: &'static str,
}

impl From<&DownloadsFilePersisted> for FileParams {
    fn from(file: &DownloadsFilePersisted) -> Self {
        Self {
            batch_id: file.batch_id.as_str().to_string(),
            file_id: file.file_id.as_str().to_string(),
            file_name: file.file_name.clone(),
            file_path: file.file_path.to_string(),
            url: file.url.clone(),
            total_size: file.total_size.and_then(|size| i64::try_from(size).ok()),
            persistence_type: file.persistence_type.as_str(),
        }
    }
}

impl FileParams {
    fn execute(&self, conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.execute(
            UPSERT_FILE,
            params![
                self.batch_id,
                self.file_id,
                self.file_name,
                self.file_path,
                self.url,
                self.total_size,
                self.persistence_type
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl DownloadsPersistence for SqliteDownloadsPersistence {
    async fn persist_batch(
        &self,
        batch: &DownloadsBatchPersisted,
        files: &[DownloadsFilePersisted],
    ) -> Result<(), PersistenceError> {
        let batch_id = batch.batch_id.as_str().to_string();
        let title = batch.title.as_str().to_string();
        let status = batch.status.as_str();
        let storage_root = batch.storage_root.to_string_lossy().into_owned();
        let downloaded_at = batch.downloaded_date_time_ms;
        let seen = batch.notification_seen;
        let files: Vec<FileParams> = files.iter().map(FileParams::from).collect();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    UPSERT_BATCH,
                    params![batch_id, title, status, storage_root, downloaded_at, seen],
                )?;
                for file in &files {
                    file.execute(&tx)?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn load_batches(&self) -> Result<Vec<DownloadsBatchPersisted>, PersistenceError> {
        let batches = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT batch_id, title, status, storage_root, downloaded_date_time, notification_seen
                     FROM batches ORDER BY rowid",
                )?;
                let rows = stmt.query_map([], batch_from_row)?;
                let batches: Result<Vec<_>, rusqlite::Error> = rows.collect();
                Ok(batches?)
            })
            .await?;
        Ok(batches)
    }

    async fn load_batch(
        &self,
        batch_id: &DownloadBatchId,
    ) -> Result<Option<DownloadsBatchPersisted>, PersistenceError> {
        let batch_id = batch_id.as_str().to_string();
        let batch = self
            .conn
            .call(move |conn| {
                let batch = conn
                    .query_row(
                        "SELECT batch_id, title, status, storage_root, downloaded_date_time, notification_seen
                         FROM batches WHERE batch_id = ?1",
                        params![batch_id],
                        batch_from_row,
                    )
                    .optional()?;
                Ok(batch)
            })
            .await?;
        Ok(batch)
    }

    async fn persist_file(&self, file: &DownloadsFilePersisted) -> Result<(), PersistenceError> {
        let file = FileParams::from(file);
        self.conn
            .call(move |conn| {
                file.execute(conn)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn load_files(
        &self,
        batch_id: &DownloadBatchId,
    ) -> Result<Vec<DownloadsFilePersisted>, PersistenceError> {
        let batch_id = batch_id.as_str().to_string();
        let files = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT batch_id, file_id, file_name, file_path, url, total_size, persistence_type
                     FROM files WHERE batch_id = ?1 ORDER BY rowid",
                )?;
                let rows = stmt.query_map(params![batch_id], file_from_row)?;
                let files: Result<Vec<_>, rusqlite::Error> = rows.collect();
                Ok(files?)
            })
            .await?;
        Ok(files)
    }

    async fn delete(&self, batch_id: &DownloadBatchId) -> Result<(), PersistenceError> {
        let batch_id = batch_id.as_str().to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM files WHERE batch_id = ?1", params![batch_id])?;
                tx.execute("DELETE FROM batches WHERE batch_id = ?1", params![batch_id])?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn update_status(
        &self,
        batch_id: &DownloadBatchId,
        status: Status,
        downloaded_date_time_ms: Option<i64>,
    ) -> Result<(), PersistenceError> {
        let batch_id = batch_id.as_str().to_string();
        let status = status.as_str();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE batches SET status = ?2, downloaded_date_time = ?3 WHERE batch_id = ?1",
                    params![batch_id, status, downloaded_date_time_ms],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn update_notification_seen(
        &self,
        batch_id: &DownloadBatchId,
        seen: bool,
    ) -> Result<(), PersistenceError> {
        let batch_id = batch_id.as_str().to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE batches SET notification_seen = ?2 WHERE batch_id = ?1",
                    params![batch_id, seen],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(id: &str, status: Status) -> DownloadsBatchPersisted {
        DownloadsBatchPersisted {
            batch_id: DownloadBatchId::new(id),
            title: DownloadBatchTitle::new(format!("title {id}")),
            status,
            storage_root: PathBuf::from("/data"),
            downloaded_date_time_ms: None,
            notification_seen: false,
        }
    }

    fn file(batch_id: &str, file_id: &str, total: Option<u64>) -> DownloadsFilePersisted {
        DownloadsFilePersisted {
            batch_id: DownloadBatchId::new(batch_id),
            file_id: DownloadFileId::new(file_id),
            file_name: format!("{file_id}.zip"),
            file_path: FilePath::new(format!("/data/{batch_id}/{file_id}.zip")),
            url: format!("http://example.com/{file_id}.zip"),
            total_size: total,
            persistence_type: FilePersistenceType::Internal,
        }
    }

    #[tokio::test]
    async fn batches_load_in_persisted_order() {
        let persistence = SqliteDownloadsPersistence::open_in_memory().await.unwrap();
        for id in ["c", "a", "b"] {
            persistence.persist_batch(&batch(id, Status::Queued), &[]).await.unwrap();
        }
        // Re-persisting must not move a batch to the end.
        persistence.persist_batch(&batch("c", Status::Paused), &[]).await.unwrap();

        let loaded = persistence.load_batches().await.unwrap();
        let ids: Vec<_> = loaded.iter().map(|b| b.batch_id.as_str()).collect();
        assert_eq!(ids, ["c", "a", "b"]);
        assert_eq!(loaded[0].status, Status::Paused);
    }

    #[tokio::test]
    async fn files_are_stored_per_batch() {
        let persistence = SqliteDownloadsPersistence::open_in_memory().await.unwrap();
        persistence
            .persist_batch(&batch("a", Status::Queued), &[file("a", "1", Some(10)), file("a", "2", None)])
            .await
            .unwrap();
        persistence
            .persist_batch(&batch("b", Status::Queued), &[file("b", "1", Some(5))])
            .await
            .unwrap();

        let files = persistence.load_files(&DownloadBatchId::new("a")).await.unwrap();
        assert_eq!(files, vec![file("a", "1", Some(10)), file("a", "2", None)]);

        persistence.persist_file(&file("a", "2", Some(99))).await.unwrap();
        let files = persistence.load_files(&DownloadBatchId::new("a")).await.unwrap();
        assert_eq!(files[1].total_size, Some(99));
    }

    #[tokio::test]
    async fn delete_removes_batch_and_files() {
        let persistence = SqliteDownloadsPersistence::open_in_memory().await.unwrap();
        let id = DownloadBatchId::new("a");
        persistence
            .persist_batch(&batch("a", Status::Queued), &[file("a", "1", Some(10))])
            .await
            .unwrap();

        persistence.delete(&id).await.unwrap();

        assert!(persistence.load_batch(&id).await.unwrap().is_none());
        assert!(persistence.load_files(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_and_notification_updates_are_persisted() {
        let persistence = SqliteDownloadsPersistence::open_in_memory().await.unwrap();
        let id = DownloadBatchId::new("a");
        persistence.persist_batch(&batch("a", Status::Queued), &[]).await.unwrap();

        persistence.update_status(&id, Status::Downloaded, Some(1234)).await.unwrap();
        persistence.update_notification_seen(&id, true).await.unwrap();

        let loaded = persistence.load_batch(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, Status::Downloaded);
        assert_eq!(loaded.downloaded_date_time_ms, Some(1234));
        assert!(loaded.notification_seen);
    }

    #[tokio::test]
    async fn failed_batch_write_leaves_nothing_behind() {
        let persistence = SqliteDownloadsPersistence::open_in_memory().await.unwrap();
        // The second file references a batch that does not exist, so the
        // foreign key fails and the whole transaction is rolled back.
        let result = persistence
            .persist_batch(&batch("a", Status::Queued), &[file("a", "1", None), file("ghost", "1", None)])
            .await;

        assert!(result.is_err());
        assert!(persistence.load_batches().await.unwrap().is_empty());
    }
}
