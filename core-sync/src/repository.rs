//! # Fingerprint Repository
//!
//! Last-known state of every tracked file.
//!
//! ## Overview
//!
//! Each [`FileRecord`] keeps two fingerprints:
//! - `fingerprint`: content hash seen by the most recent scan
//! - `synced_fingerprint`: content hash last confirmed on the remote
//!
//! A record whose synced fingerprint lags behind is pending and is picked up
//! again by every reconciliation until a remote write succeeds.

use crate::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

// ============================================================================
// Record
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path relative to the watch root, `/`-separated. Unique.
    pub path: String,
    pub fingerprint: String,
    pub size: u64,
    pub synced_fingerprint: Option<String>,
    /// Missing locally since the last scan
    pub deleted: bool,
    /// Blob store URL of the last uploaded copy (binary files only)
    pub blob_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn new(
        path: impl Into<String>,
        fingerprint: impl Into<String>,
        size: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            path: path.into(),
            fingerprint: fingerprint.into(),
            size,
            synced_fingerprint: None,
            deleted: false,
            blob_url: None,
            updated_at: now,
        }
    }

    /// Whether the remote still has to catch up with this record
    pub fn is_pending(&self) -> bool {
        if self.deleted {
            self.synced_fingerprint.is_some()
        } else {
            self.synced_fingerprint.as_deref() != Some(self.fingerprint.as_str())
        }
    }
}

// ============================================================================
// Repository Trait
// ============================================================================

#[async_trait]
pub trait FingerprintRepository: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<FileRecord>>;

    /// Every record, ordered by path
    async fn list(&self) -> Result<Vec<FileRecord>>;

    /// Insert or replace the record for `record.path`
    async fn upsert(&self, record: &FileRecord) -> Result<()>;

    /// Returns whether a record was removed
    async fn remove(&self, path: &str) -> Result<bool>;

    /// Records whose remote copy lags behind, ordered by path
    async fn pending(&self) -> Result<Vec<FileRecord>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(FileRecord::is_pending)
            .collect())
    }
}

// ============================================================================
// SQLite Implementation
// ============================================================================

pub struct SqliteFingerprintRepository {
    pool: SqlitePool,
}

impl SqliteFingerprintRepository {
    /// Wrap an existing pool, creating the schema if needed
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let repository = Self { pool };
        repository.initialize().await?;
        Ok(repository)
    }

    /// Single-connection in-memory database (for testing)
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::new(pool).await
    }

    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS file_records (
                path TEXT PRIMARY KEY NOT NULL,
                fingerprint TEXT NOT NULL,
                size INTEGER NOT NULL,
                synced_fingerprint TEXT,
                deleted INTEGER NOT NULL DEFAULT 0,
                blob_url TEXT,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct FileRecordRow {
    path: String,
    fingerprint: String,
    size: i64,
    synced_fingerprint: Option<String>,
    deleted: bool,
    blob_url: Option<String>,
    updated_at: i64,
}

impl TryFrom<FileRecordRow> for FileRecord {
    type Error = SyncError;

    fn try_from(row: FileRecordRow) -> Result<Self> {
        let updated_at = Utc
            .timestamp_millis_opt(row.updated_at)
            .single()
            .ok_or_else(|| {
                SyncError::Database(format!(
                    "Invalid updated_at {} for {}",
                    row.updated_at, row.path
                ))
            })?;

        Ok(FileRecord {
            path: row.path,
            fingerprint: row.fingerprint,
            size: row.size.max(0) as u64,
            synced_fingerprint: row.synced_fingerprint,
            deleted: row.deleted,
            blob_url: row.blob_url,
            updated_at,
        })
    }
}

#[async_trait]
impl FingerprintRepository for SqliteFingerprintRepository {
    async fn get(&self, path: &str) -> Result<Option<FileRecord>> {
        let row = sqlx::query_as::<_, FileRecordRow>(
            r#"
            SELECT path, fingerprint, size, synced_fingerprint, deleted, blob_url, updated_at
            FROM file_records
            WHERE path = ?
            "#,
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        row.map(FileRecord::try_from).transpose()
    }

    async fn list(&self) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query_as::<_, FileRecordRow>(
            r#"
            SELECT path, fingerprint, size, synced_fingerprint, deleted, blob_url, updated_at
            FROM file_records
            ORDER BY path
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(FileRecord::try_from)
            .collect::<Result<Vec<_>>>()
    }

    async fn upsert(&self, record: &FileRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO file_records (
                path, fingerprint, size, synced_fingerprint, deleted, blob_url, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                fingerprint = excluded.fingerprint,
                size = excluded.size,
                synced_fingerprint = excluded.synced_fingerprint,
                deleted = excluded.deleted,
                blob_url = excluded.blob_url,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.path)
        .bind(&record.fingerprint)
        .bind(record.size.min(i64::MAX as u64) as i64)
        .bind(&record.synced_fingerprint)
        .bind(record.deleted)
        .bind(&record.blob_url)
        .bind(record.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM file_records WHERE path = ?")
            .bind(path)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn pending(&self) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query_as::<_, FileRecordRow>(
            r#"
            SELECT path, fingerprint, size, synced_fingerprint, deleted, blob_url, updated_at
            FROM file_records
            WHERE (deleted = 0 AND (synced_fingerprint IS NULL OR synced_fingerprint != fingerprint))
               OR (deleted = 1 AND synced_fingerprint IS NOT NULL)
            ORDER BY path
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(FileRecord::try_from)
            .collect::<Result<Vec<_>>>()
    }
}

// ============================================================================
// In-Memory Implementation
// ============================================================================

/// Process-local repository; state is lost on restart.
#[derive(Default)]
pub struct InMemoryFingerprintRepository {
    records: Mutex<BTreeMap<String, FileRecord>>,
}

impl InMemoryFingerprintRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FingerprintRepository for InMemoryFingerprintRepository {
    async fn get(&self, path: &str) -> Result<Option<FileRecord>> {
        Ok(self.records.lock().await.get(path).cloned())
    }

    async fn list(&self) -> Result<Vec<FileRecord>> {
        Ok(self.records.lock().await.values().cloned().collect())
    }

    async fn upsert(&self, record: &FileRecord) -> Result<()> {
        self.records
            .lock()
            .await
            .insert(record.path.clone(), record.clone());
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<bool> {
        Ok(self.records.lock().await.remove(path).is_some())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    async fn backends() -> Vec<Arc<dyn FingerprintRepository>> {
        vec![
            Arc::new(SqliteFingerprintRepository::in_memory().await.unwrap()),
            Arc::new(InMemoryFingerprintRepository::new()),
        ]
    }

    #[test]
    fn test_pending_rules() {
        let mut record = FileRecord::new("a.md", "f1", 3, at(0));
        assert!(record.is_pending());

        record.synced_fingerprint = Some("f1".to_string());
        assert!(!record.is_pending());

        record.fingerprint = "f2".to_string();
        assert!(record.is_pending());

        record.deleted = true;
        assert!(record.is_pending());

        record.synced_fingerprint = None;
        assert!(!record.is_pending());
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        for repo in backends().await {
            let mut record = FileRecord::new("docs/a.md", "f1", 12, at(1_700_000_000_123));
            repo.upsert(&record).await.unwrap();
            assert_eq!(repo.get("docs/a.md").await.unwrap(), Some(record.clone()));

            record.synced_fingerprint = Some("f1".to_string());
            record.blob_url = Some("https://cdn.test/a".to_string());
            repo.upsert(&record).await.unwrap();

            assert_eq!(repo.get("docs/a.md").await.unwrap(), Some(record));
            assert_eq!(repo.list().await.unwrap().len(), 1);
            assert!(repo.get("missing.md").await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_list_is_ordered_and_pending_filters() {
        for repo in backends().await {
            let mut synced = FileRecord::new("b.md", "f", 1, at(0));
            synced.synced_fingerprint = Some("f".to_string());
            let fresh = FileRecord::new("a.md", "g", 1, at(0));
            let mut gone = FileRecord::new("c.md", "h", 1, at(0));
            gone.synced_fingerprint = Some("h".to_string());
            gone.deleted = true;

            for record in [&synced, &fresh, &gone] {
                repo.upsert(record).await.unwrap();
            }

            let paths: Vec<_> = repo.list().await.unwrap().into_iter().map(|r| r.path).collect();
            assert_eq!(paths, vec!["a.md", "b.md", "c.md"]);

            let pending: Vec<_> = repo
                .pending()
                .await
                .unwrap()
                .into_iter()
                .map(|r| r.path)
                .collect();
            assert_eq!(pending, vec!["a.md", "c.md"]);
        }
    }

    #[tokio::test]
    async fn test_remove() {
        for repo in backends().await {
            repo.upsert(&FileRecord::new("a.md", "f", 1, at(0)))
                .await
                .unwrap();
            assert!(repo.remove("a.md").await.unwrap());
            assert!(!repo.remove("a.md").await.unwrap());
            assert!(repo.list().await.unwrap().is_empty());
        }
    }
}
