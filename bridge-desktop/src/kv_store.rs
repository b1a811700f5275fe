//! Key-Value Stores
//!
//! Two [`KeyValueStore`] implementations:
//! - [`SqliteKeyValueStore`]: persistent, shareable between processes on the
//!   same host through a common database file
//! - [`MemoryKeyValueStore`]: process-local, for single-instance deployments
//!   and tests

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    kv::{KeyValueStore, VersionedValue},
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

// ============================================================================
// SQLite
// ============================================================================

/// SQLite-backed key-value store
///
/// Every entry carries a version and an absolute expiry in Unix milliseconds.
/// Versions are drawn from a store-wide counter in `kv_meta`, so a key that is
/// deleted (or purged) and recreated never hands out a version seen before.
/// Each conditional write runs in one transaction that bumps the counter
/// first, which takes the write lock before the precondition is checked.
pub struct SqliteKeyValueStore {
    pool: SqlitePool,
}

impl SqliteKeyValueStore {
    /// Open (or create) a store at the given database path
    pub async fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(BridgeError::Io)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| BridgeError::OperationFailed(format!("Failed to connect to DB: {}", e)))?;

        let store = Self { pool };
        store.initialize().await?;

        debug!(path = ?db_path, "Initialized key-value store");
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| BridgeError::OperationFailed(format!("Failed to connect to DB: {}", e)))?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    /// Shared with other tables kept in the same database file
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Default location under the platform data directory
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("notes-core")
            .join("kv.db")
    }

    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_entries (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                version INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| BridgeError::OperationFailed(format!("Failed to create table: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_meta (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| BridgeError::OperationFailed(format!("Failed to create table: {}", e)))?;

        // Files written before the counter existed continue above their highest version
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO kv_meta (name, value)
            SELECT 'version', COALESCE(MAX(version), 0) FROM kv_entries
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| BridgeError::OperationFailed(format!("Failed to seed counter: {}", e)))?;

        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool.begin().await.map_err(|e| {
            BridgeError::OperationFailed(format!("Failed to begin transaction: {}", e))
        })
    }

    async fn next_version(tx: &mut Transaction<'static, Sqlite>) -> Result<i64> {
        let row = sqlx::query("UPDATE kv_meta SET value = value + 1 WHERE name = 'version' RETURNING value")
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| BridgeError::OperationFailed(format!("Failed to allocate version: {}", e)))?;

        Ok(row.get(0))
    }

    async fn finish(tx: Transaction<'static, Sqlite>, applied: bool) -> Result<bool> {
        // Rolling back also returns the unused version to the counter
        let outcome = if applied { tx.commit().await } else { tx.rollback().await };
        outcome.map_err(|e| {
            BridgeError::OperationFailed(format!("Failed to finish transaction: {}", e))
        })?;
        Ok(applied)
    }

    fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn expiry_millis(ttl: Duration) -> i64 {
        Self::now_millis().saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64)
    }

    /// Remove expired rows, returning how many were dropped
    pub async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE expires_at <= ?")
            .bind(Self::now_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| BridgeError::OperationFailed(format!("Failed to purge: {}", e)))?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl KeyValueStore for SqliteKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>> {
        let row = sqlx::query("SELECT value, version FROM kv_entries WHERE key = ? AND expires_at > ?")
            .bind(key)
            .bind(Self::now_millis())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BridgeError::OperationFailed(format!("Failed to get entry: {}", e)))?;

        Ok(row.map(|row| VersionedValue {
            value: row.get(0),
            version: row.get::<i64, _>(1) as u64,
        }))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_version: Option<u64>,
        ttl: Duration,
    ) -> Result<bool> {
        let mut tx = self.begin().await?;
        let version = Self::next_version(&mut tx).await?;
        let now = Self::now_millis();
        let expires_at = Self::expiry_millis(ttl);

        let result = match expected_version {
            // An expired row counts as absent
            None => sqlx::query(
                r#"
                INSERT INTO kv_entries (key, value, version, expires_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    version = excluded.version,
                    expires_at = excluded.expires_at
                WHERE kv_entries.expires_at <= ?
                "#,
            )
            .bind(key)
            .bind(&value)
            .bind(version)
            .bind(expires_at)
            .bind(now)
            .execute(&mut *tx)
            .await,
            Some(expected) => sqlx::query(
                r#"
                UPDATE kv_entries
                SET value = ?, version = ?, expires_at = ?
                WHERE key = ? AND version = ? AND expires_at > ?
                "#,
            )
            .bind(&value)
            .bind(version)
            .bind(expires_at)
            .bind(key)
            .bind(expected as i64)
            .bind(now)
            .execute(&mut *tx)
            .await,
        }
        .map_err(|e| BridgeError::OperationFailed(format!("Failed to write entry: {}", e)))?;

        let written = Self::finish(tx, result.rows_affected() == 1).await?;
        debug!(key = key, expected_version = ?expected_version, written, "Conditional write");
        Ok(written)
    }

    async fn compare_and_delete(&self, key: &str, expected_version: u64) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM kv_entries WHERE key = ? AND version = ? AND expires_at > ?")
                .bind(key)
                .bind(expected_version as i64)
                .bind(Self::now_millis())
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    BridgeError::OperationFailed(format!("Failed to delete entry: {}", e))
                })?;

        Ok(result.rows_affected() == 1)
    }
}

// ============================================================================
// In-Memory
// ============================================================================

struct MemoryEntry {
    value: Vec<u8>,
    version: u64,
    expires_at: Instant,
}

impl MemoryEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Default)]
struct MemoryState {
    entries: HashMap<String, MemoryEntry>,
    last_version: u64,
}

impl MemoryState {
    fn next_version(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }
}

/// Process-local key-value store
///
/// Expiry uses `tokio::time::Instant`, so paused-clock tests can advance past
/// a TTL without sleeping. Versions come from one counter for the whole store.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    state: Mutex<MemoryState>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>> {
        let now = Instant::now();
        Ok(self
            .lock()
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| VersionedValue {
                value: entry.value.clone(),
                version: entry.version,
            }))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_version: Option<u64>,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut state = self.lock();

        let live_version = state
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.version);
        if live_version != expected_version {
            return Ok(false);
        }

        let version = state.next_version();
        state.entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                version,
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected_version: u64) -> Result<bool> {
        let now = Instant::now();
        let mut state = self.lock();

        match state.entries.get(key) {
            Some(entry) if entry.is_live(now) && entry.version == expected_version => {
                state.entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    async fn exercise_cas(store: &dyn KeyValueStore) {
        assert!(store.get("session:u1").await.unwrap().is_none());

        // Create only if absent
        assert!(store
            .compare_and_set("session:u1", b"a".to_vec(), None, TTL)
            .await
            .unwrap());
        assert!(!store
            .compare_and_set("session:u1", b"b".to_vec(), None, TTL)
            .await
            .unwrap());

        let current = store.get("session:u1").await.unwrap().unwrap();
        assert_eq!(current.value, b"a".to_vec());
        assert_eq!(current.version, 1);

        // Stale version loses
        assert!(store
            .compare_and_set("session:u1", b"c".to_vec(), Some(1), TTL)
            .await
            .unwrap());
        assert!(!store
            .compare_and_set("session:u1", b"d".to_vec(), Some(1), TTL)
            .await
            .unwrap());

        let current = store.get("session:u1").await.unwrap().unwrap();
        assert_eq!(current.value, b"c".to_vec());
        assert_eq!(current.version, 2);

        assert!(!store.compare_and_delete("session:u1", 1).await.unwrap());
        assert!(store.compare_and_delete("session:u1", 2).await.unwrap());
        assert!(store.get("session:u1").await.unwrap().is_none());
    }

    /// A token taken before a delete must not match the recreated entry.
    async fn exercise_recreate_after_delete(store: &dyn KeyValueStore) {
        assert!(store
            .compare_and_set("session:u1", b"old-session".to_vec(), None, TTL)
            .await
            .unwrap());
        let stale = store.get("session:u1").await.unwrap().unwrap().version;

        assert!(store.compare_and_delete("session:u1", stale).await.unwrap());
        assert!(store
            .compare_and_set("session:u1", b"new-session".to_vec(), None, TTL)
            .await
            .unwrap());

        let fresh = store.get("session:u1").await.unwrap().unwrap();
        assert_ne!(fresh.version, stale);
        assert!(!store
            .compare_and_set("session:u1", b"old-session+a".to_vec(), Some(stale), TTL)
            .await
            .unwrap());
        assert!(!store.compare_and_delete("session:u1", stale).await.unwrap());

        let current = store.get("session:u1").await.unwrap().unwrap();
        assert_eq!(current.value, b"new-session".to_vec());
        assert_eq!(current.version, fresh.version);
    }

    #[tokio::test]
    async fn test_sqlite_recreated_key_rejects_stale_version() {
        let store = SqliteKeyValueStore::in_memory().await.unwrap();
        exercise_recreate_after_delete(&store).await;
    }

    #[tokio::test]
    async fn test_memory_recreated_key_rejects_stale_version() {
        let store = MemoryKeyValueStore::new();
        exercise_recreate_after_delete(&store).await;
    }

    #[tokio::test]
    async fn test_sqlite_compare_and_set() {
        let store = SqliteKeyValueStore::in_memory().await.unwrap();
        exercise_cas(&store).await;
    }

    #[tokio::test]
    async fn test_memory_compare_and_set() {
        let store = MemoryKeyValueStore::new();
        exercise_cas(&store).await;
    }

    #[tokio::test]
    async fn test_sqlite_expired_entry_is_absent() {
        let store = SqliteKeyValueStore::in_memory().await.unwrap();

        assert!(store
            .compare_and_set("lease", b"r1".to_vec(), None, Duration::from_millis(0))
            .await
            .unwrap());
        assert!(store.get("lease").await.unwrap().is_none());

        // Absent-only write succeeds over an expired row, version keeps counting
        assert!(store
            .compare_and_set("lease", b"r2".to_vec(), None, TTL)
            .await
            .unwrap());
        let current = store.get("lease").await.unwrap().unwrap();
        assert_eq!(current.value, b"r2".to_vec());
        assert_eq!(current.version, 2);
        assert!(!store
            .compare_and_set("lease", b"r1".to_vec(), Some(1), TTL)
            .await
            .unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_entry_expires() {
        let store = MemoryKeyValueStore::new();

        assert!(store
            .compare_and_set("lease", b"r1".to_vec(), None, Duration::from_secs(5))
            .await
            .unwrap());
        tokio::time::advance(Duration::from_secs(6)).await;

        assert!(store.get("lease").await.unwrap().is_none());
        assert!(store
            .compare_and_set("lease", b"r2".to_vec(), None, TTL)
            .await
            .unwrap());
        assert_eq!(store.get("lease").await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_sqlite_purge_expired() {
        let store = SqliteKeyValueStore::in_memory().await.unwrap();
        store
            .compare_and_set("old", b"x".to_vec(), None, Duration::from_millis(0))
            .await
            .unwrap();
        store
            .compare_and_set("fresh", b"y".to_vec(), None, TTL)
            .await
            .unwrap();

        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.get("fresh").await.unwrap().is_some());

        // Purging does not rewind versions
        assert!(store
            .compare_and_set("old", b"z".to_vec(), None, TTL)
            .await
            .unwrap());
        assert_eq!(store.get("old").await.unwrap().unwrap().version, 3);
        assert!(!store
            .compare_and_set("old", b"w".to_vec(), Some(1), TTL)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_counter_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("kv-{}", uuid::Uuid::new_v4()));
        let path = dir.join("kv.db");

        {
            let store = SqliteKeyValueStore::new(path.clone()).await.unwrap();
            store
                .compare_and_set("k", b"a".to_vec(), None, TTL)
                .await
                .unwrap();
            assert!(store.compare_and_delete("k", 1).await.unwrap());
            store.pool().close().await;
        }

        let store = SqliteKeyValueStore::new(path).await.unwrap();
        store
            .compare_and_set("k", b"b".to_vec(), None, TTL)
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap().version, 2);

        store.pool().close().await;
        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
