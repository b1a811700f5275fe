//! Reconcile leases.
//!
//! Only one reconciler may run against a remote at a time. A replica that
//! cannot take the lease skips its tick.
//!
//! - [`LocalSyncLock`]: process-local, for single-instance deployments
//! - [`KvSyncLock`]: built on the shared [`KeyValueStore`] compare-and-set,
//!   so every replica pointed at the same store competes for one lease

use async_trait::async_trait;
use bridge_traits::{error::Result, kv::KeyValueStore, lock::SyncLock};
use core_runtime::config::NotesConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

const DEFAULT_KEY_PREFIX: &str = "notes:lock:";

// ============================================================================
// Local
// ============================================================================

#[derive(Default)]
pub struct LocalSyncLock {
    leases: Mutex<HashMap<String, (String, Instant)>>,
}

impl LocalSyncLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncLock for LocalSyncLock {
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();

        let available = match leases.get(name) {
            Some((owner, expires_at)) => owner == holder || *expires_at <= now,
            None => true,
        };
        if available {
            leases.insert(name.to_string(), (holder.to_string(), now + ttl));
        }
        Ok(available)
    }

    async fn release(&self, name: &str, holder: &str) -> Result<()> {
        let mut leases = self.leases.lock().unwrap_or_else(|p| p.into_inner());
        if leases.get(name).is_some_and(|(owner, _)| owner == holder) {
            leases.remove(name);
        }
        Ok(())
    }
}

// ============================================================================
// Key-value backed
// ============================================================================

pub struct KvSyncLock {
    kv: Arc<dyn KeyValueStore>,
    key_prefix: String,
}

impl KvSyncLock {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix, name)
    }
}

#[async_trait]
impl SyncLock for KvSyncLock {
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let key = self.key(name);
        let expected = match self.kv.get(&key).await? {
            Some(current) if current.value == holder.as_bytes() => Some(current.version),
            Some(_) => return Ok(false),
            None => None,
        };

        let acquired = self
            .kv
            .compare_and_set(&key, holder.as_bytes().to_vec(), expected, ttl)
            .await?;
        debug!(lock = name, holder, acquired, "Lease acquisition");
        Ok(acquired)
    }

    async fn release(&self, name: &str, holder: &str) -> Result<()> {
        let key = self.key(name);
        if let Some(current) = self.kv.get(&key).await? {
            if current.value == holder.as_bytes() {
                self.kv.compare_and_delete(&key, current.version).await?;
            }
        }
        Ok(())
    }
}

/// An injected lock wins; otherwise the shared key-value store, otherwise a
/// process-local lock.
pub fn select_sync_lock(config: &NotesConfig) -> Arc<dyn SyncLock> {
    if let Some(lock) = &config.sync_lock {
        return Arc::clone(lock);
    }
    match &config.key_value_store {
        Some(kv) => Arc::new(KvSyncLock::new(Arc::clone(kv))),
        None => Arc::new(LocalSyncLock::new()),
    }
}
