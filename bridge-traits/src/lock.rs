//! Mutual Exclusion Across Replicas

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Named lease lock
///
/// A lease expires after `ttl` unless refreshed, so a crashed holder cannot
/// wedge reconciliation forever. Acquiring a lease already held by the same
/// `holder` refreshes it.
#[async_trait]
pub trait SyncLock: Send + Sync {
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Release the lease if `holder` still owns it
    async fn release(&self, name: &str, holder: &str) -> Result<()>;
}
