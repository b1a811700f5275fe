//! Key-Value Store Abstraction
//!
//! A shared store with per-key versions and TTL (Redis, etcd, a SQLite file
//! on shared storage). Session aggregation and the sync lease are built on
//! its compare-and-set primitive.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub value: Vec<u8>,
    /// Never reused for a key, even after it is deleted and recreated
    pub version: u64,
}

/// Key-value store trait
///
/// Expired entries must behave exactly like absent ones.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>>;

    /// Write `value` if the current version equals `expected_version`.
    ///
    /// `None` means "only if absent". Returns `false` when the precondition
    /// does not hold; the store is left untouched in that case.
    async fn compare_and_set(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_version: Option<u64>,
        ttl: Duration,
    ) -> Result<bool>;

    /// Delete the entry if its version equals `expected_version`
    async fn compare_and_delete(&self, key: &str, expected_version: u64) -> Result<bool>;
}
