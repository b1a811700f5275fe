//! Blob Store Abstraction
//!
//! Content-addressable storage for uploaded page images (a CDN bucket, an
//! object store, a media host).

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;

/// Free-form metadata attached to an upload (originator, session, page index)
pub type BlobMetadata = BTreeMap<String, String>;

/// Result of a successful upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedBlob {
    pub id: String,
    /// Publicly resolvable URL handed to the recognition service
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobEntry {
    pub id: String,
    pub name: String,
    pub url: String,
    pub size: u64,
    pub uploaded_at: Option<DateTime<Utc>>,
}

/// One page of a blob listing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobPage {
    pub items: Vec<BlobEntry>,
    /// Total number of blobs across all pages
    pub total: u64,
}

/// Blob store trait
///
/// Implementations must return [`BridgeError::NotConfigured`](crate::BridgeError::NotConfigured)
/// when credentials or the endpoint are missing, and
/// [`BridgeError::Transient`](crate::BridgeError::Transient) /
/// [`BridgeError::RateLimited`](crate::BridgeError::RateLimited) for failures
/// worth retrying.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload a payload under a human-readable name
    async fn upload(&self, data: Bytes, name: &str, metadata: BlobMetadata) -> Result<UploadedBlob>;

    /// List uploaded blobs, `page` starting at 1
    async fn list(&self, page: u32, per_page: u32) -> Result<BlobPage>;
}
