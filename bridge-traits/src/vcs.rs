//! Version Control Store Abstraction
//!
//! A hosted repository with optimistic concurrency: every file carries a
//! revision token, and writes must present the token they were based on.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

/// Opaque revision token (a blob SHA, an etag, a commit id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RevisionToken(String);

impl RevisionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RevisionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// File content together with the revision it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedFile {
    pub content: Bytes,
    pub revision: RevisionToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeEntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    pub kind: TreeEntryKind,
    pub revision: Option<RevisionToken>,
}

/// Version control store trait
///
/// # Concurrency contract
///
/// - `write_file` with `expected_revision = None` creates the file and fails
///   with [`BridgeError::StaleRevision`](crate::BridgeError::StaleRevision)
///   if it already exists.
/// - `write_file` with a token that no longer matches fails with
///   `StaleRevision`; callers re-read and retry.
#[async_trait]
pub trait VersionControlStore: Send + Sync {
    /// Read a file, `None` when it does not exist
    async fn read_file(&self, path: &str) -> Result<Option<VersionedFile>>;

    /// Create or update a file, returning the new revision
    async fn write_file(
        &self,
        path: &str,
        content: Bytes,
        expected_revision: Option<RevisionToken>,
        message: &str,
    ) -> Result<RevisionToken>;

    /// Delete a file at the given revision
    async fn delete_file(&self, path: &str, revision: RevisionToken, message: &str) -> Result<()>;

    /// List entries below `path`
    async fn list_tree(&self, path: &str, recursive: bool) -> Result<Vec<TreeEntry>>;
}
