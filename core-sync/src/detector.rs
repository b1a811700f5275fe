//! # Change Detector
//!
//! Classifies tracked files as added, modified or deleted against the
//! last-known fingerprints held by a [`FingerprintRepository`].
//!
//! ## Fingerprints
//!
//! SHA-256 over the file bytes, lowercase hex. Files are hashed with bounded
//! concurrency.
//!
//! ## Last seen vs. last synced
//!
//! `scan` advances the "last seen" fingerprint, so scanning twice without a
//! mutation yields an empty [`ChangeSet`]. The "last synced" fingerprint only
//! moves through [`ChangeDetector::mark_synced`], which keeps a failed push
//! visible in [`ChangeDetector::pending`] until it succeeds.

use crate::repository::{FileRecord, FingerprintRepository};
use crate::Result;
use bridge_traits::{error::BridgeError, storage::FileSystemAccess, time::Clock};
use core_runtime::config::SyncSettings;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt, TryStreamExt};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument};

const DEFAULT_HASH_CONCURRENCY: usize = 8;

/// Lowercase hex SHA-256 of `bytes`.
pub fn fingerprint(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Three disjoint, sorted path lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }
}

// ============================================================================
// Path filter
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

impl PathFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        let compile = |patterns: &[String]| {
            patterns
                .iter()
                .map(|p| Pattern::new(p))
                .collect::<std::result::Result<Vec<_>, _>>()
        };

        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    pub fn from_settings(settings: &SyncSettings) -> Result<Self> {
        Self::new(&settings.include_patterns, &settings.exclude_patterns)
    }

    /// `relative` is `/`-separated and relative to the watch root.
    pub fn matches(&self, relative: &str) -> bool {
        let included =
            self.include.is_empty() || self.include.iter().any(|p| p.matches(relative));
        included && !self.exclude.iter().any(|p| p.matches(relative))
    }
}

// ============================================================================
// Detector
// ============================================================================

pub struct ChangeDetector {
    fs: Arc<dyn FileSystemAccess>,
    repository: Arc<dyn FingerprintRepository>,
    root: PathBuf,
    filter: PathFilter,
    clock: Arc<dyn Clock>,
    hash_concurrency: usize,
}

impl ChangeDetector {
    pub fn new(
        fs: Arc<dyn FileSystemAccess>,
        repository: Arc<dyn FingerprintRepository>,
        root: impl Into<PathBuf>,
        filter: PathFilter,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            fs,
            repository,
            root: root.into(),
            filter,
            clock,
            hash_concurrency: DEFAULT_HASH_CONCURRENCY,
        }
    }

    pub fn with_hash_concurrency(mut self, concurrency: usize) -> Self {
        self.hash_concurrency = concurrency.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repository(&self) -> &Arc<dyn FingerprintRepository> {
        &self.repository
    }

    /// Local path for a `/`-separated relative path.
    pub fn absolute(&self, relative: &str) -> PathBuf {
        relative
            .split('/')
            .filter(|segment| !segment.is_empty())
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }

    /// Lists every file below the root that passes the include/exclude filter.
    ///
    /// A missing root is an error rather than an empty folder, so an unmounted
    /// share is never mistaken for a mass deletion.
    pub async fn discover(&self) -> Result<Vec<String>> {
        if !self.fs.exists(&self.root).await? {
            return Err(BridgeError::NotFound(format!(
                "watch root {} does not exist",
                self.root.display()
            ))
            .into());
        }

        let mut tracked: Vec<String> = self
            .fs
            .list_files_recursive(&self.root)
            .await?
            .iter()
            .filter_map(|path| relative_path(&self.root, path))
            .filter(|relative| self.filter.matches(relative))
            .collect();
        tracked.sort();

        debug!(root = ?self.root, files = tracked.len(), "Discovered tracked files");
        Ok(tracked)
    }

    /// Hashes `tracked` and classifies each path against the repository.
    ///
    /// Known paths missing from `tracked` are reported as deleted. Paths that
    /// vanish between listing and hashing count as missing.
    #[instrument(skip(self, tracked), fields(tracked = tracked.len()))]
    pub async fn scan(&self, tracked: &[String]) -> Result<ChangeSet> {
        let unique: BTreeSet<&str> = tracked.iter().map(String::as_str).collect();

        let reads: Vec<BoxFuture<'_, std::result::Result<_, BridgeError>>> = unique
            .into_iter()
            .map(|relative| -> BoxFuture<'_, std::result::Result<_, BridgeError>> {
                Box::pin(async move {
                    match self.fs.read_file(&self.absolute(relative)).await {
                        Ok(bytes) => Ok(Some((
                            relative.to_string(),
                            fingerprint(&bytes),
                            bytes.len() as u64,
                        ))),
                        Err(e) if is_missing(&e) => Ok(None),
                        Err(e) => Err(e),
                    }
                })
            })
            .collect();
        let hashed: Vec<Option<(String, String, u64)>> = stream::iter(reads)
            .buffer_unordered(self.hash_concurrency)
            .try_collect()
            .await?;

        let mut known: HashMap<String, FileRecord> = self
            .repository
            .list()
            .await?
            .into_iter()
            .map(|record| (record.path.clone(), record))
            .collect();

        let now = self.clock.now();
        let mut changes = ChangeSet::default();

        for (path, hash, size) in hashed.into_iter().flatten() {
            match known.remove(&path) {
                Some(mut record) if record.deleted => {
                    record.deleted = false;
                    record.fingerprint = hash;
                    record.size = size;
                    record.updated_at = now;
                    self.repository.upsert(&record).await?;
                    changes.added.push(path);
                }
                Some(mut record) if record.fingerprint != hash => {
                    record.fingerprint = hash;
                    record.size = size;
                    record.updated_at = now;
                    self.repository.upsert(&record).await?;
                    changes.modified.push(path);
                }
                Some(_) => {}
                None => {
                    self.repository
                        .upsert(&FileRecord::new(path.clone(), hash, size, now))
                        .await?;
                    changes.added.push(path);
                }
            }
        }

        for (path, mut record) in known {
            if record.deleted {
                continue;
            }
            if record.synced_fingerprint.is_none() {
                // Never reached the remote; nothing to delete there
                self.repository.remove(&path).await?;
            } else {
                record.deleted = true;
                record.updated_at = now;
                self.repository.upsert(&record).await?;
            }
            changes.deleted.push(path);
        }

        changes.added.sort();
        changes.modified.sort();
        changes.deleted.sort();

        if !changes.is_empty() {
            info!(
                added = changes.added.len(),
                modified = changes.modified.len(),
                deleted = changes.deleted.len(),
                "Detected local changes"
            );
        }
        Ok(changes)
    }

    /// `discover` followed by `scan`.
    pub async fn scan_all(&self) -> Result<ChangeSet> {
        let tracked = self.discover().await?;
        self.scan(&tracked).await
    }

    /// Records that `path` now holds `fingerprint` on both sides.
    pub async fn mark_synced(&self, path: &str, fingerprint: &str, size: u64) -> Result<()> {
        let now = self.clock.now();
        let mut record = self
            .repository
            .get(path)
            .await?
            .unwrap_or_else(|| FileRecord::new(path, fingerprint, size, now));

        record.fingerprint = fingerprint.to_string();
        record.size = size;
        record.synced_fingerprint = Some(fingerprint.to_string());
        record.deleted = false;
        record.updated_at = now;
        self.repository.upsert(&record).await
    }

    pub async fn set_blob_url(&self, path: &str, url: &str) -> Result<()> {
        if let Some(mut record) = self.repository.get(path).await? {
            record.blob_url = Some(url.to_string());
            self.repository.upsert(&record).await?;
        }
        Ok(())
    }

    /// Drops all state for `path` once its deletion reached the remote.
    pub async fn forget(&self, path: &str) -> Result<()> {
        self.repository.remove(path).await?;
        Ok(())
    }

    pub async fn record(&self, path: &str) -> Result<Option<FileRecord>> {
        self.repository.get(path).await
    }

    /// Records whose remote copy still lags behind.
    pub async fn pending(&self) -> Result<Vec<FileRecord>> {
        self.repository.pending().await
    }
}

/// `/`-joined path of `path` below `root`; `None` for anything outside it.
fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let segments: Vec<&str> = relative
        .components()
        .map(|component| match component {
            Component::Normal(segment) => segment.to_str(),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;

    if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    }
}

fn is_missing(err: &BridgeError) -> bool {
    match err {
        BridgeError::NotFound(_) => true,
        BridgeError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
        _ => false,
    }
}

// ============================================================================
// Tests
// ============================================================================
