//! # Pipeline Stages
//!
//! Each stage wraps exactly one collaborator behind a [`RetryPolicy`]:
//!
//! | Stage | Collaborator | Mandatory |
//! |-------|--------------|-----------|
//! | [`UploadStage`] | `BlobStore::upload` | yes |
//! | [`BackupStage`] | `VersionControlStore::write_file` | no |
//! | [`RecognitionStage`] | `RecognitionService::recognize` | yes |
//! | [`PublishStage`] | `VersionControlStore::read_file` + `write_file` | yes |
//!
//! Stages know nothing about each other; ordering and failure policy live in
//! the coordinator.

use crate::assembly::{join_remote, recognition_placeholder, slugify, PageText};
use crate::error::{PipelineError, Result};
use crate::quality::PayloadFormat;
use crate::retry::RetryPolicy;
use crate::session::Unit;
use bridge_traits::{
    blob::{BlobMetadata, BlobStore, UploadedBlob},
    error::BridgeError,
    recognition::RecognitionService,
    vcs::{RevisionToken, VersionControlStore},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Stage identifiers used in timings and failure reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    QualityGate,
    Transcode,
    Upload,
    Backup,
    Recognition,
    Assembly,
    Publish,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::QualityGate => "quality_gate",
            Stage::Transcode => "transcode",
            Stage::Upload => "upload",
            Stage::Backup => "backup",
            Stage::Recognition => "recognition",
            Stage::Assembly => "assembly",
            Stage::Publish => "publish",
        }
    }

    /// Whether a failure in this stage fails the whole unit.
    pub fn is_mandatory(&self) -> bool {
        !matches!(self, Stage::Transcode | Stage::Backup)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Upload
// ============================================================================

#[derive(Clone)]
pub struct UploadStage {
    store: Arc<dyn BlobStore>,
    retry: RetryPolicy,
}

impl UploadStage {
    pub fn new(store: Arc<dyn BlobStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    #[instrument(skip(self, unit, payload), fields(unit_id = %unit.id, bytes = payload.len()))]
    pub async fn run(&self, unit: &Unit, payload: Bytes) -> Result<UploadedBlob> {
        let mut metadata = BlobMetadata::new();
        metadata.insert("originator_id".to_string(), unit.originator_id.clone());
        metadata.insert("unit_id".to_string(), unit.id.to_string());
        if let Some(mime_type) = &unit.mime_type {
            metadata.insert("mime_type".to_string(), mime_type.clone());
        }

        let store = &self.store;
        let name = unit.name.as_str();
        let uploaded = self
            .retry
            .execute("upload", |_| {
                let payload = payload.clone();
                let metadata = metadata.clone();
                async move { store.upload(payload, name, metadata).await }
            })
            .await?;

        debug!(blob_id = %uploaded.id, "Page uploaded");
        Ok(uploaded)
    }
}

// ============================================================================
// Backup
// ============================================================================

#[derive(Clone)]
pub struct BackupStage {
    vcs: Arc<dyn VersionControlStore>,
    retry: RetryPolicy,
    backup_dir: String,
}

impl BackupStage {
    pub fn new(
        vcs: Arc<dyn VersionControlStore>,
        retry: RetryPolicy,
        backup_dir: impl Into<String>,
    ) -> Self {
        Self {
            vcs,
            retry,
            backup_dir: backup_dir.into(),
        }
    }

    /// `<backup_dir>/<YYYY-MM-DD>/<unit id>-<name slug>.<ext>`
    ///
    /// The extension follows the detected format, falling back to the one in
    /// the page name.
    pub fn backup_path(&self, unit: &Unit, format: Option<PayloadFormat>) -> String {
        let (stem, named) = match unit.name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext.to_ascii_lowercase())),
            _ => (unit.name.as_str(), None),
        };
        let extension = format.map(|f| f.extension().to_string()).or(named);
        let file = match extension {
            Some(ext) => format!("{}-{}.{}", unit.id, slugify(stem), ext),
            None => format!("{}-{}", unit.id, slugify(stem)),
        };
        let day = unit.created_at.format("%Y-%m-%d").to_string();
        join_remote(&[self.backup_dir.as_str(), day.as_str(), file.as_str()])
    }

    /// Writes a copy of the page and returns its path.
    #[instrument(skip(self, unit, payload), fields(unit_id = %unit.id))]
    pub async fn run(
        &self,
        unit: &Unit,
        format: Option<PayloadFormat>,
        payload: Bytes,
    ) -> Result<String> {
        let path = self.backup_path(unit, format);
        let message = format!("Back up page {}", unit.name);

        let vcs = &self.vcs;
        let target = path.as_str();
        let message = message.as_str();
        let result = self
            .retry
            .execute("backup", |_| {
                let payload = payload.clone();
                async move { vcs.write_file(target, payload, None, message).await }
            })
            .await;

        match result {
            Ok(_) => Ok(path),
            // Unit ids are unique, so an existing file is an earlier copy of this page
            Err(PipelineError::Bridge(BridgeError::StaleRevision { .. })) => {
                debug!(path = %path, "Backup already present");
                Ok(path)
            }
            Err(e) => Err(e),
        }
    }
}

// ============================================================================
// Recognition
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct RecognitionOutcome {
    pub pages: Vec<PageText>,
    pub warnings: Vec<String>,
}

#[derive(Clone)]
pub struct RecognitionStage {
    service: Arc<dyn RecognitionService>,
    retry: RetryPolicy,
}

impl RecognitionStage {
    pub fn new(service: Arc<dyn RecognitionService>, retry: RetryPolicy) -> Self {
        Self { service, retry }
    }

    /// Recognizes each uploaded page separately.
    ///
    /// A page that cannot be recognized gets a placeholder and a warning.
    /// Only a missing configuration fails the stage.
    #[instrument(skip(self, uploads), fields(pages = uploads.len()))]
    pub async fn run(&self, uploads: &[(String, UploadedBlob)]) -> Result<RecognitionOutcome> {
        let mut outcome = RecognitionOutcome::default();

        for (name, blob) in uploads {
            let urls = vec![blob.url.clone()];
            let service = &self.service;
            let urls = &urls;
            let result = self
                .retry
                .execute("recognize", |_| async move { service.recognize(urls).await })
                .await;

            match result {
                Ok(recognized) => outcome.pages.push(PageText {
                    name: name.clone(),
                    image_url: blob.url.clone(),
                    text: recognized.text,
                    confidence: recognized.confidence,
                    placeholder: false,
                }),
                Err(e) if matches!(e.bridge_cause(), Some(BridgeError::NotConfigured(_))) => {
                    return Err(e);
                }
                Err(e) => {
                    warn!(page = %name, error = %e, "Recognition failed, using placeholder");
                    outcome
                        .warnings
                        .push(format!("Recognition failed for {}: {}", name, e));
                    outcome.pages.push(PageText {
                        name: name.clone(),
                        image_url: blob.url.clone(),
                        text: recognition_placeholder(name),
                        confidence: None,
                        placeholder: true,
                    });
                }
            }
        }

        Ok(outcome)
    }
}

// ============================================================================
// Publish
// ============================================================================

#[derive(Clone)]
pub struct PublishStage {
    vcs: Arc<dyn VersionControlStore>,
    retry: RetryPolicy,
}

impl PublishStage {
    pub fn new(vcs: Arc<dyn VersionControlStore>, retry: RetryPolicy) -> Self {
        Self { vcs, retry }
    }

    /// Creates or updates `path` with `content`.
    ///
    /// The current revision is read first. A stale-token rejection triggers
    /// one fresh read and one more write before the error is surfaced.
    #[instrument(skip(self, content), fields(bytes = content.len()))]
    pub async fn run(&self, path: &str, content: Bytes, message: &str) -> Result<RevisionToken> {
        let vcs = &self.vcs;
        let mut stale_retried = false;

        loop {
            let current = self
                .retry
                .execute("read note", |_| async move { vcs.read_file(path).await })
                .await?;
            let revision = current.map(|file| file.revision);

            let result = self
                .retry
                .execute("publish note", |_| {
                    let content = content.clone();
                    let revision = revision.clone();
                    async move { vcs.write_file(path, content, revision, message).await }
                })
                .await;

            match result {
                Ok(token) => {
                    debug!(revision = %token, "Note published");
                    return Ok(token);
                }
                Err(e)
                    if !stale_retried
                        && e.bridge_cause().is_some_and(BridgeError::is_stale_revision) =>
                {
                    warn!(path, "Revision token went stale, re-reading once");
                    stale_retried = true;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
