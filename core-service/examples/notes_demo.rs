//! End-to-end walkthrough with in-memory collaborators.
//!
//! Three pages arrive from one originator, the session is ended explicitly
//! and one note is published. Then an attachment folder is reconciled.
//!
//! ```sh
//! cargo run -p core-service --example notes_demo
//! ```

use anyhow::Context;
use async_trait::async_trait;
use bridge_desktop::TokioFileSystem;
use bridge_traits::{
    blob::{BlobMetadata, BlobPage, BlobStore, UploadedBlob},
    origin::InboundItem,
    recognition::{RecognitionService, RecognizedText},
    storage::FileSystemAccess,
    vcs::{RevisionToken, TreeEntry, TreeEntryKind, VersionControlStore, VersionedFile},
};
use bytes::Bytes;
use chrono::Utc;
use core_runtime::config::{ConflictStrategy, NotesConfig};
use core_runtime::logging::{init_logging, LogFormat, LoggingConfig};
use core_service::NotesService;
use core_sync::{InMemoryFingerprintRepository, TickOutcome};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const JPEG: &[u8] = b"\xFF\xD8\xFF\xE0demo-page";

struct PrintingBlobStore;

#[async_trait]
impl BlobStore for PrintingBlobStore {
    async fn upload(
        &self,
        data: Bytes,
        name: &str,
        _metadata: BlobMetadata,
    ) -> bridge_traits::error::Result<UploadedBlob> {
        println!("  uploaded {} ({} bytes)", name, data.len());
        Ok(UploadedBlob {
            id: name.to_string(),
            url: format!("https://cdn.example/{}", name),
        })
    }

    async fn list(&self, _page: u32, _per_page: u32) -> bridge_traits::error::Result<BlobPage> {
        Ok(BlobPage::default())
    }
}

#[derive(Default)]
struct MemoryRepository {
    files: Mutex<BTreeMap<String, (Bytes, u64)>>,
}

#[async_trait]
impl VersionControlStore for MemoryRepository {
    async fn read_file(&self, path: &str) -> bridge_traits::error::Result<Option<VersionedFile>> {
        Ok(self.files.lock().await.get(path).map(|(content, rev)| VersionedFile {
            content: content.clone(),
            revision: RevisionToken::new(rev.to_string()),
        }))
    }

    async fn write_file(
        &self,
        path: &str,
        content: Bytes,
        _expected_revision: Option<RevisionToken>,
        message: &str,
    ) -> bridge_traits::error::Result<RevisionToken> {
        let mut files = self.files.lock().await;
        let rev = files.get(path).map(|(_, rev)| rev + 1).unwrap_or(1);
        files.insert(path.to_string(), (content, rev));
        println!("  commit {:?}: {}", message, path);
        Ok(RevisionToken::new(rev.to_string()))
    }

    async fn delete_file(
        &self,
        path: &str,
        _revision: RevisionToken,
        _message: &str,
    ) -> bridge_traits::error::Result<()> {
        self.files.lock().await.remove(path);
        Ok(())
    }

    async fn list_tree(
        &self,
        path: &str,
        _recursive: bool,
    ) -> bridge_traits::error::Result<Vec<TreeEntry>> {
        Ok(self
            .files
            .lock()
            .await
            .keys()
            .filter(|p| p.starts_with(path))
            .map(|p| TreeEntry {
                path: p.clone(),
                kind: TreeEntryKind::File,
                revision: None,
            })
            .collect())
    }
}

struct EchoRecognizer;

#[async_trait]
impl RecognitionService for EchoRecognizer {
    async fn recognize(&self, blob_urls: &[String]) -> bridge_traits::error::Result<RecognizedText> {
        Ok(RecognizedText {
            text: format!("Handwriting from {}", blob_urls.join(", ")),
            confidence: Some(0.87),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging(LoggingConfig::default().with_format(LogFormat::Compact))
        .context("failed to initialize logging")?;

    let root = std::env::temp_dir().join(format!("notes-demo-{}", uuid::Uuid::new_v4()));
    let fs = Arc::new(TokioFileSystem::with_root(root.clone()));
    let repository = Arc::new(MemoryRepository::default());

    let config = NotesConfig::builder()
        .blob_store(Arc::new(PrintingBlobStore))
        .version_control(repository.clone())
        .recognition(Arc::new(EchoRecognizer))
        .file_system(fs.clone())
        .watch_root(root.clone())
        .conflict_strategy(ConflictStrategy::Merge)
        .build()
        .context("invalid configuration")?;

    let service = NotesService::new(config, Arc::new(InMemoryFingerprintRepository::new()))?;

    println!("Ingesting pages");
    for page in ["page-1.jpg", "page-2.jpg", "page-3.jpg"] {
        service
            .ingest_item(InboundItem {
                originator_id: "demo-chat".to_string(),
                name: page.to_string(),
                payload: Bytes::from_static(JPEG),
                mime_type: Some("image/jpeg".to_string()),
                received_at: Utc::now(),
            })
            .await?;
    }

    let result = service
        .end_session("demo-chat")
        .await?
        .context("session disappeared")?;
    println!(
        "Published {:?} in {} ms",
        result.note_path, result.duration_ms
    );

    println!("Reconciling attachments");
    fs.write_file(&root.join("todo.md"), Bytes::from_static(b"- buy milk\n"))
        .await?;
    fs.write_file(&root.join("sketch.png"), Bytes::from_static(b"\x89PNG\r\n\x1a\nsketch"))
        .await?;

    match service.trigger_sync().await {
        TickOutcome::Completed(report) => println!(
            "  pushed {} file(s), {} conflict(s)",
            report.files_pushed, report.conflicts_detected
        ),
        other => println!("  sync did not complete: {:?}", other),
    }
    println!("{:#?}", service.sync_status().await.counters);

    tokio::fs::remove_dir_all(&root).await.ok();
    Ok(())
}
