//! Integration tests for the notes service facade
//!
//! - Items within the window aggregate into one note; later items start anew
//! - Idle sessions are swept without waiting for another item, on the
//!   configured interval, and never lose a page that races the sweep
//! - The ingest loop dispatches transport events and acknowledges outcomes
//! - Sync controls pass through to the reconciler

use async_trait::async_trait;
use bridge_desktop::{MemoryKeyValueStore, TokioFileSystem};
use bridge_traits::{
    blob::{BlobMetadata, BlobPage, BlobStore, UploadedBlob},
    error::BridgeError,
    kv::{KeyValueStore, VersionedValue},
    origin::{InboundItem, OriginEvent, OriginTransport},
    recognition::{RecognitionService, RecognizedText},
    time::{Clock, ManualClock},
    vcs::{RevisionToken, TreeEntry, VersionControlStore, VersionedFile},
};
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use core_runtime::config::{NotesConfig, NotesConfigBuilder, RetrySettings};
use core_runtime::events::{CoreEvent, Receiver, SessionEvent};
use core_service::{NotesService, ServiceError};
use core_sync::{InMemoryFingerprintRepository, SkipReason, SyncState, TickOutcome};
use mockall::mock;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Notify};

const JPEG: &[u8] = b"\xFF\xD8\xFF\xE0jpeg-page";

// ============================================================================
// Fake collaborators
// ============================================================================

#[derive(Default)]
struct FakeBlobStore;

#[async_trait]
impl BlobStore for FakeBlobStore {
    async fn upload(
        &self,
        _data: Bytes,
        name: &str,
        _metadata: BlobMetadata,
    ) -> bridge_traits::error::Result<UploadedBlob> {
        Ok(UploadedBlob {
            id: name.to_string(),
            url: format!("https://cdn.test/{}", name),
        })
    }

    async fn list(&self, _page: u32, _per_page: u32) -> bridge_traits::error::Result<BlobPage> {
        Ok(BlobPage::default())
    }
}

/// Unconditional writes; enough for publishing notes.
#[derive(Default)]
struct FakeVcs {
    files: AsyncMutex<BTreeMap<String, Bytes>>,
}

impl FakeVcs {
    async fn notes(&self) -> Vec<String> {
        self.files
            .lock()
            .await
            .keys()
            .filter(|path| path.starts_with("notes/"))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl VersionControlStore for FakeVcs {
    async fn read_file(&self, path: &str) -> bridge_traits::error::Result<Option<VersionedFile>> {
        Ok(self.files.lock().await.get(path).map(|content| VersionedFile {
            content: content.clone(),
            revision: RevisionToken::new("r1"),
        }))
    }

    async fn write_file(
        &self,
        path: &str,
        content: Bytes,
        _expected_revision: Option<RevisionToken>,
        _message: &str,
    ) -> bridge_traits::error::Result<RevisionToken> {
        self.files.lock().await.insert(path.to_string(), content);
        Ok(RevisionToken::new("r1"))
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
        _path: &str,
        _recursive: bool,
    ) -> bridge_traits::error::Result<Vec<TreeEntry>> {
        Ok(Vec::new())
    }
}

mock! {
    Recognizer {}

    #[async_trait]
    impl RecognitionService for Recognizer {
        async fn recognize(&self, blob_urls: &[String]) -> bridge_traits::error::Result<RecognizedText>;
    }
}

/// Replays a fixed list of events, then reports the transport closed.
#[derive(Default)]
struct ScriptedTransport {
    events: AsyncMutex<VecDeque<bridge_traits::error::Result<OriginEvent>>>,
    acks: AsyncMutex<Vec<(String, String)>>,
}

impl ScriptedTransport {
    fn new(events: Vec<bridge_traits::error::Result<OriginEvent>>) -> Self {
        Self {
            events: AsyncMutex::new(events.into()),
            acks: AsyncMutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl OriginTransport for ScriptedTransport {
    async fn next_event(&self) -> bridge_traits::error::Result<Option<OriginEvent>> {
        match self.events.lock().await.pop_front() {
            Some(event) => event.map(Some),
            None => Ok(None),
        }
    }

    async fn acknowledge(&self, originator_id: &str, message: &str) -> bridge_traits::error::Result<()> {
        self.acks
            .lock()
            .await
            .push((originator_id.to_string(), message.to_string()));
        Ok(())
    }
}

// ============================================================================
// Harness
/// Emits its events, then stays open for `linger` before closing.
struct LingeringTransport {
    events: AsyncMutex<VecDeque<OriginEvent>>,
    linger: Duration,
    clock: Arc<ManualClock>,
    closed: AtomicBool,
    /// (originator, message, sent before the transport closed)
    acks: AsyncMutex<Vec<(String, String, bool)>>,
}

#[async_trait]
impl OriginTransport for LingeringTransport {
    async fn next_event(&self) -> bridge_traits::error::Result<Option<OriginEvent>> {
        if let Some(event) = self.events.lock().await.pop_front() {
            return Ok(Some(event));
        }
        // Every session is past its window while the transport lingers
        self.clock.advance(ChronoDuration::seconds(91));
        tokio::time::sleep(self.linger).await;
        self.closed.store(true, Ordering::SeqCst);
        Ok(None)
    }

    async fn acknowledge(&self, originator_id: &str, message: &str) -> bridge_traits::error::Result<()> {
        let open = !self.closed.load(Ordering::SeqCst);
        self.acks
            .lock()
            .await
            .push((originator_id.to_string(), message.to_string(), open));
        Ok(())
    }
}

/// Holds one `get` for a key ending in `suffix` after it has read the store.
///
/// `armed_after` gets for the key pass freely before the one that is held.
struct GatedKv {
    inner: MemoryKeyValueStore,
    suffix: &'static str,
    armed: AtomicBool,
    armed_after: AtomicUsize,
    entered: Notify,
    release: Notify,
}

impl GatedKv {
    fn new(suffix: &'static str) -> Self {
        Self {
            inner: MemoryKeyValueStore::new(),
            suffix,
            armed: AtomicBool::new(false),
            armed_after: AtomicUsize::new(0),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }

    fn arm(&self, pass: usize) {
        self.armed_after.store(pass, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    fn should_hold(&self, key: &str) -> bool {
        if !key.ends_with(self.suffix) || !self.armed.load(Ordering::SeqCst) {
            return false;
        }
        let passed = self
            .armed_after
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        !passed && self.armed.swap(false, Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyValueStore for GatedKv {
    async fn get(&self, key: &str) -> bridge_traits::error::Result<Option<VersionedValue>> {
        let value = self.inner.get(key).await?;
        if self.should_hold(key) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(value)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_version: Option<u64>,
        ttl: Duration,
    ) -> bridge_traits::error::Result<bool> {
        self.inner
            .compare_and_set(key, value, expected_version, ttl)
            .await
    }

    async fn compare_and_delete(&self, key: &str, expected_version: u64) -> bridge_traits::error::Result<bool> {
        self.inner.compare_and_delete(key, expected_version).await
    }
}

// ============================================================================

struct Harness {
    root: PathBuf,
    clock: Arc<ManualClock>,
    vcs: Arc<FakeVcs>,
    service: NotesService,
}

impl Harness {
    fn new() -> Self {
        Self::with(|builder| builder)
    }

    fn with(customize: impl FnOnce(NotesConfigBuilder) -> NotesConfigBuilder) -> Self {
        let root = std::env::temp_dir().join(format!("notes-service-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&root).unwrap();

        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 2, 9, 30, 0).unwrap(),
        ));
        let vcs = Arc::new(FakeVcs::default());
        let config = customize(
            NotesConfig::builder()
                .blob_store(Arc::new(FakeBlobStore))
                .version_control(vcs.clone())
                .recognition(Arc::new(recognizer()))
                .file_system(Arc::new(TokioFileSystem::with_root(root.clone())))
                .watch_root(root.clone())
                .clock(clock.clone())
                .retry(RetrySettings {
                    max_attempts: 1,
                    base_delay_ms: 1,
                    max_delay_ms: 1,
                    exponential: false,
                }),
        )
        .build()
        .unwrap();

        let service =
            NotesService::new(config, Arc::new(InMemoryFingerprintRepository::new())).unwrap();

        Self {
            root,
            clock,
            vcs,
            service,
        }
    }

    fn item(&self, originator_id: &str, name: &str, payload: &'static [u8]) -> InboundItem {
        InboundItem {
            originator_id: originator_id.to_string(),
            name: name.to_string(),
            payload: Bytes::from_static(payload),
            mime_type: Some("image/jpeg".to_string()),
            received_at: self.clock.now(),
        }
    }

    fn advance_secs(&self, secs: i64) {
        self.clock.advance(ChronoDuration::seconds(secs));
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

fn recognizer() -> MockRecognizer {
    let mut recognizer = MockRecognizer::new();
    recognizer.expect_recognize().returning(|urls| {
        Ok(RecognizedText {
            text: format!("text of {}", urls.join(",")),
            confidence: Some(0.9),
        })
    });
    recognizer
}

fn session_events(events: &mut Receiver<CoreEvent>) -> Vec<SessionEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let CoreEvent::Session(event) = event {
            drained.push(event);
        }
    }
    drained
}

// ============================================================================
// Sessions
// ============================================================================

#[tokio::test]
async fn test_items_within_window_publish_one_note() {
    let h = Harness::new();
    let mut events = h.service.subscribe();

    for (offset, name) in [(0, "p1.jpg"), (10, "p2.jpg"), (10, "p3.jpg")] {
        h.advance_secs(offset);
        let outcome = h.service.ingest_item(h.item("ana", name, JPEG)).await.unwrap();
        assert!(outcome.flushed.is_empty());
    }

    let result = h.service.end_session("ana").await.unwrap().unwrap();
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.unit_ids.len(), 3);
    assert_eq!(h.vcs.notes().await, vec![result.note_path.clone().unwrap()]);

    assert_eq!(
        session_events(&mut events),
        vec![
            SessionEvent::Started {
                originator_id: "ana".to_string()
            },
            SessionEvent::UnitAdded {
                originator_id: "ana".to_string(),
                unit_count: 2
            },
            SessionEvent::UnitAdded {
                originator_id: "ana".to_string(),
                unit_count: 3
            },
            SessionEvent::Flushed {
                originator_id: "ana".to_string(),
                unit_count: 3,
                reason: "ended".to_string()
            },
        ]
    );

    assert!(h.service.end_session("ana").await.unwrap().is_none());
}

#[tokio::test]
async fn test_item_after_window_flushes_previous_session() {
    let h = Harness::new();
    for offset in [0, 10, 10] {
        h.advance_secs(offset);
        h.service.ingest_item(h.item("ana", "page.jpg", JPEG)).await.unwrap();
    }

    // t = 130s, 110s after the last page
    h.advance_secs(110);
    let outcome = h.service.ingest_item(h.item("ana", "late.jpg", JPEG)).await.unwrap();

    assert_eq!(outcome.session_units, 1);
    assert_eq!(outcome.flushed.len(), 1);
    assert_eq!(outcome.flushed[0].unit_ids.len(), 3);
    assert!(outcome.flushed[0].success);

    let live = h.service.sessions().peek("ana").await.unwrap().unwrap();
    assert_eq!(live.units[0].name, "late.jpg");
}

#[tokio::test]
async fn test_sweep_processes_idle_sessions() {
    let h = Harness::new();
    h.service.ingest_item(h.item("ana", "p1.jpg", JPEG)).await.unwrap();
    h.service.ingest_item(h.item("bo", "p1.jpg", JPEG)).await.unwrap();

    assert!(h.service.sweep_expired().await.is_empty());

    h.advance_secs(91);
    let swept = h.service.sweep_expired().await;
    let mut originators: Vec<_> = swept.iter().map(|r| r.originator_id.as_str()).collect();
    originators.sort();
    assert_eq!(originators, vec!["ana", "bo"]);
    assert_eq!(h.vcs.notes().await.len(), 2);

    assert!(h.service.sweep_expired().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_item_racing_a_sweep_stays_tracked() {
    let kv = Arc::new(GatedKv::new("ana"));
    let h = Harness::with({
        let kv = kv.clone();
        move |builder| builder.key_value_store(kv)
    });

    // Tracked by the service but already gone from the store
    h.service.ingest_item(h.item("ana", "p1.jpg", JPEG)).await.unwrap();
    h.service.sessions().end_session("ana").await.unwrap().unwrap();

    // The sweep's expiry check passes; its idle check reads "no session"
    // and is held there
    kv.arm(1);
    let sweeper = tokio::spawn({
        let service = h.service.clone();
        async move { service.sweep_expired().await }
    });
    tokio::time::timeout(Duration::from_secs(5), kv.entered.notified())
        .await
        .expect("sweep reached the idle check");

    let ingest = tokio::spawn({
        let service = h.service.clone();
        let item = h.item("ana", "p2.jpg", JPEG);
        async move { service.ingest_item(item).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    kv.release.notify_one();

    assert!(sweeper.await.unwrap().is_empty());
    assert_eq!(ingest.await.unwrap().unwrap().session_units, 1);

    h.advance_secs(91);
    let swept = h.service.sweep_expired().await;
    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].originator_id, "ana");
    assert_eq!(swept[0].unit_ids.len(), 1);
    assert!(h.service.sessions().peek("ana").await.unwrap().is_none());
}

#[tokio::test]
async fn test_sweep_interval_comes_from_config() {
    let h = Harness::new();
    assert_eq!(h.service.sweep_interval(), core_service::DEFAULT_SWEEP_INTERVAL);

    let h = Harness::with(|builder| builder.sweep_interval(Duration::from_millis(20)));
    let copy = h.service.clone();
    assert_eq!(copy.sweep_interval(), Duration::from_millis(20));

    h.service.ingest_item(h.item("ana", "p1.jpg", JPEG)).await.unwrap();
    let transport = Arc::new(LingeringTransport {
        events: AsyncMutex::new(VecDeque::new()),
        linger: Duration::from_millis(300),
        clock: h.clock.clone(),
        closed: AtomicBool::new(false),
        acks: AsyncMutex::new(Vec::new()),
    });

    let summary = copy.run_ingest(transport.clone()).await.unwrap();
    assert_eq!(summary.sessions_processed, 1);

    let acks = transport.acks.lock().await.clone();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].0, "ana");
    assert!(acks[0].1.starts_with("Saved note notes/"), "{}", acks[0].1);
    // Swept by the loop's timer, not by the final sweep at close
    assert!(acks[0].2);
}

// ============================================================================
// Ingest loop
// ============================================================================

#[tokio::test]
async fn test_run_ingest_dispatches_and_acknowledges() {
    let h = Harness::new();
    let transport = Arc::new(ScriptedTransport::new(vec![
        Ok(OriginEvent::Item(h.item("ana", "p1.jpg", JPEG))),
        Ok(OriginEvent::Item(h.item("ana", "p2.jpg", JPEG))),
        Ok(OriginEvent::SessionEnd {
            originator_id: "ana".to_string(),
        }),
        Ok(OriginEvent::Item(h.item("bo", "scan.txt", b"not an image"))),
        Ok(OriginEvent::SessionEnd {
            originator_id: "bo".to_string(),
        }),
        Ok(OriginEvent::Item(h.item("cy", "p1.jpg", JPEG))),
    ]));

    let summary = h.service.run_ingest(transport.clone()).await.unwrap();
    assert_eq!(summary.items, 4);
    assert_eq!(summary.sessions_processed, 1);
    assert_eq!(summary.sessions_failed, 1);
    assert_eq!(summary.rejected, 0);

    let acks = transport.acks.lock().await.clone();
    assert_eq!(acks.len(), 2);
    assert_eq!(acks[0].0, "ana");
    assert!(acks[0].1.starts_with("Saved note notes/"), "{}", acks[0].1);
    assert_eq!(acks[1].0, "bo");
    assert!(acks[1].1.starts_with("Could not save note"), "{}", acks[1].1);

    // Still inside its window when the transport closed
    assert!(h.service.sessions().peek("cy").await.unwrap().is_some());
}

#[tokio::test]
async fn test_transport_failure_ends_ingest_loop() {
    let h = Harness::new();
    let transport = Arc::new(ScriptedTransport::new(vec![
        Ok(OriginEvent::Item(h.item("ana", "p1.jpg", JPEG))),
        Err(BridgeError::OperationFailed("socket closed".to_string())),
        Ok(OriginEvent::SessionEnd {
            originator_id: "ana".to_string(),
        }),
    ]));

    let result = h.service.run_ingest(transport.clone()).await;
    assert!(matches!(result, Err(ServiceError::Bridge(_))));
    assert!(transport.acks.lock().await.is_empty());
}

// ============================================================================
// Sync controls
// ============================================================================

#[tokio::test]
async fn test_sync_controls_pass_through() {
    let h = Harness::new();

    assert!(matches!(h.service.trigger_sync().await, TickOutcome::Completed(_)));
    assert_eq!(h.service.sync_status().await.state, SyncState::Idle);

    h.service.pause_sync().await.unwrap();
    assert_eq!(
        h.service.trigger_sync().await,
        TickOutcome::Skipped(SkipReason::Paused)
    );
    assert!(matches!(
        h.service.start_sync().await,
        Err(ServiceError::Sync(core_sync::SyncError::Paused))
    ));

    h.service.resume_sync().await.unwrap();
    h.service.start_sync().await.unwrap();
    assert!(h.service.sync_status().await.next_sync.is_some());
    h.service.stop_sync().await;
    assert!(h.service.sync_status().await.next_sync.is_none());
}

#[cfg(feature = "desktop-shims")]
#[tokio::test]
async fn test_desktop_bootstrap_shares_one_database() {
    let root = std::env::temp_dir().join(format!("notes-bootstrap-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(root.join("attachments")).unwrap();

    let builder = NotesConfig::builder()
        .blob_store(Arc::new(FakeBlobStore))
        .version_control(Arc::new(FakeVcs::default()))
        .recognition(Arc::new(recognizer()))
        .file_system(Arc::new(TokioFileSystem::with_root(root.clone())))
        .watch_root(root.join("attachments"));

    let service = core_service::bootstrap_desktop(builder, root.join("core.db"))
        .await
        .unwrap();

    let item = InboundItem {
        originator_id: "ana".to_string(),
        name: "p1.jpg".to_string(),
        payload: Bytes::from_static(JPEG),
        mime_type: None,
        received_at: Utc::now(),
    };
    service.ingest_item(item).await.unwrap();
    assert!(service.sessions().peek("ana").await.unwrap().is_some());
    assert!(matches!(service.trigger_sync().await, TickOutcome::Completed(_)));

    let result = service.end_session("ana").await.unwrap().unwrap();
    assert!(result.success, "{:?}", result.error);

    let _ = std::fs::remove_dir_all(&root);
}
