//! # Host Bridge Traits
//!
//! Collaborator contracts consumed by the notes processing core.
//!
//! ## Overview
//!
//! The core never talks to a CDN, a git host, or an OCR vendor directly. Each
//! external capability is a trait defined here and injected at startup, so
//! the pipeline and the reconciler can be exercised against in-memory fakes.
//!
//! ## Traits
//!
//! ### Remote services
//! - [`BlobStore`](blob::BlobStore) - Upload and list page images
//! - [`VersionControlStore`](vcs::VersionControlStore) - Revision-checked file writes
//! - [`RecognitionService`](recognition::RecognitionService) - Handwriting recognition
//! - [`Transcoder`](media::Transcoder) - Optional image optimization
//!
//! ### Ingest
//! - [`OriginTransport`](origin::OriginTransport) - Delivers pages and session-end signals
//!
//! ### Shared state
//! - [`KeyValueStore`](kv::KeyValueStore) - Versioned entries with TTL
//! - [`SyncLock`](lock::SyncLock) - Lease lock for multi-replica reconciliation
//!
//! ### Local
//! - [`FileSystemAccess`](storage::FileSystemAccess) - Tracked folder I/O
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to the host
//!
//! ## Error Handling
//!
//! All traits return [`BridgeError`](error::BridgeError). Implementations
//! must map their failures so that [`BridgeError::is_transient`] is accurate:
//! the retry machinery only retries transient errors.
//!
//! ## Thread Safety
//!
//! All traits require `Send + Sync` and are shared as `Arc<dyn Trait>`.

pub mod blob;
pub mod error;
pub mod kv;
pub mod lock;
pub mod media;
pub mod origin;
pub mod recognition;
pub mod storage;
pub mod time;
pub mod vcs;

pub use error::BridgeError;

pub use blob::{BlobEntry, BlobMetadata, BlobPage, BlobStore, UploadedBlob};
pub use kv::{KeyValueStore, VersionedValue};
pub use lock::SyncLock;
pub use media::Transcoder;
pub use origin::{InboundItem, OriginEvent, OriginTransport};
pub use recognition::{RecognitionService, RecognizedText};
pub use storage::{FileMetadata, FileSystemAccess};
pub use time::{Clock, LogEntry, LogLevel, LoggerSink, ManualClock, SystemClock};
pub use vcs::{RevisionToken, TreeEntry, TreeEntryKind, VersionControlStore, VersionedFile};
