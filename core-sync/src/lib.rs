//! # Attachment Sync
//!
//! Keeps a local attachment folder and a version-controlled remote in step.
//!
//! ## Overview
//!
//! Each reconciliation run:
//! - Scans the watch root and fingerprints every tracked file
//! - Diffs the scan against persisted fingerprints
//! - Pushes local changes, removes deleted files remotely
//! - Detects and settles conflicts with the remote
//! - Records status, history and counters for callers
//!
//! ## Components
//!
//! - **Change Detector** (`detector`): content fingerprints and include/exclude filtering
//! - **Fingerprint Repository** (`repository`): persisted per-file sync records
//! - **Conflict Resolver** (`conflict_resolver`): keep-local, keep-remote, merge, prompt
//! - **Sync Status** (`status`): lifecycle state machine and bounded histories
//! - **Sync Lock** (`lock`): lease that keeps replicas from reconciling concurrently
//! - **Sync Reconciler** (`reconciler`): timer, manual trigger and per-file reconciliation

pub mod conflict_resolver;
pub mod detector;
pub mod error;
pub mod lock;
pub mod reconciler;
pub mod repository;
pub mod status;

pub use conflict_resolver::{ConflictResolver, Resolution};
pub use detector::{fingerprint, ChangeDetector, ChangeSet, PathFilter};
pub use error::{Result, SyncError};
pub use lock::{select_sync_lock, KvSyncLock, LocalSyncLock};
pub use reconciler::{SkipReason, SyncReconciler, SyncReport, TickOutcome, SYNC_LOCK_NAME};
pub use repository::{
    FileRecord, FingerprintRepository, InMemoryFingerprintRepository,
    SqliteFingerprintRepository,
};
pub use status::{ConflictRecord, SyncCounters, SyncErrorEntry, SyncState, SyncStatus};
