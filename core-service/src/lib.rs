//! Core service façade and bootstrap helpers.
//!
//! This crate wires host-provided bridge implementations (blob store, version
//! control, recognition, key-value store, filesystem) into the notes core.
//! Desktop hosts typically enable the `desktop-shims` feature, which depends
//! on `bridge-desktop` and backs sessions, sync leases and fingerprints with
//! one SQLite file.

pub mod error;
pub mod service;

pub use error::{Result, ServiceError};
pub use service::{IngestOutcome, IngestSummary, NotesService, DEFAULT_SWEEP_INTERVAL};

#[cfg(feature = "desktop-shims")]
use bridge_desktop::SqliteKeyValueStore;
#[cfg(feature = "desktop-shims")]
use core_runtime::config::NotesConfigBuilder;
#[cfg(feature = "desktop-shims")]
use core_sync::SqliteFingerprintRepository;
#[cfg(feature = "desktop-shims")]
use std::{path::PathBuf, sync::Arc};

/// Convenience bootstrapper for desktop hosts.
///
/// Sessions and the sync lease live in the key-value table of `db_path`;
/// file fingerprints share the same database.
///
/// ```no_run
/// # #[cfg(feature = "desktop-shims")]
/// # async fn example(builder: core_runtime::config::NotesConfigBuilder) -> core_service::Result<()> {
/// use core_service::bootstrap_desktop;
///
/// let service = bootstrap_desktop(builder, "/var/lib/notes/core.db".into()).await?;
/// service.start_sync().await?;
/// # Ok(())
/// # }
/// ```
#[cfg(feature = "desktop-shims")]
pub async fn bootstrap_desktop(builder: NotesConfigBuilder, db_path: PathBuf) -> Result<NotesService> {
    let kv = Arc::new(SqliteKeyValueStore::new(db_path).await?);
    let repository = SqliteFingerprintRepository::new(kv.pool().clone()).await?;
    let config = builder.key_value_store(kv).build()?;
    NotesService::new(config, Arc::new(repository))
}
