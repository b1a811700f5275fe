//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop and server hosts
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `FileSystemAccess` using `tokio::fs`, rooted at the tracked folder
//! - `KeyValueStore` using a SQLite file (shareable between processes on one
//!   host) or a process-local map
//!
//! Remote collaborators (blob store, version control host, recognition
//! service) have no desktop default; hosts inject their own clients.
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{SqliteKeyValueStore, TokioFileSystem};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let fs = TokioFileSystem::with_root("/srv/notes/attachments".into());
//!     let kv = SqliteKeyValueStore::new(SqliteKeyValueStore::default_path()).await?;
//!     // Use in core configuration
//!     Ok(())
//! }
//! ```

mod filesystem;
mod kv_store;

pub use filesystem::TokioFileSystem;
pub use kv_store::{MemoryKeyValueStore, SqliteKeyValueStore};
