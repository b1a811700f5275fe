//! File System Abstractions
//!
//! Platform-agnostic file I/O used by the change detector and by
//! keep-remote conflict resolution.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// File metadata information
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub size: u64,
    pub created_at: Option<i64>,
    pub modified_at: Option<i64>,
    pub is_directory: bool,
}

/// File system access trait
///
/// Abstracts file I/O so the tracked attachment folder can live on a local
/// disk, a mounted share, or an in-memory fixture in tests.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::FileSystemAccess;
///
/// async fn snapshot(fs: &dyn FileSystemAccess, root: &Path) -> Result<usize> {
///     let files = fs.list_files_recursive(root).await?;
///     Ok(files.len())
/// }
/// ```
#[async_trait]
pub trait FileSystemAccess: Send + Sync {
    /// Check if a file or directory exists
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Get metadata for a file or directory
    async fn metadata(&self, path: &Path) -> Result<FileMetadata>;

    /// Create a directory and all parent directories if they don't exist
    async fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Read entire file contents into memory
    async fn read_file(&self, path: &Path) -> Result<Bytes>;

    /// Write data to a file, creating it and its parents if needed
    async fn write_file(&self, path: &Path, data: Bytes) -> Result<()>;

    /// Delete a file
    async fn delete_file(&self, path: &Path) -> Result<()>;

    /// List all entries in a directory
    async fn list_directory(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// List every regular file below `root`, depth first
    async fn list_files_recursive(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut pending = vec![root.to_path_buf()];

        while let Some(dir) = pending.pop() {
            for entry in self.list_directory(&dir).await? {
                if self.metadata(&entry).await?.is_directory {
                    pending.push(entry);
                } else {
                    files.push(entry);
                }
            }
        }

        files.sort();
        Ok(files)
    }
}
