//! File System Access Implementation using Tokio

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    storage::{FileMetadata, FileSystemAccess},
};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Tokio-based file system implementation
///
/// Rooted at the tracked attachment folder; relative paths passed to the
/// trait methods are resolved against that root, absolute ones are used as
/// given.
pub struct TokioFileSystem {
    root: PathBuf,
}

impl TokioFileSystem {
    /// Default root: `<documents>/notes-attachments`
    pub fn new() -> Self {
        let root = dirs::document_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("notes-attachments");

        Self { root }
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    fn map_io_error(e: std::io::Error) -> BridgeError {
        BridgeError::Io(e)
    }
}

impl Default for TokioFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystemAccess for TokioFileSystem {
    async fn exists(&self, path: &Path) -> Result<bool> {
        fs::try_exists(self.resolve(path))
            .await
            .map_err(Self::map_io_error)
    }

    async fn metadata(&self, path: &Path) -> Result<FileMetadata> {
        let metadata = fs::metadata(self.resolve(path))
            .await
            .map_err(Self::map_io_error)?;

        Ok(FileMetadata {
            size: metadata.len(),
            created_at: metadata
                .created()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64),
            modified_at: metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64),
            is_directory: metadata.is_dir(),
        })
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        let path = self.resolve(path);
        fs::create_dir_all(&path)
            .await
            .map_err(Self::map_io_error)?;
        debug!(path = ?path, "Created directory");
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> Result<Bytes> {
        let path = self.resolve(path);
        let data = fs::read(&path).await.map_err(Self::map_io_error)?;
        debug!(path = ?path, size = data.len(), "Read file");
        Ok(Bytes::from(data))
    }

    async fn write_file(&self, path: &Path, data: Bytes) -> Result<()> {
        let path = self.resolve(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(Self::map_io_error)?;
        }

        // Write-then-rename so a concurrent scan never hashes a torn file
        let staging = path.with_extension(format!(
            "{}.partial",
            path.extension().and_then(|e| e.to_str()).unwrap_or("tmp")
        ));
        fs::write(&staging, data.as_ref())
            .await
            .map_err(Self::map_io_error)?;
        fs::rename(&staging, &path)
            .await
            .map_err(Self::map_io_error)?;

        debug!(path = ?path, size = data.len(), "Wrote file");
        Ok(())
    }

    async fn delete_file(&self, path: &Path) -> Result<()> {
        let path = self.resolve(path);
        fs::remove_file(&path).await.map_err(Self::map_io_error)?;
        debug!(path = ?path, "Deleted file");
        Ok(())
    }

    /// Entries are returned as `path` joined with each name, so relative
    /// input yields relative output.
    async fn list_directory(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let resolved = self.resolve(path);
        let mut entries = Vec::new();
        let mut read_dir = fs::read_dir(&resolved)
            .await
            .map_err(Self::map_io_error)?;

        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(Self::map_io_error)?
        {
            entries.push(path.join(entry.file_name()));
        }

        debug!(path = ?resolved, count = entries.len(), "Listed directory");
        Ok(entries)
    }
}
