//! File System Access Implementation using Tokio

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    storage::{FileMetadata, FileSystemAccess},
};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tracing::debug;

const APP_DIRECTORY: &str = "offline-media-queue";

/// Tokio-based file system implementation
///
/// All paths handed in are used as-is; the data directory defaults to the
/// platform data dir (`~/.local/share`, `~/Library/Application Support`,
/// `%APPDATA%`) plus an application folder.
pub struct TokioFileSystem {
    data_dir: PathBuf,
}

impl TokioFileSystem {
    /// Create a new file system accessor with the platform data directory
    pub fn new() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".local")
                    .join("share")
            })
            .join(APP_DIRECTORY);

        Self { data_dir }
    }

    /// Create a new file system accessor rooted at a custom data directory
    pub fn with_data_directory(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    fn epoch_seconds(time: std::io::Result<SystemTime>) -> Option<i64> {
        time.ok()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
    }

    async fn ensure_parent(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }
}

impl Default for TokioFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystemAccess for TokioFileSystem {
    async fn get_data_directory(&self) -> Result<PathBuf> {
        if !fs::try_exists(&self.data_dir).await? {
            fs::create_dir_all(&self.data_dir).await?;
            debug!(path = ?self.data_dir, "Created data directory");
        }
        Ok(self.data_dir.clone())
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(fs::try_exists(path).await?)
    }

    async fn metadata(&self, path: &Path) -> Result<FileMetadata> {
        let metadata = fs::metadata(path).await?;

        Ok(FileMetadata {
            size: metadata.len(),
            created_at: Self::epoch_seconds(metadata.created()),
            modified_at: Self::epoch_seconds(metadata.modified()),
            is_directory: metadata.is_dir(),
        })
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).await?;
        debug!(path = ?path, "Created directory");
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> Result<Bytes> {
        let data = fs::read(path).await?;
        debug!(path = ?path, size = data.len(), "Read file");
        Ok(Bytes::from(data))
    }

    async fn write_file(&self, path: &Path, data: Bytes) -> Result<()> {
        self.ensure_parent(path).await?;
        fs::write(path, data.as_ref()).await?;
        debug!(path = ?path, size = data.len(), "Wrote file");
        Ok(())
    }

    async fn delete_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).await?;
        debug!(path = ?path, "Deleted file");
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to).await.map_err(|e| {
            BridgeError::OperationFailed(format!(
                "Failed to rename {} to {}: {}",
                from.display(),
                to.display(),
                e
            ))
        })?;
        debug!(from = ?from, to = ?to, "Renamed file");
        Ok(())
    }

    async fn list_directory(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        let mut read_dir = fs::read_dir(path).await?;

        while let Some(entry) = read_dir.next_entry().await? {
            entries.push(entry.path());
        }

        debug!(path = ?path, count = entries.len(), "Listed directory");
        Ok(entries)
    }

    async fn open_write_stream(
        &self,
        path: &Path,
    ) -> Result<Box<dyn tokio::io::AsyncWrite + Send + Unpin>> {
        self.ensure_parent(path).await?;
        let file = fs::File::create(path).await?;
        debug!(path = ?path, "Opened file for writing");
        Ok(Box::new(file))
    }
}
