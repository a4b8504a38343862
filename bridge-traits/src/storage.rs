//! Storage and File System Abstractions
//!
//! Durable file storage for downloaded media and a key-value settings store
//! for queue documents and user preferences.

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
/// - Desktop: direct filesystem access under the user data directory
/// - iOS/Android: sandboxed app directories; the absolute container path may
///   change between launches, so callers must not assume persisted absolute
///   paths stay valid
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::FileSystemAccess;
///
/// async fn media_root(fs: &dyn FileSystemAccess) -> Result<PathBuf> {
///     let root = fs.get_data_directory().await?.join("offline_media");
///     fs.create_dir_all(&root).await?;
///     Ok(root)
/// }
/// ```
#[async_trait]
pub trait FileSystemAccess: Send + Sync {
    /// Get the application's data directory
    ///
    /// This directory is suitable for persistent application data.
    async fn get_data_directory(&self) -> Result<PathBuf>;

    /// Check if a file or directory exists
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Get metadata for a file or directory
    async fn metadata(&self, path: &Path) -> Result<FileMetadata>;

    /// Create a directory and all parent directories if they don't exist
    async fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Read entire file contents into memory
    async fn read_file(&self, path: &Path) -> Result<Bytes>;

    /// Write data to a file, creating it if it doesn't exist
    async fn write_file(&self, path: &Path, data: Bytes) -> Result<()>;

    /// Delete a file
    async fn delete_file(&self, path: &Path) -> Result<()>;

    /// Rename a file, replacing the destination if it exists
    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// List all entries in a directory
    async fn list_directory(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// Open a file for streaming writes, truncating any previous content
    async fn open_write_stream(
        &self,
        path: &Path,
    ) -> Result<Box<dyn tokio::io::AsyncWrite + Send + Unpin>>;
}

/// Key-value settings storage trait
///
/// - iOS: UserDefaults
/// - Android: SharedPreferences / DataStore
/// - Desktop: SQLite-backed key-value table
///
/// Values are typed; reading a key with a different type than it was written
/// with is an error.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::SettingsStore;
///
/// async fn allow_cellular(store: &dyn SettingsStore) -> Result<()> {
///     store.set_bool("downloads.require_unmetered", false).await
/// }
/// ```
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Store a string value
    async fn set_string(&self, key: &str, value: &str) -> Result<()>;

    /// Retrieve a string value
    async fn get_string(&self, key: &str) -> Result<Option<String>>;

    /// Store a boolean value
    async fn set_bool(&self, key: &str, value: bool) -> Result<()>;

    /// Retrieve a boolean value
    async fn get_bool(&self, key: &str) -> Result<Option<bool>>;

    /// Store an integer value
    async fn set_i64(&self, key: &str, value: i64) -> Result<()>;

    /// Retrieve an integer value
    async fn get_i64(&self, key: &str) -> Result<Option<i64>>;

    /// Delete a setting
    async fn delete(&self, key: &str) -> Result<()>;

    /// Check if a setting exists
    async fn has_key(&self, key: &str) -> Result<bool>;

    /// List all setting keys
    async fn list_keys(&self) -> Result<Vec<String>>;
}
