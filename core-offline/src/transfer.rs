//! # Transfer Engine
//!
//! Fetches one resource, stores it under the media directory and keeps the
//! downloaded-resources document in step with the disk.
//!
//! ## File layout
//!
//! ```text
//! <data dir>/<storage_directory>/<urlencoded resource id>.<ext>
//! <data dir>/<storage_directory>/<urlencoded resource id>.<ext>.part   (in flight)
//! ```
//!
//! Bytes are streamed into the `.part` file and renamed into place only after
//! the body was fully written, so a file at the final path is always
//! complete. The engine has no retry or concurrency logic of its own; the
//! queue manager owns both.

use async_trait::async_trait;
use bridge_traits::{BridgeError, Clock, FileSystemAccess, HttpClient, HttpDownload, HttpRequest};
use core_runtime::config::CoreConfig;
use core_runtime::logging::{redact_url, strip_path};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

use crate::config::QueueConfig;
use crate::error::{OfflineError, Result};
use crate::models::{DownloadedResource, InitState, ResourceId, SourceDescriptor};
use crate::persistence::PersistedDocument;

const CHUNK_SIZE: usize = 64 * 1024;
pub(crate) const PARTIAL_SUFFIX: &str = ".part";
const MAX_EXTENSION_LEN: usize = 8;

/// Progress of one transfer attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes_transferred: u64,
    pub bytes_total: Option<u64>,
    /// Whole percent, 100 only once the file is in place
    pub percent: u8,
}

impl TransferProgress {
    pub fn complete(size: u64) -> Self {
        Self {
            bytes_transferred: size,
            bytes_total: Some(size),
            percent: 100,
        }
    }
}

/// Callback invoked on progress; must not block.
pub type ProgressFn = dyn Fn(TransferProgress) + Send + Sync;

/// Fetch, store and account for downloaded resources.
#[async_trait]
pub trait TransferEngine: Send + Sync {
    /// Ensures the storage root exists. Safe to call repeatedly.
    async fn initialize(&self) -> Result<()>;

    /// Fetches the resource and returns its local path.
    ///
    /// Returns immediately when the file is already on disk. Always reports a
    /// terminal 100% progress on success.
    async fn download(&self, source: &SourceDescriptor, on_progress: &ProgressFn)
        -> Result<PathBuf>;

    /// Removes the file and its record. No-op when unknown.
    async fn delete(&self, resource_id: &ResourceId) -> Result<()>;

    /// The record for `resource_id`, only if its file is verified present.
    async fn lookup(&self, resource_id: &ResourceId) -> Result<Option<DownloadedResource>>;

    /// Records whose file is present. Stale records are purged.
    async fn list_downloaded(&self) -> Result<Vec<DownloadedResource>>;

    async fn total_storage_used(&self) -> Result<u64>;

    /// Deletes the oldest resources until at most `max_count` remain.
    ///
    /// A failed delete is logged and skipped. The result lists every resource
    /// whose file was removed, including when some deletes failed.
    async fn enforce_quota(&self, max_count: usize) -> Result<Vec<ResourceId>>;
}

fn storage_error(context: &str, err: BridgeError) -> OfflineError {
    OfflineError::Storage(format!("{}: {}", context, err))
}

/// `TransferEngine` backed by the host `HttpClient` and `FileSystemAccess`.
pub struct FileTransferEngine {
    fs: Arc<dyn FileSystemAccess>,
    http: Arc<dyn HttpClient>,
    clock: Arc<dyn Clock>,
    records: PersistedDocument<Vec<DownloadedResource>>,
    storage_directory: String,
    default_extension: String,
    state: Mutex<InitState>,
    init_lock: tokio::sync::Mutex<()>,
    root: OnceLock<PathBuf>,
}

impl FileTransferEngine {
    pub fn new(
        fs: Arc<dyn FileSystemAccess>,
        http: Arc<dyn HttpClient>,
        settings: Arc<dyn bridge_traits::SettingsStore>,
        clock: Arc<dyn Clock>,
        config: &QueueConfig,
    ) -> Self {
        Self {
            fs,
            http,
            clock,
            records: PersistedDocument::new(settings, config.downloads_key.clone()),
            storage_directory: config.storage_directory.clone(),
            default_extension: config.default_extension.clone(),
            state: Mutex::new(InitState::Uninitialized),
            init_lock: tokio::sync::Mutex::new(()),
            root: OnceLock::new(),
        }
    }

    /// Builds the engine from the bridges of a `CoreConfig`.
    pub fn from_config(core: &CoreConfig, config: &QueueConfig) -> Result<Self> {
        Ok(Self::new(
            core.require_file_system()?,
            core.require_http_client()?,
            core.settings_store.clone(),
            core.clock.clone(),
            config,
        ))
    }

    pub fn init_state(&self) -> InitState {
        *self.state.lock()
    }

    /// Absolute media directory. Fails before `initialize`.
    pub fn storage_root(&self) -> Result<&Path> {
        self.root
            .get()
            .map(PathBuf::as_path)
            .ok_or(OfflineError::NotInitialized)
    }

    pub(crate) fn file_system(&self) -> &Arc<dyn FileSystemAccess> {
        &self.fs
    }

    pub(crate) fn records(&self) -> &PersistedDocument<Vec<DownloadedResource>> {
        &self.records
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn extension_for(&self, source: &SourceDescriptor) -> String {
        let from_url = || {
            let path = source.url.split(['?', '#']).next().unwrap_or_default();
            let file = path.rsplit('/').next().unwrap_or_default();
            file.rsplit_once('.').map(|(_, ext)| ext.to_string())
        };

        source
            .file_extension
            .clone()
            .or_else(from_url)
            .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| {
                !ext.is_empty()
                    && ext.len() <= MAX_EXTENSION_LEN
                    && ext.chars().all(|c| c.is_ascii_alphanumeric())
                    && ext != "part"
            })
            .unwrap_or_else(|| self.default_extension.clone())
    }

    /// File name for a resource: URL-encoded id plus extension.
    pub fn file_name_for(&self, source: &SourceDescriptor) -> String {
        format!(
            "{}.{}",
            urlencoding::encode(source.resource_id.as_str()),
            self.extension_for(source)
        )
    }

    async fn upsert_record(&self, record: DownloadedResource) -> Result<()> {
        self.records
            .update(|records| {
                records.retain(|r| r.resource_id != record.resource_id);
                records.push(record);
            })
            .await?;
        Ok(())
    }

    async fn file_present(&self, path: &Path) -> Result<bool> {
        self.fs
            .exists(path)
            .await
            .map_err(|e| storage_error("Failed to stat file", e))
    }

    /// Drops records whose file is gone, as long as they still point there.
    async fn purge_records(&self, stale: &[DownloadedResource]) -> Result<()> {
        if stale.is_empty() {
            return Ok(());
        }

        let stale: HashSet<(&ResourceId, &Path)> = stale
            .iter()
            .map(|r| (&r.resource_id, r.local_path.as_path()))
            .collect();

        self.records
            .try_update(|records| {
                let before = records.len();
                records.retain(|r| !stale.contains(&(&r.resource_id, r.local_path.as_path())));
                Ok((records.len() != before).then_some(()))
            })
            .await?;

        info!(count = stale.len(), "Purged records of missing files");
        Ok(())
    }

    async fn stream_to_partial(
        &self,
        source: &SourceDescriptor,
        partial: &Path,
        on_progress: &ProgressFn,
    ) -> Result<u64> {
        let resource_id = &source.resource_id;

        let response = self
            .http
            .download_stream(HttpRequest::get(source.url.clone()))
            .await
            .map_err(|e| OfflineError::transfer(resource_id, e.to_string()))?;

        if !response.is_success() {
            return Err(OfflineError::Transfer {
                resource_id: resource_id.clone(),
                message: format!("HTTP {}", response.status),
                status: Some(response.status),
            });
        }

        let HttpDownload {
            content_length,
            mut body,
            ..
        } = response;
        let total = content_length.or(source.expected_bytes).filter(|t| *t > 0);

        let mut writer = self
            .fs
            .open_write_stream(partial)
            .await
            .map_err(|e| storage_error("Failed to open partial file", e))?;

        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut transferred: u64 = 0;
        let mut last_percent: u8 = 0;

        loop {
            let read = body
                .read(&mut buffer)
                .await
                .map_err(|e| OfflineError::transfer(resource_id, format!("Read failed: {}", e)))?;
            if read == 0 {
                break;
            }

            writer
                .write_all(&buffer[..read])
                .await
                .map_err(|e| OfflineError::Storage(format!("Write failed: {}", e)))?;
            transferred += read as u64;

            if let Some(total) = total {
                let percent = (transferred.min(total) * 100 / total) as u8;
                // 100 is reserved for the moment the file is in place
                if percent > last_percent && percent < 100 {
                    last_percent = percent;
                    on_progress(TransferProgress {
                        bytes_transferred: transferred,
                        bytes_total: Some(total),
                        percent,
                    });
                }
            }
        }

        writer
            .shutdown()
            .await
            .map_err(|e| OfflineError::Storage(format!("Failed to finish write: {}", e)))?;
        drop(writer);

        if let Some(expected) = content_length {
            if transferred != expected {
                return Err(OfflineError::transfer(
                    resource_id,
                    format!("Body truncated: {} of {} bytes", transferred, expected),
                ));
            }
        }

        Ok(transferred)
    }
}

#[async_trait]
impl TransferEngine for FileTransferEngine {
    #[instrument(skip(self))]
    async fn initialize(&self) -> Result<()> {
        let _guard = self.init_lock.lock().await;
        if self.root.get().is_some() {
            return Ok(());
        }

        *self.state.lock() = InitState::Initializing;

        let prepared = async {
            let data_dir = self.fs.get_data_directory().await?;
            let root = data_dir.join(&self.storage_directory);
            self.fs.create_dir_all(&root).await?;
            Ok::<_, BridgeError>(root)
        }
        .await;

        match prepared {
            Ok(root) => {
                info!(directory = %self.storage_directory, "Offline storage ready");
                let _ = self.root.set(root);
                *self.state.lock() = InitState::Ready;
                Ok(())
            }
            Err(e) => {
                *self.state.lock() = InitState::Uninitialized;
                Err(storage_error("Failed to prepare storage root", e))
            }
        }
    }

    #[instrument(skip(self, source, on_progress), fields(resource_id = %source.resource_id))]
    async fn download(
        &self,
        source: &SourceDescriptor,
        on_progress: &ProgressFn,
    ) -> Result<PathBuf> {
        let root = self.storage_root()?;
        let file_name = self.file_name_for(source);
        let target = root.join(&file_name);

        if self.file_present(&target).await? {
            let size = self
                .fs
                .metadata(&target)
                .await
                .map_err(|e| storage_error("Failed to stat existing file", e))?
                .size;

            let known = self
                .records
                .load()
                .await?
                .into_iter()
                .any(|r| r.resource_id == source.resource_id && r.local_path == target);
            if !known {
                self.upsert_record(DownloadedResource {
                    resource_id: source.resource_id.clone(),
                    local_path: target.clone(),
                    size_bytes: size,
                    downloaded_at: self.clock.now(),
                    source_url: source.url.clone(),
                })
                .await?;
            }

            debug!("File already present, skipping fetch");
            on_progress(TransferProgress::complete(size));
            return Ok(target);
        }

        debug!(url = %redact_url(&source.url), "Starting transfer");
        let partial = root.join(format!("{}{}", file_name, PARTIAL_SUFFIX));

        let size = match self.stream_to_partial(source, &partial, on_progress).await {
            Ok(size) => size,
            Err(e) => {
                if let Err(cleanup) = self.fs.delete_file(&partial).await {
                    if !cleanup.is_not_found() {
                        warn!(error = %cleanup, "Failed to remove partial file");
                    }
                }
                return Err(e);
            }
        };

        self.fs
            .rename(&partial, &target)
            .await
            .map_err(|e| storage_error("Failed to move completed file", e))?;

        self.upsert_record(DownloadedResource {
            resource_id: source.resource_id.clone(),
            local_path: target.clone(),
            size_bytes: size,
            downloaded_at: self.clock.now(),
            source_url: source.url.clone(),
        })
        .await?;

        info!(bytes = size, file = %file_name, "Transfer complete");
        on_progress(TransferProgress::complete(size));
        Ok(target)
    }

    #[instrument(skip(self, resource_id), fields(resource_id = %resource_id))]
    async fn delete(&self, resource_id: &ResourceId) -> Result<()> {
        let records = self.records.load().await?;
        let Some(record) = records.into_iter().find(|r| &r.resource_id == resource_id) else {
            return Ok(());
        };

        match self.fs.delete_file(&record.local_path).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(storage_error("Failed to delete file", e)),
        }

        self.records
            .try_update(|records| {
                let before = records.len();
                records.retain(|r| &r.resource_id != resource_id);
                Ok((records.len() != before).then_some(()))
            })
            .await?;

        info!(bytes = record.size_bytes, "Deleted downloaded resource");
        Ok(())
    }

    async fn lookup(&self, resource_id: &ResourceId) -> Result<Option<DownloadedResource>> {
        let records = self.records.load().await?;
        let Some(record) = records.into_iter().find(|r| &r.resource_id == resource_id) else {
            return Ok(None);
        };

        if self.file_present(&record.local_path).await? {
            Ok(Some(record))
        } else {
            self.purge_records(std::slice::from_ref(&record)).await?;
            Ok(None)
        }
    }

    async fn list_downloaded(&self) -> Result<Vec<DownloadedResource>> {
        let records = self.records.load().await?;

        let mut present = Vec::with_capacity(records.len());
        let mut missing = Vec::new();
        for record in records {
            match self.file_present(&record.local_path).await {
                Ok(true) => present.push(record),
                Ok(false) => missing.push(record),
                Err(e) => warn!(
                    resource_id = %record.resource_id,
                    file = %strip_path(&record.local_path.to_string_lossy()),
                    error = %e,
                    "Skipping record that could not be verified"
                ),
            }
        }

        self.purge_records(&missing).await?;
        Ok(present)
    }

    async fn total_storage_used(&self) -> Result<u64> {
        Ok(self
            .list_downloaded()
            .await?
            .iter()
            .map(|r| r.size_bytes)
            .sum())
    }

    #[instrument(skip(self))]
    async fn enforce_quota(&self, max_count: usize) -> Result<Vec<ResourceId>> {
        let mut downloaded = self.list_downloaded().await?;
        if downloaded.len() <= max_count {
            return Ok(Vec::new());
        }

        downloaded.sort_by_key(|r| r.downloaded_at);
        let excess = downloaded.len() - max_count;

        let mut evicted = Vec::with_capacity(excess);
        let mut failed = 0usize;
        for record in downloaded.into_iter().take(excess) {
            match self.delete(&record.resource_id).await {
                Ok(()) => evicted.push(record.resource_id),
                Err(e) => {
                    failed += 1;
                    warn!(
                        resource_id = %record.resource_id,
                        error = %e,
                        "Failed to evict resource"
                    );
                    // The record update can fail after the file is already gone
                    if !self.file_present(&record.local_path).await.unwrap_or(true) {
                        evicted.push(record.resource_id);
                    }
                }
            }
        }

        info!(
            evicted = evicted.len(),
            failed,
            max_count,
            "Enforced download quota"
        );
        Ok(evicted)
    }
}

/// Recovers the resource id from a media file name.
///
/// Returns `None` for partial files and names that do not decode.
pub(crate) fn resource_id_from_file_name(name: &str) -> Option<ResourceId> {
    if name.ends_with(PARTIAL_SUFFIX) {
        return None;
    }
    let (stem, _ext) = name.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    urlencoding::decode(stem)
        .ok()
        .map(|id| ResourceId::new(id.into_owned()))
}
