//! # Offline Queue Models
//!
//! Persisted queue documents and the derived status projection.
//!
//! `QueueState` and the list of `DownloadedResource`s are the two documents
//! written to the settings store. `StatusCacheEntry` is never persisted; it is
//! rebuilt from those documents at startup.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::{OfflineError, Result};

/// Stable identifier of a downloadable remote media item.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ResourceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Type-safe queue item identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueItemId(Uuid);

impl QueueItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| OfflineError::ItemNotFound(s.to_string()))
    }
}

impl Default for QueueItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueueItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a component that needs async setup before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitState {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
}

/// Everything needed to fetch one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub resource_id: ResourceId,
    pub url: String,
    pub title: Option<String>,
    /// Size advertised by the catalog, used until the server reports one
    pub expected_bytes: Option<u64>,
    /// File extension without the dot (`mp3`, `flac`)
    pub file_extension: Option<String>,
}

impl SourceDescriptor {
    pub fn new(resource_id: impl Into<ResourceId>, url: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            url: url.into(),
            title: None,
            expected_bytes: None,
            file_extension: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_expected_bytes(mut self, bytes: u64) -> Self {
        self.expected_bytes = Some(bytes);
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.file_extension = Some(extension.into());
        self
    }
}

/// Queue item status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
    Paused,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
        }
    }

    /// Completed and failed items only move again on explicit user action.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Still waiting to be satisfied by a transfer.
    pub fn is_outstanding(&self) -> bool {
        matches!(self, Self::Pending | Self::Downloading | Self::Paused)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = OfflineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "downloading" => Ok(Self::Downloading),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "paused" => Ok(Self::Paused),
            _ => Err(OfflineError::Consistency(format!(
                "Unknown queue status: {}",
                s
            ))),
        }
    }
}

/// Why an item is paused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PauseReason {
    /// The network policy disallowed downloads; resumed automatically.
    Network,
    /// The user paused it.
    Manual,
    Error,
}

impl PauseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Manual => "manual",
            Self::Error => "error",
        }
    }
}

/// One entry of the persisted download queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub resource_id: ResourceId,
    pub source: SourceDescriptor,
    pub status: QueueStatus,
    /// 0..=100, non-decreasing within one attempt
    pub progress_percent: u8,
    pub bytes_transferred: u64,
    pub bytes_total: Option<u64>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub paused_reason: Option<PauseReason>,
    /// Incremented on every start; results from older attempts are discarded
    #[serde(default)]
    pub attempt: u32,
    /// When the pending automatic retry becomes due
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    pub fn new(source: SourceDescriptor, max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: QueueItemId::new(),
            resource_id: source.resource_id.clone(),
            bytes_total: source.expected_bytes,
            source,
            status: QueueStatus::Pending,
            progress_percent: 0,
            bytes_transferred: 0,
            retry_count: 0,
            max_retries,
            last_error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            paused_reason: None,
            attempt: 0,
            next_retry_at: None,
        }
    }

    /// A completed item for a resource that is already on disk. Never stored.
    pub fn already_downloaded(
        source: SourceDescriptor,
        size_bytes: u64,
        now: DateTime<Utc>,
    ) -> Self {
        let mut item = Self::new(source, 0, now);
        item.complete(size_bytes, now);
        item
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    fn reset_progress(&mut self) {
        self.progress_percent = 0;
        self.bytes_transferred = 0;
        self.bytes_total = self.source.expected_bytes;
    }

    /// Moves the item to `downloading` and returns the new attempt token.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) -> u32 {
        self.status = QueueStatus::Downloading;
        self.started_at = Some(now);
        self.paused_reason = None;
        self.next_retry_at = None;
        self.attempt += 1;
        self.reset_progress();
        self.attempt
    }

    /// Whether a transfer result for `attempt` still applies to this item.
    pub fn is_current_attempt(&self, attempt: u32) -> bool {
        self.status == QueueStatus::Downloading && self.attempt == attempt
    }

    /// Applies a progress report; returns false when nothing changed.
    pub fn apply_progress(
        &mut self,
        attempt: u32,
        percent: u8,
        bytes_transferred: u64,
        bytes_total: Option<u64>,
    ) -> bool {
        if !self.is_current_attempt(attempt) || percent < self.progress_percent {
            return false;
        }

        let total = bytes_total.or(self.bytes_total);
        let transferred = match total {
            Some(total) => bytes_transferred.min(total),
            None => bytes_transferred,
        };
        let percent = percent.min(100);

        if percent == self.progress_percent && transferred <= self.bytes_transferred {
            return false;
        }

        self.progress_percent = percent;
        self.bytes_transferred = transferred.max(self.bytes_transferred);
        self.bytes_total = total;
        true
    }

    /// Marks the item done with the size of the file actually stored.
    pub fn complete(&mut self, size_bytes: u64, now: DateTime<Utc>) {
        self.status = QueueStatus::Completed;
        self.progress_percent = 100;
        self.bytes_transferred = size_bytes;
        self.bytes_total = Some(size_bytes);
        self.completed_at = Some(now);
        self.last_error = None;
        self.next_retry_at = None;
        self.paused_reason = None;
    }

    /// Counts a failed attempt.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.retry_count += 1;
        self.last_error = Some(error.into());
    }

    /// Back to `pending`, not schedulable before `due`.
    pub fn schedule_retry(&mut self, due: DateTime<Utc>) {
        self.status = QueueStatus::Pending;
        self.next_retry_at = Some(due);
        self.reset_progress();
    }

    pub fn fail(&mut self) {
        self.status = QueueStatus::Failed;
        self.next_retry_at = None;
    }

    pub fn pause(&mut self, reason: PauseReason) -> Result<()> {
        match self.status {
            QueueStatus::Pending | QueueStatus::Downloading => {
                self.status = QueueStatus::Paused;
                self.paused_reason = Some(reason);
                self.reset_progress();
                Ok(())
            }
            status => Err(OfflineError::InvalidTransition {
                status,
                action: "pause",
            }),
        }
    }

    pub fn resume(&mut self) -> Result<()> {
        match self.status {
            QueueStatus::Paused => {
                self.status = QueueStatus::Pending;
                self.paused_reason = None;
                Ok(())
            }
            status => Err(OfflineError::InvalidTransition {
                status,
                action: "resume",
            }),
        }
    }

    /// Manual retry of a failed item. The automatic retry budget starts over.
    pub fn reset_for_retry(&mut self) -> Result<()> {
        match self.status {
            QueueStatus::Failed => {
                self.status = QueueStatus::Pending;
                self.retry_count = 0;
                self.last_error = None;
                self.next_retry_at = None;
                self.reset_progress();
                Ok(())
            }
            status => Err(OfflineError::InvalidTransition {
                status,
                action: "retry",
            }),
        }
    }

    /// Items left `downloading` by a crash restart from zero.
    pub fn recover_orphan(&mut self) -> bool {
        if self.status != QueueStatus::Downloading {
            return false;
        }
        self.status = QueueStatus::Pending;
        self.reset_progress();
        true
    }
}

/// Per-status counts exposed to the presentation layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub downloading: usize,
    pub completed: usize,
    pub failed: usize,
    pub paused: usize,
    pub total: usize,
    /// Size of the active set
    pub active: usize,
    pub max_concurrent: usize,
    pub completed_today: u32,
}

/// The persisted queue document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueState {
    /// FIFO order; retried items are moved to the back
    pub items: Vec<QueueItem>,
    pub active_resource_ids: BTreeSet<ResourceId>,
    pub completed_today: u32,
    /// UTC day `completed_today` belongs to
    #[serde(default)]
    pub counter_day: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl QueueState {
    pub fn find(&self, id: QueueItemId) -> Option<&QueueItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn find_mut(&mut self, id: QueueItemId) -> Option<&mut QueueItem> {
        self.items.iter_mut().find(|item| item.id == id)
    }

    pub fn find_by_resource(&self, resource_id: &ResourceId) -> Option<&QueueItem> {
        self.items
            .iter()
            .find(|item| &item.resource_id == resource_id)
    }

    pub fn find_by_resource_mut(&mut self, resource_id: &ResourceId) -> Option<&mut QueueItem> {
        self.items
            .iter_mut()
            .find(|item| &item.resource_id == resource_id)
    }

    /// Appends a new item; at most one item may exist per resource.
    pub fn insert(&mut self, item: QueueItem) -> Result<()> {
        if self.find_by_resource(&item.resource_id).is_some() {
            return Err(OfflineError::DuplicateRequest(item.resource_id));
        }
        self.items.push(item);
        Ok(())
    }

    pub fn remove(&mut self, id: QueueItemId) -> Option<QueueItem> {
        let index = self.items.iter().position(|item| item.id == id)?;
        let item = self.items.remove(index);
        self.active_resource_ids.remove(&item.resource_id);
        Some(item)
    }

    pub fn move_to_back(&mut self, id: QueueItemId) {
        if let Some(index) = self.items.iter().position(|item| item.id == id) {
            let item = self.items.remove(index);
            self.items.push(item);
        }
    }

    /// Drops completed items older than `retention`, returning them.
    pub fn prune_expired(&mut self, now: DateTime<Utc>, retention: Duration) -> Vec<QueueItem> {
        let cutoff = now - retention;
        let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.items)
            .into_iter()
            .partition(|item| {
                item.status == QueueStatus::Completed
                    && item.completed_at.is_some_and(|at| at < cutoff)
            });
        self.items = kept;
        expired
    }

    /// Removes every completed item, returning them.
    pub fn clear_completed(&mut self) -> Vec<QueueItem> {
        let (completed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.items)
            .into_iter()
            .partition(|item| item.status == QueueStatus::Completed);
        self.items = kept;
        completed
    }

    /// Bumps the daily completion counter, resetting it on a new UTC day.
    pub fn record_completion(&mut self, day_key: &str) {
        if self.counter_day.as_deref() != Some(day_key) {
            self.counter_day = Some(day_key.to_string());
            self.completed_today = 0;
        }
        self.completed_today += 1;
    }

    pub fn next_pending<F>(&self, mut eligible: F) -> Option<&QueueItem>
    where
        F: FnMut(&QueueItem) -> bool,
    {
        self.items
            .iter()
            .find(|item| item.status == QueueStatus::Pending && eligible(item))
    }

    pub fn stats(&self, max_concurrent: usize, day_key: &str) -> QueueStats {
        let mut stats = QueueStats {
            total: self.items.len(),
            active: self.active_resource_ids.len(),
            max_concurrent,
            completed_today: if self.counter_day.as_deref() == Some(day_key) {
                self.completed_today
            } else {
                0
            },
            ..QueueStats::default()
        };

        for item in &self.items {
            match item.status {
                QueueStatus::Pending => stats.pending += 1,
                QueueStatus::Downloading => stats.downloading += 1,
                QueueStatus::Completed => stats.completed += 1,
                QueueStatus::Failed => stats.failed += 1,
                QueueStatus::Paused => stats.paused += 1,
            }
        }

        stats
    }
}

/// A resource stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadedResource {
    pub resource_id: ResourceId,
    pub local_path: PathBuf,
    pub size_bytes: u64,
    pub downloaded_at: DateTime<Utc>,
    /// Empty for records rebuilt from a storage scan
    pub source_url: String,
}

/// Derived per-resource view served by the status cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusCacheEntry {
    /// Set only from a verified file check
    pub is_downloaded: bool,
    pub queue_item_id: Option<QueueItemId>,
    pub local_path: Option<PathBuf>,
    pub status: Option<QueueStatus>,
    pub progress_percent: u8,
}

impl StatusCacheEntry {
    pub fn is_absent(&self) -> bool {
        !self.is_downloaded && self.queue_item_id.is_none()
    }

    pub(crate) fn clear_queue_fields(&mut self) {
        self.queue_item_id = None;
        self.status = None;
        self.progress_percent = 0;
    }
}
