//! Queue tuning knobs.

use std::time::Duration;

pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 5;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_COMPLETED_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_PROGRESS_PERSIST_STEP: u8 = 10;
pub const DEFAULT_STORAGE_DIRECTORY: &str = "offline_media";
pub const DEFAULT_FILE_EXTENSION: &str = "audio";
pub const DEFAULT_QUEUE_KEY: &str = "offline.queue_state";
pub const DEFAULT_DOWNLOADS_KEY: &str = "offline.downloaded_resources";

/// Configuration for the download queue and transfer engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Concurrency ceiling for simultaneous transfers
    pub max_concurrent_downloads: usize,
    /// Automatic attempts after the first failure before an item is failed
    pub max_retries: u32,
    /// Delay before the first automatic retry; doubles on each subsequent one
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// How long completed items stay visible in the queue
    pub completed_retention: Duration,
    /// Percent steps between persisted progress writes; the status cache
    /// sees every step
    pub progress_persist_step: u8,
    /// Media directory, relative to the host data directory
    pub storage_directory: String,
    /// Used when a source carries no usable extension
    pub default_extension: String,
    /// Settings key of the persisted queue document
    pub queue_key: String,
    /// Settings key of the downloaded-resources document
    pub downloads_key: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            max_retries: DEFAULT_MAX_RETRIES,
            base_backoff: DEFAULT_BASE_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            completed_retention: DEFAULT_COMPLETED_RETENTION,
            progress_persist_step: DEFAULT_PROGRESS_PERSIST_STEP,
            storage_directory: DEFAULT_STORAGE_DIRECTORY.to_string(),
            default_extension: DEFAULT_FILE_EXTENSION.to_string(),
            queue_key: DEFAULT_QUEUE_KEY.to_string(),
            downloads_key: DEFAULT_DOWNLOADS_KEY.to_string(),
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrent_downloads(mut self, max: usize) -> Self {
        self.max_concurrent_downloads = max;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_base_backoff(mut self, backoff: Duration) -> Self {
        self.base_backoff = backoff;
        self
    }

    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    pub fn with_completed_retention(mut self, retention: Duration) -> Self {
        self.completed_retention = retention;
        self
    }

    pub fn with_progress_persist_step(mut self, step: u8) -> Self {
        self.progress_persist_step = step;
        self
    }

    pub fn with_storage_directory(mut self, directory: impl Into<String>) -> Self {
        self.storage_directory = directory.into();
        self
    }

    pub fn with_default_extension(mut self, extension: impl Into<String>) -> Self {
        self.default_extension = extension.into();
        self
    }

    pub fn with_keys(mut self, queue_key: impl Into<String>, downloads_key: impl Into<String>) -> Self {
        self.queue_key = queue_key.into();
        self.downloads_key = downloads_key.into();
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_downloads == 0 {
            return Err("max_concurrent_downloads must be greater than 0".to_string());
        }

        if self.base_backoff.is_zero() {
            return Err("base_backoff must be greater than 0".to_string());
        }

        if self.max_backoff < self.base_backoff {
            return Err("max_backoff must be at least base_backoff".to_string());
        }

        if self.progress_persist_step == 0 || self.progress_persist_step > 100 {
            return Err("progress_persist_step must be between 1 and 100".to_string());
        }

        if self.storage_directory.trim().is_empty() {
            return Err("storage_directory cannot be empty".to_string());
        }

        if self.default_extension.trim().is_empty() {
            return Err("default_extension cannot be empty".to_string());
        }

        if self.queue_key.is_empty() || self.downloads_key.is_empty() {
            return Err("persistence keys cannot be empty".to_string());
        }

        if self.queue_key == self.downloads_key {
            return Err("queue_key and downloads_key must differ".to_string());
        }

        Ok(())
    }

    /// Delay before the automatic retry that follows failure number `retry_count`.
    ///
    /// `base * 2^(retry_count - 1)`, capped at `max_backoff`.
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(31);
        self.base_backoff
            .checked_mul(1u32 << exponent)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }
}
