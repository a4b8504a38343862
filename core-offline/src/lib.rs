//! # Offline Download Module
//!
//! Schedules, executes, persists and recovers background downloads of remote
//! audio resources for offline playback.
//!
//! ## Overview
//!
//! This module handles:
//! - Transfers into durable local storage (`transfer`)
//! - A synchronous per-resource status projection (`status_cache`)
//! - The persisted queue state machine with retry, backoff and network
//!   policy (`queue`)
//! - A startup consistency pass between metadata and disk (`recovery`)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_offline::{OfflineDownloadService, QueueConfig, SourceDescriptor};
//! use core_runtime::config::CoreConfig;
//!
//! # async fn example(core: CoreConfig) -> core_offline::Result<()> {
//! let service = OfflineDownloadService::new(&core, QueueConfig::default())?;
//! service.start().await?;
//!
//! let item = service
//!     .manager()
//!     .enqueue(SourceDescriptor::new("track-42", "https://cdn.example.com/42.mp3"))
//!     .await?;
//!
//! let status = service.status_cache().get(&item.resource_id);
//! println!("{:?} {}%", status.status, status.progress_percent);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod models;
pub mod persistence;
pub mod preferences;
pub mod queue;
pub mod recovery;
pub mod service;
pub mod status_cache;
pub mod subscription;
pub mod transfer;

pub use config::QueueConfig;
pub use error::{OfflineError, Result};
pub use models::{
    DownloadedResource, InitState, PauseReason, QueueItem, QueueItemId, QueueState, QueueStats,
    QueueStatus, ResourceId, SourceDescriptor, StatusCacheEntry,
};
pub use preferences::{DownloadPreferences, PreferenceReader};
pub use queue::{QueueManager, QueueManagerBuilder};
pub use recovery::{RecoveryReport, StorageRecovery};
pub use service::OfflineDownloadService;
pub use status_cache::StatusCache;
pub use subscription::Subscription;
pub use transfer::{FileTransferEngine, ProgressFn, TransferEngine, TransferProgress};
