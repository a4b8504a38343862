//! # Host Bridge Traits
//!
//! Capability traits the offline download core needs from its host platform.
//!
//! ## Overview
//!
//! The download queue never talks to the network, the disk, or the settings
//! database directly. Each of those is a bridge trait implemented per host
//! (desktop adapters live in `bridge-desktop`; mobile hosts inject their own).
//!
//! ## Traits
//!
//! ### Networking & I/O
//! - [`HttpClient`](http::HttpClient) - Streaming resource fetches
//! - [`FileSystemAccess`](storage::FileSystemAccess) - Durable local storage for downloaded media
//!
//! ### Persistence
//! - [`SettingsStore`](storage::SettingsStore) - Key-value store holding the queue documents and user preferences
//!
//! ### Platform Integration
//! - [`NetworkMonitor`](network::NetworkMonitor) - Reachability and metered/unmetered classification
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Error Handling
//!
//! All bridge traits return [`BridgeError`](error::BridgeError). Implementations
//! convert platform errors into it and keep the original context in the message.
//!
//! ## Thread Safety
//!
//! Every trait requires `Send + Sync` so adapters can be shared behind `Arc`
//! across spawned transfer tasks.

pub mod error;
pub mod http;
pub mod network;
pub mod storage;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use http::{HttpClient, HttpDownload, HttpMethod, HttpRequest};
pub use network::{
    ConnectionKind, NetworkChangeStream, NetworkInfo, NetworkMonitor, NetworkStatus, NetworkType,
};
pub use storage::{FileMetadata, FileSystemAccess, SettingsStore};
pub use time::{Clock, LogEntry, LogLevel, LoggerSink, SystemClock};
