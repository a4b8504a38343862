//! # Core Configuration Module
//!
//! Capability wiring for the offline download core.
//!
//! ## Overview
//!
//! A `CoreConfig` bundles every host bridge the download queue needs together
//! with a handful of global settings. The builder enforces fail-fast
//! validation so a missing capability surfaces at startup with an actionable
//! message instead of on the first download.
//!
//! ## Required Dependencies
//!
//! - `data_dir` - Root directory for persisted state and downloaded media
//! - `SettingsStore` - Backing store for the queue document, the download
//!   records and user preferences
//!
//! ## Optional Dependencies (with platform defaults)
//!
//! - `HttpClient` - Streaming transfers (desktop default: reqwest)
//! - `FileSystemAccess` - Media files (desktop default: tokio fs)
//! - `NetworkMonitor` - Connectivity detection (desktop default: TCP probe,
//!   only when network awareness is enabled)
//! - `Clock` - Time source (default: system clock)
//!
//! When the `desktop-shims` feature is enabled, desktop-ready defaults are
//! injected for every capability that was not provided.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//!
//! let config = CoreConfig::builder()
//!     .data_dir("/var/lib/player")
//!     .enable_network_awareness(true)
//!     .build()
//!     .expect("Failed to build config");
//! ```
//!
//! ## Error Handling
//!
//! Without `desktop-shims`, omitting the settings store is an error:
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//!
//! let err = CoreConfig::builder().data_dir("/tmp/q").build().unwrap_err();
//! assert!(err.to_string().contains("SettingsStore"));
//! ```

use crate::error::{Error, Result};
use crate::events::DEFAULT_EVENT_BUFFER_SIZE;
use bridge_traits::{
    Clock, FileSystemAccess, HttpClient, NetworkMonitor, SettingsStore, SystemClock,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Core configuration for the offline download core.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// Root directory for persisted state and downloaded media
    pub data_dir: PathBuf,

    /// HTTP client for streaming transfers (optional with desktop default)
    pub http_client: Option<Arc<dyn HttpClient>>,

    /// File system access abstraction (optional with desktop default)
    pub file_system: Option<Arc<dyn FileSystemAccess>>,

    /// Key/value store for queue state and preferences (required)
    pub settings_store: Arc<dyn SettingsStore>,

    /// Network connectivity monitor (optional)
    pub network_monitor: Option<Arc<dyn NetworkMonitor>>,

    /// Time source for queue timestamps
    pub clock: Arc<dyn Clock>,

    /// Capacity of the event bus channel
    pub event_buffer_size: usize,

    pub features: FeatureFlags,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("data_dir", &self.data_dir)
            .field(
                "http_client",
                &self.http_client.as_ref().map(|_| "HttpClient { ... }"),
            )
            .field(
                "file_system",
                &self
                    .file_system
                    .as_ref()
                    .map(|_| "FileSystemAccess { ... }"),
            )
            .field("settings_store", &"SettingsStore { ... }")
            .field(
                "network_monitor",
                &self
                    .network_monitor
                    .as_ref()
                    .map(|_| "NetworkMonitor { ... }"),
            )
            .field("event_buffer_size", &self.event_buffer_size)
            .field("features", &self.features)
            .finish()
    }
}

/// Feature flags control optional functionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureFlags {
    /// Gate downloads on connection kind (requires NetworkMonitor)
    pub enable_network_awareness: bool,

    /// Evict the oldest downloads beyond `downloads.max_retained`
    pub enable_quota_eviction: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            enable_network_awareness: false,
            enable_quota_eviction: true,
        }
    }
}

impl CoreConfig {
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Data directory is not empty
    /// - Event buffer size is non-zero
    /// - Feature flags are consistent with available bridges
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::Config("Data directory cannot be empty".to_string()));
        }

        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        if self.features.enable_network_awareness && self.network_monitor.is_none() {
            return Err(Error::Config(
                "Network awareness enabled but no NetworkMonitor provided. \
                 Disable the feature or inject a NetworkMonitor implementation."
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Returns the HTTP client or a `CapabilityMissing` error.
    pub fn require_http_client(&self) -> Result<Arc<dyn HttpClient>> {
        self.http_client
            .clone()
            .ok_or_else(|| Error::CapabilityMissing {
                capability: "HttpClient".to_string(),
                message: "HttpClient implementation is required for media transfers. \
                         Desktop: enable the 'desktop-shims' feature to use ReqwestHttpClient. \
                         Mobile: inject a URLSession/OkHttp-backed client."
                    .to_string(),
            })
    }

    /// Returns the file system bridge or a `CapabilityMissing` error.
    pub fn require_file_system(&self) -> Result<Arc<dyn FileSystemAccess>> {
        self.file_system
            .clone()
            .ok_or_else(|| Error::CapabilityMissing {
                capability: "FileSystemAccess".to_string(),
                message: "FileSystemAccess implementation is required to store media. \
                         Desktop: enable the 'desktop-shims' feature to use TokioFileSystem. \
                         Mobile: inject a sandbox-aware file system bridge."
                    .to_string(),
            })
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn settings_store_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "SettingsStore".to_string(),
        message: "SettingsStore implementation is required for queue persistence. \
                 Desktop: ensure the 'desktop-shims' feature is enabled to use the default SqliteSettingsStore. \
                 Mobile: inject platform-native settings (UserDefaults/DataStore)."
            .to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_settings_store(data_dir: &Path) -> Result<Arc<dyn SettingsStore>> {
    use bridge_desktop::SqliteSettingsStore;
    use std::thread;
    use tokio::runtime::{Builder, Handle};

    let path = data_dir.join("settings.db");

    let init_store = |path: PathBuf| -> Result<_> {
        let runtime = Builder::new_current_thread().enable_all().build().map_err(|e| {
            Error::Internal(format!(
                "Failed to create Tokio runtime for default settings store: {}",
                e
            ))
        })?;

        runtime
            .block_on(SqliteSettingsStore::new(path))
            .map_err(|e| {
                Error::Internal(format!("Failed to initialize default SettingsStore: {}", e))
            })
    };

    // block_on is not allowed on a runtime worker, so build on a fresh thread
    let store = match Handle::try_current() {
        Ok(_) => thread::spawn(move || init_store(path))
            .join()
            .map_err(|_| {
                Error::Internal(
                    "Worker thread panicked while creating default SettingsStore".to_string(),
                )
            })??,
        Err(_) => init_store(path)?,
    };

    let store: Arc<dyn SettingsStore> = Arc::new(store);
    Ok(store)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_settings_store(_data_dir: &Path) -> Result<Arc<dyn SettingsStore>> {
    Err(settings_store_missing_error())
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client() -> Result<Option<Arc<dyn HttpClient>>> {
    let client: Arc<dyn HttpClient> = Arc::new(bridge_desktop::ReqwestHttpClient::new()?);
    Ok(Some(client))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client() -> Result<Option<Arc<dyn HttpClient>>> {
    Ok(None)
}

#[cfg(feature = "desktop-shims")]
fn provide_default_file_system(data_dir: &Path) -> Option<Arc<dyn FileSystemAccess>> {
    Some(Arc::new(bridge_desktop::TokioFileSystem::with_data_directory(
        data_dir.to_path_buf(),
    )))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_file_system(_data_dir: &Path) -> Option<Arc<dyn FileSystemAccess>> {
    None
}

#[cfg(feature = "desktop-shims")]
fn provide_default_network_monitor() -> Option<Arc<dyn NetworkMonitor>> {
    Some(Arc::new(bridge_desktop::DesktopNetworkMonitor::new()))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_network_monitor() -> Option<Arc<dyn NetworkMonitor>> {
    None
}

/// Builder for constructing [`CoreConfig`] instances.
#[derive(Default)]
pub struct CoreConfigBuilder {
    data_dir: Option<PathBuf>,
    http_client: Option<Arc<dyn HttpClient>>,
    file_system: Option<Arc<dyn FileSystemAccess>>,
    settings_store: Option<Arc<dyn SettingsStore>>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    clock: Option<Arc<dyn Clock>>,
    event_buffer_size: Option<usize>,
    features: FeatureFlags,
}

impl CoreConfigBuilder {
    /// Sets the root directory for persisted state and media (required).
    ///
    /// ```
    /// use core_runtime::config::CoreConfig;
    ///
    /// let builder = CoreConfig::builder().data_dir("/var/lib/player");
    /// ```
    pub fn data_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.data_dir = Some(path.into());
        self
    }

    /// Sets the HTTP client implementation.
    ///
    /// If not provided, `ReqwestHttpClient` is used when the `desktop-shims`
    /// feature is enabled.
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Sets the file system access implementation.
    ///
    /// If not provided, a `TokioFileSystem` rooted at `data_dir` is used when
    /// the `desktop-shims` feature is enabled.
    pub fn file_system(mut self, fs: Arc<dyn FileSystemAccess>) -> Self {
        self.file_system = Some(fs);
        self
    }

    /// Sets the settings store implementation (required).
    pub fn settings_store(mut self, store: Arc<dyn SettingsStore>) -> Self {
        self.settings_store = Some(store);
        self
    }

    /// Sets the network monitor implementation (optional).
    ///
    /// Without one, the connection is treated as permanently unmetered.
    pub fn network_monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.network_monitor = Some(monitor);
        self
    }

    /// Overrides the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sets the event bus capacity.
    ///
    /// Default: 256
    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Enables or disables network awareness.
    ///
    /// Requires a `NetworkMonitor` unless the desktop default is available.
    ///
    /// Default: false
    pub fn enable_network_awareness(mut self, enabled: bool) -> Self {
        self.features.enable_network_awareness = enabled;
        self
    }

    /// Enables or disables quota eviction after each completion.
    ///
    /// Default: true
    pub fn enable_quota_eviction(mut self, enabled: bool) -> Self {
        self.features.enable_quota_eviction = enabled;
        self
    }

    pub fn features(mut self, features: FeatureFlags) -> Self {
        self.features = features;
        self
    }

    /// Builds the final `CoreConfig` instance.
    ///
    /// Returns an error if:
    /// - `data_dir` was not set
    /// - The settings store is missing and no desktop default is available
    /// - Configuration values are invalid
    /// - Feature flags are inconsistent with available bridges
    pub fn build(self) -> Result<CoreConfig> {
        let data_dir = self.data_dir.ok_or_else(|| {
            Error::Config("Data directory is required. Use .data_dir() to set it.".to_string())
        })?;

        let settings_store = match self.settings_store {
            Some(store) => store,
            None => provide_default_settings_store(&data_dir)?,
        };

        let http_client = match self.http_client {
            Some(client) => Some(client),
            None => provide_default_http_client()?,
        };

        let file_system = self
            .file_system
            .or_else(|| provide_default_file_system(&data_dir));

        let network_monitor = match self.network_monitor {
            Some(monitor) => Some(monitor),
            None if self.features.enable_network_awareness => provide_default_network_monitor(),
            None => None,
        };

        let config = CoreConfig {
            data_dir,
            http_client,
            file_system,
            settings_store,
            network_monitor,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            event_buffer_size: self.event_buffer_size.unwrap_or(DEFAULT_EVENT_BUFFER_SIZE),
            features: self.features,
        };

        config.validate()?;

        Ok(config)
    }
}
