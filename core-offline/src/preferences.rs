//! User download preferences, polled from the settings store at decision points.

use bridge_traits::SettingsStore;
use std::sync::Arc;
use tracing::warn;

use crate::error::Result;

pub const REQUIRE_UNMETERED_KEY: &str = "downloads.require_unmetered";
pub const MAX_RETAINED_KEY: &str = "downloads.max_retained";

pub const DEFAULT_REQUIRE_UNMETERED: bool = true;
pub const DEFAULT_MAX_RETAINED_DOWNLOADS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadPreferences {
    /// Only download on unmetered connections
    pub require_unmetered: bool,
    /// Quota for downloaded resources; oldest are evicted beyond it
    pub max_retained_downloads: usize,
}

impl Default for DownloadPreferences {
    fn default() -> Self {
        Self {
            require_unmetered: DEFAULT_REQUIRE_UNMETERED,
            max_retained_downloads: DEFAULT_MAX_RETAINED_DOWNLOADS,
        }
    }
}

/// Reads and writes [`DownloadPreferences`] through a `SettingsStore`.
#[derive(Clone)]
pub struct PreferenceReader {
    store: Arc<dyn SettingsStore>,
}

impl PreferenceReader {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self { store }
    }

    /// Current preferences. Unreadable values fall back to the defaults.
    pub async fn current(&self) -> DownloadPreferences {
        let defaults = DownloadPreferences::default();

        let require_unmetered = match self.store.get_bool(REQUIRE_UNMETERED_KEY).await {
            Ok(value) => value.unwrap_or(defaults.require_unmetered),
            Err(e) => {
                warn!(key = REQUIRE_UNMETERED_KEY, error = %e, "Failed to read preference");
                defaults.require_unmetered
            }
        };

        let max_retained_downloads = match self.store.get_i64(MAX_RETAINED_KEY).await {
            Ok(Some(value)) if value >= 0 => value as usize,
            Ok(Some(value)) => {
                warn!(key = MAX_RETAINED_KEY, value, "Ignoring negative preference");
                defaults.max_retained_downloads
            }
            Ok(None) => defaults.max_retained_downloads,
            Err(e) => {
                warn!(key = MAX_RETAINED_KEY, error = %e, "Failed to read preference");
                defaults.max_retained_downloads
            }
        };

        DownloadPreferences {
            require_unmetered,
            max_retained_downloads,
        }
    }

    pub async fn set_require_unmetered(&self, value: bool) -> Result<()> {
        self.store.set_bool(REQUIRE_UNMETERED_KEY, value).await?;
        Ok(())
    }

    pub async fn set_max_retained_downloads(&self, value: usize) -> Result<()> {
        let value = i64::try_from(value).unwrap_or(i64::MAX);
        self.store.set_i64(MAX_RETAINED_KEY, value).await?;
        Ok(())
    }
}
