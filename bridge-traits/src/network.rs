//! Network Monitoring Abstraction
//!
//! Provides reachability information and change notifications.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Network connection type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
    /// Cellular/mobile data connection
    Cellular,
    /// WiFi connection
    WiFi,
    /// Ethernet connection
    Ethernet,
    /// Other or unknown connection type
    Other,
}

/// Network connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    /// Connected to network
    Connected,
    /// Not connected to any network
    Disconnected,
    /// Connection status unknown or indeterminate
    Indeterminate,
}

/// Coarse reachability classification used for download policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    /// Connected on a network the user may treat as free (WiFi, Ethernet)
    Unmetered,
    /// Connected on a network with data limits or costs
    Metered,
    /// No usable connection
    Offline,
}

impl ConnectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unmetered => "unmetered",
            Self::Metered => "metered",
            Self::Offline => "offline",
        }
    }
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network information
#[derive(Debug, Clone)]
pub struct NetworkInfo {
    pub status: NetworkStatus,
    pub network_type: Option<NetworkType>,
    /// Whether the connection is metered (has data limits/costs)
    pub is_metered: bool,
    /// Whether the connection is considered expensive by the OS
    pub is_expensive: bool,
}

impl NetworkInfo {
    /// Connected on an unmetered link.
    pub fn unmetered(network_type: NetworkType) -> Self {
        Self {
            status: NetworkStatus::Connected,
            network_type: Some(network_type),
            is_metered: false,
            is_expensive: false,
        }
    }

    /// Connected on a metered link.
    pub fn metered(network_type: NetworkType) -> Self {
        Self {
            status: NetworkStatus::Connected,
            network_type: Some(network_type),
            is_metered: true,
            is_expensive: false,
        }
    }

    pub fn offline() -> Self {
        Self {
            status: NetworkStatus::Disconnected,
            network_type: None,
            is_metered: false,
            is_expensive: false,
        }
    }

    /// Classify this reading. Cellular links count as metered even when the
    /// OS does not flag them.
    pub fn connection_kind(&self) -> ConnectionKind {
        if self.status != NetworkStatus::Connected {
            return ConnectionKind::Offline;
        }
        if self.is_metered
            || self.is_expensive
            || matches!(self.network_type, Some(NetworkType::Cellular))
        {
            ConnectionKind::Metered
        } else {
            ConnectionKind::Unmetered
        }
    }
}

/// Network monitor trait
///
/// Lets the download queue pause transfers on metered links and resume them
/// once an unmetered link comes back.
///
/// # Platform Support
///
/// - **Desktop**: Polling connectivity probe
/// - **iOS**: Network framework (`NWPathMonitor`)
/// - **Android**: ConnectivityManager
#[async_trait]
pub trait NetworkMonitor: Send + Sync {
    /// Get current network information
    async fn get_network_info(&self) -> Result<NetworkInfo>;

    /// Subscribe to network status changes
    ///
    /// Implementations should emit an item whenever the reachability type
    /// changes. Duplicate readings are tolerated by consumers.
    async fn subscribe_changes(&self) -> Result<Box<dyn NetworkChangeStream>>;
}

/// Stream of network status changes
#[async_trait]
pub trait NetworkChangeStream: Send {
    /// Get the next network info update
    ///
    /// Returns `None` when the stream is closed.
    async fn next(&mut self) -> Option<NetworkInfo>;
}
