//! Network Monitoring Implementation

use async_trait::async_trait;
use bridge_traits::{
    error::Result,
    network::{
        ConnectionKind, NetworkChangeStream, NetworkInfo, NetworkMonitor, NetworkStatus,
        NetworkType,
    },
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

const PROBE_ADDRESS: &str = "1.1.1.1:53";
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Desktop network monitor implementation
///
/// Detects reachability with a TCP probe. Desktop links are reported as
/// unmetered; distinguishing tethered or metered WiFi needs OS-specific APIs
/// (NetworkManager, SystemConfiguration, Network List Manager).
pub struct DesktopNetworkMonitor {
    cached_info: Arc<Mutex<Option<NetworkInfo>>>,
    poll_interval: Duration,
}

impl DesktopNetworkMonitor {
    /// Create a new network monitor
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    /// Create a monitor whose change stream polls at `interval`
    pub fn with_poll_interval(interval: Duration) -> Self {
        Self {
            cached_info: Arc::new(Mutex::new(None)),
            poll_interval: interval,
        }
    }

    async fn check_connectivity() -> NetworkStatus {
        match tokio::time::timeout(PROBE_TIMEOUT, tokio::net::TcpStream::connect(PROBE_ADDRESS))
            .await
        {
            Ok(Ok(_)) => NetworkStatus::Connected,
            Ok(Err(_)) | Err(_) => NetworkStatus::Disconnected,
        }
    }

    async fn probe() -> NetworkInfo {
        match Self::check_connectivity().await {
            NetworkStatus::Connected => NetworkInfo::unmetered(NetworkType::Other),
            _ => NetworkInfo::offline(),
        }
    }
}

impl Default for DesktopNetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkMonitor for DesktopNetworkMonitor {
    async fn get_network_info(&self) -> Result<NetworkInfo> {
        let info = Self::probe().await;
        *self.cached_info.lock().await = Some(info.clone());
        debug!(status = ?info.status, "Network info updated");
        Ok(info)
    }

    async fn subscribe_changes(&self) -> Result<Box<dyn NetworkChangeStream>> {
        let last_kind = self
            .cached_info
            .lock()
            .await
            .as_ref()
            .map(NetworkInfo::connection_kind);

        Ok(Box::new(DesktopNetworkChangeStream {
            poll_interval: self.poll_interval,
            last_kind,
        }))
    }
}

/// Network change stream that polls for reachability changes
struct DesktopNetworkChangeStream {
    poll_interval: Duration,
    last_kind: Option<ConnectionKind>,
}

#[async_trait]
impl NetworkChangeStream for DesktopNetworkChangeStream {
    async fn next(&mut self) -> Option<NetworkInfo> {
        loop {
            tokio::time::sleep(self.poll_interval).await;

            let info = DesktopNetworkMonitor::probe().await;
            let kind = info.connection_kind();
            if self.last_kind != Some(kind) {
                self.last_kind = Some(kind);
                return Some(info);
            }
        }
    }
}
