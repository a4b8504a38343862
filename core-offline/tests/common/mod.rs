//! Shared fakes for the offline queue integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::{
    BridgeError, Clock, NetworkChangeStream, NetworkInfo, NetworkMonitor, SettingsStore,
};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use core_offline::{
    DownloadedResource, OfflineError, ProgressFn, QueueConfig, QueueManager, ResourceId, Result,
    SourceDescriptor, StatusCache, TransferEngine, TransferProgress,
};
use core_runtime::events::EventBus;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

// ============================================================================
// Settings store
// ============================================================================

#[derive(Default)]
pub struct MemorySettingsStore {
    values: Mutex<HashMap<String, String>>,
    writes: Mutex<HashMap<String, usize>>,
}

impl MemorySettingsStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    /// How many times `key` has been written.
    pub fn writes(&self, key: &str) -> usize {
        self.writes.lock().get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn set_string(&self, key: &str, value: &str) -> BridgeResult<()> {
        *self.writes.lock().entry(key.to_string()).or_default() += 1;
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get_string(&self, key: &str) -> BridgeResult<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn set_bool(&self, key: &str, value: bool) -> BridgeResult<()> {
        self.set_string(key, &value.to_string()).await
    }

    async fn get_bool(&self, key: &str) -> BridgeResult<Option<bool>> {
        Ok(self.values.lock().get(key).and_then(|v| v.parse().ok()))
    }

    async fn set_i64(&self, key: &str, value: i64) -> BridgeResult<()> {
        self.set_string(key, &value.to_string()).await
    }

    async fn get_i64(&self, key: &str) -> BridgeResult<Option<i64>> {
        Ok(self.values.lock().get(key).and_then(|v| v.parse().ok()))
    }

    async fn delete(&self, key: &str) -> BridgeResult<()> {
        self.values.lock().remove(key);
        Ok(())
    }

    async fn has_key(&self, key: &str) -> BridgeResult<bool> {
        Ok(self.values.lock().contains_key(key))
    }

    async fn list_keys(&self) -> BridgeResult<Vec<String>> {
        Ok(self.values.lock().keys().cloned().collect())
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()),
        })
    }

    pub fn advance(&self, by: ChronoDuration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

// ============================================================================
// Network monitor
// ============================================================================

pub struct ScriptedNetworkMonitor {
    current: Mutex<NetworkInfo>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<NetworkInfo>>>,
}

impl ScriptedNetworkMonitor {
    pub fn new(initial: NetworkInfo) -> Arc<Self> {
        Arc::new(Self {
            current: Mutex::new(initial),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Updates the reading and pushes it to every subscriber.
    pub fn set(&self, info: NetworkInfo) {
        *self.current.lock() = info.clone();
        self.subscribers
            .lock()
            .retain(|tx| tx.send(info.clone()).is_ok());
    }
}

struct ChannelStream(mpsc::UnboundedReceiver<NetworkInfo>);

#[async_trait]
impl NetworkChangeStream for ChannelStream {
    async fn next(&mut self) -> Option<NetworkInfo> {
        self.0.recv().await
    }
}

#[async_trait]
impl NetworkMonitor for ScriptedNetworkMonitor {
    async fn get_network_info(&self) -> BridgeResult<NetworkInfo> {
        Ok(self.current.lock().clone())
    }

    async fn subscribe_changes(&self) -> BridgeResult<Box<dyn NetworkChangeStream>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        Ok(Box::new(ChannelStream(rx)))
    }
}

// ============================================================================
// Transfer engine
// ============================================================================

#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    /// Reports every whole percent on the way to success
    Stream,
    FailTransfer(&'static str),
    FailStorage(&'static str),
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory engine whose outcomes are scripted per resource.
pub struct ScriptedEngine {
    records: Mutex<HashMap<ResourceId, DownloadedResource>>,
    scripts: Mutex<HashMap<ResourceId, VecDeque<Step>>>,
    attempts: Mutex<HashMap<ResourceId, Vec<Instant>>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    sequence: AtomicUsize,
    delay: Mutex<Duration>,
    released: watch::Sender<bool>,
}

impl ScriptedEngine {
    pub fn new() -> Arc<Self> {
        let (released, _) = watch::channel(true);
        Arc::new(Self {
            records: Mutex::new(HashMap::new()),
            scripts: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            sequence: AtomicUsize::new(0),
            delay: Mutex::new(Duration::ZERO),
            released,
        })
    }

    pub fn with_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.delay.lock() = delay;
        self
    }

    pub fn script(&self, resource_id: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .insert(ResourceId::new(resource_id), steps.into());
    }

    /// Transfers started from now on block until [`release`](Self::release).
    pub fn hold(&self) {
        self.released.send_replace(false);
    }

    pub fn release(&self) {
        self.released.send_replace(true);
    }

    /// Pretends the resource is already on disk.
    pub fn mark_present(&self, resource_id: &str) {
        let record = self.record_for(&ResourceId::new(resource_id), "");
        self.records.lock().insert(record.resource_id.clone(), record);
    }

    /// Simulates the file vanishing out-of-band.
    pub fn forget(&self, resource_id: &str) {
        self.records.lock().remove(&ResourceId::new(resource_id));
    }

    pub fn is_present(&self, resource_id: &str) -> bool {
        self.records
            .lock()
            .contains_key(&ResourceId::new(resource_id))
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    pub fn attempts(&self, resource_id: &str) -> Vec<Instant> {
        self.attempts
            .lock()
            .get(&ResourceId::new(resource_id))
            .cloned()
            .unwrap_or_default()
    }

    fn store_record(&self, source: &SourceDescriptor, on_progress: &ProgressFn) -> PathBuf {
        let record = self.record_for(&source.resource_id, &source.url);
        let path = record.local_path.clone();
        self.records
            .lock()
            .insert(source.resource_id.clone(), record);
        on_progress(TransferProgress::complete(1_000));
        path
    }

    fn record_for(&self, resource_id: &ResourceId, url: &str) -> DownloadedResource {
        let order = self.sequence.fetch_add(1, Ordering::SeqCst) as i64;
        DownloadedResource {
            resource_id: resource_id.clone(),
            local_path: PathBuf::from(format!("/offline/{}.mp3", resource_id)),
            size_bytes: 1_000,
            downloaded_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
                + ChronoDuration::seconds(order),
            source_url: url.to_string(),
        }
    }
}

#[async_trait]
impl TransferEngine for ScriptedEngine {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn download(
        &self,
        source: &SourceDescriptor,
        on_progress: &ProgressFn,
    ) -> Result<PathBuf> {
        self.attempts
            .lock()
            .entry(source.resource_id.clone())
            .or_default()
            .push(Instant::now());

        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now_running, Ordering::SeqCst);
        let _running = RunningGuard(&self.running);

        let mut released = self.released.subscribe();
        let _ = released.wait_for(|ready| *ready).await;

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let step = self
            .scripts
            .lock()
            .get_mut(&source.resource_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Succeed);

        match step {
            Step::Succeed => {
                on_progress(TransferProgress {
                    bytes_transferred: 500,
                    bytes_total: Some(1_000),
                    percent: 50,
                });
                // Lets the queue observe the midpoint before completion
                tokio::time::sleep(Duration::from_millis(2)).await;
                Ok(self.store_record(source, on_progress))
            }
            Step::Stream => {
                for percent in 1..100u8 {
                    on_progress(TransferProgress {
                        bytes_transferred: u64::from(percent) * 10,
                        bytes_total: Some(1_000),
                        percent,
                    });
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                Ok(self.store_record(source, on_progress))
            }
            Step::FailTransfer(message) => Err(OfflineError::Transfer {
                resource_id: source.resource_id.clone(),
                message: message.to_string(),
                status: Some(503),
            }),
            Step::FailStorage(message) => Err(OfflineError::Storage(message.to_string())),
        }
    }

    async fn delete(&self, resource_id: &ResourceId) -> Result<()> {
        self.records.lock().remove(resource_id);
        Ok(())
    }

    async fn lookup(&self, resource_id: &ResourceId) -> Result<Option<DownloadedResource>> {
        Ok(self.records.lock().get(resource_id).cloned())
    }

    async fn list_downloaded(&self) -> Result<Vec<DownloadedResource>> {
        Ok(self.records.lock().values().cloned().collect())
    }

    async fn total_storage_used(&self) -> Result<u64> {
        Ok(self.records.lock().values().map(|r| r.size_bytes).sum())
    }

    async fn enforce_quota(&self, max_count: usize) -> Result<Vec<ResourceId>> {
        let mut records = self.records.lock();
        if records.len() <= max_count {
            return Ok(Vec::new());
        }

        let mut ordered: Vec<DownloadedResource> = records.values().cloned().collect();
        ordered.sort_by_key(|r| r.downloaded_at);
        let excess = ordered.len() - max_count;

        let evicted: Vec<ResourceId> = ordered
            .into_iter()
            .take(excess)
            .map(|r| r.resource_id)
            .collect();
        for id in &evicted {
            records.remove(id);
        }
        Ok(evicted)
    }
}

/// Engine that refuses to touch storage.
pub struct BrokenEngine;

#[async_trait]
impl TransferEngine for BrokenEngine {
    async fn initialize(&self) -> Result<()> {
        Err(OfflineError::Bridge(BridgeError::NotAvailable(
            "storage".to_string(),
        )))
    }

    async fn download(&self, source: &SourceDescriptor, _: &ProgressFn) -> Result<PathBuf> {
        Err(OfflineError::transfer(&source.resource_id, "unreachable"))
    }

    async fn delete(&self, _: &ResourceId) -> Result<()> {
        Ok(())
    }

    async fn lookup(&self, _: &ResourceId) -> Result<Option<DownloadedResource>> {
        Ok(None)
    }

    async fn list_downloaded(&self) -> Result<Vec<DownloadedResource>> {
        Err(OfflineError::Storage("unreadable".to_string()))
    }

    async fn total_storage_used(&self) -> Result<u64> {
        Ok(0)
    }

    async fn enforce_quota(&self, _: usize) -> Result<Vec<ResourceId>> {
        Ok(Vec::new())
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub manager: QueueManager,
    pub engine: Arc<ScriptedEngine>,
    pub store: Arc<MemorySettingsStore>,
    pub cache: Arc<StatusCache>,
    pub events: EventBus,
}

/// Fast retries so backoff tests finish quickly.
pub fn test_config() -> QueueConfig {
    QueueConfig::default()
        .with_base_backoff(Duration::from_millis(20))
        .with_max_backoff(Duration::from_millis(200))
}

pub fn source(resource_id: &str) -> SourceDescriptor {
    SourceDescriptor::new(
        resource_id,
        format!("https://cdn.test/audio/{}.mp3", resource_id),
    )
}

pub fn harness(config: QueueConfig) -> Harness {
    harness_with(config, ScriptedEngine::new(), MemorySettingsStore::new(), None)
}

pub fn harness_with(
    config: QueueConfig,
    engine: Arc<ScriptedEngine>,
    store: Arc<MemorySettingsStore>,
    clock: Option<Arc<dyn Clock>>,
) -> Harness {
    let cache = Arc::new(StatusCache::new());
    let events = EventBus::new(256);

    let mut builder = QueueManager::builder()
        .config(config)
        .engine(engine.clone())
        .settings_store(store.clone())
        .status_cache(cache.clone())
        .event_bus(events.clone());
    if let Some(clock) = clock {
        builder = builder.clock(clock);
    }

    Harness {
        manager: builder.build().unwrap(),
        engine,
        store,
        cache,
        events,
    }
}

/// Polls `check` until it returns true or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
