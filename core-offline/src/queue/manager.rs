//! # Queue Manager
//!
//! The state machine and scheduler of the offline download queue.
//!
//! ## State machine
//!
//! ```text
//! pending ──▶ downloading ──▶ completed
//!    ▲  ▲          │  │
//!    │  └─ retry ──┘  └──▶ failed ──(manual retry)──▶ pending
//!    │                │
//!    └── resume ── paused ◀── pause (manual or network)
//! ```
//!
//! ## Scheduling
//!
//! Every trigger calls `request_pass`. Passes are coalesced: at most
//! one runs at a time and triggers arriving mid-pass cause exactly one more.
//! A pass starts the earliest eligible pending item while fewer than
//! `max_concurrent_downloads` transfers are in flight and the network policy
//! allows downloads.
//!
//! ## Attempts
//!
//! Each start increments the item's attempt token. Transfer results and
//! progress reports carry the token they were started with and are discarded
//! once the item has moved on (removed, paused, restarted). Removing or
//! pausing an item never cancels its transfer.
//!
//! ## Persistence
//!
//! All queue mutations go through `commit`, which re-reads the
//! persisted document under its lock, applies the change, saves it and
//! publishes the new snapshot to subscribers.

use bridge_traits::{Clock, ConnectionKind, NetworkMonitor, SettingsStore, SystemClock};
use chrono::{DateTime, Utc};
use core_runtime::events::{CoreEvent, DownloadEvent, EventBus};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::QueueConfig;
use crate::error::{OfflineError, Result};
use crate::models::{
    DownloadedResource, InitState, PauseReason, QueueItem, QueueItemId, QueueState, QueueStats,
    QueueStatus, ResourceId, SourceDescriptor,
};
use crate::persistence::PersistedDocument;
use crate::preferences::{DownloadPreferences, PreferenceReader};
use crate::status_cache::StatusCache;
use crate::subscription::{ListenerRegistry, Subscription};
use crate::transfer::{TransferEngine, TransferProgress};

use super::activity::Activity;
use super::policy::{downloads_allowed, NetworkState};

#[derive(Default)]
struct PassState {
    running: bool,
    rerun: bool,
}

enum FailureOutcome {
    Retry { item: QueueItem, delay: Duration },
    Failed(QueueItem),
}

enum Existing {
    Requeued(QueueItem),
    DroppedCompleted,
}

/// Explicitly owned download queue. Cloning shares the same queue.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: QueueConfig,
    quota_eviction: bool,
    document: PersistedDocument<QueueState>,
    engine: Arc<dyn TransferEngine>,
    status_cache: Arc<StatusCache>,
    preferences: PreferenceReader,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    clock: Arc<dyn Clock>,
    event_bus: Option<EventBus>,
    listeners: Arc<ListenerRegistry<QueueState>>,
    snapshots: watch::Sender<Arc<QueueState>>,

    state: Mutex<InitState>,
    start_lock: tokio::sync::Mutex<()>,
    /// Serializes commit + publish so snapshots reach subscribers in order
    commit_lock: tokio::sync::Mutex<()>,
    network: Mutex<NetworkState>,
    /// Items waiting for their backoff timer
    retry_gate: Mutex<HashSet<QueueItemId>>,
    retry_timers: Mutex<HashMap<QueueItemId, JoinHandle<()>>>,
    /// Resources with a transfer still running, including superseded ones
    in_flight: Mutex<HashSet<ResourceId>>,
    pass: Mutex<PassState>,
    activity: Arc<Activity>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

/// Builder for [`QueueManager`].
#[derive(Default)]
pub struct QueueManagerBuilder {
    config: Option<QueueConfig>,
    engine: Option<Arc<dyn TransferEngine>>,
    settings_store: Option<Arc<dyn SettingsStore>>,
    status_cache: Option<Arc<StatusCache>>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    clock: Option<Arc<dyn Clock>>,
    event_bus: Option<EventBus>,
    quota_eviction: Option<bool>,
}

impl QueueManagerBuilder {
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn engine(mut self, engine: Arc<dyn TransferEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Store holding the queue document and the user preferences (required).
    pub fn settings_store(mut self, store: Arc<dyn SettingsStore>) -> Self {
        self.settings_store = Some(store);
        self
    }

    pub fn status_cache(mut self, cache: Arc<StatusCache>) -> Self {
        self.status_cache = Some(cache);
        self
    }

    /// Without a monitor the connection is treated as unmetered.
    pub fn network_monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.network_monitor = Some(monitor);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Evict the oldest downloads after each completion (default: enabled).
    pub fn quota_eviction(mut self, enabled: bool) -> Self {
        self.quota_eviction = Some(enabled);
        self
    }

    pub fn build(self) -> Result<QueueManager> {
        let config = self.config.unwrap_or_default();
        config.validate().map_err(OfflineError::Config)?;

        let engine = self
            .engine
            .ok_or_else(|| OfflineError::Config("a transfer engine is required".to_string()))?;
        let settings_store = self
            .settings_store
            .ok_or_else(|| OfflineError::Config("a settings store is required".to_string()))?;

        let (snapshots, _) = watch::channel(Arc::new(QueueState::default()));

        let inner = Inner {
            document: PersistedDocument::new(settings_store.clone(), config.queue_key.clone()),
            preferences: PreferenceReader::new(settings_store),
            engine,
            status_cache: self.status_cache.unwrap_or_default(),
            network_monitor: self.network_monitor,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            event_bus: self.event_bus,
            quota_eviction: self.quota_eviction.unwrap_or(true),
            listeners: ListenerRegistry::new(),
            snapshots,
            state: Mutex::new(InitState::Uninitialized),
            start_lock: tokio::sync::Mutex::new(()),
            commit_lock: tokio::sync::Mutex::new(()),
            network: Mutex::new(NetworkState::new(ConnectionKind::Unmetered)),
            retry_gate: Mutex::new(HashSet::new()),
            retry_timers: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            pass: Mutex::new(PassState::default()),
            activity: Activity::new(),
            watcher: Mutex::new(None),
            config,
        };

        Ok(QueueManager {
            inner: Arc::new(inner),
        })
    }
}

impl QueueManager {
    pub fn builder() -> QueueManagerBuilder {
        QueueManagerBuilder::default()
    }

    pub fn init_state(&self) -> InitState {
        self.inner.init_state()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn status_cache(&self) -> &Arc<StatusCache> {
        &self.inner.status_cache
    }

    /// Restores the persisted queue and begins processing. Idempotent.
    ///
    /// Items left `downloading` by a previous process restart from zero.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner.start_lock.lock().await;
        if inner.init_state() == InitState::Ready {
            return Ok(());
        }

        *inner.state.lock() = InitState::Initializing;
        match inner.bootstrap().await {
            Ok(()) => {
                *inner.state.lock() = InitState::Ready;
                info!(
                    max_concurrent = inner.config.max_concurrent_downloads,
                    "Download queue started"
                );
                inner.request_pass();
                Ok(())
            }
            Err(e) => {
                *inner.state.lock() = InitState::Uninitialized;
                Err(e)
            }
        }
    }

    /// Stops scheduling. Transfers already running finish on their own.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let _guard = inner.start_lock.lock().await;
        *inner.state.lock() = InitState::Uninitialized;

        if let Some(watcher) = inner.watcher.lock().take() {
            watcher.abort();
        }
        for (_, timer) in inner.retry_timers.lock().drain() {
            timer.abort();
        }
        inner.retry_gate.lock().clear();
        info!("Download queue stopped");
    }

    /// Queues `source` for download.
    ///
    /// Never fails with a duplicate: an outstanding item for the same
    /// resource is returned as is, and a resource already on disk yields a
    /// completed item that is not stored.
    #[instrument(skip(self, source), fields(resource_id = %source.resource_id))]
    pub async fn enqueue(&self, source: SourceDescriptor) -> Result<QueueItem> {
        let inner = &self.inner;
        let resource_id = source.resource_id.clone();

        let mut outstanding: Option<QueueItem> = None;
        let existing = inner
            .commit(|state, _| {
                let Some(item) = state.find_by_resource_mut(&resource_id) else {
                    return Ok(None);
                };
                let status = item.status;
                match status {
                    QueueStatus::Pending | QueueStatus::Downloading => {
                        outstanding = Some(item.clone());
                        Ok(None)
                    }
                    QueueStatus::Failed => {
                        item.source = source.clone();
                        item.reset_for_retry()?;
                        Ok(Some(Existing::Requeued(item.clone())))
                    }
                    QueueStatus::Paused => {
                        item.source = source.clone();
                        item.resume()?;
                        Ok(Some(Existing::Requeued(item.clone())))
                    }
                    QueueStatus::Completed => {
                        let id = item.id;
                        state.remove(id);
                        Ok(Some(Existing::DroppedCompleted))
                    }
                }
            })
            .await?;

        if let Some(item) = outstanding {
            debug!(item_id = %item.id, status = %item.status, "Resource already queued");
            return Ok(item);
        }

        let dropped_completed = match existing {
            Some(Existing::Requeued(item)) => {
                inner.cancel_retry(item.id);
                inner.announce_queued(&item);
                inner.request_pass();
                return Ok(item);
            }
            Some(Existing::DroppedCompleted) => true,
            None => false,
        };

        match inner.engine.lookup(&resource_id).await {
            Ok(Some(record)) => {
                if dropped_completed {
                    inner.status_cache.remove_queue_item(&resource_id);
                }
                inner
                    .status_cache
                    .mark_downloaded(&resource_id, record.local_path);
                debug!("Resource already downloaded");
                return Ok(QueueItem::already_downloaded(
                    source,
                    record.size_bytes,
                    inner.clock.now(),
                ));
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Could not check for an existing download"),
        }

        let mut raced: Option<QueueItem> = None;
        let max_retries = inner.config.max_retries;
        let created = inner
            .commit(|state, now| {
                if let Some(item) = state.find_by_resource(&resource_id) {
                    raced = Some(item.clone());
                    return Ok(None);
                }
                let item = QueueItem::new(source.clone(), max_retries, now);
                state.insert(item.clone())?;
                Ok(Some(item))
            })
            .await?;

        if let Some(item) = raced {
            return Ok(item);
        }
        let item = created.ok_or_else(|| OfflineError::ItemNotFound(resource_id.to_string()))?;

        info!(item_id = %item.id, "Download queued");
        inner.announce_queued(&item);
        inner.request_pass();
        Ok(item)
    }

    /// Moves a pending or downloading item to `paused`.
    #[instrument(skip(self), fields(item_id = %id))]
    pub async fn pause(&self, id: QueueItemId, reason: PauseReason) -> Result<QueueItem> {
        let inner = &self.inner;
        let item = inner
            .commit(|state, _| {
                let item = state
                    .find_mut(id)
                    .ok_or_else(|| OfflineError::ItemNotFound(id.to_string()))?;
                item.pause(reason)?;
                let paused = item.clone();
                state.active_resource_ids.remove(&paused.resource_id);
                Ok(Some(paused))
            })
            .await?
            .ok_or_else(|| OfflineError::ItemNotFound(id.to_string()))?;

        inner.cancel_retry(id);
        inner.announce_paused(&item);
        inner.request_pass();
        Ok(item)
    }

    /// Moves a paused item back to `pending`.
    #[instrument(skip(self), fields(item_id = %id))]
    pub async fn resume(&self, id: QueueItemId) -> Result<QueueItem> {
        let inner = &self.inner;
        let item = inner
            .commit(|state, _| {
                let item = state
                    .find_mut(id)
                    .ok_or_else(|| OfflineError::ItemNotFound(id.to_string()))?;
                item.resume()?;
                Ok(Some(item.clone()))
            })
            .await?
            .ok_or_else(|| OfflineError::ItemNotFound(id.to_string()))?;

        inner.announce_resumed(&item);
        inner.request_pass();
        Ok(item)
    }

    /// Manual retry of a failed item. The automatic retry budget restarts.
    #[instrument(skip(self), fields(item_id = %id))]
    pub async fn retry_download(&self, id: QueueItemId) -> Result<QueueItem> {
        let inner = &self.inner;
        let item = inner
            .commit(|state, _| {
                let item = state
                    .find_mut(id)
                    .ok_or_else(|| OfflineError::ItemNotFound(id.to_string()))?;
                item.reset_for_retry()?;
                Ok(Some(item.clone()))
            })
            .await?
            .ok_or_else(|| OfflineError::ItemNotFound(id.to_string()))?;

        inner.announce_queued(&item);
        inner.request_pass();
        Ok(item)
    }

    /// Drops an item in any state. A running transfer is left to finish and
    /// its result is ignored.
    #[instrument(skip(self), fields(item_id = %id))]
    pub async fn remove(&self, id: QueueItemId) -> Result<QueueItem> {
        let inner = &self.inner;
        let item = inner
            .commit(|state, _| {
                state
                    .remove(id)
                    .map(Some)
                    .ok_or_else(|| OfflineError::ItemNotFound(id.to_string()))
            })
            .await?
            .ok_or_else(|| OfflineError::ItemNotFound(id.to_string()))?;

        inner.cancel_retry(id);
        inner.status_cache.remove_queue_item(&item.resource_id);
        inner.emit(DownloadEvent::Removed {
            item_id: item.id.to_string(),
            resource_id: item.resource_id.to_string(),
        });
        inner.request_pass();
        Ok(item)
    }

    /// Drops every completed item; returns how many were removed.
    pub async fn clear_completed(&self) -> Result<usize> {
        let inner = &self.inner;
        let removed = inner
            .commit(|state, _| {
                let removed = state.clear_completed();
                Ok((!removed.is_empty()).then_some(removed))
            })
            .await?
            .unwrap_or_default();

        for item in &removed {
            inner.status_cache.remove_queue_item(&item.resource_id);
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "Cleared completed downloads");
        }
        Ok(removed.len())
    }

    /// Deletes a downloaded resource and any completed item for it.
    #[instrument(skip(self, resource_id), fields(resource_id = %resource_id))]
    pub async fn delete_download(&self, resource_id: &ResourceId) -> Result<()> {
        let inner = &self.inner;
        inner.engine.delete(resource_id).await?;

        inner
            .commit(|state, _| {
                let completed: Vec<QueueItemId> = state
                    .items
                    .iter()
                    .filter(|item| {
                        &item.resource_id == resource_id && item.status == QueueStatus::Completed
                    })
                    .map(|item| item.id)
                    .collect();
                if completed.is_empty() {
                    return Ok(None);
                }
                for id in completed {
                    state.remove(id);
                }
                Ok(Some(()))
            })
            .await?;

        inner.status_cache.mark_deleted(resource_id);
        inner.emit(DownloadEvent::Deleted {
            resource_id: resource_id.to_string(),
        });
        Ok(())
    }

    /// Current queue, without completed items past their retention.
    pub async fn get_state(&self) -> Result<QueueState> {
        self.inner.fresh_state().await
    }

    pub async fn get_stats(&self) -> Result<QueueStats> {
        let inner = &self.inner;
        let state = inner.fresh_state().await?;
        Ok(state.stats(inner.config.max_concurrent_downloads, &inner.clock.day_key()))
    }

    pub async fn get_item(&self, id: QueueItemId) -> Result<QueueItem> {
        self.inner
            .fresh_state()
            .await?
            .find(id)
            .cloned()
            .ok_or_else(|| OfflineError::ItemNotFound(id.to_string()))
    }

    pub async fn find_by_resource(&self, resource_id: &ResourceId) -> Result<Option<QueueItem>> {
        Ok(self
            .inner
            .fresh_state()
            .await?
            .find_by_resource(resource_id)
            .cloned())
    }

    /// Calls `listener` with the full queue after every change.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&QueueState) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(listener)
    }

    /// Latest published queue snapshot.
    pub fn watch(&self) -> watch::Receiver<Arc<QueueState>> {
        self.inner.snapshots.subscribe()
    }

    /// Feeds a reachability reading. Readings of an unchanged kind are ignored.
    pub fn handle_network_change(&self, kind: ConnectionKind) {
        self.inner.observe_network(kind);
    }

    /// Resolves once no pass, transfer or retry timer is outstanding.
    pub async fn wait_until_idle(&self) {
        self.inner.activity.wait_idle().await;
    }
}

impl Inner {
    fn init_state(&self) -> InitState {
        *self.state.lock()
    }

    fn retention(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.completed_retention)
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
    }

    fn emit(&self, event: DownloadEvent) {
        if let Some(bus) = &self.event_bus {
            // No subscribers is fine
            let _ = bus.emit(CoreEvent::Download(event));
        }
    }

    fn publish(&self, state: QueueState) {
        let snapshot = Arc::new(state);
        self.snapshots.send_replace(Arc::clone(&snapshot));
        self.listeners.notify(snapshot.as_ref());
    }

    /// Read-modify-write of the queue document.
    ///
    /// The closure returns `Ok(None)` when it changed nothing; the document
    /// is then neither saved nor published.
    async fn commit<R, F>(&self, mutate: F) -> Result<Option<R>>
    where
        F: FnOnce(&mut QueueState, DateTime<Utc>) -> Result<Option<R>>,
    {
        let _guard = self.commit_lock.lock().await;
        let now = self.clock.now();

        let outcome = self
            .document
            .try_update(|state| {
                let result = mutate(state, now)?;
                if result.is_some() {
                    state.last_updated = Some(now);
                }
                Ok(result)
            })
            .await?;

        Ok(outcome.map(|(result, state)| {
            self.publish(state);
            result
        }))
    }

    async fn fresh_state(&self) -> Result<QueueState> {
        let retention = self.retention();
        let pruned = {
            let _guard = self.commit_lock.lock().await;
            let now = self.clock.now();
            let pruned = self
                .document
                .try_update(|state| {
                    let expired = state.prune_expired(now, retention);
                    if expired.is_empty() {
                        return Ok(None);
                    }
                    state.last_updated = Some(now);
                    Ok(Some(expired))
                })
                .await?;
            if let Some((_, state)) = &pruned {
                self.publish(state.clone());
            }
            pruned
        };

        match pruned {
            Some((expired, state)) => {
                for item in &expired {
                    self.status_cache.remove_queue_item(&item.resource_id);
                }
                debug!(count = expired.len(), "Pruned expired completed items");
                Ok(state)
            }
            None => self.document.load().await,
        }
    }

    async fn bootstrap(self: &Arc<Self>) -> Result<()> {
        let retention = self.retention();
        self.retry_gate.lock().clear();

        let state = {
            let _guard = self.commit_lock.lock().await;
            let now = self.clock.now();
            let ((orphans, expired), state) = self
                .document
                .update(|state| {
                    let orphans = state
                        .items
                        .iter_mut()
                        .map(QueueItem::recover_orphan)
                        .filter(|reset| *reset)
                        .count();
                    state.active_resource_ids.clear();
                    let expired = state.prune_expired(now, retention).len();
                    state.last_updated = Some(now);
                    (orphans, expired)
                })
                .await?;

            if orphans > 0 {
                info!(orphans, "Reset interrupted downloads to pending");
            }
            if expired > 0 {
                debug!(expired, "Pruned expired completed items");
            }
            self.publish(state.clone());
            state
        };

        let downloaded = match self.engine.list_downloaded().await {
            Ok(downloaded) => downloaded,
            Err(e) => {
                warn!(error = %e, "Could not list downloaded resources");
                Vec::new()
            }
        };
        self.status_cache.initialize(&downloaded, &state.items);

        let kind = self.initial_connection_kind().await;
        *self.network.lock() = NetworkState::new(kind);
        self.spawn_network_watcher().await;

        Ok(())
    }

    async fn initial_connection_kind(&self) -> ConnectionKind {
        let Some(monitor) = &self.network_monitor else {
            return ConnectionKind::Unmetered;
        };
        match monitor.get_network_info().await {
            Ok(info) => info.connection_kind(),
            Err(e) => {
                warn!(error = %e, "Could not read network state, assuming offline");
                ConnectionKind::Offline
            }
        }
    }

    async fn spawn_network_watcher(self: &Arc<Self>) {
        let Some(monitor) = self.network_monitor.clone() else {
            return;
        };
        let mut changes = match monitor.subscribe_changes().await {
            Ok(changes) => changes,
            Err(e) => {
                warn!(error = %e, "Could not subscribe to network changes");
                return;
            }
        };

        let queue: Weak<Inner> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(info) = changes.next().await {
                let Some(inner) = queue.upgrade() else {
                    break;
                };
                inner.observe_network(info.connection_kind());
            }
            debug!("Network change stream closed");
        });

        if let Some(previous) = self.watcher.lock().replace(handle) {
            previous.abort();
        }
    }

    fn observe_network(self: &Arc<Self>, kind: ConnectionKind) {
        if !self.network.lock().observe(kind) {
            debug!(kind = %kind, "Ignoring unchanged reachability");
            return;
        }
        info!(kind = %kind, "Reachability changed");
        self.request_pass();
    }

    fn cancel_retry(&self, id: QueueItemId) {
        self.retry_gate.lock().remove(&id);
        if let Some(timer) = self.retry_timers.lock().remove(&id) {
            timer.abort();
        }
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    fn request_pass(self: &Arc<Self>) {
        {
            let mut pass = self.pass.lock();
            if pass.running {
                pass.rerun = true;
                return;
            }
            pass.running = true;
        }

        let guard = self.activity.enter();
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            loop {
                if let Err(e) = inner.run_pass().await {
                    warn!(error = %e, "Scheduling pass failed");
                }

                let again = {
                    let mut pass = inner.pass.lock();
                    if pass.rerun {
                        pass.rerun = false;
                        true
                    } else {
                        pass.running = false;
                        false
                    }
                };
                if !again {
                    break;
                }
            }
        });
    }

    async fn run_pass(self: &Arc<Self>) -> Result<()> {
        if self.init_state() != InitState::Ready {
            return Ok(());
        }

        let preferences = self.preferences.current().await;
        if !self.apply_policy(&preferences).await? {
            return Ok(());
        }

        let ceiling = self.config.max_concurrent_downloads;
        while self.init_state() == InitState::Ready {
            let mut claimed: Option<ResourceId> = None;
            let started = self
                .commit(|state, now| {
                    let mut in_flight = self.in_flight.lock();
                    if state.active_resource_ids.len().max(in_flight.len()) >= ceiling {
                        return Ok(None);
                    }

                    let next = {
                        let gate = self.retry_gate.lock();
                        state
                            .next_pending(|item| {
                                !gate.contains(&item.id) && !in_flight.contains(&item.resource_id)
                            })
                            .map(|item| item.id)
                    };
                    let Some(id) = next else {
                        return Ok(None);
                    };
                    let Some(item) = state.find_mut(id) else {
                        return Ok(None);
                    };

                    let attempt = item.begin_attempt(now);
                    let started = item.clone();
                    in_flight.insert(started.resource_id.clone());
                    claimed = Some(started.resource_id.clone());
                    state
                        .active_resource_ids
                        .insert(started.resource_id.clone());
                    Ok(Some((started, attempt)))
                })
                .await;

            let started = match started {
                Ok(started) => started,
                Err(e) => {
                    if let Some(resource_id) = claimed {
                        self.in_flight.lock().remove(&resource_id);
                    }
                    return Err(e);
                }
            };
            let Some((item, attempt)) = started else {
                break;
            };

            debug!(item_id = %item.id, resource_id = %item.resource_id, attempt, "Starting transfer");
            self.status_cache.update_queue_item(&item);
            self.emit(DownloadEvent::Started {
                item_id: item.id.to_string(),
                resource_id: item.resource_id.to_string(),
                attempt,
            });
            self.spawn_transfer(item, attempt);
        }

        Ok(())
    }

    /// Re-evaluates the network policy, pausing or resuming on a flip.
    async fn apply_policy(self: &Arc<Self>, preferences: &DownloadPreferences) -> Result<bool> {
        let (kind, allowed, flip) = {
            let mut network = self.network.lock();
            let kind = network.kind;
            let allowed = downloads_allowed(preferences, kind);
            (kind, allowed, network.settle(allowed))
        };

        let Some(previous) = flip else {
            return Ok(allowed);
        };

        if previous.is_some() {
            info!(kind = %kind, downloads_allowed = allowed, "Download policy changed");
            self.emit(DownloadEvent::PolicyChanged {
                downloads_allowed: allowed,
            });
        }

        let applied = if allowed {
            self.resume_network_paused().await
        } else {
            self.pause_for_network().await
        };
        if let Err(e) = applied {
            self.network.lock().downloads_allowed = previous;
            return Err(e);
        }

        Ok(allowed)
    }

    async fn pause_for_network(&self) -> Result<()> {
        let paused = self
            .commit(|state, _| {
                let mut paused = Vec::new();
                for item in state
                    .items
                    .iter_mut()
                    .filter(|item| item.status == QueueStatus::Downloading)
                {
                    item.pause(PauseReason::Network)?;
                    paused.push(item.clone());
                }
                for item in &paused {
                    state.active_resource_ids.remove(&item.resource_id);
                }
                Ok((!paused.is_empty()).then_some(paused))
            })
            .await?
            .unwrap_or_default();

        for item in &paused {
            self.announce_paused(item);
        }
        Ok(())
    }

    async fn resume_network_paused(&self) -> Result<()> {
        let resumed = self
            .commit(|state, _| {
                let mut resumed = Vec::new();
                for item in state.items.iter_mut().filter(|item| {
                    item.status == QueueStatus::Paused
                        && item.paused_reason == Some(PauseReason::Network)
                }) {
                    item.resume()?;
                    resumed.push(item.clone());
                }
                Ok((!resumed.is_empty()).then_some(resumed))
            })
            .await?
            .unwrap_or_default();

        for item in &resumed {
            self.announce_resumed(item);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transfers
    // ------------------------------------------------------------------

    fn spawn_transfer(self: &Arc<Self>, item: QueueItem, attempt: u32) {
        let guard = self.activity.enter();
        let inner = Arc::clone(self);

        tokio::spawn(async move {
            let _guard = guard;

            let (progress_tx, progress_rx) = mpsc::unbounded_channel();
            let forwarder = tokio::spawn(Arc::clone(&inner).forward_progress(
                item.id,
                item.resource_id.clone(),
                attempt,
                progress_rx,
            ));

            let on_progress = move |progress: TransferProgress| {
                let _ = progress_tx.send(progress);
            };
            let result = inner.engine.download(&item.source, &on_progress).await;
            drop(on_progress);

            if let Err(e) = forwarder.await {
                warn!(error = %e, "Progress forwarder stopped");
            }

            inner.finish_transfer(&item, attempt, result).await;
            inner.in_flight.lock().remove(&item.resource_id);
            inner.request_pass();
        });
    }

    /// Persists progress every `progress_persist_step` percent. Steps in
    /// between only patch the status cache and go out as events.
    async fn forward_progress(
        self: Arc<Self>,
        id: QueueItemId,
        resource_id: ResourceId,
        attempt: u32,
        mut updates: mpsc::UnboundedReceiver<TransferProgress>,
    ) {
        let step = self.config.progress_persist_step.max(1);
        let mut persisted = 0u8;

        while let Some(mut progress) = updates.recv().await {
            // Only the latest report matters once writes fall behind
            while let Ok(newer) = updates.try_recv() {
                progress = newer;
            }
            // Completion sets 100
            if progress.percent >= 100 {
                continue;
            }

            if progress.percent < persisted.saturating_add(step) {
                if self
                    .status_cache
                    .update_progress(&resource_id, id, progress.percent)
                {
                    self.emit(DownloadEvent::Progress {
                        item_id: id.to_string(),
                        resource_id: resource_id.to_string(),
                        percent: progress.percent,
                        bytes_transferred: progress.bytes_transferred,
                        bytes_total: progress.bytes_total,
                    });
                }
                continue;
            }

            let applied = self
                .commit(|state, _| {
                    let Some(item) = state.find_mut(id) else {
                        return Ok(None);
                    };
                    let changed = item.apply_progress(
                        attempt,
                        progress.percent,
                        progress.bytes_transferred,
                        progress.bytes_total,
                    );
                    Ok(changed.then(|| item.clone()))
                })
                .await;

            match applied {
                Ok(Some(item)) => {
                    persisted = item.progress_percent;
                    self.status_cache.update_queue_item(&item);
                    self.emit(DownloadEvent::Progress {
                        item_id: item.id.to_string(),
                        resource_id: item.resource_id.to_string(),
                        percent: item.progress_percent,
                        bytes_transferred: item.bytes_transferred,
                        bytes_total: item.bytes_total,
                    });
                }
                Ok(None) => {}
                Err(e) => warn!(item_id = %id, error = %e, "Failed to record progress"),
            }
        }
    }

    async fn finish_transfer(
        self: &Arc<Self>,
        item: &QueueItem,
        attempt: u32,
        result: Result<PathBuf>,
    ) {
        let recorded = match result {
            Ok(_) => match self.engine.lookup(&item.resource_id).await {
                Ok(Some(record)) => self.complete(item, attempt, record).await,
                Ok(None) => {
                    let missing =
                        OfflineError::Storage("transferred file is missing".to_string());
                    self.fail_attempt(item, attempt, missing).await
                }
                Err(e) => self.fail_attempt(item, attempt, e).await,
            },
            Err(e) => self.fail_attempt(item, attempt, e).await,
        };

        if let Err(e) = recorded {
            warn!(
                item_id = %item.id,
                resource_id = %item.resource_id,
                error = %e,
                "Failed to record transfer outcome"
            );
        }
    }

    async fn complete(
        &self,
        item: &QueueItem,
        attempt: u32,
        record: DownloadedResource,
    ) -> Result<()> {
        // The file exists whether or not the item still wants it
        self.status_cache
            .mark_downloaded(&item.resource_id, record.local_path.clone());

        let day = self.clock.day_key();
        let completed = self
            .commit(|state, now| {
                let Some(current) = state.find_mut(item.id) else {
                    return Ok(None);
                };
                if !current.is_current_attempt(attempt) {
                    return Ok(None);
                }
                current.complete(record.size_bytes, now);
                let done = current.clone();
                state.active_resource_ids.remove(&done.resource_id);
                state.record_completion(&day);
                Ok(Some(done))
            })
            .await?;

        match completed {
            Some(done) => {
                info!(
                    item_id = %done.id,
                    resource_id = %done.resource_id,
                    bytes = record.size_bytes,
                    "Download completed"
                );
                self.status_cache.update_queue_item(&done);
                self.emit(DownloadEvent::Completed {
                    item_id: done.id.to_string(),
                    resource_id: done.resource_id.to_string(),
                    local_path: record.local_path.display().to_string(),
                });
            }
            None => debug!(item_id = %item.id, attempt, "Discarding result of a superseded attempt"),
        }

        if self.quota_eviction {
            self.enforce_quota().await;
        }
        Ok(())
    }

    async fn enforce_quota(&self) {
        let max = self.preferences.current().await.max_retained_downloads;
        match self.engine.enforce_quota(max).await {
            Ok(evicted) => {
                for resource_id in evicted {
                    self.status_cache.mark_deleted(&resource_id);
                    self.emit(DownloadEvent::Evicted {
                        resource_id: resource_id.to_string(),
                    });
                }
            }
            Err(e) => warn!(error = %e, max_retained = max, "Quota enforcement failed"),
        }
    }

    async fn fail_attempt(
        self: &Arc<Self>,
        item: &QueueItem,
        attempt: u32,
        error: OfflineError,
    ) -> Result<()> {
        let message = error.to_string();
        let retryable = error.is_retryable();

        let outcome = self
            .commit(|state, now| {
                let Some(current) = state.find_mut(item.id) else {
                    return Ok(None);
                };
                if !current.is_current_attempt(attempt) {
                    return Ok(None);
                }

                current.record_failure(message.clone());
                let outcome = if retryable && current.can_retry() {
                    let delay = self.config.backoff_for(current.retry_count);
                    let due = chrono::Duration::from_std(delay)
                        .map(|delay| now + delay)
                        .unwrap_or(now);
                    current.schedule_retry(due);
                    // Gated before the document lock is released
                    self.retry_gate.lock().insert(current.id);
                    FailureOutcome::Retry {
                        item: current.clone(),
                        delay,
                    }
                } else {
                    current.fail();
                    FailureOutcome::Failed(current.clone())
                };

                state.active_resource_ids.remove(&item.resource_id);
                if matches!(outcome, FailureOutcome::Retry { .. }) {
                    state.move_to_back(item.id);
                }
                Ok(Some(outcome))
            })
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                self.retry_gate.lock().remove(&item.id);
                return Err(e);
            }
        };

        match outcome {
            Some(FailureOutcome::Retry { item, delay }) => {
                warn!(
                    item_id = %item.id,
                    resource_id = %item.resource_id,
                    retry_count = item.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "Transfer failed, retry scheduled"
                );
                self.status_cache.update_queue_item(&item);
                self.emit(DownloadEvent::RetryScheduled {
                    item_id: item.id.to_string(),
                    resource_id: item.resource_id.to_string(),
                    retry_count: item.retry_count,
                    delay_ms: delay.as_millis() as u64,
                    error: message,
                });
                self.schedule_retry_timer(item.id, delay);
            }
            Some(FailureOutcome::Failed(item)) => {
                warn!(
                    item_id = %item.id,
                    resource_id = %item.resource_id,
                    retry_count = item.retry_count,
                    error = %message,
                    "Download failed"
                );
                self.status_cache.update_queue_item(&item);
                self.emit(DownloadEvent::Failed {
                    item_id: item.id.to_string(),
                    resource_id: item.resource_id.to_string(),
                    retry_count: item.retry_count,
                    error: message,
                });
            }
            None => debug!(item_id = %item.id, attempt, "Discarding failure of a superseded attempt"),
        }

        Ok(())
    }

    fn schedule_retry_timer(self: &Arc<Self>, id: QueueItemId, delay: Duration) {
        let guard = self.activity.enter();
        let inner = Arc::clone(self);

        let timer = tokio::spawn(async move {
            let _guard = guard;
            tokio::time::sleep(delay).await;
            inner.retry_timers.lock().remove(&id);
            inner.retry_gate.lock().remove(&id);
            inner.request_pass();
        });

        if let Some(previous) = self.retry_timers.lock().insert(id, timer) {
            previous.abort();
        }
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    fn announce_queued(&self, item: &QueueItem) {
        self.status_cache.update_queue_item(item);
        self.emit(DownloadEvent::Queued {
            item_id: item.id.to_string(),
            resource_id: item.resource_id.to_string(),
        });
    }

    fn announce_paused(&self, item: &QueueItem) {
        info!(
            item_id = %item.id,
            reason = item.paused_reason.map(|r| r.as_str()).unwrap_or("unknown"),
            "Download paused"
        );
        self.status_cache.update_queue_item(item);
        self.emit(DownloadEvent::Paused {
            item_id: item.id.to_string(),
            resource_id: item.resource_id.to_string(),
            reason: item
                .paused_reason
                .map(|r| r.as_str().to_string())
                .unwrap_or_default(),
        });
    }

    fn announce_resumed(&self, item: &QueueItem) {
        self.status_cache.update_queue_item(item);
        self.emit(DownloadEvent::Resumed {
            item_id: item.id.to_string(),
            resource_id: item.resource_id.to_string(),
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.get_mut().take() {
            watcher.abort();
        }
    }
}
