//! Service bootstrap wiring the offline subsystem together.
//!
//! Startup order is fixed: the engine prepares its storage root, recovery
//! reconciles the downloaded-resources document with the disk, and only then
//! does the queue resume processing.

use core_runtime::config::CoreConfig;
use core_runtime::events::{CoreEvent, EventBus, EventStream, StorageEvent};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, instrument, warn};

use crate::config::QueueConfig;
use crate::error::{OfflineError, Result};
use crate::preferences::PreferenceReader;
use crate::queue::QueueManager;
use crate::recovery::StorageRecovery;
use crate::status_cache::StatusCache;
use crate::transfer::{FileTransferEngine, TransferEngine};

/// Owns every part of the offline download subsystem.
pub struct OfflineDownloadService {
    engine: Arc<FileTransferEngine>,
    recovery: StorageRecovery,
    status_cache: Arc<StatusCache>,
    manager: QueueManager,
    preferences: PreferenceReader,
    event_bus: EventBus,
    /// Set once the first recovery pass has run; later starts skip it
    recovered: OnceCell<()>,
}

impl OfflineDownloadService {
    /// Builds the subsystem from host bridges. Nothing touches storage until
    /// [`start`](Self::start).
    pub fn new(core: &CoreConfig, config: QueueConfig) -> Result<Self> {
        core.validate()?;
        config.validate().map_err(OfflineError::Config)?;

        let engine = Arc::new(FileTransferEngine::from_config(core, &config)?);
        let status_cache = Arc::new(StatusCache::new());
        let event_bus = EventBus::new(core.event_buffer_size);

        let mut builder = QueueManager::builder()
            .config(config)
            .engine(engine.clone())
            .settings_store(core.settings_store.clone())
            .status_cache(status_cache.clone())
            .clock(core.clock.clone())
            .event_bus(event_bus.clone())
            .quota_eviction(core.features.enable_quota_eviction);

        if core.features.enable_network_awareness {
            if let Some(monitor) = &core.network_monitor {
                builder = builder.network_monitor(monitor.clone());
            }
        }

        Ok(Self {
            recovery: StorageRecovery::new(engine.clone()),
            preferences: PreferenceReader::new(core.settings_store.clone()),
            manager: builder.build()?,
            engine,
            status_cache,
            event_bus,
            recovered: OnceCell::new(),
        })
    }

    /// Initializes storage, runs recovery and starts the queue. Idempotent.
    ///
    /// Recovery runs on the first start only. Transfers detached by
    /// [`shutdown`](Self::shutdown) may still be writing partial files.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        self.engine.initialize().await?;
        self.recovered.get_or_init(|| self.recover()).await;

        self.manager.start().await?;
        info!("Offline download service started");
        Ok(())
    }

    /// Recovery never blocks startup; failures are logged and announced.
    async fn recover(&self) {
        match self.recovery.run().await {
            Ok(report) => {
                let _ = self
                    .event_bus
                    .emit(CoreEvent::Storage(StorageEvent::RecoveryCompleted {
                        migrated: report.migrated,
                        adopted: report.adopted,
                        partials_removed: report.partials_removed,
                    }));
            }
            Err(e) => {
                warn!(error = %e, "Storage recovery failed, continuing with persisted state");
                let _ = self
                    .event_bus
                    .emit(CoreEvent::Storage(StorageEvent::RecoveryFailed {
                        message: e.to_string(),
                    }));
            }
        }
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }

    pub fn manager(&self) -> &QueueManager {
        &self.manager
    }

    pub fn status_cache(&self) -> &Arc<StatusCache> {
        &self.status_cache
    }

    pub fn engine(&self) -> &Arc<FileTransferEngine> {
        &self.engine
    }

    pub fn preferences(&self) -> &PreferenceReader {
        &self.preferences
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Stream of download and storage events from now on.
    pub fn events(&self) -> EventStream {
        EventStream::new(self.event_bus.subscribe())
    }
}
