//! Storage recovery and service bootstrap tests
//!
//! Seeds a temp storage root and the downloaded-resources document, then
//! checks what a recovery pass makes of them.

use async_trait::async_trait;
use bridge_desktop::{SqliteSettingsStore, TokioFileSystem};
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::{HttpClient, HttpDownload, HttpRequest, SettingsStore};
use chrono::{TimeZone, Utc};
use core_offline::{
    DownloadedResource, FileTransferEngine, OfflineDownloadService, QueueConfig, QueueStatus,
    RecoveryReport, ResourceId, SourceDescriptor, StorageRecovery, TransferEngine,
};
use core_runtime::config::CoreConfig;
use core_runtime::events::{CoreEvent, StorageEvent};
use mockall::mock;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mock! {
    HttpClient {}

    #[async_trait]
    impl HttpClient for HttpClient {
        async fn download_stream(&self, request: HttpRequest) -> BridgeResult<HttpDownload>;
    }
}

struct Fixture {
    data_dir: PathBuf,
    settings: Arc<SqliteSettingsStore>,
    engine: Arc<FileTransferEngine>,
}

impl Fixture {
    fn root(&self) -> PathBuf {
        self.data_dir.join("offline_media")
    }

    fn write(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.root().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    async fn seed_records(&self, records: &[DownloadedResource]) {
        self.settings
            .set_string(
                &QueueConfig::default().downloads_key,
                &serde_json::to_string(records).unwrap(),
            )
            .await
            .unwrap();
    }

    async fn stored_records(&self) -> Vec<DownloadedResource> {
        let raw = self
            .settings
            .get_string(&QueueConfig::default().downloads_key)
            .await
            .unwrap()
            .unwrap_or_else(|| "[]".to_string());
        serde_json::from_str(&raw).unwrap()
    }

    async fn recover(&self) -> RecoveryReport {
        StorageRecovery::new(self.engine.clone()).run().await.unwrap()
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.data_dir);
    }
}

fn temp_data_dir() -> PathBuf {
    std::env::temp_dir().join(format!("offline-recovery-{}", uuid::Uuid::new_v4()))
}

async fn fixture() -> Fixture {
    let data_dir = temp_data_dir();
    let settings = Arc::new(SqliteSettingsStore::in_memory().await.unwrap());
    let mut http = MockHttpClient::new();
    http.expect_download_stream().never();

    let engine = Arc::new(FileTransferEngine::new(
        Arc::new(TokioFileSystem::with_data_directory(data_dir.clone())),
        Arc::new(http),
        settings.clone(),
        Arc::new(bridge_traits::SystemClock),
        &QueueConfig::default(),
    ));
    engine.initialize().await.unwrap();

    Fixture {
        data_dir,
        settings,
        engine,
    }
}

fn record(resource_id: &str, local_path: &Path) -> DownloadedResource {
    DownloadedResource {
        resource_id: ResourceId::new(resource_id),
        local_path: local_path.to_path_buf(),
        size_bytes: 4,
        downloaded_at: Utc.with_ymd_and_hms(2026, 1, 10, 9, 0, 0).unwrap(),
        source_url: format!("https://cdn.test/audio/{}.mp3", resource_id),
    }
}

// ============================================================================
// Recovery pass
// ============================================================================

#[tokio::test]
async fn test_records_follow_a_moved_container() {
    let f = fixture().await;
    let current = f.write("a.mp3", b"aaaa");
    f.seed_records(&[record(
        "a",
        Path::new("/var/mobile/Containers/OLD-UUID/offline_media/a.mp3"),
    )])
    .await;

    let report = f.recover().await;
    assert_eq!(report.migrated, 1);
    assert_eq!(report.adopted, 0);
    assert_eq!(report.unresolved, 0);

    let stored = f.stored_records().await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].local_path, current);
    assert_eq!(stored[0].source_url, "https://cdn.test/audio/a.mp3");

    let found = f.engine.lookup(&ResourceId::new("a")).await.unwrap();
    assert_eq!(found.map(|r| r.local_path), Some(current));
}

#[tokio::test]
async fn test_unreferenced_files_are_adopted() {
    let f = fixture().await;
    let verified = f.write("kept.mp3", b"kept");
    f.write("album%2Ftrack%201.flac", b"flac-bytes");
    f.write("b.mp3", b"bbbbbb");
    f.seed_records(&[record("kept", &verified)]).await;

    let report = f.recover().await;
    assert_eq!(report.verified, 1);
    assert_eq!(report.adopted, 2);

    let adopted = f
        .engine
        .lookup(&ResourceId::new("album/track 1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(adopted.size_bytes, 10);
    assert_eq!(adopted.source_url, "");
    assert_eq!(adopted.local_path, f.root().join("album%2Ftrack%201.flac"));

    let listed = f.engine.list_downloaded().await.unwrap();
    assert_eq!(listed.len(), 3);
}

#[tokio::test]
async fn test_partial_files_are_removed() {
    let f = fixture().await;
    let partial = f.write("c.mp3.part", b"half");
    let complete = f.write("d.mp3", b"dddd");
    f.seed_records(&[record("d", &complete)]).await;

    let report = f.recover().await;
    assert_eq!(report.partials_removed, 1);
    assert_eq!(report.adopted, 0);
    assert!(!report.changed_metadata());

    assert!(!partial.exists());
    assert!(complete.exists());
}

#[tokio::test]
async fn test_unresolved_records_are_left_alone() {
    let f = fixture().await;
    f.seed_records(&[record("ghost", Path::new("/nowhere/offline_media/ghost.mp3"))])
        .await;

    let report = f.recover().await;
    assert_eq!(report.unresolved, 1);
    assert_eq!(report.migrated, 0);
    assert_eq!(f.stored_records().await.len(), 1);

    // Purged lazily on the next read
    assert!(f
        .engine
        .lookup(&ResourceId::new("ghost"))
        .await
        .unwrap()
        .is_none());
    assert!(f.stored_records().await.is_empty());
}

#[tokio::test]
async fn test_unrecognised_names_are_neither_adopted_nor_deleted() {
    let f = fixture().await;
    let kept = f.write("kept.mp3", b"kept");
    let odd = f.write("README", b"not media");
    f.seed_records(&[record("kept", &kept)]).await;

    let report = f.recover().await;
    assert_eq!(report.verified, 1);
    assert_eq!(report.adopted, 0);

    assert!(odd.exists());
    assert_eq!(f.stored_records().await.len(), 1);
}

#[tokio::test]
async fn test_recovery_requires_initialized_engine() {
    let settings = Arc::new(SqliteSettingsStore::in_memory().await.unwrap());
    let engine = Arc::new(FileTransferEngine::new(
        Arc::new(TokioFileSystem::with_data_directory(temp_data_dir())),
        Arc::new(MockHttpClient::new()),
        settings,
        Arc::new(bridge_traits::SystemClock),
        &QueueConfig::default(),
    ));

    assert!(matches!(
        StorageRecovery::new(engine).run().await,
        Err(core_offline::OfflineError::NotInitialized)
    ));
}

// ============================================================================
// Service bootstrap
// ============================================================================

fn core_config(
    data_dir: &Path,
    settings: Arc<SqliteSettingsStore>,
    http: MockHttpClient,
) -> CoreConfig {
    CoreConfig::builder()
        .data_dir(data_dir.to_path_buf())
        .settings_store(settings)
        .file_system(Arc::new(TokioFileSystem::with_data_directory(
            data_dir.to_path_buf(),
        )))
        .http_client(Arc::new(http))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_service_start_announces_recovery() {
    let data_dir = temp_data_dir();
    let root = data_dir.join("offline_media");
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(root.join("left.mp3.part"), b"half").unwrap();
    std::fs::write(root.join("orphan.mp3"), b"orphan").unwrap();

    let settings = Arc::new(SqliteSettingsStore::in_memory().await.unwrap());
    let mut http = MockHttpClient::new();
    http.expect_download_stream().never();

    let service = OfflineDownloadService::new(
        &core_config(&data_dir, settings, http),
        QueueConfig::default(),
    )
    .unwrap();
    let mut events = service.events();

    service.start().await.unwrap();
    service.start().await.unwrap();

    let mut completed = Vec::new();
    while let Some(Ok(event)) = events.try_recv() {
        if let CoreEvent::Storage(StorageEvent::RecoveryCompleted {
            migrated,
            adopted,
            partials_removed,
        }) = event
        {
            completed.push((migrated, adopted, partials_removed));
        }
    }
    assert_eq!(completed, vec![(0, 1, 1)]);

    let entry = service.status_cache().get(&ResourceId::new("orphan"));
    assert!(entry.is_downloaded);
    assert_eq!(entry.local_path, Some(root.join("orphan.mp3")));

    service.shutdown().await;
    let _ = std::fs::remove_dir_all(&data_dir);
}

#[tokio::test]
async fn test_restart_after_shutdown_skips_recovery() {
    let data_dir = temp_data_dir();
    let settings = Arc::new(SqliteSettingsStore::in_memory().await.unwrap());
    let mut http = MockHttpClient::new();
    http.expect_download_stream().never();

    let service = OfflineDownloadService::new(
        &core_config(&data_dir, settings, http),
        QueueConfig::default(),
    )
    .unwrap();
    let mut events = service.events();

    service.start().await.unwrap();
    service.shutdown().await;

    // Stands in for a transfer detached by the shutdown
    let live = data_dir.join("offline_media").join("live.mp3.part");
    std::fs::write(&live, b"still writing").unwrap();

    service.start().await.unwrap();
    assert!(live.exists());

    let mut passes = 0;
    while let Some(Ok(event)) = events.try_recv() {
        if matches!(
            event,
            CoreEvent::Storage(StorageEvent::RecoveryCompleted { .. })
        ) {
            passes += 1;
        }
    }
    assert_eq!(passes, 1);

    service.shutdown().await;
    let _ = std::fs::remove_dir_all(&data_dir);
}

#[tokio::test]
async fn test_service_downloads_through_real_storage() {
    let data_dir = temp_data_dir();
    let settings = Arc::new(SqliteSettingsStore::in_memory().await.unwrap());

    let mut http = MockHttpClient::new();
    http.expect_download_stream()
        .withf(|request| request.url == "https://cdn.test/audio/42.mp3")
        .times(1)
        .returning(|_| {
            Ok(HttpDownload {
                status: 200,
                content_length: None,
                body: Box::new(std::io::Cursor::new(b"audio".to_vec())),
            })
        });

    let service = OfflineDownloadService::new(
        &core_config(&data_dir, settings.clone(), http),
        QueueConfig::default(),
    )
    .unwrap();
    service.start().await.unwrap();

    // The catalog estimate is off and the server sends no length
    let item = service
        .manager()
        .enqueue(
            SourceDescriptor::new("42", "https://cdn.test/audio/42.mp3")
                .with_expected_bytes(4_096),
        )
        .await
        .unwrap();
    service.manager().wait_until_idle().await;

    let done = service.manager().get_item(item.id).await.unwrap();
    assert_eq!(done.status, QueueStatus::Completed);
    assert_eq!(done.bytes_transferred, 5);
    assert_eq!(done.bytes_total, Some(5));

    let path = data_dir.join("offline_media").join("42.mp3");
    assert_eq!(std::fs::read(&path).unwrap(), b"audio");
    assert_eq!(
        service.status_cache().get(&ResourceId::new("42")).local_path,
        Some(path)
    );
    assert_eq!(service.engine().total_storage_used().await.unwrap(), 5);

    // A second enqueue is satisfied from disk
    let again = service
        .manager()
        .enqueue(SourceDescriptor::new("42", "https://cdn.test/audio/42.mp3"))
        .await
        .unwrap();
    assert_eq!(again.status, QueueStatus::Completed);
    assert_eq!(again.bytes_total, Some(5));
    assert!(service
        .manager()
        .find_by_resource(&ResourceId::new("42"))
        .await
        .unwrap()
        .is_none());

    service.shutdown().await;
    let _ = std::fs::remove_dir_all(&data_dir);
}
