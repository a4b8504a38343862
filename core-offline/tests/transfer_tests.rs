//! File transfer engine integration tests
//!
//! Runs the engine against a real temp directory and an in-memory SQLite
//! settings store, with the HTTP layer mocked.

use async_trait::async_trait;
use bridge_desktop::{SqliteSettingsStore, TokioFileSystem};
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::{Clock, FileMetadata, FileSystemAccess, HttpClient, HttpDownload, HttpRequest};
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use core_offline::{
    FileTransferEngine, OfflineError, QueueConfig, ResourceId, SourceDescriptor, TransferEngine,
    TransferProgress,
};
use mockall::mock;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mock! {
    HttpClient {}

    #[async_trait]
    impl HttpClient for HttpClient {
        async fn download_stream(&self, request: HttpRequest) -> BridgeResult<HttpDownload>;
    }
}

/// Advances one second per reading so download order is strict.
struct StepClock {
    now: Mutex<DateTime<Utc>>,
}

impl StepClock {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2026, 2, 1, 8, 0, 0).unwrap()),
        })
    }
}

impl Clock for StepClock {
    fn now(&self) -> DateTime<Utc> {
        let mut now = self.now.lock();
        *now += ChronoDuration::seconds(1);
        *now
    }
}

fn body(bytes: Vec<u8>, content_length: Option<u64>) -> HttpDownload {
    HttpDownload {
        status: 200,
        content_length,
        body: Box::new(std::io::Cursor::new(bytes)),
    }
}

fn source(resource_id: &str) -> SourceDescriptor {
    SourceDescriptor::new(
        resource_id,
        format!("https://cdn.test/audio/{}.mp3", resource_id),
    )
}

struct Fixture {
    engine: FileTransferEngine,
    data_dir: PathBuf,
}

impl Fixture {
    fn root(&self) -> PathBuf {
        self.data_dir.join("offline_media")
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.data_dir);
    }
}

/// Real disk access, except that deleting the named file always fails.
struct StuckFileSystem {
    inner: TokioFileSystem,
    stuck: String,
}

#[async_trait]
impl FileSystemAccess for StuckFileSystem {
    async fn get_data_directory(&self) -> BridgeResult<PathBuf> {
        self.inner.get_data_directory().await
    }

    async fn exists(&self, path: &Path) -> BridgeResult<bool> {
        self.inner.exists(path).await
    }

    async fn metadata(&self, path: &Path) -> BridgeResult<FileMetadata> {
        self.inner.metadata(path).await
    }

    async fn create_dir_all(&self, path: &Path) -> BridgeResult<()> {
        self.inner.create_dir_all(path).await
    }

    async fn read_file(&self, path: &Path) -> BridgeResult<Bytes> {
        self.inner.read_file(path).await
    }

    async fn write_file(&self, path: &Path, data: Bytes) -> BridgeResult<()> {
        self.inner.write_file(path, data).await
    }

    async fn delete_file(&self, path: &Path) -> BridgeResult<()> {
        if path.file_name().and_then(|n| n.to_str()) == Some(self.stuck.as_str()) {
            return Err(bridge_traits::BridgeError::OperationFailed(
                "EBUSY".to_string(),
            ));
        }
        self.inner.delete_file(path).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> BridgeResult<()> {
        self.inner.rename(from, to).await
    }

    async fn list_directory(&self, path: &Path) -> BridgeResult<Vec<PathBuf>> {
        self.inner.list_directory(path).await
    }

    async fn open_write_stream(
        &self,
        path: &Path,
    ) -> BridgeResult<Box<dyn tokio::io::AsyncWrite + Send + Unpin>> {
        self.inner.open_write_stream(path).await
    }
}

fn temp_data_dir() -> PathBuf {
    std::env::temp_dir().join(format!("offline-transfer-{}", uuid::Uuid::new_v4()))
}

async fn fixture(http: MockHttpClient) -> Fixture {
    let data_dir = temp_data_dir();
    let fs = Arc::new(TokioFileSystem::with_data_directory(data_dir.clone()));
    fixture_with(http, fs, data_dir).await
}

async fn fixture_with(
    http: MockHttpClient,
    fs: Arc<dyn FileSystemAccess>,
    data_dir: PathBuf,
) -> Fixture {
    let settings = Arc::new(SqliteSettingsStore::in_memory().await.unwrap());

    let engine = FileTransferEngine::new(
        fs,
        Arc::new(http),
        settings,
        StepClock::new(),
        &QueueConfig::default(),
    );
    Fixture { engine, data_dir }
}

fn no_progress() -> impl Fn(TransferProgress) + Send + Sync {
    |_| {}
}

fn partial_files(root: &std::path::Path) -> Vec<PathBuf> {
    std::fs::read_dir(root)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| path.to_string_lossy().ends_with(".part"))
                .collect()
        })
        .unwrap_or_default()
}

// ============================================================================
// Downloads
// ============================================================================

#[tokio::test]
async fn test_download_writes_file_and_record() {
    let payload = vec![7u8; 200_000];
    let expected = payload.clone();

    let mut http = MockHttpClient::new();
    http.expect_download_stream()
        .withf(|request| request.url == "https://cdn.test/audio/track-1.mp3")
        .times(1)
        .returning(move |_| Ok(body(payload.clone(), Some(200_000))));

    let f = fixture(http).await;
    f.engine.initialize().await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    let on_progress = move |progress: TransferProgress| record.lock().push(progress.percent);

    let path = f
        .engine
        .download(&source("track-1"), &on_progress)
        .await
        .unwrap();

    assert_eq!(path, f.root().join("track-1.mp3"));
    assert_eq!(std::fs::read(&path).unwrap(), expected);
    assert!(partial_files(&f.root()).is_empty());

    let percents = seen.lock().clone();
    assert!(percents.len() >= 2);
    assert!(percents.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(percents.last(), Some(&100));
    assert_eq!(percents.iter().filter(|p| **p == 100).count(), 1);

    let stored = f
        .engine
        .lookup(&ResourceId::new("track-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.local_path, path);
    assert_eq!(stored.size_bytes, 200_000);
    assert_eq!(stored.source_url, "https://cdn.test/audio/track-1.mp3");
}

#[tokio::test]
async fn test_http_error_leaves_nothing_behind() {
    let mut http = MockHttpClient::new();
    http.expect_download_stream().times(1).returning(|_| {
        Ok(HttpDownload {
            status: 404,
            content_length: Some(9),
            body: Box::new(std::io::Cursor::new(b"not found".to_vec())),
        })
    });

    let f = fixture(http).await;
    f.engine.initialize().await.unwrap();

    let err = f
        .engine
        .download(&source("missing"), &no_progress())
        .await
        .unwrap_err();
    match err {
        OfflineError::Transfer { status, .. } => assert_eq!(status, Some(404)),
        other => panic!("expected a transfer error, got {:?}", other),
    }

    assert!(partial_files(&f.root()).is_empty());
    assert!(!f.root().join("missing.mp3").exists());
    assert!(f
        .engine
        .lookup(&ResourceId::new("missing"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_truncated_body_is_a_transfer_error() {
    let mut http = MockHttpClient::new();
    http.expect_download_stream()
        .times(1)
        .returning(|_| Ok(body(vec![1u8; 600], Some(1_000))));

    let f = fixture(http).await;
    f.engine.initialize().await.unwrap();

    let err = f
        .engine
        .download(&source("short"), &no_progress())
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(err.to_string().contains("truncated"));

    assert!(partial_files(&f.root()).is_empty());
    assert!(!f.root().join("short.mp3").exists());
}

#[tokio::test]
async fn test_connection_failure_is_retryable() {
    let mut http = MockHttpClient::new();
    http.expect_download_stream().times(1).returning(|_| {
        Err(bridge_traits::BridgeError::OperationFailed(
            "connection refused".to_string(),
        ))
    });

    let f = fixture(http).await;
    f.engine.initialize().await.unwrap();

    let err = f
        .engine
        .download(&source("offline"), &no_progress())
        .await
        .unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_existing_file_skips_fetch() {
    let mut http = MockHttpClient::new();
    http.expect_download_stream().never();

    let f = fixture(http).await;
    f.engine.initialize().await.unwrap();
    std::fs::write(f.root().join("cached.mp3"), b"already here").unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    let on_progress = move |progress: TransferProgress| record.lock().push(progress);

    let path = f
        .engine
        .download(&source("cached"), &on_progress)
        .await
        .unwrap();
    assert_eq!(path, f.root().join("cached.mp3"));

    let progress = seen.lock().clone();
    assert_eq!(progress, vec![TransferProgress::complete(12)]);

    let stored = f
        .engine
        .lookup(&ResourceId::new("cached"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.size_bytes, 12);
}

#[tokio::test]
async fn test_download_requires_initialize() {
    let mut http = MockHttpClient::new();
    http.expect_download_stream().never();

    let f = fixture(http).await;
    assert!(matches!(
        f.engine.storage_root(),
        Err(OfflineError::NotInitialized)
    ));
    assert!(matches!(
        f.engine.download(&source("early"), &no_progress()).await,
        Err(OfflineError::NotInitialized)
    ));

    f.engine.initialize().await.unwrap();
    f.engine.initialize().await.unwrap();
    assert!(f.root().is_dir());
    assert_eq!(f.engine.storage_root().unwrap(), f.root().as_path());
}

// ============================================================================
// Records
// ============================================================================

#[tokio::test]
async fn test_missing_files_are_purged_on_read() {
    let mut http = MockHttpClient::new();
    http.expect_download_stream()
        .times(2)
        .returning(|_| Ok(body(vec![3u8; 64], Some(64))));

    let f = fixture(http).await;
    f.engine.initialize().await.unwrap();

    let kept = f.engine.download(&source("kept"), &no_progress()).await.unwrap();
    let gone = f.engine.download(&source("gone"), &no_progress()).await.unwrap();
    std::fs::remove_file(&gone).unwrap();

    assert!(f
        .engine
        .lookup(&ResourceId::new("gone"))
        .await
        .unwrap()
        .is_none());

    let listed = f.engine.list_downloaded().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].local_path, kept);
    assert_eq!(f.engine.total_storage_used().await.unwrap(), 64);
}

#[tokio::test]
async fn test_delete_removes_file_and_record() {
    let mut http = MockHttpClient::new();
    http.expect_download_stream()
        .times(1)
        .returning(|_| Ok(body(vec![5u8; 32], None)));

    let f = fixture(http).await;
    f.engine.initialize().await.unwrap();

    let path = f.engine.download(&source("doomed"), &no_progress()).await.unwrap();
    let id = ResourceId::new("doomed");
    f.engine.delete(&id).await.unwrap();

    assert!(!path.exists());
    assert!(f.engine.lookup(&id).await.unwrap().is_none());

    // Unknown ids are a no-op
    f.engine.delete(&ResourceId::new("never")).await.unwrap();
}

#[tokio::test]
async fn test_quota_evicts_oldest_first() {
    let mut http = MockHttpClient::new();
    http.expect_download_stream()
        .times(12)
        .returning(|_| Ok(body(vec![9u8; 100], Some(100))));

    let f = fixture(http).await;
    f.engine.initialize().await.unwrap();

    for i in 0..12 {
        f.engine
            .download(&source(&format!("track-{:02}", i)), &no_progress())
            .await
            .unwrap();
    }
    assert_eq!(f.engine.total_storage_used().await.unwrap(), 1_200);

    let evicted = f.engine.enforce_quota(10).await.unwrap();
    assert_eq!(
        evicted,
        vec![ResourceId::new("track-00"), ResourceId::new("track-01")]
    );
    assert!(!f.root().join("track-00.mp3").exists());
    assert_eq!(f.engine.list_downloaded().await.unwrap().len(), 10);
    assert_eq!(f.engine.total_storage_used().await.unwrap(), 1_000);

    assert!(f.engine.enforce_quota(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_quota_reports_evictions_past_a_failed_delete() {
    let mut http = MockHttpClient::new();
    http.expect_download_stream()
        .times(3)
        .returning(|_| Ok(body(vec![4u8; 10], Some(10))));

    let data_dir = temp_data_dir();
    let fs = Arc::new(StuckFileSystem {
        inner: TokioFileSystem::with_data_directory(data_dir.clone()),
        stuck: "track-01.mp3".to_string(),
    });
    let f = fixture_with(http, fs, data_dir).await;
    f.engine.initialize().await.unwrap();

    for id in ["track-00", "track-01", "track-02"] {
        f.engine.download(&source(id), &no_progress()).await.unwrap();
    }

    let evicted = f.engine.enforce_quota(1).await.unwrap();
    assert_eq!(evicted, vec![ResourceId::new("track-00")]);
    assert!(!f.root().join("track-00.mp3").exists());
    assert!(f.root().join("track-01.mp3").exists());

    let remaining: Vec<String> = f
        .engine
        .list_downloaded()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.resource_id.to_string())
        .collect();
    assert_eq!(remaining, vec!["track-01", "track-02"]);
}

// ============================================================================
// Naming
// ============================================================================

#[tokio::test]
async fn test_file_names() {
    let f = fixture(MockHttpClient::new()).await;

    assert_eq!(f.engine.file_name_for(&source("a")), "a.mp3");
    assert_eq!(
        f.engine
            .file_name_for(&source("a").with_extension(".M4A")),
        "a.m4a"
    );
    assert_eq!(
        f.engine.file_name_for(&SourceDescriptor::new(
            "b",
            "https://cdn.test/stream/b.flac?sig=abc#t=1"
        )),
        "b.flac"
    );
    assert_eq!(
        f.engine
            .file_name_for(&SourceDescriptor::new("c", "https://cdn.test/stream/c")),
        "c.audio"
    );
    assert_eq!(
        f.engine
            .file_name_for(&source("d").with_extension("part")),
        "d.audio"
    );
    assert_eq!(
        f.engine.file_name_for(&source("album/track 1")),
        "album%2Ftrack%201.mp3"
    );
}
