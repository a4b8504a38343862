//! # Storage Recovery
//!
//! One-shot consistency pass run before the queue resumes processing.
//!
//! 1. Leftover `.part` files are removed. No transfer is in flight at startup,
//!    so every partial file is an orphan.
//! 2. Records whose file is missing are looked up again by file name under
//!    the current storage root and rewritten when found there. Mobile
//!    sandboxes may move the container between launches.
//! 3. When the directory holds more media files than the document accounts
//!    for, the unreferenced files are adopted as new records.
//!
//! Only partial files are ever deleted. Records that cannot be resolved are
//! left for the engine to purge lazily.

use bridge_traits::FileSystemAccess;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::error::{OfflineError, Result};
use crate::models::{DownloadedResource, ResourceId};
use crate::transfer::{resource_id_from_file_name, FileTransferEngine, PARTIAL_SUFFIX};

/// Outcome of a recovery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Records whose file was found where the record says
    pub verified: usize,
    /// Records rewritten to a path under the current root
    pub migrated: usize,
    /// Records whose file could not be found anywhere
    pub unresolved: usize,
    /// Files re-attached to freshly built records
    pub adopted: usize,
    pub partials_removed: usize,
}

impl RecoveryReport {
    pub fn changed_metadata(&self) -> bool {
        self.migrated > 0 || self.adopted > 0
    }
}

pub struct StorageRecovery {
    engine: Arc<FileTransferEngine>,
}

impl StorageRecovery {
    pub fn new(engine: Arc<FileTransferEngine>) -> Self {
        Self { engine }
    }

    fn fs(&self) -> &Arc<dyn FileSystemAccess> {
        self.engine.file_system()
    }

    /// Runs the pass. The engine must be initialized.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<RecoveryReport> {
        let root = self.engine.storage_root()?.to_path_buf();
        let mut report = RecoveryReport::default();

        let media = self.scan_root(&root, &mut report).await?;
        let records = self.engine.records().load().await?;

        // (resource id, old path) -> new path
        let mut moves: HashMap<(ResourceId, PathBuf), PathBuf> = HashMap::new();
        let mut referenced: HashSet<PathBuf> = HashSet::new();
        let mut resolved_ids: HashSet<ResourceId> = HashSet::new();

        for record in &records {
            match self.fs().exists(&record.local_path).await {
                Ok(true) => {
                    report.verified += 1;
                    referenced.insert(record.local_path.clone());
                    resolved_ids.insert(record.resource_id.clone());
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(resource_id = %record.resource_id, error = %e, "Could not verify record");
                    report.unresolved += 1;
                    continue;
                }
            }

            let candidate = record
                .local_path
                .file_name()
                .map(|name| root.join(name))
                .filter(|path| media.contains_key(path));

            match candidate {
                Some(path) => {
                    debug!(resource_id = %record.resource_id, "Record migrated to current root");
                    referenced.insert(path.clone());
                    resolved_ids.insert(record.resource_id.clone());
                    moves.insert(
                        (record.resource_id.clone(), record.local_path.clone()),
                        path,
                    );
                    report.migrated += 1;
                }
                None => {
                    let mismatch = OfflineError::Consistency(format!(
                        "file for {} is missing from storage",
                        record.resource_id
                    ));
                    debug!(error = %mismatch, "Unresolved record");
                    report.unresolved += 1;
                }
            }
        }

        // More files than accounted records means the document drifted
        let adopted = if media.len() > referenced.len() {
            self.adopt_unreferenced(&media, &referenced, &resolved_ids)
                .await
        } else {
            Vec::new()
        };
        report.adopted = adopted.len();

        if report.changed_metadata() {
            self.write_back(moves, adopted).await?;
        }

        info!(
            verified = report.verified,
            migrated = report.migrated,
            unresolved = report.unresolved,
            adopted = report.adopted,
            partials_removed = report.partials_removed,
            "Storage recovery finished"
        );
        Ok(report)
    }

    /// Removes partial files and returns the remaining media files by path.
    async fn scan_root(
        &self,
        root: &Path,
        report: &mut RecoveryReport,
    ) -> Result<HashMap<PathBuf, String>> {
        let entries = self
            .fs()
            .list_directory(root)
            .await
            .map_err(|e| OfflineError::Storage(format!("Failed to scan storage root: {}", e)))?;

        let mut media = HashMap::new();
        for path in entries {
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
                continue;
            };

            if name.ends_with(PARTIAL_SUFFIX) {
                match self.fs().delete_file(&path).await {
                    Ok(()) => report.partials_removed += 1,
                    Err(e) if e.is_not_found() => {}
                    Err(e) => warn!(file = %name, error = %e, "Failed to remove partial file"),
                }
                continue;
            }

            media.insert(path, name);
        }

        Ok(media)
    }

    async fn adopt_unreferenced(
        &self,
        media: &HashMap<PathBuf, String>,
        referenced: &HashSet<PathBuf>,
        resolved_ids: &HashSet<ResourceId>,
    ) -> Vec<DownloadedResource> {
        let mut adopted: Vec<DownloadedResource> = Vec::new();
        let mut claimed: HashSet<ResourceId> = resolved_ids.clone();

        let mut candidates: Vec<(&PathBuf, &String)> = media
            .iter()
            .filter(|(path, _)| !referenced.contains(*path))
            .collect();
        candidates.sort_unstable();

        for (path, name) in candidates {
            let Some(resource_id) = resource_id_from_file_name(name) else {
                debug!(file = %name, "Skipping file with unrecognised name");
                continue;
            };
            if !claimed.insert(resource_id.clone()) {
                continue;
            }

            let metadata = match self.fs().metadata(path).await {
                Ok(metadata) if !metadata.is_directory => metadata,
                Ok(_) => continue,
                Err(e) => {
                    warn!(file = %name, error = %e, "Could not stat unreferenced file");
                    continue;
                }
            };

            let downloaded_at = metadata
                .modified_at
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
                .unwrap_or_else(|| self.engine.clock().now());

            adopted.push(DownloadedResource {
                resource_id,
                local_path: path.clone(),
                size_bytes: metadata.size,
                downloaded_at,
                source_url: String::new(),
            });
        }

        adopted
    }

    /// Applies migrations and adoptions to the freshest document snapshot.
    async fn write_back(
        &self,
        moves: HashMap<(ResourceId, PathBuf), PathBuf>,
        adopted: Vec<DownloadedResource>,
    ) -> Result<()> {
        self.engine
            .records()
            .try_update(|records| {
                let mut changed = false;

                for record in records.iter_mut() {
                    let key = (record.resource_id.clone(), record.local_path.clone());
                    if let Some(path) = moves.get(&key) {
                        record.local_path = path.clone();
                        changed = true;
                    }
                }

                for record in adopted {
                    // Adopted ids never had a resolvable record, so a stale one
                    // is superseded by the file on disk
                    records.retain(|r| r.resource_id != record.resource_id);
                    records.push(record);
                    changed = true;
                }

                Ok(changed.then_some(()))
            })
            .await?;

        Ok(())
    }
}
