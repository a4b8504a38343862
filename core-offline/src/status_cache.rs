//! # Status Cache
//!
//! Synchronous per-resource projection of queue and download state.
//!
//! Reads never touch the settings store and never wait on an async lock. The
//! cache holds no truth of its own: it is rebuilt from the persisted documents
//! at startup and patched by the queue manager afterwards.
//!
//! `is_downloaded` is only ever set by [`StatusCache::mark_downloaded`], which
//! callers invoke after a verified file check. A queue item reaching
//! `completed` does not imply it.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::models::{
    DownloadedResource, QueueItem, QueueItemId, QueueStatus, ResourceId, StatusCacheEntry,
};
use crate::subscription::{ListenerRegistry, Subscription};

type StatusChange = (ResourceId, StatusCacheEntry);

pub struct StatusCache {
    entries: RwLock<HashMap<ResourceId, StatusCacheEntry>>,
    listeners: Arc<ListenerRegistry<StatusChange>>,
}

impl Default for StatusCache {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            listeners: ListenerRegistry::new(),
        }
    }

    /// Entry for `resource_id`, or the absent entry when unknown.
    pub fn get(&self, resource_id: &ResourceId) -> StatusCacheEntry {
        self.entries
            .read()
            .get(resource_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_many<'a, I>(&self, resource_ids: I) -> HashMap<ResourceId, StatusCacheEntry>
    where
        I: IntoIterator<Item = &'a ResourceId>,
    {
        let entries = self.entries.read();
        resource_ids
            .into_iter()
            .map(|id| (id.clone(), entries.get(id).cloned().unwrap_or_default()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Rebuilds every entry in one pass.
    pub fn initialize(&self, downloaded: &[DownloadedResource], items: &[QueueItem]) {
        let mut rebuilt: HashMap<ResourceId, StatusCacheEntry> = HashMap::new();

        for record in downloaded {
            let entry = rebuilt.entry(record.resource_id.clone()).or_default();
            entry.is_downloaded = true;
            entry.local_path = Some(record.local_path.clone());
        }

        for item in items {
            let entry = rebuilt.entry(item.resource_id.clone()).or_default();
            entry.queue_item_id = Some(item.id);
            entry.status = Some(item.status);
            entry.progress_percent = item.progress_percent;
        }

        let previous = std::mem::replace(&mut *self.entries.write(), rebuilt.clone());
        debug!(entries = rebuilt.len(), "Status cache rebuilt");

        for (resource_id, entry) in rebuilt.iter() {
            if previous.get(resource_id) != Some(entry) {
                self.listeners.notify(&(resource_id.clone(), entry.clone()));
            }
        }
        for resource_id in previous.keys().filter(|id| !rebuilt.contains_key(*id)) {
            self.listeners
                .notify(&(resource_id.clone(), StatusCacheEntry::default()));
        }
    }

    /// Moves the progress of a running download forward without touching
    /// the rest of the entry.
    ///
    /// Ignored unless the entry still tracks `item_id` as downloading.
    pub fn update_progress(
        &self,
        resource_id: &ResourceId,
        item_id: QueueItemId,
        percent: u8,
    ) -> bool {
        self.patch(resource_id, |entry| {
            if entry.queue_item_id == Some(item_id)
                && entry.status == Some(QueueStatus::Downloading)
                && percent > entry.progress_percent
            {
                entry.progress_percent = percent.min(100);
            }
        })
    }

    /// Applies `patch` to one entry and notifies when it changed.
    fn patch<F>(&self, resource_id: &ResourceId, patch: F) -> bool
    where
        F: FnOnce(&mut StatusCacheEntry),
    {
        let updated = {
            let mut entries = self.entries.write();
            let current = entries.get(resource_id).cloned().unwrap_or_default();
            let mut next = current.clone();
            patch(&mut next);

            if next == current {
                return false;
            }
            if next.is_absent() {
                entries.remove(resource_id);
            } else {
                entries.insert(resource_id.clone(), next.clone());
            }
            next
        };

        self.listeners.notify(&(resource_id.clone(), updated));
        true
    }

    /// Mirrors the queue fields of `item`; the downloaded flag is untouched.
    pub fn update_queue_item(&self, item: &QueueItem) {
        self.patch(&item.resource_id, |entry| {
            entry.queue_item_id = Some(item.id);
            entry.status = Some(item.status);
            entry.progress_percent = item.progress_percent;
        });
    }

    /// Records a verified file for `resource_id`.
    pub fn mark_downloaded(&self, resource_id: &ResourceId, local_path: PathBuf) {
        self.patch(resource_id, |entry| {
            entry.is_downloaded = true;
            entry.local_path = Some(local_path);
        });
    }

    /// Clears the downloaded flag. An outstanding queue item stays visible.
    pub fn mark_deleted(&self, resource_id: &ResourceId) {
        self.patch(resource_id, |entry| {
            entry.is_downloaded = false;
            entry.local_path = None;
            if !entry.status.is_some_and(|s| s.is_outstanding()) {
                entry.clear_queue_fields();
            }
        });
    }

    /// Drops the queue fields. The downloaded flag stays as confirmed.
    pub fn remove_queue_item(&self, resource_id: &ResourceId) {
        self.patch(resource_id, StatusCacheEntry::clear_queue_fields);
    }

    /// Calls `listener(resource_id, entry)` after every change.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ResourceId, &StatusCacheEntry) + Send + Sync + 'static,
    {
        self.listeners
            .subscribe(move |(resource_id, entry): &StatusChange| listener(resource_id, entry))
    }
}
