//! # Whole-Document Persistence
//!
//! Each document is JSON under one settings key. All writers go through a
//! per-document mutex that is held across load → mutate → save, so two
//! concurrent mutations can never both start from the same snapshot.

use bridge_traits::SettingsStore;
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;

pub struct PersistedDocument<T> {
    store: Arc<dyn SettingsStore>,
    key: String,
    lock: Mutex<()>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PersistedDocument<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(store: Arc<dyn SettingsStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            lock: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Latest stored value. Missing or corrupt documents read as the default.
    pub async fn load(&self) -> Result<T> {
        let Some(raw) = self.store.get_string(&self.key).await? else {
            return Ok(T::default());
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(key = %self.key, error = %e, "Discarding corrupt document");
                Ok(T::default())
            }
        }
    }

    async fn write(&self, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.store.set_string(&self.key, &raw).await?;
        debug!(key = %self.key, bytes = raw.len(), "Saved document");
        Ok(())
    }

    /// Replaces the document.
    pub async fn save(&self, value: &T) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.write(value).await
    }

    /// Read-modify-write against the freshest snapshot. Always saves.
    pub async fn update<R, F>(&self, mutate: F) -> Result<(R, T)>
    where
        F: FnOnce(&mut T) -> R,
    {
        let _guard = self.lock.lock().await;
        let mut value = self.load().await?;
        let result = mutate(&mut value);
        self.write(&value).await?;
        Ok((result, value))
    }

    /// Like [`update`](Self::update), but the closure decides whether anything
    /// changed: `Ok(Some(r))` saves, `Ok(None)` leaves the store untouched,
    /// `Err` aborts.
    pub async fn try_update<R, F>(&self, mutate: F) -> Result<Option<(R, T)>>
    where
        F: FnOnce(&mut T) -> Result<Option<R>>,
    {
        let _guard = self.lock.lock().await;
        let mut value = self.load().await?;
        match mutate(&mut value)? {
            Some(result) => {
                self.write(&value).await?;
                Ok(Some((result, value)))
            }
            None => Ok(None),
        }
    }
}
