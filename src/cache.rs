//! Explicit keyed cache for resources the UI loads lazily (patient lists, static
//! assets), with an injected lifecycle instead of module-level state.
//!
//! Concurrent [`ResourceCache::load`] calls for the same key share one loader run. A
//! failed load caches nothing, so the next call tries again.

use crate::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{OnceCell, broadcast};

/// Change notifications sent to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A value was loaded for the key
    Loaded(String),
    /// Every entry was dropped
    Cleared,
}

/// Shared, cloneable cache of `V` values keyed by string.
#[derive(Clone)]
pub struct ResourceCache<V> {
    entries: Arc<Mutex<HashMap<String, Arc<OnceCell<V>>>>>,
    events: broadcast::Sender<CacheEvent>,
}

impl<V: Clone> ResourceCache<V> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Arc<OnceCell<V>>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the cached value for `key`, running `loader` if there is none yet.
    pub async fn load<F, Fut>(&self, key: &str, loader: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let cell = Arc::clone(self.entries().entry(key.to_string()).or_default());

        let mut loaded_here = false;
        let flag = &mut loaded_here;
        let value = cell
            .get_or_try_init(|| async move {
                *flag = true;
                loader().await
            })
            .await?
            .clone();

        if loaded_here {
            log::debug!("Loaded cache entry {}", key);
            // No subscribers is fine.
            let _ = self.events.send(CacheEvent::Loaded(key.to_string()));
        }
        Ok(value)
    }

    /// Returns the value for `key` if it has been loaded.
    pub fn get(&self, key: &str) -> Option<V> {
        self.entries().get(key).and_then(|cell| cell.get().cloned())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Drops every entry. Loads already running finish into their detached cells.
    pub fn clear(&self) {
        self.entries().clear();
        let _ = self.events.send(CacheEvent::Cleared);
    }

    pub fn len(&self) -> usize {
        self.entries()
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for ResourceCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
