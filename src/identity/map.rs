use crate::core::{EntityId, EntityKey};
use lru::LruCache;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IdentityMapStats {
    pub distinct_kinds: usize,
    pub total_keys: usize,
}

struct MapState<T> {
    entries: HashMap<EntityKey, Weak<T>>,
    /// Recently used instances kept alive regardless of outside references
    hot: Option<LruCache<EntityKey, Arc<T>>>,
}

/// At most one live instance per `(kind, id)`
///
/// Entries are weak: once nothing else holds an instance it disappears and
/// `get` reports it absent. `with_hot_capacity` keeps the most recently
/// used instances alive anyway. Eviction only ever saves memory.
pub struct IdentityMap<T> {
    state: Mutex<MapState<T>>,
}

impl<T> Default for IdentityMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IdentityMap<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MapState {
                entries: HashMap::new(),
                hot: None,
            }),
        }
    }

    /// Keep the `capacity` most recently used instances strongly referenced.
    pub fn with_hot_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            state: Mutex::new(MapState {
                entries: HashMap::new(),
                hot: Some(LruCache::new(capacity)),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MapState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &EntityKey) -> Option<Arc<T>> {
        let mut state = self.state();
        let instance = state.entries.get(key).and_then(Weak::upgrade);
        match &instance {
            Some(instance) => {
                if let Some(hot) = state.hot.as_mut() {
                    hot.put(key.clone(), Arc::clone(instance));
                }
            }
            None => {
                state.entries.remove(key);
            }
        }
        instance
    }

    pub fn get_by(&self, kind: &str, id: impl Into<EntityId>) -> Option<Arc<T>> {
        self.get(&EntityKey::new(kind, id))
    }

    /// Register `instance` under `key`, returning the stored instance
    ///
    /// If a live instance is already registered it is returned unchanged
    /// and `instance` is discarded.
    pub fn set(&self, key: EntityKey, instance: Arc<T>) -> Arc<T> {
        let mut state = self.state();
        if let Some(existing) = state.entries.get(&key).and_then(Weak::upgrade) {
            if let Some(hot) = state.hot.as_mut() {
                hot.put(key, Arc::clone(&existing));
            }
            return existing;
        }

        state.entries.insert(key.clone(), Arc::downgrade(&instance));
        if let Some(hot) = state.hot.as_mut() {
            hot.put(key, Arc::clone(&instance));
        }
        instance
    }

    pub fn has(&self, key: &EntityKey) -> bool {
        self.state()
            .entries
            .get(key)
            .is_some_and(|weak| weak.strong_count() > 0)
    }

    /// Returns `true` if a live entry was removed.
    pub fn delete(&self, key: &EntityKey) -> bool {
        let mut state = self.state();
        if let Some(hot) = state.hot.as_mut() {
            hot.pop(key);
        }
        state
            .entries
            .remove(key)
            .is_some_and(|weak| weak.strong_count() > 0)
    }

    /// Remove every entry of `kind`, returning how many were removed.
    pub fn clear_kind(&self, kind: &str) -> usize {
        let mut state = self.state();
        let keys: Vec<EntityKey> = state
            .entries
            .keys()
            .filter(|key| key.kind() == kind)
            .cloned()
            .collect();
        for key in &keys {
            state.entries.remove(key);
            if let Some(hot) = state.hot.as_mut() {
                hot.pop(key);
            }
        }
        keys.len()
    }

    pub fn clear(&self) {
        let mut state = self.state();
        state.entries.clear();
        if let Some(hot) = state.hot.as_mut() {
            hot.clear();
        }
    }

    /// Drop entries whose instance is gone. Returns how many were dropped.
    pub fn purge(&self) -> usize {
        let mut state = self.state();
        let before = state.entries.len();
        state.entries.retain(|_, weak| weak.strong_count() > 0);
        before - state.entries.len()
    }

    /// Counts live entries only.
    pub fn stats(&self) -> IdentityMapStats {
        let state = self.state();
        let mut kinds = HashSet::new();
        let mut total_keys = 0;
        for (key, weak) in &state.entries {
            if weak.strong_count() > 0 {
                kinds.insert(key.kind());
                total_keys += 1;
            }
        }
        IdentityMapStats {
            distinct_kinds: kinds.len(),
            total_keys,
        }
    }
}
