use super::change::{ChangeType, EntityChange};
use super::entity::Managed;
use crate::core::{DbError, EntityKey, Result};
use serde::Serialize;
use serde_json::{Map, Value as Json};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub total: usize,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

struct TrackedEntry {
    /// Registration order, used to keep change sets stable
    seq: u64,
    entity: Managed,
}

#[derive(Default)]
struct TrackerState {
    entries: HashMap<EntityKey, TrackedEntry>,
    next_seq: u64,
}

/// Records which entities changed since their baseline
#[derive(Default)]
pub struct ChangeTracker {
    state: Mutex<TrackerState>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking `data` under `key`
    ///
    /// Tracking the same key twice returns the handle issued the first
    /// time; the second payload is ignored.
    pub fn track(&self, key: EntityKey, data: Map<String, Json>, is_new: bool) -> Managed {
        self.track_with_key_fields(key, data, is_new, Vec::new())
    }

    /// Like `track`, refusing later writes to the listed key fields.
    pub fn track_with_key_fields(
        &self,
        key: EntityKey,
        data: Map<String, Json>,
        is_new: bool,
        key_fields: Vec<String>,
    ) -> Managed {
        let mut state = self.state();
        if let Some(entry) = state.entries.get(&key) {
            return entry.entity.clone();
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let entity = Managed::new(key.clone(), data, is_new, key_fields);
        state.entries.insert(
            key,
            TrackedEntry {
                seq,
                entity: entity.clone(),
            },
        );
        entity
    }

    /// Re-attach an existing handle. Returns the handle already tracked
    /// under its key, if any.
    pub(crate) fn adopt(&self, entity: Managed) -> Managed {
        let mut state = self.state();
        if let Some(entry) = state.entries.get(entity.key()) {
            return entry.entity.clone();
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            entity.key().clone(),
            TrackedEntry {
                seq,
                entity: entity.clone(),
            },
        );
        entity
    }

    pub fn get(&self, key: &EntityKey) -> Option<Managed> {
        self.state().entries.get(key).map(|e| e.entity.clone())
    }

    pub fn is_tracked(&self, key: &EntityKey) -> bool {
        self.state().entries.contains_key(key)
    }

    pub fn mark_deleted(&self, key: &EntityKey) -> Result<()> {
        let state = self.state();
        let entry = state
            .entries
            .get(key)
            .ok_or_else(|| DbError::NotTracked(key.to_string()))?;
        entry.entity.mark_deleted();
        Ok(())
    }

    /// Pending changes in registration order. Unchanged entities and
    /// entities created then deleted produce nothing.
    pub fn get_changes(&self) -> Vec<EntityChange> {
        let mut entities: Vec<(u64, Managed)> = self
            .state()
            .entries
            .values()
            .map(|e| (e.seq, e.entity.clone()))
            .collect();
        entities.sort_by_key(|(seq, _)| *seq);

        entities
            .into_iter()
            .filter_map(|(_, entity)| entity.change())
            .collect()
    }

    pub fn has_changes(&self) -> bool {
        self.state()
            .entries
            .values()
            .any(|e| e.entity.change().is_some())
    }

    /// Re-baseline after a successful write. Deleted entities are dropped.
    pub fn reset_changes(&self, key: &EntityKey) -> Result<()> {
        let mut state = self.state();
        let entity = state
            .entries
            .get(key)
            .map(|e| e.entity.clone())
            .ok_or_else(|| DbError::NotTracked(key.to_string()))?;

        if entity.is_deleted() {
            state.entries.remove(key);
        } else {
            entity.rebaseline();
        }
        Ok(())
    }

    /// Drop entities that were created and deleted without ever being
    /// written. Returns their keys.
    pub fn discard_abandoned(&self) -> Vec<EntityKey> {
        let mut state = self.state();
        let abandoned: Vec<EntityKey> = state
            .entries
            .iter()
            .filter(|(_, e)| e.entity.is_abandoned())
            .map(|(key, _)| key.clone())
            .collect();
        for key in &abandoned {
            state.entries.remove(key);
        }
        abandoned
    }

    pub fn untrack(&self, key: &EntityKey) -> Option<Managed> {
        self.state().entries.remove(key).map(|e| e.entity)
    }

    pub fn clear(&self) {
        let mut state = self.state();
        state.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> TrackerStats {
        let state = self.state();
        let mut stats = TrackerStats {
            total: state.entries.len(),
            ..TrackerStats::default()
        };
        for entry in state.entries.values() {
            let entity = &entry.entity;
            if entity.is_deleted() {
                stats.deleted += 1;
                continue;
            }
            match entity.change().map(|c| c.change_type) {
                Some(ChangeType::Created) => stats.created += 1,
                Some(ChangeType::Updated) => stats.updated += 1,
                _ => stats.unchanged += 1,
            }
        }
        stats
    }
}
