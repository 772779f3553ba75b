// ============================================================================
// Managed Entity Handles
// ============================================================================
//
// A Managed handle owns one entity's tracked state: the baseline snapshot
// taken at track time, the live data, and the set of dotted paths written
// since the baseline. All mutation goes through the handle so every write
// is seen. Clones share state; equality is identity.
//
// ============================================================================

use super::change::{ChangeType, EntityChange};
use super::path;
use crate::core::{DbError, EntityId, EntityKey, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as Json};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct TrackedState {
    baseline: Map<String, Json>,
    live: Map<String, Json>,
    changed_fields: BTreeSet<String>,
    is_new: bool,
    is_deleted: bool,
}

#[derive(Debug)]
pub struct TrackedEntity {
    key: EntityKey,
    /// Top-level fields that make up the key; writes to them are refused
    key_fields: Vec<String>,
    state: Mutex<TrackedState>,
}

/// Shared handle to a tracked entity
#[derive(Debug, Clone)]
pub struct Managed {
    inner: Arc<TrackedEntity>,
}

impl PartialEq for Managed {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Managed {}

impl Managed {
    pub(crate) fn new(
        key: EntityKey,
        data: Map<String, Json>,
        is_new: bool,
        key_fields: Vec<String>,
    ) -> Self {
        Self {
            inner: Arc::new(TrackedEntity {
                key,
                key_fields,
                state: Mutex::new(TrackedState {
                    baseline: data.clone(),
                    live: data,
                    changed_fields: BTreeSet::new(),
                    is_new,
                    is_deleted: false,
                }),
            }),
        }
    }

    pub(crate) fn from_arc(inner: Arc<TrackedEntity>) -> Self {
        Self { inner }
    }

    pub(crate) fn as_arc(&self) -> &Arc<TrackedEntity> {
        &self.inner
    }

    /// Returns `true` if both handles point at the same instance.
    pub fn same_instance(&self, other: &Managed) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn state(&self) -> MutexGuard<'_, TrackedState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> &EntityKey {
        &self.inner.key
    }

    pub fn kind(&self) -> &str {
        self.inner.key.kind()
    }

    pub fn id(&self) -> &EntityId {
        self.inner.key.id()
    }

    pub fn get(&self, path: &str) -> Option<Json> {
        path::get(&self.state().live, path).cloned()
    }

    /// Deserializes the value at `path`; `Ok(None)` when absent.
    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        match self.get(path) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Write `value` at `path`, creating intermediate objects as needed
    ///
    /// Writing the value already present is a no-op and does not mark the
    /// path. Once marked, a path stays marked until the baseline is reset,
    /// even if the original value is written back.
    pub fn set(&self, path: &str, value: impl Into<Json>) -> Result<()> {
        let value = value.into();
        self.guard_key_field(path)?;

        let mut state = self.state();
        if path::get(&state.live, path) == Some(&value) {
            return Ok(());
        }
        path::set(&mut state.live, path, value)?;
        mark(&mut state, path);
        Ok(())
    }

    /// Remove the field at `path`, returning the removed value
    pub fn remove(&self, path: &str) -> Result<Option<Json>> {
        self.guard_key_field(path)?;

        let mut state = self.state();
        let removed = path::remove(&mut state.live, path);
        if removed.is_some() {
            mark(&mut state, path);
        }
        Ok(removed)
    }

    /// Append to the array at `path`, returning the new length.
    pub fn push(&self, path: &str, value: impl Into<Json>) -> Result<usize> {
        let value = value.into();
        self.with_array(path, |items| {
            items.push(value);
            Ok(items.len())
        })
    }

    pub fn pop(&self, path: &str) -> Result<Option<Json>> {
        self.with_array(path, |items| Ok(items.pop()))
    }

    pub fn insert_at(&self, path: &str, index: usize, value: impl Into<Json>) -> Result<()> {
        let value = value.into();
        self.with_array(path, |items| {
            if index > items.len() {
                return Err(index_error(path, index, items.len()));
            }
            items.insert(index, value);
            Ok(())
        })
    }

    pub fn remove_at(&self, path: &str, index: usize) -> Result<Json> {
        self.with_array(path, |items| {
            if index >= items.len() {
                return Err(index_error(path, index, items.len()));
            }
            Ok(items.remove(index))
        })
    }

    pub fn sort_by<F>(&self, path: &str, compare: F) -> Result<()>
    where
        F: FnMut(&Json, &Json) -> Ordering,
    {
        self.with_array(path, |items| {
            items.sort_by(compare);
            Ok(())
        })
    }

    pub fn reverse(&self, path: &str) -> Result<()> {
        self.with_array(path, |items| {
            items.reverse();
            Ok(())
        })
    }

    /// Keep only elements matching `keep`; returns how many were removed.
    pub fn retain<F>(&self, path: &str, mut keep: F) -> Result<usize>
    where
        F: FnMut(&Json) -> bool,
    {
        self.with_array(path, |items| {
            let before = items.len();
            items.retain(|item| keep(item));
            Ok(before - items.len())
        })
    }

    /// Runs `f` on the array at `path` and marks the path if the array
    /// changed.
    fn with_array<R>(
        &self,
        path: &str,
        f: impl FnOnce(&mut Vec<Json>) -> Result<R>,
    ) -> Result<R> {
        let mut state = self.state();
        let items = match path::get_mut(&mut state.live, path) {
            Some(Json::Array(items)) => items,
            Some(other) => {
                return Err(DbError::TypeMismatch(format!(
                    "'{}' holds {}, not an array",
                    path,
                    path::json_type(other)
                )));
            }
            None => {
                return Err(DbError::TypeMismatch(format!("no array at '{}'", path)));
            }
        };

        let before = items.clone();
        let result = f(items)?;
        let changed = *items != before;
        if changed {
            mark(&mut state, path);
        }
        Ok(result)
    }

    /// Mutate the payload freely; every leaf that differs afterwards is
    /// marked
    ///
    /// Fails without applying anything if `f` touches a key field.
    pub fn modify<R>(&self, f: impl FnOnce(&mut Map<String, Json>) -> R) -> Result<R> {
        let mut state = self.state();
        let mut draft = state.live.clone();
        let result = f(&mut draft);

        let mut paths = Vec::new();
        diff_objects(&state.live, &draft, "", &mut paths);
        for path in &paths {
            self.guard_key_field(path)?;
        }

        state.live = draft;
        for path in &paths {
            mark(&mut state, path);
        }
        Ok(result)
    }

    /// Overwrite the payload from a typed value, marking differing leaves
    pub fn apply<T: Serialize>(&self, value: &T) -> Result<()> {
        let replacement = match serde_json::to_value(value)? {
            Json::Object(map) => map,
            other => {
                return Err(DbError::TypeMismatch(format!(
                    "entity payload must be an object, got {}",
                    path::json_type(&other)
                )));
            }
        };
        self.modify(|data| *data = replacement)
    }

    /// Snapshot of the live data
    pub fn data(&self) -> Map<String, Json> {
        self.state().live.clone()
    }

    /// Snapshot of the data as of the last baseline
    pub fn baseline(&self) -> Map<String, Json> {
        self.state().baseline.clone()
    }

    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T> {
        let data = self.data();
        Ok(serde_json::from_value(Json::Object(data))?)
    }

    pub fn changed_fields(&self) -> Vec<String> {
        self.state().changed_fields.iter().cloned().collect()
    }

    pub fn is_new(&self) -> bool {
        self.state().is_new
    }

    pub fn is_deleted(&self) -> bool {
        self.state().is_deleted
    }

    /// Pending work exists for this entity.
    pub fn is_dirty(&self) -> bool {
        let state = self.state();
        state.is_new || state.is_deleted || !state.changed_fields.is_empty()
    }

    pub(crate) fn mark_deleted(&self) {
        self.state().is_deleted = true;
    }

    /// Schedules the entity for insertion on the next commit.
    pub(crate) fn mark_new(&self) {
        let mut state = self.state();
        state.is_new = true;
        state.is_deleted = false;
    }

    /// Created and deleted before ever being written.
    pub(crate) fn is_abandoned(&self) -> bool {
        let state = self.state();
        state.is_new && state.is_deleted
    }

    /// Takes the live data as the new baseline.
    pub(crate) fn rebaseline(&self) {
        let mut state = self.state();
        state.baseline = state.live.clone();
        state.changed_fields.clear();
        state.is_new = false;
    }

    pub(crate) fn change(&self) -> Option<EntityChange> {
        let state = self.state();
        let (change_type, changed_fields) = if state.is_deleted {
            if state.is_new {
                return None;
            }
            (ChangeType::Deleted, None)
        } else if state.is_new {
            (ChangeType::Created, None)
        } else if !state.changed_fields.is_empty() {
            (
                ChangeType::Updated,
                Some(state.changed_fields.iter().cloned().collect()),
            )
        } else {
            return None;
        };

        Some(EntityChange {
            key: self.inner.key.clone(),
            change_type,
            changed_fields,
            snapshot: state.live.clone(),
        })
    }

    fn guard_key_field(&self, path: &str) -> Result<()> {
        let field = path::top_level(path);
        if self.inner.key_fields.iter().any(|k| k == field) {
            return Err(DbError::InvalidKey(format!(
                "key field '{}' of {} cannot be modified",
                field, self.inner.key
            )));
        }
        Ok(())
    }
}

fn mark(state: &mut TrackedState, path: &str) {
    if !path::is_internal(path) {
        state.changed_fields.insert(path.to_string());
    }
}

fn index_error(path: &str, index: usize, len: usize) -> DbError {
    DbError::ExecutionError(format!(
        "index {} out of bounds for '{}' (len {})",
        index, path, len
    ))
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

/// Collects leaf paths that differ between two objects. Arrays are
/// compared whole and reported at their own path.
fn diff_objects(
    before: &Map<String, Json>,
    after: &Map<String, Json>,
    prefix: &str,
    out: &mut Vec<String>,
) {
    for (key, old) in before {
        let path = join(prefix, key);
        match after.get(key) {
            Some(new) => diff_values(old, new, &path, out),
            None => out.push(path),
        }
    }
    for key in after.keys() {
        if !before.contains_key(key) {
            out.push(join(prefix, key));
        }
    }
}

fn diff_values(old: &Json, new: &Json, path: &str, out: &mut Vec<String>) {
    match (old, new) {
        (Json::Object(a), Json::Object(b)) => diff_objects(a, b, path, out),
        (a, b) if a != b => out.push(path.to_string()),
        _ => {}
    }
}
