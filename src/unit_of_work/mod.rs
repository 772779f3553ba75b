// ============================================================================
// Unit of Work
// ============================================================================
//
// Collects entity creations, updates and deletions and writes them in one
// transaction. The identity map guarantees one instance per key, the
// change tracker says what to write, and the commit runs deletes, then
// updates, then creates. A failed commit leaves tracked state untouched so
// it can be retried.
//
// ============================================================================

pub mod statements;

use crate::connection::{ConnectionPool, PoolConnection};
use crate::core::{DbError, EntityId, EntityKey, EntityMetadata, Result};
use crate::identity::{IdentityMap, IdentityMapStats};
use crate::tracking::{
    ChangeTracker, ChangeType, EntityChange, Managed, TrackedEntity, TrackerStats,
};
use crate::transaction::{IsolationLevel, TransactionManager, TransactionOptions};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as Json};
use statements::Statement;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{Instrument, Level, event, info_span};

/// Where a commit's statements run
#[derive(Clone)]
enum Executor {
    /// A fresh BEGIN/COMMIT on a pooled connection per commit
    Pool(ConnectionPool),
    /// Through a transaction manager; nests as a savepoint when the
    /// manager already has a transaction open
    Bound(TransactionManager),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CommitSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub duration_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UnitOfWorkStats {
    pub identity_map: IdentityMapStats,
    pub tracker: TrackerStats,
    pub registered_kinds: Vec<String>,
}

pub struct UnitOfWork {
    identity_map: IdentityMap<TrackedEntity>,
    tracker: ChangeTracker,
    metadata: RwLock<HashMap<String, Arc<EntityMetadata>>>,
    executor: Executor,
    isolation_level: Option<IsolationLevel>,
    /// Serializes commits so one batch is never written twice
    commit_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl UnitOfWork {
    /// Commits run on connections leased from `pool`
    pub fn new(pool: ConnectionPool) -> Self {
        Self::with_executor(Executor::Pool(pool))
    }

    /// Commits run through `manager`, joining any transaction it has open
    pub fn bound(manager: TransactionManager) -> Self {
        Self::with_executor(Executor::Bound(manager))
    }

    /// Convenience for `bound` over a single leased connection
    pub fn on_connection(connection: PoolConnection) -> Self {
        Self::bound(TransactionManager::new(connection))
    }

    fn with_executor(executor: Executor) -> Self {
        Self {
            identity_map: IdentityMap::new(),
            tracker: ChangeTracker::new(),
            metadata: RwLock::new(HashMap::new()),
            executor,
            isolation_level: None,
            commit_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Isolation level requested for commit transactions
    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::UnitOfWorkClosed);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn register_entity(&self, metadata: EntityMetadata) -> Result<()> {
        self.ensure_open()?;
        metadata.validate()?;
        let mut registry = self.metadata.write()?;
        registry.insert(metadata.entity.clone(), Arc::new(metadata));
        Ok(())
    }

    pub fn metadata(&self, kind: &str) -> Result<Arc<EntityMetadata>> {
        self.metadata
            .read()?
            .get(kind)
            .cloned()
            .ok_or_else(|| DbError::UnregisteredEntityKind(kind.to_string()))
    }

    fn key_fields(&self, kind: &str) -> Vec<String> {
        self.metadata(kind)
            .map(|meta| meta.primary_key.clone())
            .unwrap_or_default()
    }

    /// The instance registered under `(kind, id)`, if any
    pub fn get(&self, kind: &str, id: impl Into<EntityId>) -> Result<Option<Managed>> {
        self.ensure_open()?;
        let key = EntityKey::new(kind, id);
        Ok(self.identity_map.get(&key).map(Managed::from_arc))
    }

    /// The registered instance, or `data` registered as an existing,
    /// unmodified entity
    ///
    /// When the key is already registered `data` is ignored.
    pub fn attach(
        &self,
        kind: &str,
        id: impl Into<EntityId>,
        data: Map<String, Json>,
    ) -> Result<Managed> {
        self.ensure_open()?;
        let key = EntityKey::new(kind, id);
        if let Some(existing) = self.identity_map.get(&key) {
            return Ok(Managed::from_arc(existing));
        }

        let entity = self
            .tracker
            .track_with_key_fields(key.clone(), data, false, self.key_fields(kind));
        let stored = self.identity_map.set(key, Arc::clone(entity.as_arc()));
        Ok(Managed::from_arc(stored))
    }

    /// Deserialize the registered instance into `T`
    pub fn get_typed<T: DeserializeOwned>(
        &self,
        kind: &str,
        id: impl Into<EntityId>,
    ) -> Result<Option<T>> {
        match self.get(kind, id)? {
            Some(entity) => entity.to_typed().map(Some),
            None => Ok(None),
        }
    }

    /// Register `data` as a new entity keyed by its primary-key fields
    ///
    /// If the key is already registered the existing instance is returned
    /// and `data` is discarded.
    pub fn create(&self, kind: &str, data: Map<String, Json>) -> Result<Managed> {
        self.ensure_open()?;
        let metadata = self.metadata(kind)?;
        let key = EntityKey::new(kind, EntityId::from_fields(&data, &metadata.primary_key)?);

        if let Some(existing) = self.identity_map.get(&key) {
            return Ok(Managed::from_arc(existing));
        }

        let entity = self.tracker.track_with_key_fields(
            key.clone(),
            data,
            true,
            metadata.primary_key.clone(),
        );
        let stored = self.identity_map.set(key, Arc::clone(entity.as_arc()));
        event!(Level::DEBUG, entity = %entity.key(), "entity registered for insert");
        Ok(Managed::from_arc(stored))
    }

    pub fn create_from<T: Serialize>(&self, kind: &str, value: &T) -> Result<Managed> {
        match serde_json::to_value(value)? {
            Json::Object(data) => self.create(kind, data),
            other => Err(DbError::TypeMismatch(format!(
                "entity payload must be an object, got {}",
                crate::tracking::path::json_type(&other)
            ))),
        }
    }

    /// Adopt an instance built elsewhere (e.g. by another unit of work)
    /// as new
    ///
    /// Returns the instance already registered under its key if there is
    /// one; in that case `entity` is left alone.
    pub fn persist(&self, entity: &Managed) -> Result<Managed> {
        self.ensure_open()?;
        self.metadata(entity.kind())?;

        let stored = self
            .identity_map
            .set(entity.key().clone(), Arc::clone(entity.as_arc()));
        let stored = Managed::from_arc(stored);
        if !stored.same_instance(entity) || self.tracker.is_tracked(stored.key()) {
            return Ok(stored);
        }

        stored.mark_new();
        Ok(self.tracker.adopt(stored))
    }

    /// Schedule a loaded entity for deletion
    pub fn delete(&self, kind: &str, id: impl Into<EntityId>) -> Result<()> {
        self.ensure_open()?;
        let key = EntityKey::new(kind, id);
        if !self.identity_map.has(&key) {
            return Err(DbError::NotLoaded(key.to_string()));
        }
        self.tracker.mark_deleted(&key)
    }

    pub fn get_changes(&self) -> Result<Vec<EntityChange>> {
        self.ensure_open()?;
        Ok(self.tracker.get_changes())
    }

    pub fn has_changes(&self) -> bool {
        !self.is_closed() && self.tracker.has_changes()
    }

    /// Write all pending changes in one transaction
    ///
    /// Deletes run first, then updates, then creates. With nothing pending
    /// no transaction is opened. On failure the transaction is rolled back,
    /// the original error is returned, and every pending change is kept.
    pub async fn commit(&self) -> Result<CommitSummary> {
        self.ensure_open()?;
        let _commit = self.commit_lock.lock().await;
        let started = Instant::now();

        let mut changes = self.tracker.get_changes();
        if changes.is_empty() {
            self.finish(&changes)?;
            return Ok(CommitSummary::default());
        }
        changes.sort_by_key(|change| change.change_type.commit_order());

        let mut batch = Vec::with_capacity(changes.len());
        let mut summary = CommitSummary::default();
        for change in &changes {
            let metadata = self.metadata(change.kind())?;
            let Some(statement) = statements::build(&metadata, change)? else {
                continue;
            };
            match change.change_type {
                ChangeType::Created => summary.created += 1,
                ChangeType::Updated => summary.updated += 1,
                ChangeType::Deleted => summary.deleted += 1,
            }
            batch.push(statement);
        }

        if batch.is_empty() {
            self.finish(&changes)?;
            return Ok(CommitSummary {
                duration_ms: started.elapsed().as_secs_f64() * 1000.0,
                ..summary
            });
        }

        let span = info_span!(
            "unit_of_work.commit",
            statements = batch.len(),
            created = summary.created,
            updated = summary.updated,
            deleted = summary.deleted
        );
        if let Err(err) = self.execute_batch(batch).instrument(span).await {
            event!(Level::WARN, error = %err, "unit of work commit rolled back");
            return Err(err);
        }

        self.finish(&changes)?;

        summary.duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        event!(
            Level::INFO,
            created = summary.created,
            updated = summary.updated,
            deleted = summary.deleted,
            duration_ms = summary.duration_ms,
            "unit of work committed"
        );
        Ok(summary)
    }

    /// Re-baselines written entities, then evicts deleted ones and those
    /// created and deleted without ever being written.
    fn finish(&self, changes: &[EntityChange]) -> Result<()> {
        for change in changes {
            self.tracker.reset_changes(&change.key)?;
            if change.change_type == ChangeType::Deleted {
                self.identity_map.delete(&change.key);
            }
        }
        for key in self.tracker.discard_abandoned() {
            self.identity_map.delete(&key);
        }
        Ok(())
    }

    async fn execute_batch(&self, batch: Vec<Statement>) -> Result<()> {
        match &self.executor {
            Executor::Pool(pool) => {
                pool.transaction(
                    move |conn| {
                        Box::pin(async move {
                            for statement in &batch {
                                conn.query(&statement.sql, &statement.params).await?;
                            }
                            Ok(())
                        })
                    },
                    self.isolation_level,
                )
                .await
            }
            Executor::Bound(manager) => {
                let mut options = TransactionOptions::new();
                if let Some(level) = self.isolation_level {
                    options = options.isolation_level(level);
                }
                let batch = &batch;
                manager
                    .with_transaction(
                        |scope| async move {
                            for statement in batch {
                                scope.query(&statement.sql, &statement.params).await?;
                            }
                            Ok::<(), DbError>(())
                        },
                        options,
                    )
                    .await
                    .map(|_| ())
            }
        }
    }

    /// Forget every registered entity and pending change
    pub fn clear(&self) {
        self.identity_map.clear();
        self.tracker.clear();
    }

    /// Clear and refuse further use with `UnitOfWorkClosed`
    pub fn close(&self) {
        self.clear();
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn get_stats(&self) -> UnitOfWorkStats {
        let mut registered_kinds: Vec<String> = self
            .metadata
            .read()
            .map(|registry| registry.keys().cloned().collect())
            .unwrap_or_default();
        registered_kinds.sort();

        UnitOfWorkStats {
            identity_map: self.identity_map.stats(),
            tracker: self.tracker.stats(),
            registered_kinds,
        }
    }
}
