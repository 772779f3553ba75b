// ============================================================================
// Transaction Manager
// ============================================================================

use super::events::TransactionEvent;
use super::state::{
    TransactionContext, TransactionId, TransactionOptions, TransactionOutcome, TransactionState,
};
use crate::connection::PoolConnection;
use crate::core::{DbError, Result, Value, is_sql_identifier};
use crate::result::QueryResult;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tokio::time::timeout;
use tracing::{Instrument, Level, event, info_span};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Runs transactions, nested transactions and savepoints on one connection
///
/// The first `with_transaction` opens `BEGIN`; calls made while it is
/// running (typically from inside its callback) nest on savepoints named
/// `sp_level_N`. Clones share the connection and the transaction stack.
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    connection: AsyncMutex<PoolConnection>,
    /// Open transactions ordered by nesting level
    active: Mutex<Vec<TransactionContext>>,
    events: broadcast::Sender<TransactionEvent>,
}

/// Handle passed to transaction callbacks
#[derive(Clone)]
pub struct TransactionScope {
    context: TransactionContext,
    manager: TransactionManager,
}

impl TransactionManager {
    pub fn new(connection: PoolConnection) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ManagerInner {
                connection: AsyncMutex::new(connection),
                active: Mutex::new(Vec::new()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransactionEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: TransactionEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Execute a statement on the managed connection
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let mut conn = self.inner.connection.lock().await;
        conn.query(sql, params).await
    }

    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        Ok(self.query(sql, params).await?.row_count())
    }

    /// Current nesting depth (0 when no transaction is open)
    pub fn depth(&self) -> usize {
        self.inner.active.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub fn get_active_transactions(&self) -> Vec<TransactionContext> {
        self.inner
            .active
            .lock()
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    /// Run `operation` inside a transaction, or a savepoint when one is
    /// already open
    ///
    /// With `retry_on_deadlock`, a top-level attempt failing with a
    /// deadlock or serialization error is rolled back and `operation` is
    /// invoked again from scratch. Nested transactions never retry on their
    /// own; the error travels to the outermost one.
    pub async fn with_transaction<T, F, Fut>(
        &self,
        mut operation: F,
        options: TransactionOptions,
    ) -> Result<TransactionOutcome<T>>
    where
        F: FnMut(TransactionScope) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let nested = self.depth() > 0;
        let mut retries = 0u32;

        loop {
            let span = info_span!("transaction", nested, retries);
            match self
                .run_attempt(&mut operation, &options)
                .instrument(span)
                .await
            {
                Ok((result, savepoint_count)) => {
                    return Ok(TransactionOutcome {
                        result,
                        duration: started.elapsed(),
                        retries,
                        savepoint_count,
                    });
                }
                Err(err) => {
                    let retryable = options.retry_on_deadlock
                        && !nested
                        && err.is_deadlock()
                        && retries < options.max_retries;
                    if !retryable {
                        return Err(err);
                    }

                    retries += 1;
                    let delay = options.backoff_for(retries);
                    event!(
                        Level::WARN,
                        attempt = retries,
                        max_retries = options.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying transaction after deadlock"
                    );
                    self.emit(TransactionEvent::Retrying {
                        attempt: retries,
                        max_retries: options.max_retries,
                        delay_ms: delay.as_millis() as u64,
                        error: err.to_string(),
                    });
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn run_attempt<T, F, Fut>(
        &self,
        operation: &mut F,
        options: &TransactionOptions,
    ) -> Result<(T, usize)>
    where
        F: FnMut(TransactionScope) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let context = self.begin(options).await?;
        let id = context.id;
        let work = operation(TransactionScope {
            context,
            manager: self.clone(),
        });

        let outcome = match options.timeout {
            Some(limit) => match timeout(limit, work).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let timeout_ms = limit.as_millis() as u64;
                    event!(Level::WARN, %id, timeout_ms, "transaction timed out");
                    self.emit(TransactionEvent::TimedOut { id, timeout_ms });
                    Err(DbError::TransactionTimeout(timeout_ms))
                }
            },
            None => work.await,
        };

        match outcome {
            Ok(value) => {
                let savepoint_count = self.commit(id).await?;
                Ok((value, savepoint_count))
            }
            Err(err) => {
                self.rollback(id, &err.to_string()).await;
                Err(err)
            }
        }
    }

    async fn begin(&self, options: &TransactionOptions) -> Result<TransactionContext> {
        let context = {
            let mut active = self.inner.active.lock()?;
            let context = TransactionContext::new(active.len(), options);
            active.push(context.clone());
            context
        };

        for sql in begin_statements(&context, options) {
            if let Err(err) = self.query(&sql, &[]).await {
                self.discard_from(context.id);
                return Err(err);
            }
        }

        let context = self.update(context.id, |ctx| ctx.activate())?;
        event!(
            Level::DEBUG,
            id = %context.id,
            nesting_level = context.nesting_level,
            "transaction started"
        );
        self.emit(TransactionEvent::Began {
            id: context.id,
            nesting_level: context.nesting_level,
        });
        Ok(context)
    }

    /// Returns the number of savepoints created inside the transaction.
    async fn commit(&self, id: TransactionId) -> Result<usize> {
        let context = self.update(id, |ctx| {
            if ctx.state.is_active() {
                ctx.transition(TransactionState::Committing);
                Ok(())
            } else {
                Err(DbError::NoActiveTransaction(ctx.id.to_string()))
            }
        })?;

        let sql = match context.nesting_savepoint() {
            Some(savepoint) => format!("RELEASE SAVEPOINT {}", savepoint),
            None => "COMMIT".to_string(),
        };

        match self.query(&sql, &[]).await {
            Ok(_) => {
                self.discard_from(id);
                let duration_ms = (chrono::Utc::now() - context.started_at)
                    .num_microseconds()
                    .map(|us| us as f64 / 1000.0)
                    .unwrap_or(0.0);
                self.emit(TransactionEvent::Committed {
                    id,
                    nesting_level: context.nesting_level,
                    duration_ms,
                });
                Ok(context.savepoints_created)
            }
            Err(err) => {
                self.rollback(id, &err.to_string()).await;
                Err(err)
            }
        }
    }

    /// Rolls back `id` if it is still tracked. Rollback failures are
    /// reported as events; the original error is what callers see.
    async fn rollback(&self, id: TransactionId, reason: &str) {
        let Ok(context) =
            self.update(id, |ctx| ctx.transition(TransactionState::RollingBack))
        else {
            return;
        };

        let sql = match context.nesting_savepoint() {
            Some(savepoint) => format!("ROLLBACK TO SAVEPOINT {}", savepoint),
            None => "ROLLBACK".to_string(),
        };
        let result = self.query(&sql, &[]).await;
        self.discard_from(id);

        match result {
            Ok(_) => {
                event!(Level::DEBUG, %id, reason, "transaction rolled back");
                self.emit(TransactionEvent::RolledBack {
                    id,
                    nesting_level: context.nesting_level,
                    reason: reason.to_string(),
                });
            }
            Err(err) => {
                event!(Level::ERROR, %id, error = %err, "rollback failed");
                self.emit(TransactionEvent::RollbackFailed {
                    id,
                    error: err.to_string(),
                });
            }
        }
    }

    /// Create a savepoint inside transaction `id`, auto-named `sp_N` when
    /// `name` is omitted. N counts savepoints created in that transaction.
    pub async fn create_savepoint(&self, id: TransactionId, name: Option<&str>) -> Result<String> {
        let name = {
            let active = self.inner.active.lock()?;
            let context = find_active(&active, id)?;
            match name {
                Some(name) => name.to_string(),
                None => context.next_savepoint_name(),
            }
        };
        validate_savepoint_name(&name)?;

        self.query(&format!("SAVEPOINT {}", name), &[]).await?;
        self.update(id, |ctx| {
            ctx.savepoints.push(name.clone());
            ctx.savepoints_created += 1;
        })?;

        self.emit(TransactionEvent::SavepointCreated {
            id,
            name: name.clone(),
        });
        Ok(name)
    }

    /// Undo everything after savepoint `name`; savepoints created after it
    /// are discarded, `name` itself stays usable
    pub async fn rollback_to_savepoint(&self, id: TransactionId, name: &str) -> Result<()> {
        let position = self.savepoint_position(id, name)?;
        self.query(&format!("ROLLBACK TO SAVEPOINT {}", name), &[])
            .await?;
        self.update(id, |ctx| ctx.savepoints.truncate(position + 1))?;

        self.emit(TransactionEvent::SavepointRolledBack {
            id,
            name: name.to_string(),
        });
        Ok(())
    }

    /// Release savepoint `name` along with every savepoint created after it
    pub async fn release_savepoint(&self, id: TransactionId, name: &str) -> Result<()> {
        let position = self.savepoint_position(id, name)?;
        self.query(&format!("RELEASE SAVEPOINT {}", name), &[])
            .await?;
        self.update(id, |ctx| ctx.savepoints.truncate(position))?;

        self.emit(TransactionEvent::SavepointReleased {
            id,
            name: name.to_string(),
        });
        Ok(())
    }

    /// Roll back every open transaction, innermost first
    ///
    /// Individual failures do not stop the sweep; each is published as a
    /// `RollbackFailed` event. Returns how many rollbacks succeeded.
    pub async fn rollback_all(&self) -> usize {
        let contexts: Vec<TransactionContext> = match self.inner.active.lock() {
            Ok(mut active) => {
                for ctx in active.iter_mut() {
                    ctx.transition(TransactionState::RollingBack);
                }
                active.iter().rev().cloned().collect()
            }
            Err(_) => return 0,
        };

        let mut rolled_back = 0;
        for context in contexts {
            let sql = match context.nesting_savepoint() {
                Some(savepoint) => format!("ROLLBACK TO SAVEPOINT {}", savepoint),
                None => "ROLLBACK".to_string(),
            };
            match self.query(&sql, &[]).await {
                Ok(_) => {
                    rolled_back += 1;
                    self.emit(TransactionEvent::RolledBack {
                        id: context.id,
                        nesting_level: context.nesting_level,
                        reason: "rollback_all".to_string(),
                    });
                }
                Err(err) => {
                    event!(Level::WARN, id = %context.id, error = %err, "forced rollback failed");
                    self.emit(TransactionEvent::RollbackFailed {
                        id: context.id,
                        error: err.to_string(),
                    });
                }
            }
        }

        if let Ok(mut active) = self.inner.active.lock() {
            active.clear();
        }
        rolled_back
    }

    /// Give the connection back. Fails while transactions are open or
    /// other clones of this manager are alive.
    pub fn into_connection(self) -> Result<PoolConnection> {
        if self.depth() > 0 {
            return Err(DbError::ExecutionError(
                "cannot detach connection while transactions are active".into(),
            ));
        }
        match Arc::try_unwrap(self.inner) {
            Ok(inner) => Ok(inner.connection.into_inner()),
            Err(_) => Err(DbError::ExecutionError(
                "transaction manager is still shared".into(),
            )),
        }
    }

    fn savepoint_position(&self, id: TransactionId, name: &str) -> Result<usize> {
        let active = self.inner.active.lock()?;
        let context = find_active(&active, id)?;
        context
            .savepoints
            .iter()
            .rposition(|sp| sp == name)
            .ok_or_else(|| DbError::SavepointNotFound(name.to_string()))
    }

    /// Applies `f` to the tracked context `id` and returns its new state.
    fn update<R>(
        &self,
        id: TransactionId,
        f: impl FnOnce(&mut TransactionContext) -> R,
    ) -> Result<TransactionContext>
    where
        R: IntoUpdateResult,
    {
        let mut active = self.inner.active.lock()?;
        let context = active
            .iter_mut()
            .find(|ctx| ctx.id == id)
            .ok_or_else(|| DbError::NoActiveTransaction(id.to_string()))?;
        f(context).into_update_result()?;
        Ok(context.clone())
    }

    /// Drops `id` and anything nested inside it from the stack.
    fn discard_from(&self, id: TransactionId) {
        if let Ok(mut active) = self.inner.active.lock() {
            if let Some(position) = active.iter().position(|ctx| ctx.id == id) {
                active.truncate(position);
            }
        }
    }
}

/// Lets `update` closures either mutate unconditionally or veto.
trait IntoUpdateResult {
    fn into_update_result(self) -> Result<()>;
}

impl IntoUpdateResult for () {
    fn into_update_result(self) -> Result<()> {
        Ok(())
    }
}

impl IntoUpdateResult for Result<()> {
    fn into_update_result(self) -> Result<()> {
        self
    }
}

fn find_active(active: &[TransactionContext], id: TransactionId) -> Result<&TransactionContext> {
    active
        .iter()
        .find(|ctx| ctx.id == id && ctx.active)
        .ok_or_else(|| DbError::NoActiveTransaction(id.to_string()))
}

fn validate_savepoint_name(name: &str) -> Result<()> {
    if !is_sql_identifier(name) || name.contains('.') {
        return Err(DbError::ExecutionError(format!(
            "invalid savepoint name '{}'",
            name
        )));
    }
    Ok(())
}

fn begin_statements(context: &TransactionContext, options: &TransactionOptions) -> Vec<String> {
    if let Some(savepoint) = context.nesting_savepoint() {
        return vec![format!("SAVEPOINT {}", savepoint)];
    }

    let mut statements = vec!["BEGIN".to_string()];
    if let Some(level) = options.isolation_level {
        statements.push(level.set_transaction_sql());
    }
    if options.read_only {
        statements.push("SET TRANSACTION READ ONLY".to_string());
    }
    if options.deferrable {
        statements.push("SET TRANSACTION DEFERRABLE".to_string());
    }
    statements
}

impl TransactionScope {
    pub fn context(&self) -> &TransactionContext {
        &self.context
    }

    pub fn id(&self) -> TransactionId {
        self.context.id
    }

    pub fn nesting_level(&self) -> usize {
        self.context.nesting_level
    }

    pub fn manager(&self) -> &TransactionManager {
        &self.manager
    }

    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        self.manager.query(sql, params).await
    }

    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.manager.execute(sql, params).await
    }

    pub async fn savepoint(&self, name: Option<&str>) -> Result<String> {
        self.manager.create_savepoint(self.id(), name).await
    }

    pub async fn rollback_to(&self, name: &str) -> Result<()> {
        self.manager.rollback_to_savepoint(self.id(), name).await
    }

    pub async fn release(&self, name: &str) -> Result<()> {
        self.manager.release_savepoint(self.id(), name).await
    }

    /// Open a nested transaction on a savepoint of this one
    pub async fn nested<T, F, Fut>(
        &self,
        operation: F,
        options: TransactionOptions,
    ) -> Result<TransactionOutcome<T>>
    where
        F: FnMut(TransactionScope) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.manager.with_transaction(operation, options).await
    }
}
