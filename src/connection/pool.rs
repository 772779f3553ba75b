use super::PoolConnection;
use super::config::PoolConfig;
use super::events::PoolEvent;
use super::health::HealthCheckResult;
use super::metrics::{MetricsRecorder, PoolStats, QueryMetric, sql_preview};
use crate::core::{DbError, Result, Value};
use crate::driver::{Driver, DriverConnection};
use crate::result::QueryResult;
use crate::transaction::IsolationLevel;
use chrono::Utc;
use futures::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{Level, event};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Driver handle shared between a lease and the pool's lease registry, so
/// a forced close can reach connections that are still leased out.
/// `None` once the connection has been closed.
type SharedDriverConnection = Arc<AsyncMutex<Option<Box<dyn DriverConnection>>>>;

/// Connection pool
///
/// Bounds the number of physical connections opened through a `Driver`
/// and hands them out as exclusive leases. Cloning the pool is cheap; all
/// clones share the same connections, metrics and event channel.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

/// A connection sitting in (or leased from) the pool
pub(crate) struct PooledConnection {
    pub(crate) id: u64,
    conn: SharedDriverConnection,
    created_at: Instant,
    last_used: Instant,
    /// Set after a connection-class failure; broken connections are
    /// discarded instead of going back to the idle set.
    broken: bool,
}

impl PooledConnection {
    fn new(id: u64, conn: Box<dyn DriverConnection>) -> Self {
        let now = Instant::now();
        Self {
            id,
            conn: Arc::new(AsyncMutex::new(Some(conn))),
            created_at: now,
            last_used: now,
            broken: false,
        }
    }

    fn is_expired(&self, max_lifetime: Option<Duration>) -> bool {
        if let Some(lifetime) = max_lifetime {
            self.created_at.elapsed() > lifetime
        } else {
            false
        }
    }

    fn is_idle_too_long(&self, idle_timeout: Option<Duration>) -> bool {
        if let Some(timeout) = idle_timeout {
            self.last_used.elapsed() > timeout
        } else {
            false
        }
    }

    fn refresh_last_used(&mut self) {
        self.last_used = Instant::now();
    }

    /// Close the driver connection once; later calls are no-ops
    async fn close(&self) -> Result<()> {
        let taken = self.conn.lock().await.take();
        match taken {
            Some(mut conn) => conn.close().await,
            None => Ok(()),
        }
    }
}

pub(crate) struct PoolShared {
    pub(crate) config: PoolConfig,
    driver: Arc<dyn Driver>,
    idle: Mutex<VecDeque<PooledConnection>>,
    leased: Mutex<HashMap<u64, SharedDriverConnection>>,
    permits: Arc<Semaphore>,
    total_connections: AtomicUsize,
    waiting: AtomicUsize,
    next_id: AtomicU64,
    shutting_down: AtomicBool,
    terminated: AtomicBool,
    pub(crate) healthy: AtomicBool,
    pub(crate) reconnecting: AtomicBool,
    connection_errors: AtomicU64,
    pub(crate) reconnection_attempts: AtomicU64,
    metrics: Mutex<MetricsRecorder>,
    events: broadcast::Sender<PoolEvent>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

/// Decrements the waiting counter even when the acquiring future is dropped.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConnectionPool {
    /// Create a pool, pre-open `min_connections` and start health probing
    pub async fn new<D: Driver>(driver: D, config: PoolConfig) -> Result<Self> {
        Self::with_driver(Arc::new(driver), config).await
    }

    pub async fn with_driver(driver: Arc<dyn Driver>, config: PoolConfig) -> Result<Self> {
        config.validate().map_err(DbError::InvalidConfig)?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(PoolShared {
            permits: Arc::new(Semaphore::new(config.max_connections)),
            metrics: Mutex::new(MetricsRecorder::new(config.monitoring.metrics_capacity)),
            config,
            driver,
            idle: Mutex::new(VecDeque::new()),
            leased: Mutex::new(HashMap::new()),
            total_connections: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            reconnecting: AtomicBool::new(false),
            connection_errors: AtomicU64::new(0),
            reconnection_attempts: AtomicU64::new(0),
            events,
            health_task: Mutex::new(None),
        });

        shared.ensure_min_connections().await?;

        if shared.config.health_check.enabled {
            let handle = super::health::spawn_health_monitor(&shared);
            *shared.health_task.lock()? = Some(handle);
        }

        event!(
            Level::INFO,
            min = shared.config.min_connections,
            max = shared.config.max_connections,
            "connection pool started"
        );

        Ok(Self { shared })
    }

    /// Lease a connection, waiting up to `connection_timeout` for a free slot
    pub async fn get_connection(&self) -> Result<PoolConnection> {
        self.shared.acquire().await
    }

    /// Run a single statement on a short-lived lease
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let mut conn = self.get_connection().await?;
        let result = conn.query(sql, params).await;
        conn.release();
        result
    }

    /// Run `operation` inside BEGIN/COMMIT on one leased connection
    ///
    /// The transaction is rolled back and the error returned when
    /// `operation` fails. The connection is released in every case.
    pub async fn transaction<T, F>(
        &self,
        operation: F,
        isolation_level: Option<IsolationLevel>,
    ) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut PoolConnection) -> BoxFuture<'c, Result<T>>,
    {
        let mut conn = self.get_connection().await?;

        conn.query("BEGIN", &[]).await?;
        let outcome = match isolation_level {
            Some(level) => match conn.query(&level.set_transaction_sql(), &[]).await {
                Ok(_) => operation(&mut conn).await,
                Err(err) => Err(err),
            },
            None => operation(&mut conn).await,
        };

        let result = match outcome {
            Ok(value) => match conn.query("COMMIT", &[]).await {
                Ok(_) => Ok(value),
                Err(err) => {
                    rollback_quietly(&mut conn).await;
                    Err(err)
                }
            },
            Err(err) => {
                rollback_quietly(&mut conn).await;
                Err(err)
            }
        };

        conn.release();
        result
    }

    /// Round-trip a trivial query and report latency
    pub async fn health_check(&self) -> HealthCheckResult {
        self.shared.check_health().await
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    /// The newest `limit` query metrics, oldest first
    pub fn query_metrics(&self, limit: usize) -> Vec<QueryMetric> {
        self.shared
            .metrics
            .lock()
            .map(|m| m.latest(limit))
            .unwrap_or_default()
    }

    /// Subscribe to pool notifications
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events.subscribe()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutting_down.load(Ordering::SeqCst)
    }

    /// Stop health probing, wait for every lease to come back, close all
    /// connections and shut the driver down
    pub async fn close(&self) -> Result<()> {
        if self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        event!(Level::INFO, "connection pool closing");
        self.shared.stop_health_monitor();

        // Holding every permit means no lease is outstanding.
        let max = self.shared.config.max_connections as u32;
        let drained = self.shared.permits.acquire_many(max).await;
        self.shared.permits.close();
        drop(drained);

        self.shared.close_idle().await;
        self.shared.driver.shutdown().await?;
        self.shared.emit(PoolEvent::Closed { forced: false });
        Ok(())
    }

    /// Terminate immediately: pending acquisitions fail, idle and leased
    /// connections are closed and outstanding leases stop accepting statements
    pub async fn force_close(&self) -> Result<()> {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        if self.shared.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        event!(Level::WARN, "connection pool force-closed");
        self.shared.stop_health_monitor();
        self.shared.permits.close();
        self.shared.close_idle().await;
        self.shared.close_leased().await;
        self.shared.emit(PoolEvent::Closed { forced: true });
        Ok(())
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.shared.stats();
        f.debug_struct("ConnectionPool")
            .field("total_connections", &stats.total_connections)
            .field("idle_connections", &stats.idle_connections)
            .field("max_connections", &stats.max_connections)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn rollback_quietly(conn: &mut PoolConnection) {
    if let Err(err) = conn.query("ROLLBACK", &[]).await {
        event!(Level::ERROR, error = %err, "rollback failed");
    }
}

impl PoolShared {
    pub(crate) fn emit(&self, event: PoolEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub(crate) async fn acquire(self: &Arc<Self>) -> Result<PoolConnection> {
        if self.is_shutting_down() {
            return Err(DbError::PoolShuttingDown);
        }

        let wait = self.config.connection_timeout;
        let permit = {
            let _waiting = WaitingGuard::enter(&self.waiting);
            timeout(wait, self.permits.clone().acquire_owned())
                .await
                .map_err(|_| DbError::AcquireTimeout(wait.as_millis() as u64))?
                .map_err(|_| DbError::PoolShuttingDown)?
        };

        if self.is_shutting_down() {
            return Err(DbError::PoolShuttingDown);
        }

        let mut pooled = match self.take_idle().await? {
            Some(pooled) => pooled,
            None => self.open_connection().await?,
        };
        pooled.refresh_last_used();
        if let Ok(mut leased) = self.leased.lock() {
            leased.insert(pooled.id, Arc::clone(&pooled.conn));
        }

        self.emit(PoolEvent::Acquired {
            connection_id: pooled.id,
        });
        Ok(PoolConnection::new(pooled, Arc::clone(self), permit))
    }

    /// Pop a reusable idle connection, closing stale ones on the way
    async fn take_idle(&self) -> Result<Option<PooledConnection>> {
        let mut stale = Vec::new();
        let found = {
            let mut idle = self.idle.lock()?;
            let mut found = None;
            while let Some(pooled) = idle.pop_front() {
                if pooled.is_expired(self.config.max_lifetime)
                    || pooled.is_idle_too_long(self.config.idle_timeout)
                {
                    stale.push(pooled);
                } else {
                    found = Some(pooled);
                    break;
                }
            }
            found
        };

        for pooled in stale {
            self.total_connections.fetch_sub(1, Ordering::SeqCst);
            event!(Level::DEBUG, connection_id = pooled.id, "retiring stale connection");
            let _ = pooled.close().await;
        }

        Ok(found)
    }

    async fn open_connection(self: &Arc<Self>) -> Result<PooledConnection> {
        match self.driver.connect().await {
            Ok(conn) => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                self.total_connections.fetch_add(1, Ordering::SeqCst);
                self.emit(PoolEvent::Connected { connection_id: id });
                event!(Level::DEBUG, connection_id = id, "opened connection");
                Ok(PooledConnection::new(id, conn))
            }
            Err(err) => {
                self.connection_errors.fetch_add(1, Ordering::SeqCst);
                self.handle_fatal_error(&err);
                Err(err)
            }
        }
    }

    async fn ensure_min_connections(self: &Arc<Self>) -> Result<()> {
        while self.total_connections.load(Ordering::SeqCst) < self.config.min_connections {
            let pooled = self.open_connection().await?;
            self.idle.lock()?.push_back(pooled);
        }
        Ok(())
    }

    /// Put a lease back. Broken or expired connections, and everything
    /// after a forced close, are closed and discarded instead.
    pub(crate) fn return_connection(&self, mut pooled: PooledConnection) {
        let id = pooled.id;
        if let Ok(mut leased) = self.leased.lock() {
            leased.remove(&id);
        }
        let discard = pooled.broken
            || self.is_terminated()
            || pooled.is_expired(self.config.max_lifetime);

        if discard {
            event!(Level::DEBUG, connection_id = id, "discarding connection on release");
            self.discard(pooled);
        } else {
            pooled.refresh_last_used();
            match self.idle.lock() {
                Ok(mut idle) => idle.push_back(pooled),
                Err(_) => self.discard(pooled),
            }
        }

        self.emit(PoolEvent::Released { connection_id: id });
    }

    /// Drop a connection from the pool's count and close it on the runtime.
    /// Release is synchronous, so the close runs as a background task.
    fn discard(&self, pooled: PooledConnection) {
        self.total_connections.fetch_sub(1, Ordering::SeqCst);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            event!(
                Level::WARN,
                connection_id = pooled.id,
                "no runtime to close discarded connection"
            );
            return;
        };
        runtime.spawn(async move {
            if let Err(err) = pooled.close().await {
                event!(
                    Level::WARN,
                    connection_id = pooled.id,
                    error = %err,
                    "error closing connection"
                );
            }
        });
    }

    async fn close_idle(&self) {
        let drained: Vec<PooledConnection> = match self.idle.lock() {
            Ok(mut idle) => idle.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for pooled in drained {
            self.total_connections.fetch_sub(1, Ordering::SeqCst);
            if let Err(err) = pooled.close().await {
                event!(
                    Level::WARN,
                    connection_id = pooled.id,
                    error = %err,
                    "error closing connection"
                );
            }
        }
    }

    /// Close connections that are still leased out. Leases keep counting
    /// towards `total_connections` until they are released.
    async fn close_leased(&self) {
        let leased: Vec<(u64, SharedDriverConnection)> = match self.leased.lock() {
            Ok(mut leased) => leased.drain().collect(),
            Err(_) => Vec::new(),
        };
        for (id, conn) in leased {
            // A lease in the middle of a statement holds the lock; it is
            // closed when released instead.
            let taken = match conn.try_lock() {
                Ok(mut guard) => guard.take(),
                Err(_) => {
                    event!(Level::DEBUG, connection_id = id, "lease busy, closing on release");
                    continue;
                }
            };
            if let Some(mut driver_conn) = taken {
                if let Err(err) = driver_conn.close().await {
                    event!(
                        Level::WARN,
                        connection_id = id,
                        error = %err,
                        "error closing connection"
                    );
                }
            }
        }
    }

    /// Executes one statement with timing, metrics and slow-query detection
    pub(crate) async fn run_query(
        self: &Arc<Self>,
        pooled: &mut PooledConnection,
        sql: &str,
        params: &[Value],
    ) -> Result<QueryResult> {
        let monitoring = &self.config.monitoring;
        if monitoring.log_queries {
            event!(
                Level::DEBUG,
                connection_id = pooled.id,
                sql = %sql_preview(sql),
                params = params.len(),
                "executing query"
            );
        }

        let started = Instant::now();
        let result = {
            let mut guard = pooled.conn.lock().await;
            match guard.as_mut() {
                Some(conn) => conn.execute(sql, params).await,
                None => Err(DbError::PoolShuttingDown),
            }
        };
        let elapsed = started.elapsed();
        pooled.refresh_last_used();

        if let Err(err) = &result {
            if err.is_connection_error() {
                pooled.broken = true;
                self.connection_errors.fetch_add(1, Ordering::SeqCst);
                self.handle_fatal_error(err);
            }
        }

        if monitoring.enabled {
            let duration_ms = elapsed.as_secs_f64() * 1000.0;
            let slow = elapsed > monitoring.slow_query_threshold;
            if slow {
                let threshold_ms = monitoring.slow_query_threshold.as_millis() as u64;
                event!(
                    Level::WARN,
                    duration_ms,
                    threshold_ms,
                    sql = %sql_preview(sql),
                    "slow query"
                );
                self.emit(PoolEvent::SlowQuery {
                    sql: sql_preview(sql),
                    duration_ms,
                    threshold_ms,
                });
            }

            let metric = QueryMetric {
                sql: sql_preview(sql),
                duration_ms,
                success: result.is_ok(),
                row_count: result.as_ref().map(|r| r.row_count()).unwrap_or(0),
                connection_id: pooled.id,
                slow,
                timestamp: Utc::now(),
            };
            if let Ok(mut metrics) = self.metrics.lock() {
                metrics.record(metric);
            }
        }

        result
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let idle = self.idle.lock().map(|i| i.len()).unwrap_or(0);
        let total = self.total_connections.load(Ordering::SeqCst);
        let (total_queries, failed_queries, slow_queries, average_query_ms) = self
            .metrics
            .lock()
            .map(|m| {
                let (total, failed, slow) = m.totals();
                (total, failed, slow, m.average_ms())
            })
            .unwrap_or((0, 0, 0, 0.0));

        PoolStats {
            total_connections: total,
            idle_connections: idle,
            active_connections: total.saturating_sub(idle),
            waiting_requests: self.waiting.load(Ordering::SeqCst),
            max_connections: self.config.max_connections,
            total_queries,
            failed_queries,
            slow_queries,
            average_query_ms,
            connection_errors: self.connection_errors.load(Ordering::SeqCst),
            reconnection_attempts: self.reconnection_attempts.load(Ordering::SeqCst),
            healthy: self.healthy.load(Ordering::SeqCst),
        }
    }

    fn stop_health_monitor(&self) {
        if let Ok(mut task) = self.health_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        self.stop_health_monitor();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ReconnectionConfig;
    use crate::driver::ScriptedDriver;

    fn quiet_config() -> PoolConfig {
        PoolConfig::new()
            .min_connections(1)
            .max_connections(2)
            .connection_timeout(Duration::from_millis(100))
            .without_health_check()
    }

    #[tokio::test]
    async fn test_pool_creation_opens_min_connections() {
        let driver = ScriptedDriver::new();
        let pool = ConnectionPool::new(driver.clone(), quiet_config().min_connections(2))
            .await
            .unwrap();

        let stats = pool.stats();
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.idle_connections, 2);
        assert_eq!(driver.opened_connections(), 2);
    }

    #[tokio::test]
    async fn test_connection_return_to_pool() {
        let pool = ConnectionPool::new(ScriptedDriver::new(), quiet_config())
            .await
            .unwrap();

        {
            let _conn = pool.get_connection().await.unwrap();
            let stats = pool.stats();
            assert_eq!(stats.active_connections, 1);
            assert_eq!(stats.idle_connections, 0);
        }

        let stats = pool.stats();
        assert_eq!(stats.idle_connections, 1);
        assert_eq!(stats.total_connections, 1);
    }

    #[tokio::test]
    async fn test_max_connections_limit() {
        let pool = ConnectionPool::new(ScriptedDriver::new(), quiet_config())
            .await
            .unwrap();

        let _conn1 = pool.get_connection().await.unwrap();
        let _conn2 = pool.get_connection().await.unwrap();

        let result = pool.get_connection().await;
        assert!(matches!(result, Err(DbError::AcquireTimeout(100))));
        assert_eq!(pool.stats().waiting_requests, 0);
    }

    #[tokio::test]
    async fn test_query_after_release_fails_fast() {
        let pool = ConnectionPool::new(ScriptedDriver::new(), quiet_config())
            .await
            .unwrap();

        let mut conn = pool.get_connection().await.unwrap();
        conn.query("SELECT 1", &[]).await.unwrap();
        conn.release();
        conn.release();

        assert!(conn.is_released());
        assert!(matches!(
            conn.query("SELECT 1", &[]).await,
            Err(DbError::ConnectionError(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_idle_connections_are_retired() {
        let driver = ScriptedDriver::new();
        let pool = ConnectionPool::new(
            driver.clone(),
            quiet_config().idle_timeout(Duration::from_millis(10)),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let conn = pool.get_connection().await.unwrap();

        assert_eq!(driver.closed_connections(), 1);
        assert_eq!(driver.opened_connections(), 2);
        drop(conn);
        assert_eq!(pool.stats().total_connections, 1);
    }

    #[tokio::test]
    async fn test_broken_connection_is_closed_on_release() {
        let driver = ScriptedDriver::new();
        driver.fail_when("SELECT 1", DbError::ConnectionError("reset by peer".into()));
        let pool = ConnectionPool::new(
            driver.clone(),
            quiet_config().reconnection(ReconnectionConfig {
                enabled: false,
                ..Default::default()
            }),
        )
        .await
        .unwrap();

        let mut conn = pool.get_connection().await.unwrap();
        assert!(conn.query("SELECT 1", &[]).await.is_err());
        conn.release();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(pool.stats().total_connections, 0);
        assert_eq!(driver.closed_connections(), 1);
    }

    #[tokio::test]
    async fn test_debug_output_reports_counts() {
        let pool = ConnectionPool::new(ScriptedDriver::new(), quiet_config())
            .await
            .unwrap();

        let rendered = format!("{:?}", pool);
        assert!(rendered.starts_with("ConnectionPool"));
        assert!(rendered.contains("total_connections: 1"));
        assert!(rendered.contains("closed: false"));
    }
}
