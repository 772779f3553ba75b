pub mod config;
pub mod events;
mod health;
pub mod metrics;
pub mod pool;

use crate::core::{DbError, Result, Value};
use crate::result::QueryResult;
use pool::{PoolShared, PooledConnection};
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;

pub use config::{HealthCheckConfig, MonitoringConfig, PoolConfig, ReconnectionConfig};
pub use events::PoolEvent;
pub use health::HealthCheckResult;
pub use metrics::{PoolStats, QueryMetric};
pub use pool::ConnectionPool;

/// A physical connection leased from the pool
///
/// The lease is exclusive until `release` is called or the handle is
/// dropped; either returns the connection to the idle set. Statements
/// issued after release fail immediately.
pub struct PoolConnection {
    pooled: Option<PooledConnection>,
    shared: Arc<PoolShared>,
    permit: Option<OwnedSemaphorePermit>,
    released: bool,
}

impl PoolConnection {
    pub(crate) fn new(
        pooled: PooledConnection,
        shared: Arc<PoolShared>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            pooled: Some(pooled),
            shared,
            permit: Some(permit),
            released: false,
        }
    }

    /// Get connection ID
    pub fn id(&self) -> u64 {
        self.pooled.as_ref().map(|p| p.id).unwrap_or(0)
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Execute a statement and return its rows
    pub async fn query(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        if self.released {
            return Err(DbError::ConnectionError(
                "connection was already released to the pool".into(),
            ));
        }
        if self.shared.is_terminated() {
            return Err(DbError::PoolShuttingDown);
        }

        let pooled = self
            .pooled
            .as_mut()
            .ok_or_else(|| DbError::ConnectionError("connection is no longer available".into()))?;

        self.shared.run_query(pooled, sql, params).await
    }

    /// Execute a statement and return the affected row count
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let result = self.query(sql, params).await?;
        Ok(result.row_count())
    }

    /// Return the connection to the pool. Calling it twice is a no-op.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Some(pooled) = self.pooled.take() {
            self.shared.return_connection(pooled);
        }
        // Dropped after the connection is back in the idle set, so the next
        // waiter finds it there.
        self.permit.take();
    }
}

impl Drop for PoolConnection {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for PoolConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConnection")
            .field("id", &self.id())
            .field("released", &self.released)
            .finish()
    }
}
