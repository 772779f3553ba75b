// ============================================================================
// MapperDB Library
// ============================================================================
//
// Runtime core of a data-mapper persistence layer:
//
//   connection   - pooled physical connections, health checks, reconnection
//   transaction  - nested transactions on savepoints, deadlock retry, timeouts
//   identity     - one live instance per (kind, id)
//   tracking     - baseline snapshots and changed field paths
//   unit_of_work - ordered, atomic commit of everything pending
//
// Backends plug in through the `driver` traits.
//
// ============================================================================

pub mod connection;
pub mod core;
pub mod driver;
pub mod identity;
pub mod prelude;
pub mod result;
pub mod tracking;
pub mod transaction;
pub mod unit_of_work;

// Re-export main types for convenience
pub use core::{DbError, EntityId, EntityKey, EntityMetadata, KeyPart, Result, Value};
pub use result::QueryResult;

pub use connection::{
    ConnectionPool, HealthCheckConfig, HealthCheckResult, MonitoringConfig, PoolConfig,
    PoolConnection, PoolEvent, PoolStats, QueryMetric, ReconnectionConfig,
};
pub use driver::{Driver, DriverConnection, ScriptedDriver};
pub use identity::{IdentityMap, IdentityMapStats};
pub use tracking::{ChangeTracker, ChangeType, EntityChange, Managed, TrackerStats};
pub use transaction::{
    IsolationLevel, TransactionContext, TransactionEvent, TransactionId, TransactionManager,
    TransactionOptions, TransactionOutcome, TransactionScope, TransactionState,
};
pub use unit_of_work::{CommitSummary, UnitOfWork, UnitOfWorkStats};
