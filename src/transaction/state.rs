// ============================================================================
// Transaction State Management
// ============================================================================
//
// Each logical transaction moves through:
//
//   Idle -> Active -> Committing -> Committed
//                  \-> RollingBack -> RolledBack
//
// A nested transaction opens directly at Active on a savepoint of its
// parent and closes by releasing or rolling back to that savepoint.
//
// ============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Global transaction ID counter
static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Generate a new unique transaction ID
    pub fn new() -> Self {
        TransactionId(NEXT_TXN_ID.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
    Idle,
    Active,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

impl TransactionState {
    /// Check if transaction can execute operations
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    /// Check if transaction is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::RolledBack
        )
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Idle => write!(f, "IDLE"),
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Committing => write!(f, "COMMITTING"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::RollingBack => write!(f, "ROLLING BACK"),
            TransactionState::RolledBack => write!(f, "ROLLED BACK"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }

    pub fn set_transaction_sql(&self) -> String {
        format!("SET TRANSACTION ISOLATION LEVEL {}", self.as_sql())
    }
}

/// Options for `TransactionManager::with_transaction`
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionOptions {
    pub isolation_level: Option<IsolationLevel>,
    pub read_only: bool,
    pub deferrable: bool,
    /// Roll back and fail with `TransactionTimeout` once this elapses
    pub timeout: Option<Duration>,
    pub retry_on_deadlock: bool,
    pub max_retries: u32,
    /// Base delay; attempt `n` waits `retry_delay * 2^(n-1)`
    pub retry_delay: Duration,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            isolation_level: None,
            read_only: false,
            deferrable: false,
            timeout: None,
            retry_on_deadlock: false,
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn deferrable(mut self) -> Self {
        self.deferrable = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Retry the whole transaction on deadlock/serialization failures
    pub fn retry_on_deadlock(mut self, max_retries: u32) -> Self {
        self.retry_on_deadlock = true;
        self.max_retries = max_retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.retry_delay.saturating_mul(factor)
    }
}

/// Snapshot of one open (or just closed) logical transaction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionContext {
    pub id: TransactionId,
    pub nesting_level: usize,
    pub isolation_level: Option<IsolationLevel>,
    pub started_at: DateTime<Utc>,
    /// Explicit savepoints in creation order
    pub savepoints: Vec<String>,
    pub read_only: bool,
    pub active: bool,
    pub state: TransactionState,
    #[serde(skip)]
    pub(crate) savepoints_created: usize,
}

impl TransactionContext {
    pub(crate) fn new(nesting_level: usize, options: &TransactionOptions) -> Self {
        Self {
            id: TransactionId::new(),
            nesting_level,
            isolation_level: options.isolation_level,
            started_at: Utc::now(),
            savepoints: Vec::new(),
            read_only: options.read_only,
            active: false,
            state: TransactionState::Idle,
            savepoints_created: 0,
        }
    }

    pub fn is_nested(&self) -> bool {
        self.nesting_level > 0
    }

    /// Savepoint that brackets a nested transaction
    pub fn nesting_savepoint(&self) -> Option<String> {
        self.is_nested().then(|| format!("sp_level_{}", self.nesting_level))
    }

    pub(crate) fn next_savepoint_name(&self) -> String {
        format!("sp_{}", self.savepoints_created + 1)
    }

    pub(crate) fn activate(&mut self) {
        self.state = TransactionState::Active;
        self.active = true;
    }

    pub(crate) fn transition(&mut self, state: TransactionState) {
        self.state = state;
        self.active = state.is_active();
    }
}

/// What `with_transaction` returns on success
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionOutcome<T> {
    pub result: T,
    pub duration: Duration,
    /// Deadlock retries taken before the successful attempt
    pub retries: u32,
    /// Savepoints created inside the successful attempt
    pub savepoint_count: usize,
}

impl<T> TransactionOutcome<T> {
    pub fn duration_ms(&self) -> f64 {
        self.duration.as_secs_f64() * 1000.0
    }

    pub fn into_result(self) -> T {
        self.result
    }
}
