use super::TransactionId;
use serde::Serialize;

/// Notifications published by a `TransactionManager`, in order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TransactionEvent {
    Began {
        id: TransactionId,
        nesting_level: usize,
    },
    Committed {
        id: TransactionId,
        nesting_level: usize,
        duration_ms: f64,
    },
    RolledBack {
        id: TransactionId,
        nesting_level: usize,
        reason: String,
    },
    SavepointCreated {
        id: TransactionId,
        name: String,
    },
    SavepointReleased {
        id: TransactionId,
        name: String,
    },
    SavepointRolledBack {
        id: TransactionId,
        name: String,
    },
    Retrying {
        attempt: u32,
        max_retries: u32,
        delay_ms: u64,
        error: String,
    },
    TimedOut {
        id: TransactionId,
        timeout_ms: u64,
    },
    RollbackFailed {
        id: TransactionId,
        error: String,
    },
}
