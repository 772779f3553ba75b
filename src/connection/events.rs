use serde::Serialize;

/// Notifications published by the pool on its broadcast channel.
///
/// Events are delivered in the order they were produced. A subscriber
/// that falls more than the channel capacity behind observes a lag error
/// and skips ahead; the pool itself never waits on subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    Connected {
        connection_id: u64,
    },
    Acquired {
        connection_id: u64,
    },
    Released {
        connection_id: u64,
    },
    Error {
        message: String,
    },
    SlowQuery {
        sql: String,
        duration_ms: f64,
        threshold_ms: u64,
    },
    HealthCheck {
        healthy: bool,
        latency_ms: f64,
        error: Option<String>,
    },
    ReconnectAttempt {
        attempt: u32,
        max_retries: u32,
        delay_ms: u64,
    },
    ReconnectSucceeded {
        attempt: u32,
    },
    ReconnectFailed {
        attempts: u32,
        error: Option<String>,
    },
    Closed {
        forced: bool,
    },
}

impl PoolEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connect",
            Self::Acquired { .. } => "acquire",
            Self::Released { .. } => "release",
            Self::Error { .. } => "error",
            Self::SlowQuery { .. } => "slow_query",
            Self::HealthCheck { .. } => "health_check",
            Self::ReconnectAttempt { .. } => "reconnect_attempt",
            Self::ReconnectSucceeded { .. } => "reconnect_success",
            Self::ReconnectFailed { .. } => "reconnect_failed",
            Self::Closed { .. } => "closed",
        }
    }
}
