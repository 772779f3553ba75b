// ============================================================================
// Health Probing & Reconnection
// ============================================================================
//
// The monitor runs on its own task and leases connections like any other
// caller, so it never shares a connection with in-flight work. It only
// holds a weak reference to the pool: dropping the last pool handle ends it.
//
// ============================================================================

use super::events::PoolEvent;
use super::pool::PoolShared;
use crate::core::DbError;
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{Level, event};

const HEALTH_CHECK_SQL: &str = "SELECT 1";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub latency_ms: f64,
    pub error: Option<String>,
}

impl PoolShared {
    pub(crate) async fn check_health(self: &Arc<Self>) -> HealthCheckResult {
        let started = Instant::now();
        let probe = async {
            let mut conn = self.acquire().await?;
            let result = conn.query(HEALTH_CHECK_SQL, &[]).await;
            conn.release();
            result
        };

        let limit = self.config.health_check.timeout;
        let outcome = match timeout(limit, probe).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!(
                "health check timed out after {}ms",
                limit.as_millis()
            )),
        };

        let result = HealthCheckResult {
            healthy: outcome.is_ok(),
            latency_ms: started.elapsed().as_secs_f64() * 1000.0,
            error: outcome.err(),
        };

        self.healthy.store(result.healthy, Ordering::SeqCst);
        self.emit(PoolEvent::HealthCheck {
            healthy: result.healthy,
            latency_ms: result.latency_ms,
            error: result.error.clone(),
        });
        result
    }

    /// Probe up to `1 + retries` times, stopping at the first success.
    async fn check_health_with_retries(self: &Arc<Self>) -> HealthCheckResult {
        let mut result = self.check_health().await;
        let mut attempt = 0;
        while !result.healthy && attempt < self.config.health_check.retries {
            attempt += 1;
            if self.is_shutting_down() {
                break;
            }
            result = self.check_health().await;
        }
        result
    }

    /// Marks the pool unhealthy and, when enabled, starts a background
    /// reconnection loop. Only one loop runs at a time.
    pub(crate) fn handle_fatal_error(self: &Arc<Self>, err: &DbError) {
        self.healthy.store(false, Ordering::SeqCst);
        event!(Level::ERROR, error = %err, "connection pool error");
        self.emit(PoolEvent::Error {
            message: err.to_string(),
        });

        if !self.config.reconnection.enabled || self.is_shutting_down() {
            return;
        }
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.reconnecting.store(false, Ordering::SeqCst);
            return;
        };
        let weak = Arc::downgrade(self);
        runtime.spawn(reconnect_loop(weak));
    }
}

async fn reconnect_loop(weak: Weak<PoolShared>) {
    let (max_retries, reconnection) = match weak.upgrade() {
        Some(shared) => (
            shared.config.reconnection.max_retries,
            shared.config.reconnection.clone(),
        ),
        None => return,
    };

    let mut last_error = None;
    for attempt in 0..max_retries {
        let delay = reconnection.delay_for(attempt);
        {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if shared.is_shutting_down() {
                shared.reconnecting.store(false, Ordering::SeqCst);
                return;
            }
            shared.reconnection_attempts.fetch_add(1, Ordering::SeqCst);
            event!(
                Level::WARN,
                attempt = attempt + 1,
                max_retries,
                delay_ms = delay.as_millis() as u64,
                "attempting pool reconnection"
            );
            shared.emit(PoolEvent::ReconnectAttempt {
                attempt: attempt + 1,
                max_retries,
                delay_ms: delay.as_millis() as u64,
            });
        }

        tokio::time::sleep(delay).await;

        let Some(shared) = weak.upgrade() else {
            return;
        };
        let result = shared.check_health().await;
        if result.healthy {
            event!(Level::INFO, attempt = attempt + 1, "pool reconnected");
            shared.emit(PoolEvent::ReconnectSucceeded {
                attempt: attempt + 1,
            });
            shared.reconnecting.store(false, Ordering::SeqCst);
            return;
        }
        last_error = result.error;
    }

    if let Some(shared) = weak.upgrade() {
        event!(Level::ERROR, attempts = max_retries, "pool reconnection exhausted");
        shared.emit(PoolEvent::ReconnectFailed {
            attempts: max_retries,
            error: last_error,
        });
        shared.reconnecting.store(false, Ordering::SeqCst);
    }
}

pub(crate) fn spawn_health_monitor(shared: &Arc<PoolShared>) -> JoinHandle<()> {
    let weak = Arc::downgrade(shared);
    let interval = shared.config.health_check.interval;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(shared) = weak.upgrade() else {
                break;
            };
            if shared.is_shutting_down() {
                break;
            }
            // Reconnection already owns the probing while it runs.
            if shared.reconnecting.load(Ordering::SeqCst) {
                continue;
            }

            let result = shared.check_health_with_retries().await;
            if !result.healthy {
                let message = result
                    .error
                    .unwrap_or_else(|| "health check failed".to_string());
                shared.handle_fatal_error(&DbError::ConnectionError(message));
            }
        }
    })
}
