use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection pool configuration
///
/// Every option has a default; build on top of `PoolConfig::default()`
/// with the setter methods. Durations serialize as milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections opened eagerly when the pool starts
    pub min_connections: usize,

    /// Upper bound on open physical connections
    pub max_connections: usize,

    /// Idle connections older than this are closed instead of reused
    #[serde(with = "option_millis")]
    pub idle_timeout: Option<Duration>,

    /// How long `get_connection` waits for a free slot
    #[serde(with = "millis")]
    pub connection_timeout: Duration,

    /// Maximum connection lifetime
    #[serde(with = "option_millis")]
    pub max_lifetime: Option<Duration>,

    pub health_check: HealthCheckConfig,

    pub reconnection: ReconnectionConfig,

    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    #[serde(with = "millis")]
    pub interval: Duration,
    #[serde(with = "millis")]
    pub timeout: Duration,
    /// Consecutive failed probes tolerated before the pool is declared unhealthy
    pub retries: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionConfig {
    pub enabled: bool,
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub retry_delay: Duration,
    pub exponential_backoff: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub enabled: bool,
    #[serde(with = "millis")]
    pub slow_query_threshold: Duration,
    /// Emit a debug log line for every statement
    pub log_queries: bool,
    /// Number of query metrics retained for inspection
    pub metrics_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            idle_timeout: Some(Duration::from_secs(600)), // 10 minutes
            connection_timeout: Duration::from_secs(30),
            max_lifetime: Some(Duration::from_secs(1800)), // 30 minutes
            health_check: HealthCheckConfig::default(),
            reconnection: ReconnectionConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            retries: 3,
        }
    }
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 5,
            retry_delay: Duration::from_secs(1),
            exponential_backoff: true,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            slow_query_threshold: Duration::from_secs(1),
            log_queries: false,
            metrics_capacity: 1000,
        }
    }
}

impl ReconnectionConfig {
    /// Delay before the zero-based `attempt`: `retry_delay * 2^attempt`
    /// with exponential backoff, a flat `retry_delay` otherwise.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if !self.exponential_backoff {
            return self.retry_delay;
        }
        let factor = 2u32.saturating_pow(attempt);
        self.retry_delay.saturating_mul(factor)
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set minimum connections
    pub fn min_connections(mut self, min: usize) -> Self {
        self.min_connections = min;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set idle timeout
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Set acquisition timeout
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set maximum lifetime
    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = Some(lifetime);
        self
    }

    pub fn health_check(mut self, health_check: HealthCheckConfig) -> Self {
        self.health_check = health_check;
        self
    }

    /// Turn periodic health probing off entirely
    pub fn without_health_check(mut self) -> Self {
        self.health_check.enabled = false;
        self
    }

    pub fn reconnection(mut self, reconnection: ReconnectionConfig) -> Self {
        self.reconnection = reconnection;
        self
    }

    pub fn monitoring(mut self, monitoring: MonitoringConfig) -> Self {
        self.monitoring = monitoring;
        self
    }

    /// Set the slow query threshold
    pub fn slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.monitoring.slow_query_threshold = threshold;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == 0 {
            return Err("max_connections must be > 0".to_string());
        }

        if self.min_connections > self.max_connections {
            return Err("min_connections cannot exceed max_connections".to_string());
        }

        if self.max_connections > u32::MAX as usize {
            return Err("max_connections is too large".to_string());
        }

        if self.connection_timeout.is_zero() {
            return Err("connection_timeout must be > 0".to_string());
        }

        if self.health_check.enabled && self.health_check.interval.is_zero() {
            return Err("health_check.interval must be > 0".to_string());
        }

        if self.monitoring.metrics_capacity == 0 {
            return Err("monitoring.metrics_capacity must be > 0".to_string());
        }

        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod option_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
