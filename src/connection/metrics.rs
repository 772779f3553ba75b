use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

/// Longest statement prefix kept in metrics and logs.
pub const SQL_PREVIEW_LEN: usize = 200;

/// Timing record for one executed statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryMetric {
    pub sql: String,
    pub duration_ms: f64,
    pub success: bool,
    pub row_count: u64,
    pub connection_id: u64,
    pub slow: bool,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub total_connections: usize,
    pub idle_connections: usize,
    pub active_connections: usize,
    pub waiting_requests: usize,
    pub max_connections: usize,
    pub total_queries: u64,
    pub failed_queries: u64,
    pub slow_queries: u64,
    /// Mean latency over the retained metrics window
    pub average_query_ms: f64,
    pub connection_errors: u64,
    pub reconnection_attempts: u64,
    pub healthy: bool,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} active, {} idle, {} waiting, max {}, {} queries ({} slow, {} failed), avg {:.2}ms",
            self.active_connections,
            self.total_connections,
            self.idle_connections,
            self.waiting_requests,
            self.max_connections,
            self.total_queries,
            self.slow_queries,
            self.failed_queries,
            self.average_query_ms
        )
    }
}

/// Bounded ring buffer of recent query metrics plus lifetime counters.
#[derive(Debug)]
pub(crate) struct MetricsRecorder {
    capacity: usize,
    recent: VecDeque<QueryMetric>,
    total: u64,
    failed: u64,
    slow: u64,
}

impl MetricsRecorder {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            recent: VecDeque::with_capacity(capacity.min(1024)),
            total: 0,
            failed: 0,
            slow: 0,
        }
    }

    pub(crate) fn record(&mut self, metric: QueryMetric) {
        self.total += 1;
        if !metric.success {
            self.failed += 1;
        }
        if metric.slow {
            self.slow += 1;
        }
        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(metric);
    }

    /// The newest `limit` metrics, oldest first.
    pub(crate) fn latest(&self, limit: usize) -> Vec<QueryMetric> {
        let skip = self.recent.len().saturating_sub(limit);
        self.recent.iter().skip(skip).cloned().collect()
    }

    pub(crate) fn average_ms(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.recent.iter().map(|m| m.duration_ms).sum();
        sum / self.recent.len() as f64
    }

    pub(crate) fn totals(&self) -> (u64, u64, u64) {
        (self.total, self.failed, self.slow)
    }
}

/// Shortens statements for logs and metrics on a char boundary.
pub(crate) fn sql_preview(sql: &str) -> String {
    if sql.len() <= SQL_PREVIEW_LEN {
        return sql.to_string();
    }
    let mut end = SQL_PREVIEW_LEN;
    while !sql.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &sql[..end])
}
