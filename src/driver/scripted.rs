//! An in-process driver that records statements instead of talking to a
//! server.
//!
//! It models just enough transaction semantics (BEGIN/COMMIT/ROLLBACK and
//! savepoints) to tell which writes would have survived, and lets callers
//! inject failures, latency and refused connections. The test suite runs
//! entirely against it; embedders can use it for dry runs.

use super::{Driver, DriverConnection};
use crate::core::{DbError, Result, Value};
use crate::result::QueryResult;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One statement seen by the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStatement {
    pub connection_id: u64,
    pub sql: String,
    pub params: Vec<Value>,
}

struct FailureRule {
    pattern: String,
    skip: usize,
    remaining: usize,
    error: DbError,
}

#[derive(Default)]
struct ScriptState {
    journal: Mutex<Vec<ExecutedStatement>>,
    committed: Mutex<Vec<ExecutedStatement>>,
    failures: Mutex<Vec<FailureRule>>,
    responses: Mutex<Vec<(String, QueryResult)>>,
    latency: Mutex<Option<Duration>>,
    refuse_connections: AtomicBool,
    next_connection_id: AtomicU64,
    opened: AtomicU64,
    closed: AtomicU64,
    shutdown_called: AtomicBool,
}

#[derive(Clone, Default)]
pub struct ScriptedDriver {
    state: Arc<ScriptState>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next statement containing `pattern` (case-insensitive).
    pub fn fail_when(&self, pattern: &str, error: DbError) {
        self.fail_times(pattern, 1, error);
    }

    /// Fails the next `times` statements containing `pattern`.
    pub fn fail_times(&self, pattern: &str, times: usize, error: DbError) {
        self.push_rule(pattern, 0, times, error);
    }

    /// Lets `n - 1` matching statements through, then fails the `n`-th.
    pub fn fail_nth(&self, pattern: &str, n: usize, error: DbError) {
        self.push_rule(pattern, n.saturating_sub(1), 1, error);
    }

    fn push_rule(&self, pattern: &str, skip: usize, times: usize, error: DbError) {
        if let Ok(mut rules) = self.state.failures.lock() {
            rules.push(FailureRule {
                pattern: pattern.to_uppercase(),
                skip,
                remaining: times,
                error,
            });
        }
    }

    /// Returns `result` for statements containing `pattern`.
    pub fn respond_with(&self, pattern: &str, result: QueryResult) {
        if let Ok(mut responses) = self.state.responses.lock() {
            responses.push((pattern.to_uppercase(), result));
        }
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut slot) = self.state.latency.lock() {
            *slot = latency;
        }
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Every statement attempted, including ones that failed.
    pub fn statements(&self) -> Vec<ExecutedStatement> {
        self.state
            .journal
            .lock()
            .map(|j| j.clone())
            .unwrap_or_default()
    }

    pub fn sql_log(&self) -> Vec<String> {
        self.statements().into_iter().map(|s| s.sql).collect()
    }

    /// Writes (INSERT/UPDATE/DELETE) that reached a durable state.
    pub fn committed(&self) -> Vec<ExecutedStatement> {
        self.state
            .committed
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn clear_journal(&self) {
        if let Ok(mut journal) = self.state.journal.lock() {
            journal.clear();
        }
        if let Ok(mut committed) = self.state.committed.lock() {
            committed.clear();
        }
    }

    pub fn opened_connections(&self) -> u64 {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn closed_connections(&self) -> u64 {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn was_shut_down(&self) -> bool {
        self.state.shutdown_called.load(Ordering::SeqCst)
    }

    fn take_failure(&self, upper_sql: &str) -> Option<DbError> {
        let mut rules = self.state.failures.lock().ok()?;
        let idx = rules
            .iter()
            .position(|rule| rule.remaining > 0 && upper_sql.contains(&rule.pattern))?;
        let rule = &mut rules[idx];
        if rule.skip > 0 {
            rule.skip -= 1;
            return None;
        }
        rule.remaining -= 1;
        let error = rule.error.clone();
        if rule.remaining == 0 {
            rules.remove(idx);
        }
        Some(error)
    }

    fn scripted_response(&self, upper_sql: &str) -> Option<QueryResult> {
        let responses = self.state.responses.lock().ok()?;
        responses
            .iter()
            .find(|(pattern, _)| upper_sql.contains(pattern))
            .map(|(_, result)| result.clone())
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    async fn connect(&self) -> Result<Box<dyn DriverConnection>> {
        if self.state.refuse_connections.load(Ordering::SeqCst) {
            return Err(DbError::ConnectionError("connection refused".into()));
        }
        let id = self.state.next_connection_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedConnection {
            id,
            driver: self.clone(),
            pending: None,
            savepoints: Vec::new(),
            closed: false,
        }))
    }

    async fn shutdown(&self) -> Result<()> {
        self.state.shutdown_called.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct ScriptedConnection {
    id: u64,
    driver: ScriptedDriver,
    /// Writes issued inside the open transaction, if any.
    pending: Option<Vec<ExecutedStatement>>,
    /// Savepoint name and the pending length at creation.
    savepoints: Vec<(String, usize)>,
    closed: bool,
}

impl ScriptedConnection {
    fn apply_control(&mut self, upper: &str) {
        if upper.starts_with("BEGIN") || upper.starts_with("START TRANSACTION") {
            self.pending = Some(Vec::new());
            self.savepoints.clear();
        } else if upper.starts_with("COMMIT") {
            if let Some(pending) = self.pending.take() {
                if let Ok(mut committed) = self.driver.state.committed.lock() {
                    committed.extend(pending);
                }
            }
            self.savepoints.clear();
        } else if let Some(name) = upper.strip_prefix("ROLLBACK TO SAVEPOINT ") {
            let name = name.trim();
            if let Some(pos) = self.savepoints.iter().rposition(|(n, _)| n == name) {
                let mark = self.savepoints[pos].1;
                self.savepoints.truncate(pos + 1);
                if let Some(pending) = self.pending.as_mut() {
                    pending.truncate(mark);
                }
            }
        } else if upper.starts_with("ROLLBACK") {
            self.pending = None;
            self.savepoints.clear();
        } else if let Some(name) = upper.strip_prefix("SAVEPOINT ") {
            let mark = self.pending.as_ref().map(Vec::len).unwrap_or(0);
            self.savepoints.push((name.trim().to_string(), mark));
        } else if let Some(name) = upper.strip_prefix("RELEASE SAVEPOINT ") {
            let name = name.trim();
            if let Some(pos) = self.savepoints.iter().rposition(|(n, _)| n == name) {
                self.savepoints.truncate(pos);
            }
        }
    }

    fn record_write(&mut self, statement: ExecutedStatement) {
        match self.pending.as_mut() {
            Some(pending) => pending.push(statement),
            None => {
                if let Ok(mut committed) = self.driver.state.committed.lock() {
                    committed.push(statement);
                }
            }
        }
    }
}

fn is_write(upper: &str) -> bool {
    upper.starts_with("INSERT") || upper.starts_with("UPDATE") || upper.starts_with("DELETE")
}

#[async_trait]
impl DriverConnection for ScriptedConnection {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        if self.closed {
            return Err(DbError::ConnectionError("connection is closed".into()));
        }

        let latency = self.driver.state.latency.lock().ok().and_then(|l| *l);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let statement = ExecutedStatement {
            connection_id: self.id,
            sql: sql.to_string(),
            params: params.to_vec(),
        };
        if let Ok(mut journal) = self.driver.state.journal.lock() {
            journal.push(statement.clone());
        }

        let upper = sql.trim().to_uppercase();
        if let Some(err) = self.driver.take_failure(&upper) {
            return Err(err);
        }

        self.apply_control(&upper);

        if let Some(result) = self.driver.scripted_response(&upper) {
            if is_write(&upper) {
                self.record_write(statement);
            }
            return Ok(result);
        }

        if upper == "SELECT 1" {
            return Ok(QueryResult::new(
                vec!["?column?".to_string()],
                vec![vec![Value::Integer(1)]],
            ));
        }

        if is_write(&upper) {
            self.record_write(statement);
            return Ok(QueryResult::affected(1));
        }

        Ok(QueryResult::empty())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.pending = None;
            self.driver.state.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
