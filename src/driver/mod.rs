// ============================================================================
// Driver Seam
// ============================================================================
//
// The pool never talks to a wire protocol directly. A `Driver` opens
// physical connections; a `DriverConnection` runs parameterized SQL on one
// of them. Errors should carry the backend SQLSTATE (see
// `DbError::from_sqlstate`) so deadlocks and connection failures can be
// told apart from ordinary statement errors.
//
// ============================================================================

pub mod scripted;

use crate::core::{Result, Value};
use crate::result::QueryResult;
use async_trait::async_trait;

pub use scripted::{ExecutedStatement, ScriptedDriver};

#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Opens a new physical connection.
    async fn connect(&self) -> Result<Box<dyn DriverConnection>>;

    /// Called once by `ConnectionPool::close` after every lease has been
    /// returned, so the driver can flush and tear down shared resources.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait DriverConnection: Send {
    /// Executes `sql` with positional parameters bound to `$1..$n`.
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    async fn close(&mut self) -> Result<()>;
}
