use thiserror::Error;

/// SQLSTATE reported by the backend when it breaks a deadlock.
pub const SQLSTATE_DEADLOCK: &str = "40P01";
/// SQLSTATE reported when a serializable transaction cannot be ordered.
pub const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DbError {
    #[error("Invalid entity key: {0}")]
    InvalidKey(String),

    #[error("Entity {0} is not tracked")]
    NotTracked(String),

    #[error("Entity {0} is not loaded in this unit of work")]
    NotLoaded(String),

    #[error("Entity kind '{0}' has no registered metadata")]
    UnregisteredEntityKind(String),

    #[error("No active transaction: {0}")]
    NoActiveTransaction(String),

    #[error("Savepoint '{0}' not found")]
    SavepointNotFound(String),

    #[error("Deadlock detected: {0}")]
    DeadlockDetected(String),

    #[error("Transaction timed out after {0}ms")]
    TransactionTimeout(u64),

    #[error("Connection pool is shutting down")]
    PoolShuttingDown,

    #[error("Timed out after {0}ms waiting for a pooled connection")]
    AcquireTimeout(u64),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Driver error{}: {message}", display_code(.code))]
    Driver {
        code: Option<String>,
        message: String,
    },

    #[error("Unit of work is closed")]
    UnitOfWorkClosed,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

fn display_code(code: &Option<String>) -> String {
    code.as_deref()
        .map(|c| format!(" [{}]", c))
        .unwrap_or_default()
}

impl DbError {
    /// Builds a driver error, promoting well-known SQLSTATE classes to
    /// their dedicated variants.
    pub fn from_sqlstate(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let message = message.into();
        if code == SQLSTATE_DEADLOCK || code == SQLSTATE_SERIALIZATION_FAILURE {
            return Self::DeadlockDetected(format!("[{}] {}", code, message));
        }
        if code.starts_with("08") {
            return Self::ConnectionError(format!("[{}] {}", code, message));
        }
        Self::Driver {
            code: Some(code),
            message,
        }
    }

    /// Returns `true` for errors that a deadlock retry loop may re-run.
    pub fn is_deadlock(&self) -> bool {
        match self {
            Self::DeadlockDetected(_) => true,
            Self::Driver {
                code: Some(code), ..
            } => code == SQLSTATE_DEADLOCK || code == SQLSTATE_SERIALIZATION_FAILURE,
            _ => false,
        }
    }

    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::ConnectionError(_) => true,
            Self::Driver {
                code: Some(code), ..
            } => code.starts_with("08"),
            _ => false,
        }
    }

    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Self::Driver { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        Self::TypeMismatch(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_classification() {
        assert!(DbError::from_sqlstate("40P01", "deadlock").is_deadlock());
        assert!(DbError::from_sqlstate("40001", "could not serialize").is_deadlock());
        assert!(DbError::from_sqlstate("08006", "connection failure").is_connection_error());

        let unique = DbError::from_sqlstate("23505", "duplicate key");
        assert!(!unique.is_deadlock());
        assert_eq!(unique.sqlstate(), Some("23505"));
    }

    #[test]
    fn test_driver_error_display() {
        let err = DbError::Driver {
            code: Some("42P01".into()),
            message: "relation does not exist".into(),
        };
        assert_eq!(err.to_string(), "Driver error [42P01]: relation does not exist");

        let err = DbError::Driver {
            code: None,
            message: "boom".into(),
        };
        assert_eq!(err.to_string(), "Driver error: boom");
    }
}
