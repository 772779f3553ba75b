// ============================================================================
// Transaction Management Module
// ============================================================================
//
// Transactions run on a single pooled connection. The outermost level maps
// to BEGIN/COMMIT/ROLLBACK; each nested level maps to a savepoint, so an
// inner failure only undoes the inner work.
//
// ============================================================================

pub mod events;
pub mod manager;
pub mod state;

pub use events::TransactionEvent;
pub use manager::{TransactionManager, TransactionScope};
pub use state::{
    IsolationLevel, TransactionContext, TransactionId, TransactionOptions, TransactionOutcome,
    TransactionState,
};
