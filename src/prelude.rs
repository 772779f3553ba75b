//! Recommended API entrypoints grouped by abstraction level.
//!
//! `dx` covers everyday entity work through a unit of work.
//! `advanced` exposes the collaborators a unit of work is built from.

pub mod dx {
    //! Stable high-level surface for application code.
    //!
    //! Intended usage:
    //! - register `EntityMetadata` per kind,
    //! - load, create and mutate entities through `Managed` handles,
    //! - `UnitOfWork::commit` to write everything at once.
    pub use crate::{
        CommitSummary, ConnectionPool, DbError, EntityId, EntityMetadata, Managed, PoolConfig,
        Result, UnitOfWork,
    };
}

pub mod advanced {
    //! Building blocks for custom orchestration.
    //!
    //! Application code should normally stay on `prelude::dx`.
    pub use crate::driver::{Driver, DriverConnection, ExecutedStatement, ScriptedDriver};
    pub use crate::identity::IdentityMap;
    pub use crate::tracking::{ChangeTracker, EntityChange};
    pub use crate::transaction::{TransactionManager, TransactionOptions, TransactionScope};
}
