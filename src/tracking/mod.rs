// ============================================================================
// Change Tracking Module
// ============================================================================
//
// Entities are tracked as JSON objects behind `Managed` handles. Writes go
// through the handle and record dotted field paths (`profile.bio`); array
// operations record the array's path. Fields whose name starts with `__`
// are internal and never recorded.
//
// ============================================================================

pub mod change;
pub mod entity;
pub mod path;
pub mod tracker;

pub use change::{ChangeType, EntityChange};
pub use entity::{Managed, TrackedEntity};
pub use tracker::{ChangeTracker, TrackerStats};
