//! Background work that runs off the reply path.
//!
//! - [`MaintenanceScheduler`]: periodic reindex per namespace with an overlap guard
//! - [`DetachedTasks`]: bounded fire-and-forget pool, cancelled on shutdown

pub mod detached;
pub mod maintenance;

pub use detached::DetachedTasks;
pub use maintenance::{CycleOutcome, MaintenanceScheduler};
