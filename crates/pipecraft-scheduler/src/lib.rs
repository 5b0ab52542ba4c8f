//! Claims `ready` tasks for idle workers on a cooperative tick loop,
//! honoring dependencies, the implementer lock, and tie-break rules.
//!
//! # Main types
//!
//! - [`Scheduler`] — the tick loop.
//! - [`select_claimable_task`] — pure selection logic, tested without I/O.

/// Tick loop, claim logic, and tie-break rules.
pub mod scheduler;

pub use scheduler::{select_claimable_task, Scheduler};
