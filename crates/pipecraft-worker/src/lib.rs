//! Runs pipeline tasks: executes a role's work (model invocation or test
//! command), isolates that execution behind a respawnable bridge, and
//! supervises a configured pool of workers per run.
//!
//! # Main types
//!
//! - [`WorkerExecutor`] / [`ExecutionContext`] — runs one task to completion.
//! - [`Bridge`] — isolation + respawn boundary around the executor.
//! - [`WorkerSupervisor`] / [`WorkerSpawnConfig`] — owns a run's worker pool.

/// Validated, worktree-confined artifact writes.
pub mod artifacts;
/// Isolation boundary with monotonic-id request/response correlation.
pub mod bridge;
/// Single-task execution: model invocation or configured test command.
pub mod executor;
/// Worker pool lifecycle, dispatch, heartbeats, and crash recovery.
pub mod supervisor;

pub use bridge::Bridge;
pub use executor::{ExecutionContext, WorkerExecutor};
pub use supervisor::{SupervisorConfig, WorkerSpawnConfig, WorkerSupervisor};
