//! Owns the one active run per worktree, from `startRun` through follow-up
//! ingestion to `stopRun`, wiring the task store, conversation log, worker
//! supervisor, and scheduler together for that run.
//!
//! # Main types
//!
//! - [`RunController`] — the lifecycle owner.
//! - [`Briefing`] — what `startRun` needs to kick one off.

/// Run lifecycle, workflow-expansion kickoff, and follow-up ingestion.
pub mod controller;

pub use controller::{Briefing, RunController};
pub use pipecraft_projection::{AgentGraph, ProjectionEvent, Snapshot};
