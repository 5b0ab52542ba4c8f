//! Durable, filesystem-backed ground truth for runs, tasks, and
//! conversations.
//!
//! Everything here is plain file I/O against `<worktree>/codex-runs/<runId>/`
//! (see [`paths`] for the exact layout). Higher layers (scheduler, worker
//! supervisor, run controller) hold no state that can't be reconstructed by
//! re-reading this directory, which is what makes a restart safe.
//!
//! # Main types
//!
//! - [`RunRecord`] / [`RunStore`] — one run's manifest.
//! - [`TaskRecord`] / [`TaskStore`] — the task graph, one file per task.
//! - [`ConversationEntry`] / [`ConversationLog`] — per-task append-only log.
//! - [`ensure_workflow_expansion`] — the pipeline state machine.

/// Append-only per-task conversation log.
pub mod conversation;
/// The pipeline state machine (`ensure_workflow_expansion`).
pub mod expansion;
/// Record types shared by every store operation.
pub mod model;
/// Stable on-disk path layout.
pub mod paths;
/// Atomic task/run file storage.
pub mod store;

pub use conversation::ConversationLog;
pub use expansion::ensure_workflow_expansion;
pub use model::{
    has_cycle, find_unresolvable_dependencies, ConversationEntry, Role, RunMode, RunRecord,
    RunStatus, TaskKind, TaskRecord, TaskStatus, WorkerOutcome, WorkerOutcomeStatus, WorkerState,
    WorkerStatus,
};
pub use store::{RunStore, TaskStore};
