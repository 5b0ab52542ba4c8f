//! The event variants a subscriber receives, each carrying the worktree it
//! describes so a subscriber can fan a single channel across worktrees if
//! it wants to.

use crate::snapshot::Snapshot;
use pipecraft_core::TaskId;
use pipecraft_store::{ConversationEntry, RunStatus, TaskRecord, WorkerStatus};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProjectionEvent {
    Snapshot { worktree_id: String, snapshot: Box<Snapshot> },
    RunStatus { worktree_id: String, status: RunStatus },
    TasksUpdated { worktree_id: String, tasks: Vec<TaskRecord> },
    TasksRemoved { worktree_id: String, task_ids: Vec<TaskId> },
    WorkersUpdated { worktree_id: String, workers: Vec<WorkerStatus> },
    WorkerLog { worktree_id: String, worker_id: pipecraft_core::WorkerId, line: String },
    ConversationAppended { worktree_id: String, entry: ConversationEntry },
    Error { worktree_id: String, message: String },
}

impl ProjectionEvent {
    pub fn worktree_id(&self) -> &str {
        match self {
            ProjectionEvent::Snapshot { worktree_id, .. }
            | ProjectionEvent::RunStatus { worktree_id, .. }
            | ProjectionEvent::TasksUpdated { worktree_id, .. }
            | ProjectionEvent::TasksRemoved { worktree_id, .. }
            | ProjectionEvent::WorkersUpdated { worktree_id, .. }
            | ProjectionEvent::WorkerLog { worktree_id, .. }
            | ProjectionEvent::ConversationAppended { worktree_id, .. }
            | ProjectionEvent::Error { worktree_id, .. } => worktree_id,
        }
    }
}
