//! The `Snapshot` type: everything a fresh subscriber or a `getSnapshot`
//! call needs to render the current state of one worktree's run.

use chrono::{DateTime, Utc};
use pipecraft_core::WorkerId;
use pipecraft_store::{Role, RunRecord, TaskRecord, TaskStatus, WorkerStatus};
use serde::Serialize;
use std::collections::HashMap;

/// Metadata that doesn't belong on any single task or worker record but is
/// cheap to derive from the current set of both.
#[derive(Debug, Clone, Serialize, Default)]
pub struct SnapshotMetadata {
    pub implementer_lock_held_by: Option<WorkerId>,
    /// Worker count per role, keyed by the role's display name.
    pub worker_counts: HashMap<String, usize>,
    /// Configured model ids per role, in priority order, keyed by the
    /// role's display name.
    pub model_priority: HashMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_states: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub run: Option<RunRecord>,
    pub tasks: Vec<TaskRecord>,
    pub workers: Vec<WorkerStatus>,
    pub last_event_at: DateTime<Utc>,
    pub metadata: SnapshotMetadata,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            run: None,
            tasks: Vec::new(),
            workers: Vec::new(),
            last_event_at: Utc::now(),
            metadata: SnapshotMetadata::default(),
        }
    }
}

/// The worker currently holding the (at most one) in-progress `implementer`
/// task, if any — the implementer lock the scheduler enforces.
pub fn implementer_lock_holder(tasks: &[TaskRecord]) -> Option<WorkerId> {
    tasks
        .iter()
        .find(|t| t.role == Role::Implementer && t.status == TaskStatus::InProgress)
        .and_then(|t| t.assignee)
}

pub fn worker_counts(workers: &[WorkerStatus]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for w in workers {
        *counts.entry(w.role.to_string()).or_insert(0) += 1;
    }
    counts
}
