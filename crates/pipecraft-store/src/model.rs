//! On-disk record types for runs, tasks, conversations and worker status.
//!
//! Every enum here is closed: a new variant is a deliberate schema change,
//! not something a caller can extend by adding a string. This mirrors how
//! roles and statuses are matched exhaustively everywhere above the store.

use chrono::{DateTime, Utc};
use pipecraft_core::{EpicId, RunId, TaskId, WorkerId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// High-level lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Bootstrapping,
    Running,
    AwaitingFollowUp,
    Completed,
    Error,
}

/// What kind of work a run's epic represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    ImplementFeature,
    BugHunt,
}

/// A run: one `implement_feature`/`bug_hunt` request and everything it expands into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub worktree_id: String,
    #[serde(default)]
    pub epic_id: Option<EpicId>,
    pub status: RunStatus,
    pub mode: RunMode,
    pub description: String,
    #[serde(default)]
    pub guidance: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
}

impl RunRecord {
    pub fn new(worktree_id: impl Into<String>, mode: RunMode, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: RunId::new(),
            worktree_id: worktree_id.into(),
            epic_id: None,
            status: RunStatus::Idle,
            mode,
            description: description.into(),
            guidance: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The pipeline stage a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Analysis,
    Consensus,
    Impl,
    Test,
    Review,
}

/// Fixed set of agent roles. Each role maps to exactly one [`TaskKind`] slot
/// in the pipeline (see `agent_graph` in `pipecraft-projection`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    AnalystA,
    AnalystB,
    ConsensusBuilder,
    Splitter,
    Implementer,
    Tester,
    Reviewer,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::AnalystA => "analyst_a",
            Role::AnalystB => "analyst_b",
            Role::ConsensusBuilder => "consensus_builder",
            Role::Splitter => "splitter",
            Role::Implementer => "implementer",
            Role::Tester => "tester",
            Role::Reviewer => "reviewer",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a task. `blocked` and `error` are terminal-until-intervention:
/// only a human or a restart can move a task out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Ready,
    InProgress,
    AwaitingReview,
    ChangesRequested,
    Approved,
    Blocked,
    Done,
    Error,
}

/// What a worker concluded about the task it just ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerOutcomeStatus {
    Ok,
    ChangesRequested,
    Blocked,
}

/// The worker's verdict, attached to a task after a model invocation finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerOutcome {
    pub status: WorkerOutcomeStatus,
    pub summary: String,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub document_path: Option<String>,
}

/// A single unit of pipeline work, persisted as one JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub run_id: RunId,
    pub epic_id: EpicId,
    pub kind: TaskKind,
    pub role: Role,
    pub status: TaskStatus,
    pub title: String,
    pub prompt: String,
    pub working_dir: String,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    pub approvals_required: u32,
    #[serde(default)]
    pub approvals: BTreeSet<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub conversation_path: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub worker_outcome: Option<WorkerOutcome>,
    #[serde(default)]
    pub assignee: Option<WorkerId>,
    #[serde(default)]
    pub last_claimed_by: Option<WorkerId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: RunId,
        epic_id: EpicId,
        kind: TaskKind,
        role: Role,
        title: impl Into<String>,
        prompt: impl Into<String>,
        working_dir: impl Into<String>,
        depends_on: Vec<TaskId>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            run_id,
            epic_id,
            kind,
            role,
            // Ready regardless of `depends_on`: `is_claimable` gates on
            // `dependencies_met` separately, so an unmet dependency blocks
            // claiming without needing a distinct status. `Blocked` is
            // reserved for dependencies that can never complete.
            status: TaskStatus::Ready,
            title: title.into(),
            prompt: prompt.into(),
            working_dir: working_dir.into(),
            depends_on,
            // Only the reviewer task requires sign-off before a task can
            // complete; expansion.rs sets this explicitly to 1 for it.
            approvals_required: 0,
            approvals: BTreeSet::new(),
            artifacts: Vec::new(),
            conversation_path: None,
            summary: None,
            worker_outcome: None,
            assignee: None,
            last_claimed_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A task with unmet dependencies is never schedulable, regardless of `status`.
    pub fn dependencies_met(&self, done: &std::collections::HashSet<TaskId>) -> bool {
        self.depends_on.iter().all(|dep| done.contains(dep))
    }

    pub fn is_claimable(&self, done: &std::collections::HashSet<TaskId>) -> bool {
        self.status == TaskStatus::Ready && self.dependencies_met(done)
    }
}

/// One entry in a task's append-only conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub id: uuid::Uuid,
    pub task_id: TaskId,
    pub author: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl ConversationEntry {
    pub fn new(task_id: TaskId, author: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            task_id,
            author: author.into(),
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}

/// Runtime state of a worker, independent of which task it currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Claiming,
    Working,
    Waiting,
    Stopped,
    Error,
}

/// Observable status of one configured worker slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub id: WorkerId,
    pub role: Role,
    pub state: WorkerState,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub description: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub log_tail: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub reasoning_depth: Option<String>,
}

impl WorkerStatus {
    pub fn new(id: WorkerId, role: Role) -> Self {
        let now = Utc::now();
        Self {
            id,
            role,
            state: WorkerState::Idle,
            task_id: None,
            description: None,
            started_at: now,
            updated_at: now,
            pid: None,
            log_tail: None,
            model: None,
            reasoning_depth: None,
        }
    }
}

/// Depth-first cycle detection over `depends_on` edges, three-state visited map
/// (absent / in-progress / done) so a diamond dependency isn't mistaken for a cycle.
pub fn has_cycle(tasks: &[TaskRecord]) -> bool {
    use std::collections::HashMap;

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        InProgress,
        Done,
    }

    let by_id: HashMap<TaskId, &TaskRecord> = tasks.iter().map(|t| (t.id, t)).collect();
    let mut marks: HashMap<TaskId, Mark> = HashMap::new();

    fn visit(
        id: TaskId,
        by_id: &HashMap<TaskId, &TaskRecord>,
        marks: &mut HashMap<TaskId, Mark>,
    ) -> bool {
        match marks.get(&id) {
            Some(Mark::Done) => return false,
            Some(Mark::InProgress) => return true,
            None => {}
        }
        marks.insert(id, Mark::InProgress);
        if let Some(task) = by_id.get(&id) {
            for dep in &task.depends_on {
                if visit(*dep, by_id, marks) {
                    return true;
                }
            }
        }
        marks.insert(id, Mark::Done);
        false
    }

    tasks.iter().any(|t| visit(t.id, &by_id, &mut marks))
}

/// Tasks whose `depends_on` references an id absent from the loaded set.
/// Such tasks are moved to [`TaskStatus::Blocked`] with an error recorded,
/// instead of silently hanging forever waiting on a dependency that will
/// never complete.
pub fn find_unresolvable_dependencies(tasks: &[TaskRecord]) -> Vec<TaskId> {
    let known: std::collections::HashSet<TaskId> = tasks.iter().map(|t| t.id).collect();
    tasks
        .iter()
        .filter(|t| t.depends_on.iter().any(|dep| !known.contains(dep)))
        .map(|t| t.id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(run_id: RunId, epic_id: EpicId, depends_on: Vec<TaskId>) -> TaskRecord {
        TaskRecord::new(
            run_id,
            epic_id,
            TaskKind::Impl,
            Role::Implementer,
            "t",
            "p",
            ".",
            depends_on,
        )
    }

    #[test]
    fn acyclic_chain_has_no_cycle() {
        let run_id = RunId::new();
        let epic_id = EpicId::new();
        let a = task(run_id, epic_id, vec![]);
        let b = task(run_id, epic_id, vec![a.id]);
        assert!(!has_cycle(&[a, b]));
    }

    #[test]
    fn direct_cycle_is_detected() {
        let run_id = RunId::new();
        let epic_id = EpicId::new();
        let mut a = task(run_id, epic_id, vec![]);
        let mut b = task(run_id, epic_id, vec![a.id]);
        a.depends_on.push(b.id);
        b.depends_on.push(a.id);
        assert!(has_cycle(&[a, b]));
    }

    #[test]
    fn diamond_dependency_is_not_a_cycle() {
        let run_id = RunId::new();
        let epic_id = EpicId::new();
        let a = task(run_id, epic_id, vec![]);
        let b = task(run_id, epic_id, vec![a.id]);
        let c = task(run_id, epic_id, vec![a.id]);
        let d = task(run_id, epic_id, vec![b.id, c.id]);
        assert!(!has_cycle(&[a, b, c, d]));
    }

    #[test]
    fn unresolvable_dependency_is_flagged() {
        let run_id = RunId::new();
        let epic_id = EpicId::new();
        let ghost = TaskId::new();
        let a = task(run_id, epic_id, vec![ghost]);
        let flagged = find_unresolvable_dependencies(std::slice::from_ref(&a));
        assert_eq!(flagged, vec![a.id]);
    }

    #[test]
    fn is_claimable_requires_dependencies_done() {
        let run_id = RunId::new();
        let epic_id = EpicId::new();
        let a = task(run_id, epic_id, vec![]);
        let mut b = task(run_id, epic_id, vec![a.id]);
        b.status = TaskStatus::Ready;
        let done = std::collections::HashSet::new();
        assert!(!b.is_claimable(&done));
        let done = std::collections::HashSet::from([a.id]);
        assert!(b.is_claimable(&done));
    }
}
