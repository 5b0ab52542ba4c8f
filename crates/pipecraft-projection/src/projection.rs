//! Maintains one in-memory [`Snapshot`] per worktree and fans out typed
//! events to subscribers. There is no mutation-callback hook wired into
//! the store or supervisor (both are plain file-backed components with no
//! notion of a listener) so this polls them on an interval instead and
//! diffs against what it last saw — the same tick-and-diff shape already
//! used by [`pipecraft_store::ensure_workflow_expansion`]'s caller and
//! `Scheduler::tick`.
//!
//! Fan-out is non-blocking: each subscriber gets a bounded channel, and a
//! subscriber whose channel is full has its queued diff events replaced by
//! one coalesced `snapshot`, matching the "slow subscribers drop to
//! coalesced snapshot events" rule.

use crate::event::ProjectionEvent;
use crate::graph::agent_graph;
use crate::snapshot::{implementer_lock_holder, worker_counts, Snapshot, SnapshotMetadata};
use chrono::Utc;
use pipecraft_core::{PipecraftResult, RunId, TaskId, WorkerId};
use pipecraft_store::{ConversationLog, RunRecord, RunStore, TaskRecord, TaskStore, WorkerStatus};
use pipecraft_worker::WorkerSupervisor;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

/// Per-subscriber outbox capacity before a subscriber is considered slow.
const SUBSCRIBER_CAPACITY: usize = 64;

struct Subscriber {
    id: Uuid,
    tx: mpsc::Sender<ProjectionEvent>,
}

struct ProjectionState {
    run: Option<RunRecord>,
    tasks: HashMap<TaskId, TaskRecord>,
    workers: Vec<WorkerStatus>,
    worker_log_tails: HashMap<WorkerId, String>,
    conversation_counts: HashMap<TaskId, usize>,
}

impl ProjectionState {
    fn empty() -> Self {
        Self {
            run: None,
            tasks: HashMap::new(),
            workers: Vec::new(),
            worker_log_tails: HashMap::new(),
            conversation_counts: HashMap::new(),
        }
    }
}

/// Watches one worktree's run and serves snapshot + event-stream queries.
pub struct Projection {
    worktree_id: String,
    run_id: RunId,
    run_store: Arc<RunStore>,
    task_store: Arc<TaskStore>,
    conversation: Arc<ConversationLog>,
    supervisor: Arc<WorkerSupervisor>,
    state: Mutex<ProjectionState>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Projection {
    pub fn new(
        worktree_id: impl Into<String>,
        run_id: RunId,
        run_store: Arc<RunStore>,
        task_store: Arc<TaskStore>,
        conversation: Arc<ConversationLog>,
        supervisor: Arc<WorkerSupervisor>,
    ) -> Self {
        Self {
            worktree_id: worktree_id.into(),
            run_id,
            run_store,
            task_store,
            conversation,
            supervisor,
            state: Mutex::new(ProjectionState::empty()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a new subscriber and immediately sends it a full snapshot,
    /// so it observes current state within one tick of subscribing without
    /// waiting for the next diff.
    pub async fn subscribe(&self) -> (Uuid, mpsc::Receiver<ProjectionEvent>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let id = Uuid::new_v4();

        let snapshot = self.current_snapshot().await;
        let _ = tx
            .try_send(ProjectionEvent::Snapshot { worktree_id: self.worktree_id.clone(), snapshot: Box::new(snapshot) });

        self.subscribers.lock().await.push(Subscriber { id, tx });
        (id, rx)
    }

    pub async fn unsubscribe(&self, id: Uuid) {
        self.subscribers.lock().await.retain(|s| s.id != id);
    }

    /// Builds a [`Snapshot`] from the current in-memory state (not from
    /// disk) — callers that want a guaranteed-fresh read should call
    /// [`Self::tick`] first.
    pub async fn current_snapshot(&self) -> Snapshot {
        let state = self.state.lock().await;
        let tasks: Vec<TaskRecord> = state.tasks.values().cloned().collect();
        let model_priority = self.supervisor.configured_model_priority().await;
        Snapshot {
            run: state.run.clone(),
            tasks: tasks.clone(),
            workers: state.workers.clone(),
            last_event_at: Utc::now(),
            metadata: SnapshotMetadata {
                implementer_lock_held_by: implementer_lock_holder(&tasks),
                worker_counts: worker_counts(&state.workers),
                model_priority: model_priority.into_iter().map(|(role, models)| (role.to_string(), models)).collect(),
                agent_states: None,
            },
        }
    }

    /// The derived agent graph for the current in-memory state.
    pub async fn agent_graph(&self) -> crate::graph::AgentGraph {
        let state = self.state.lock().await;
        let tasks: Vec<TaskRecord> = state.tasks.values().cloned().collect();
        agent_graph(&tasks, &state.workers, None)
    }

    /// Re-reads the store and supervisor, diffs against the last-known
    /// state, and fans out whatever changed. Never returns an error to the
    /// caller — failures become an `error` event instead, per the "any
    /// failure raised to the projection" rule.
    pub async fn tick(&self) {
        if let Err(e) = self.tick_inner().await {
            self.dispatch(ProjectionEvent::Error { worktree_id: self.worktree_id.clone(), message: e.to_string() })
                .await;
        }
    }

    async fn tick_inner(&self) -> PipecraftResult<()> {
        let run = self.run_store.read(self.run_id).await.ok();
        let tasks = self.task_store.read_tasks().await?;
        let workers = self.supervisor.statuses().await;

        let mut state = self.state.lock().await;

        let run_status_changed = run.as_ref().map(|r| r.status) != state.run.as_ref().map(|r| r.status);
        state.run = run;

        let mut updated_tasks = Vec::new();
        let mut fresh: HashMap<TaskId, TaskRecord> = HashMap::new();
        for task in tasks {
            let changed = state.tasks.get(&task.id).map(|prev| prev.updated_at) != Some(task.updated_at);
            if changed || !state.tasks.contains_key(&task.id) {
                updated_tasks.push(task.clone());
            }
            fresh.insert(task.id, task);
        }
        let removed_ids: Vec<TaskId> = state.tasks.keys().filter(|id| !fresh.contains_key(id)).copied().collect();
        state.tasks = fresh;

        let workers_changed = workers.iter().any(|w| {
            state
                .workers
                .iter()
                .find(|prev| prev.id == w.id)
                .map(|prev| prev.state != w.state || prev.task_id != w.task_id)
                .unwrap_or(true)
        }) || workers.len() != state.workers.len();

        let mut log_events = Vec::new();
        for w in &workers {
            if let Some(line) = &w.log_tail {
                if state.worker_log_tails.get(&w.id) != Some(line) {
                    state.worker_log_tails.insert(w.id, line.clone());
                    log_events.push(ProjectionEvent::WorkerLog {
                        worktree_id: self.worktree_id.clone(),
                        worker_id: w.id,
                        line: line.clone(),
                    });
                }
            }
        }
        state.workers = workers;

        let mut conversation_events = Vec::new();
        for task_id in state.tasks.keys().copied().collect::<Vec<_>>() {
            let entries = self.conversation.read_all(task_id).await?;
            let seen = state.conversation_counts.entry(task_id).or_insert(0);
            if entries.len() > *seen {
                for entry in &entries[*seen..] {
                    conversation_events.push(ProjectionEvent::ConversationAppended {
                        worktree_id: self.worktree_id.clone(),
                        entry: entry.clone(),
                    });
                }
                *seen = entries.len();
            }
        }

        drop(state);

        if run_status_changed {
            if let Some(run) = self.state.lock().await.run.clone() {
                self.dispatch(ProjectionEvent::RunStatus { worktree_id: self.worktree_id.clone(), status: run.status })
                    .await;
            }
        }
        if !updated_tasks.is_empty() {
            self.dispatch(ProjectionEvent::TasksUpdated { worktree_id: self.worktree_id.clone(), tasks: updated_tasks })
                .await;
        }
        if !removed_ids.is_empty() {
            self.dispatch(ProjectionEvent::TasksRemoved { worktree_id: self.worktree_id.clone(), task_ids: removed_ids })
                .await;
        }
        if workers_changed {
            let workers = self.state.lock().await.workers.clone();
            self.dispatch(ProjectionEvent::WorkersUpdated { worktree_id: self.worktree_id.clone(), workers }).await;
        }
        for event in log_events {
            self.dispatch(event).await;
        }
        for event in conversation_events {
            self.dispatch(event).await;
        }

        Ok(())
    }

    /// Sends `event` to every subscriber, coalescing a full subscriber's
    /// queue down to one fresh snapshot instead of blocking or dropping
    /// silently, and forgetting subscribers whose receiver is gone.
    async fn dispatch(&self, event: ProjectionEvent) {
        let mut subscribers = self.subscribers.lock().await;
        if subscribers.is_empty() {
            return;
        }

        let snapshot = self.current_snapshot().await;
        let mut dead = Vec::new();
        for (idx, sub) in subscribers.iter().enumerate() {
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = %sub.id, "subscriber queue full, coalescing to a fresh snapshot");
                    let coalesced = ProjectionEvent::Snapshot {
                        worktree_id: self.worktree_id.clone(),
                        snapshot: Box::new(snapshot.clone()),
                    };
                    let _ = sub.tx.try_send(coalesced);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(idx),
            }
        }
        for idx in dead.into_iter().rev() {
            subscribers.remove(idx);
        }
    }

    /// Runs [`Self::tick`] on `interval` until `cancel` fires.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.tick().await,
            }
        }
    }
}
