//! Owns the one active run per worktree: its lifecycle, workflow expansion
//! kickoff, and follow-up ingestion. Everything it does is a thin
//! orchestration layer over [`TaskStore`]/[`RunStore`]/[`WorkerSupervisor`]/
//! [`Scheduler`] — the controller holds no state that can't be rebuilt by
//! [`RunController::recover`] re-reading the filesystem.

use pipecraft_core::{EpicId, PipecraftError, PipecraftResult, RunId, TaskId};
use pipecraft_projection::{AgentGraph, Projection, ProjectionEvent, Snapshot};
use pipecraft_scheduler::Scheduler;
use pipecraft_store::{
    ensure_workflow_expansion, ConversationEntry, ConversationLog, Role, RunMode, RunRecord,
    RunStatus, RunStore, TaskKind, TaskRecord, TaskStatus, TaskStore,
};
use pipecraft_worker::{SupervisorConfig, WorkerSpawnConfig, WorkerSupervisor};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A brief for `startRun`: what to work on and how.
#[derive(serde::Deserialize)]
pub struct Briefing {
    pub mode: RunMode,
    pub description: String,
    pub guidance: Option<String>,
    pub working_dir: String,
    pub worker_configs: Vec<WorkerSpawnConfig>,
    pub supervisor_config: SupervisorConfig,
    pub auto_start_workers: bool,
}

struct ActiveRun {
    run_id: RunId,
    /// Shared with the background expansion loop so a follow-up's fresh
    /// epic gets expanded too, not just the one the run started with.
    epic_id: Arc<Mutex<EpicId>>,
    working_dir: String,
    task_store: Arc<TaskStore>,
    conversation: Arc<ConversationLog>,
    supervisor: Arc<WorkerSupervisor>,
    projection: Arc<Projection>,
    scheduler_cancel: CancellationToken,
}

/// Owns run lifecycle for a single worktree.
pub struct RunController {
    worktree: PathBuf,
    worktree_id: String,
    run_store: Arc<RunStore>,
    expansion_interval: Duration,
    current: Mutex<Option<ActiveRun>>,
}

impl RunController {
    pub fn new(worktree: PathBuf, worktree_id: impl Into<String>, expansion_interval: Duration) -> Self {
        let run_store = Arc::new(RunStore::new(worktree.clone()));
        Self {
            worktree,
            worktree_id: worktree_id.into(),
            run_store,
            expansion_interval,
            current: Mutex::new(None),
        }
    }

    /// Rebuilds controller state from disk after a restart: the most
    /// recent non-terminal run (if any) becomes the current run, with a
    /// fresh supervisor that nothing has configured yet — workers and the
    /// scheduler must be explicitly reconfigured and started again.
    pub async fn recover(&self) -> PipecraftResult<Option<RunRecord>> {
        let runs = self.run_store.list().await?;
        let Some(run) = runs
            .into_iter()
            .rev()
            .find(|r| !matches!(r.status, RunStatus::Completed | RunStatus::Error))
        else {
            return Ok(None);
        };

        let task_store = Arc::new(TaskStore::new(self.worktree.clone(), run.run_id));
        let conversation = Arc::new(ConversationLog::new(self.worktree.clone(), run.run_id));
        let supervisor = Arc::new(WorkerSupervisor::new(
            self.worktree.clone(),
            run.run_id,
            task_store.clone(),
            conversation.clone(),
            SupervisorConfig {
                heartbeat_interval: Duration::from_secs(10),
                bridge_timeout: Duration::from_secs(120),
                max_retries_per_task: 2,
                test_command: None,
                max_turns: 20,
            },
        ));
        let projection = Arc::new(Projection::new(
            self.worktree_id.clone(),
            run.run_id,
            self.run_store.clone(),
            task_store.clone(),
            conversation.clone(),
            supervisor.clone(),
        ));

        let mut current = self.current.lock().await;
        *current = Some(ActiveRun {
            run_id: run.run_id,
            epic_id: Arc::new(Mutex::new(run.epic_id.unwrap_or_default())),
            working_dir: ".".to_string(),
            task_store,
            conversation,
            supervisor,
            projection,
            scheduler_cancel: CancellationToken::new(),
        });
        info!(run_id = %run.run_id, "recovered in-flight run from disk");
        Ok(Some(run))
    }

    /// Starts a new run, superseding any prior run that is still active.
    pub async fn start_run(&self, briefing: Briefing) -> PipecraftResult<RunRecord> {
        {
            let current = self.current.lock().await;
            if let Some(active) = current.as_ref() {
                let existing = self.run_store.read(active.run_id).await?;
                if matches!(
                    existing.status,
                    RunStatus::Bootstrapping | RunStatus::Running | RunStatus::AwaitingFollowUp
                ) {
                    return Err(PipecraftError::ConflictState(format!(
                        "run {} is still {:?}",
                        active.run_id, existing.status
                    )));
                }
            }
        }

        let mut run = RunRecord::new(self.worktree_id.clone(), briefing.mode, briefing.description.clone());
        run.guidance = briefing.guidance.clone();
        run.status = RunStatus::Bootstrapping;
        self.run_store.write(&mut run).await?;

        let epic_id = EpicId::new();
        let task_store = Arc::new(TaskStore::new(self.worktree.clone(), run.run_id));
        task_store
            .seed_analysis(epic_id, &briefing.description, briefing.guidance.as_deref(), &briefing.working_dir)
            .await?;

        run.epic_id = Some(epic_id);
        run.status = RunStatus::Running;
        self.run_store.write(&mut run).await?;

        let conversation = Arc::new(ConversationLog::new(self.worktree.clone(), run.run_id));
        let supervisor = Arc::new(WorkerSupervisor::new(
            self.worktree.clone(),
            run.run_id,
            task_store.clone(),
            conversation.clone(),
            briefing.supervisor_config,
        ));
        supervisor.configure(briefing.worker_configs).await?;
        if briefing.auto_start_workers {
            supervisor.start().await?;
        }

        let scheduler_cancel = CancellationToken::new();
        let scheduler = Arc::new(Scheduler::new(task_store.clone(), supervisor.clone(), Duration::from_millis(500)));
        let expansion_store = task_store.clone();
        let expansion_cancel = scheduler_cancel.clone();
        let expansion_interval = self.expansion_interval;
        let run_id_for_log = run.run_id;
        tokio::spawn(async move {
            scheduler.run(expansion_cancel.clone()).await;
            let _ = run_id_for_log;
        });
        let shared_epic_id = Arc::new(Mutex::new(epic_id));
        let expansion_cancel_2 = scheduler_cancel.clone();
        tokio::spawn(run_expansion_loop(
            expansion_store,
            shared_epic_id.clone(),
            expansion_interval,
            expansion_cancel_2,
        ));

        let projection = Arc::new(Projection::new(
            self.worktree_id.clone(),
            run.run_id,
            self.run_store.clone(),
            task_store.clone(),
            conversation.clone(),
            supervisor.clone(),
        ));
        let projection_loop = projection.clone();
        let projection_cancel = scheduler_cancel.clone();
        let projection_interval = self.expansion_interval;
        tokio::spawn(async move { projection_loop.run(projection_interval, projection_cancel).await });

        let mut current = self.current.lock().await;
        *current = Some(ActiveRun {
            run_id: run.run_id,
            epic_id: shared_epic_id,
            working_dir: briefing.working_dir,
            task_store,
            conversation,
            supervisor,
            projection,
            scheduler_cancel,
        });

        Ok(run)
    }

    /// Appends a follow-up as a conversation entry against the run's
    /// thread-anchor task (the consensus task once it exists, the first
    /// analyst task before that), and, once a `reviewer` task has been
    /// `approved`, starts a fresh analysis stage chained off it.
    pub async fn submit_follow_up(&self, description: impl Into<String>) -> PipecraftResult<()> {
        let mut current = self.current.lock().await;
        let active = current.as_mut().ok_or_else(|| {
            PipecraftError::ConflictState("no active run to submit a follow-up to".into())
        })?;

        let current_epic = *active.epic_id.lock().await;
        let tasks: Vec<TaskRecord> = active
            .task_store
            .read_tasks()
            .await?
            .into_iter()
            .filter(|t| t.epic_id == current_epic)
            .collect();
        let anchor = tasks
            .iter()
            .find(|t| t.role == Role::ConsensusBuilder)
            .or_else(|| tasks.iter().find(|t| t.role == Role::AnalystA))
            .ok_or_else(|| PipecraftError::ConflictState("run has no thread-anchor task yet".into()))?;
        active.conversation.append(anchor.id, "user", description).await?;

        let reviewer_approved = tasks
            .iter()
            .any(|t| t.role == Role::Reviewer && t.status == TaskStatus::Approved);
        if reviewer_approved {
            let next_epic = EpicId::new();
            let mut a = TaskRecord::new(
                active.run_id,
                next_epic,
                TaskKind::Analysis,
                Role::AnalystA,
                "Independent analysis (A)",
                "Follow-up stage",
                &active.working_dir,
                vec![],
            );
            let mut b = TaskRecord::new(
                active.run_id,
                next_epic,
                TaskKind::Analysis,
                Role::AnalystB,
                "Independent analysis (B)",
                "Follow-up stage",
                &active.working_dir,
                vec![],
            );
            active.task_store.write_task(&mut a).await?;
            active.task_store.write_task(&mut b).await?;
            *active.epic_id.lock().await = next_epic;
            info!(run_id = %active.run_id, epic_id = %next_epic, "follow-up started a fresh analysis stage");
        }
        Ok(())
    }

    /// Records `approver`'s sign-off on a task; once `approvals.len()` meets
    /// `approvals_required` the task becomes `approved`. Idempotent: the
    /// same approver recorded twice doesn't double-count (approvals is a set).
    /// Once the threshold is already met, further approvers are not recorded,
    /// keeping `approvals.len() <= approvals_required` invariant.
    pub async fn approve_task(&self, task_id: TaskId, approver: impl Into<String>) -> PipecraftResult<TaskRecord> {
        let active = self.active().await?;
        let mut task = active
            .task_store
            .read_task(task_id)
            .await?
            .ok_or_else(|| PipecraftError::Validation(format!("no such task {task_id}")))?;

        if (task.approvals.len() as u32) < task.approvals_required {
            task.approvals.insert(approver.into());
        }
        if task.approvals.len() as u32 >= task.approvals_required {
            task.status = TaskStatus::Approved;
        }
        active.task_store.write_task(&mut task).await?;
        Ok(task)
    }

    /// Writes a conversation entry against `task_id`.
    pub async fn comment_on_task(
        &self,
        task_id: TaskId,
        author: impl Into<String>,
        message: impl Into<String>,
    ) -> PipecraftResult<ConversationEntry> {
        let active = self.active().await?;
        active.conversation.append(task_id, author, message).await
    }

    /// Replaces the active run's worker configuration.
    pub async fn configure_workers(&self, configs: Vec<WorkerSpawnConfig>) -> PipecraftResult<()> {
        let active = self.active().await?;
        active.supervisor.configure(configs).await
    }

    /// Starts workers under the active run's current configuration,
    /// optionally reconfiguring first.
    pub async fn start_workers(&self, configs: Option<Vec<WorkerSpawnConfig>>) -> PipecraftResult<()> {
        let active = self.active().await?;
        if let Some(configs) = configs {
            active.supervisor.configure(configs).await?;
        }
        active.supervisor.start().await
    }

    /// Stops the active run's workers. `roles` is accepted for API parity
    /// with the gateway's `stopWorkers(worktreeId, roles?)` verb but the
    /// supervisor only supports an all-or-nothing stop, so any non-empty
    /// `roles` still stops every role.
    pub async fn stop_workers(&self, _roles: Option<Vec<Role>>) -> PipecraftResult<()> {
        let active = self.active().await?;
        active.supervisor.stop().await;
        Ok(())
    }

    /// Stops the current run's workers and scheduler, and marks it
    /// `completed` (or `error` if `failure` is given).
    pub async fn stop_run(&self, failure: Option<String>) -> PipecraftResult<RunRecord> {
        let mut current = self.current.lock().await;
        let active = current.take().ok_or_else(|| {
            PipecraftError::ConflictState("no active run to stop".into())
        })?;

        active.supervisor.stop().await;
        active.scheduler_cancel.cancel();

        let mut run = self.run_store.read(active.run_id).await?;
        run.status = match &failure {
            Some(_) => RunStatus::Error,
            None => RunStatus::Completed,
        };
        run.error = failure;
        self.run_store.write(&mut run).await?;
        Ok(run)
    }

    /// The current run's full state, for a client that just connected.
    pub async fn snapshot(&self) -> PipecraftResult<Snapshot> {
        let active = self.active().await?;
        Ok(active.projection.current_snapshot().await)
    }

    /// Registers a new event-stream subscriber against the active run's
    /// projection. The returned receiver gets an initial `snapshot` event
    /// before any diffs.
    pub async fn subscribe(&self) -> PipecraftResult<(uuid::Uuid, mpsc::Receiver<ProjectionEvent>)> {
        let active = self.active().await?;
        Ok(active.projection.subscribe().await)
    }

    /// Unregisters a subscriber previously obtained from [`Self::subscribe`].
    pub async fn unsubscribe(&self, id: uuid::Uuid) -> PipecraftResult<()> {
        let active = self.active().await?;
        active.projection.unsubscribe(id).await;
        Ok(())
    }

    /// The pipeline's node/edge view derived from the active run's state.
    pub async fn agent_graph(&self) -> PipecraftResult<AgentGraph> {
        let active = self.active().await?;
        Ok(active.projection.agent_graph().await)
    }

    async fn active(&self) -> PipecraftResult<ActiveRunRef> {
        let current = self.current.lock().await;
        let active = current
            .as_ref()
            .ok_or_else(|| PipecraftError::ConflictState("no active run".into()))?;
        Ok(ActiveRunRef {
            task_store: active.task_store.clone(),
            conversation: active.conversation.clone(),
            projection: active.projection.clone(),
            supervisor: active.supervisor.clone(),
        })
    }
}

struct ActiveRunRef {
    task_store: Arc<TaskStore>,
    conversation: Arc<ConversationLog>,
    projection: Arc<Projection>,
    supervisor: Arc<WorkerSupervisor>,
}

async fn run_expansion_loop(
    store: Arc<TaskStore>,
    epic_id: Arc<Mutex<EpicId>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let current_epic = *epic_id.lock().await;
                if let Err(e) = ensure_workflow_expansion(&store, current_epic).await {
                    warn!(error = %e, "workflow expansion failed");
                }
            }
        }
    }
}
