//! Owns the configured worker pool for a run: spawning workers per role,
//! dispatching claimed tasks to them through a [`Bridge`], tracking
//! heartbeats, and recovering from a worker that crashed or went silent.

use crate::bridge::Bridge;
use crate::executor::{ExecutionContext, WorkerExecutor};
use chrono::{DateTime, Utc};
use pipecraft_agent::{build_backend, LogSink, ModelConfig, ModelSelector, RetryPolicy};
use pipecraft_core::{PipecraftError, PipecraftResult, RunId, TaskId, WorkerId};
use pipecraft_store::{
    ConversationLog, Role, TaskRecord, TaskStatus, TaskStore, WorkerOutcomeStatus, WorkerState,
    WorkerStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A role's desired worker count and per-slot model fallback chain, as
/// configured through `configureWorkers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpawnConfig {
    pub role: Role,
    pub max_workers: u32,
    pub model_priority: Vec<ModelConfig>,
}

/// Analysts run in parallel pairs by design and get a wider cap; every
/// other role is capped tighter since only one task of that role is ever
/// runnable at a time in the fixed pipeline shape.
fn role_cap(role: Role) -> u32 {
    match role {
        Role::AnalystA | Role::AnalystB => 4,
        _ => 2,
    }
}

/// Clamps `max_workers` to the role's cap and extends `model_priority` to
/// that length by repeating its last entry, so every worker slot has a
/// primary model assigned even when fewer models were configured than workers.
fn normalize(mut config: WorkerSpawnConfig) -> WorkerSpawnConfig {
    config.max_workers = config.max_workers.clamp(1, role_cap(config.role));
    if let Some(last) = config.model_priority.last().cloned() {
        while (config.model_priority.len() as u32) < config.max_workers {
            config.model_priority.push(last.clone());
        }
    }
    config
}

/// Builds the fallback chain for worker slot `index`: its own rotated
/// priority list, starting with the model assigned to that slot and then
/// falling through the rest in order.
fn backend_chain_for_slot(models: &[ModelConfig], index: usize) -> Arc<ModelSelector> {
    let mut rotated = Vec::with_capacity(models.len());
    for offset in 0..models.len() {
        rotated.push(build_backend(&models[(index + offset) % models.len()]));
    }
    Arc::new(ModelSelector::new(rotated, RetryPolicy::default()))
}

struct WorkerHandle {
    status: Mutex<WorkerStatus>,
    bridge: Arc<Bridge>,
    selector: Arc<ModelSelector>,
    last_heartbeat: Mutex<DateTime<Utc>>,
    cancel: CancellationToken,
}

/// Runtime policy knobs threaded through from `pipecraft.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Heartbeat interval `H`; a worker with no heartbeat for `3H` is
    /// declared dead.
    pub heartbeat_interval: Duration,
    pub bridge_timeout: Duration,
    pub max_retries_per_task: u32,
    pub test_command: Option<String>,
    pub max_turns: u32,
}

/// Manages the set of workers configured for one run's worktree.
pub struct WorkerSupervisor {
    worktree: PathBuf,
    run_id: RunId,
    store: Arc<TaskStore>,
    conversation: Arc<ConversationLog>,
    config: SupervisorConfig,
    executor: Arc<WorkerExecutor>,
    configs: Mutex<HashMap<Role, WorkerSpawnConfig>>,
    workers: Mutex<HashMap<WorkerId, Arc<WorkerHandle>>>,
    retries: Mutex<HashMap<TaskId, u32>>,
}

impl WorkerSupervisor {
    pub fn new(
        worktree: PathBuf,
        run_id: RunId,
        store: Arc<TaskStore>,
        conversation: Arc<ConversationLog>,
        config: SupervisorConfig,
    ) -> Self {
        let executor = Arc::new(WorkerExecutor::new(config.test_command.clone(), config.max_turns));
        Self {
            worktree,
            run_id,
            store,
            conversation,
            config,
            executor,
            configs: Mutex::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
            retries: Mutex::new(HashMap::new()),
        }
    }

    /// Stores the desired worker counts and model priorities per role.
    /// Does not itself spawn anything; call [`Self::start`] for that.
    pub async fn configure(&self, spawn_configs: Vec<WorkerSpawnConfig>) -> PipecraftResult<()> {
        if spawn_configs.iter().any(|c| c.model_priority.is_empty()) {
            return Err(PipecraftError::Validation(
                "every role's modelPriority must have at least one entry".into(),
            ));
        }
        let mut configs = self.configs.lock().await;
        for spawn_config in spawn_configs {
            configs.insert(spawn_config.role, normalize(spawn_config));
        }
        Ok(())
    }

    /// Spawns worker slots for every configured role that isn't already running.
    pub async fn start(&self) -> PipecraftResult<()> {
        let configs = self.configs.lock().await.clone();
        let mut workers = self.workers.lock().await;

        let mut running_per_role: HashMap<Role, usize> = HashMap::new();
        for handle in workers.values() {
            let role = handle.status.lock().await.role;
            *running_per_role.entry(role).or_insert(0) += 1;
        }

        for config in configs.values() {
            let running_for_role = running_per_role.get(&config.role).copied().unwrap_or(0);
            for slot in running_for_role..config.max_workers as usize {
                let id = WorkerId::new();
                let selector = backend_chain_for_slot(&config.model_priority, slot);
                let bridge = Arc::new(Bridge::new(self.executor.clone(), self.config.bridge_timeout));
                let handle = Arc::new(WorkerHandle {
                    status: Mutex::new(WorkerStatus::new(id, config.role)),
                    bridge,
                    selector,
                    last_heartbeat: Mutex::new(Utc::now()),
                    cancel: CancellationToken::new(),
                });
                workers.insert(id, handle);
                info!(worker_id = %id, role = %config.role, "spawned worker");
            }
        }
        Ok(())
    }

    /// Signals every worker to stop accepting new work and cancels whatever
    /// it is currently running.
    pub async fn stop(&self) {
        let workers = self.workers.lock().await;
        for (id, handle) in workers.iter() {
            handle.cancel.cancel();
            let mut status = handle.status.lock().await;
            status.state = WorkerState::Stopped;
            status.updated_at = Utc::now();
            info!(worker_id = %id, "worker stopped");
        }
    }

    /// Configured model ids per role, in priority order, as last set by
    /// [`Self::configure`]. Used by the projection to report `modelPriority`.
    pub async fn configured_model_priority(&self) -> HashMap<Role, Vec<String>> {
        let configs = self.configs.lock().await;
        configs
            .iter()
            .map(|(role, config)| (*role, config.model_priority.iter().map(|m| m.model_id.clone()).collect()))
            .collect()
    }

    pub async fn statuses(&self) -> Vec<WorkerStatus> {
        let workers = self.workers.lock().await;
        let mut out = Vec::with_capacity(workers.len());
        for handle in workers.values() {
            out.push(handle.status.lock().await.clone());
        }
        out
    }

    /// Picks an idle worker for `role`, in ascending worker-id order so
    /// assignment is deterministic across ticks.
    pub async fn idle_worker_for(&self, role: Role) -> Option<WorkerId> {
        let workers = self.workers.lock().await;
        let mut candidates: Vec<WorkerId> = Vec::new();
        for (id, handle) in workers.iter() {
            let status = handle.status.lock().await;
            if status.role == role && status.state == WorkerState::Idle {
                candidates.push(*id);
            }
        }
        candidates.sort_by_key(|id| id.0);
        candidates.into_iter().next()
    }

    /// Runs `task` on `worker_id` to completion, persisting the resulting
    /// outcome and advancing the task's status. Retries up to
    /// `max_retries_per_task` times on worker crash before giving up and
    /// leaving the task in `error`.
    pub async fn dispatch(&self, worker_id: WorkerId, task: TaskRecord) -> PipecraftResult<()> {
        let handle = {
            let workers = self.workers.lock().await;
            workers
                .get(&worker_id)
                .cloned()
                .ok_or_else(|| PipecraftError::Validation(format!("unknown worker {worker_id}")))?
        };

        {
            let mut status = handle.status.lock().await;
            status.state = WorkerState::Working;
            status.task_id = Some(task.id);
            status.updated_at = Utc::now();
        }
        *handle.last_heartbeat.lock().await = Utc::now();

        let ctx = ExecutionContext {
            worktree: self.worktree.clone(),
            run_id: self.run_id,
            task: task.clone(),
            selector: handle.selector.clone(),
            cancel: handle.cancel.clone(),
        };
        let (log, mut rx) = LogSink::new();
        let handle_for_log = handle.clone();
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                let mut status = handle_for_log.status.lock().await;
                status.log_tail = Some(line);
                status.updated_at = Utc::now();
            }
        });

        let result = handle.bridge.run(ctx, log).await;

        let mut status = handle.status.lock().await;
        status.state = WorkerState::Idle;
        status.task_id = None;
        status.updated_at = Utc::now();
        drop(status);

        match result {
            Ok((artifacts, outcome)) => {
                let mut task = task;
                task.artifacts = artifacts;
                task.status = match outcome.status {
                    WorkerOutcomeStatus::Ok if task.approvals_required == 0 => TaskStatus::Done,
                    WorkerOutcomeStatus::Ok => TaskStatus::AwaitingReview,
                    WorkerOutcomeStatus::ChangesRequested => TaskStatus::ChangesRequested,
                    WorkerOutcomeStatus::Blocked => TaskStatus::Blocked,
                };
                task.summary = Some(outcome.summary.clone());
                self.conversation
                    .append(task.id, task.role.to_string(), outcome.summary.clone())
                    .await?;
                task.worker_outcome = Some(outcome);
                self.store.write_task(&mut task).await?;
                Ok(())
            }
            Err(PipecraftError::Cancellation) => {
                let mut task = task;
                task.status = TaskStatus::Ready;
                task.last_claimed_by = task.assignee;
                task.assignee = None;
                self.store.write_task(&mut task).await?;
                Err(PipecraftError::Cancellation)
            }
            Err(e) => {
                self.record_crash(&handle, &task, &e).await?;
                Err(e)
            }
        }
    }

    async fn record_crash(
        &self,
        handle: &WorkerHandle,
        task: &TaskRecord,
        err: &PipecraftError,
    ) -> PipecraftResult<()> {
        error!(task_id = %task.id, error = %err, "worker crashed while running task");
        {
            let mut status = handle.status.lock().await;
            status.state = WorkerState::Error;
            status.updated_at = Utc::now();
        }

        let retries = {
            let mut retries = self.retries.lock().await;
            let count = retries.entry(task.id).or_insert(0);
            *count += 1;
            *count
        };

        let mut task = task.clone();
        // A terminal outcome may already have been persisted by the time
        // the crash is observed (e.g. the bridge died delivering the
        // response); never clobber it.
        if matches!(task.status, TaskStatus::Done | TaskStatus::Approved | TaskStatus::Blocked) {
            return Ok(());
        }

        if retries > self.config.max_retries_per_task {
            task.status = TaskStatus::Error;
            task.summary = Some(format!("worker crashed: {err}"));
        } else {
            task.status = TaskStatus::Ready;
            task.last_claimed_by = task.assignee;
            task.assignee = None;
        }
        self.store.write_task(&mut task).await?;
        Ok(())
    }

    /// Marks a worker's heartbeat as seen. Called from whatever channel the
    /// worker uses to report liveness while a long model invocation runs.
    pub async fn record_heartbeat(&self, worker_id: WorkerId) {
        let workers = self.workers.lock().await;
        if let Some(handle) = workers.get(&worker_id) {
            *handle.last_heartbeat.lock().await = Utc::now();
        }
    }

    /// Declares any worker silent for `3 * heartbeat_interval` dead: flips
    /// it to `error` and, if it was holding a task, resets that task back
    /// to `ready` with `last_claimed_by` bumped so the next claim is visibly
    /// a retry.
    pub async fn reap_stale_workers(&self) -> PipecraftResult<()> {
        let stale_after = self.config.heartbeat_interval * 3;
        let workers = self.workers.lock().await;
        for (id, handle) in workers.iter() {
            let elapsed = Utc::now().signed_duration_since(*handle.last_heartbeat.lock().await);
            let elapsed = Duration::from_millis(elapsed.num_milliseconds().max(0) as u64);
            if elapsed <= stale_after {
                continue;
            }

            let mut status = handle.status.lock().await;
            if status.state == WorkerState::Error || status.state == WorkerState::Stopped {
                continue;
            }
            warn!(worker_id = %id, "worker heartbeat stale, declaring error");
            let stuck_task = status.task_id.take();
            status.state = WorkerState::Error;
            status.updated_at = Utc::now();
            drop(status);

            if let Some(task_id) = stuck_task {
                if let Some(mut task) = self.store.read_task(task_id).await? {
                    if !matches!(task.status, TaskStatus::Done | TaskStatus::Approved) {
                        task.status = TaskStatus::Ready;
                        task.last_claimed_by = task.assignee;
                        task.assignee = None;
                        self.store.write_task(&mut task).await?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipecraft_agent::ModelProvider;
    use pipecraft_core::EpicId;
    use pipecraft_store::TaskKind;

    fn claude_code_config() -> ModelConfig {
        ModelConfig {
            provider: ModelProvider::ClaudeCode,
            model_id: "default".into(),
            api_key: String::new(),
            api_base_url: None,
            temperature: 0.7,
            max_tokens: 4096,
        }
    }

    #[test]
    fn normalize_clamps_to_role_cap() {
        let config = WorkerSpawnConfig {
            role: Role::Implementer,
            max_workers: 10,
            model_priority: vec![claude_code_config()],
        };
        let normalized = normalize(config);
        assert_eq!(normalized.max_workers, 2);
        assert_eq!(normalized.model_priority.len(), 2);
    }

    #[test]
    fn normalize_gives_analysts_a_wider_cap() {
        let config = WorkerSpawnConfig {
            role: Role::AnalystA,
            max_workers: 10,
            model_priority: vec![claude_code_config()],
        };
        let normalized = normalize(config);
        assert_eq!(normalized.max_workers, 4);
        assert_eq!(normalized.model_priority.len(), 4);
    }

    #[tokio::test]
    async fn configure_rejects_empty_model_priority() {
        let tmp = tempfile::tempdir().unwrap();
        let run_id = RunId::new();
        let store = Arc::new(TaskStore::new(tmp.path().to_path_buf(), run_id));
        let conversation = Arc::new(ConversationLog::new(tmp.path().to_path_buf(), run_id));
        let supervisor = WorkerSupervisor::new(
            tmp.path().to_path_buf(),
            run_id,
            store,
            conversation,
            SupervisorConfig {
                heartbeat_interval: Duration::from_secs(5),
                bridge_timeout: Duration::from_secs(30),
                max_retries_per_task: 2,
                test_command: None,
                max_turns: 5,
            },
        );

        let err = supervisor
            .configure(vec![WorkerSpawnConfig {
                role: Role::Implementer,
                max_workers: 1,
                model_priority: vec![],
            }])
            .await
            .unwrap_err();
        assert!(matches!(err, PipecraftError::Validation(_)));
    }

    #[tokio::test]
    async fn start_spawns_configured_workers_idle() {
        let tmp = tempfile::tempdir().unwrap();
        let run_id = RunId::new();
        let store = Arc::new(TaskStore::new(tmp.path().to_path_buf(), run_id));
        let conversation = Arc::new(ConversationLog::new(tmp.path().to_path_buf(), run_id));
        let supervisor = WorkerSupervisor::new(
            tmp.path().to_path_buf(),
            run_id,
            store,
            conversation,
            SupervisorConfig {
                heartbeat_interval: Duration::from_secs(5),
                bridge_timeout: Duration::from_secs(30),
                max_retries_per_task: 2,
                test_command: None,
                max_turns: 5,
            },
        );

        supervisor
            .configure(vec![WorkerSpawnConfig {
                role: Role::Implementer,
                max_workers: 2,
                model_priority: vec![claude_code_config()],
            }])
            .await
            .unwrap();
        supervisor.start().await.unwrap();

        let statuses = supervisor.statuses().await;
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.state == WorkerState::Idle));
        assert!(supervisor.idle_worker_for(Role::Implementer).await.is_some());
    }

    #[tokio::test]
    async fn dispatch_runs_task_through_configured_test_command() {
        let tmp = tempfile::tempdir().unwrap();
        let run_id = RunId::new();
        let epic_id = EpicId::new();
        let store = Arc::new(TaskStore::new(tmp.path().to_path_buf(), run_id));
        let conversation = Arc::new(ConversationLog::new(tmp.path().to_path_buf(), run_id));
        let supervisor = WorkerSupervisor::new(
            tmp.path().to_path_buf(),
            run_id,
            store.clone(),
            conversation,
            SupervisorConfig {
                heartbeat_interval: Duration::from_secs(5),
                bridge_timeout: Duration::from_secs(30),
                max_retries_per_task: 2,
                test_command: Some("echo pass".to_string()),
                max_turns: 5,
            },
        );
        supervisor
            .configure(vec![WorkerSpawnConfig {
                role: Role::Tester,
                max_workers: 1,
                model_priority: vec![claude_code_config()],
            }])
            .await
            .unwrap();
        supervisor.start().await.unwrap();
        let worker_id = supervisor.idle_worker_for(Role::Tester).await.unwrap();

        let mut task = TaskRecord::new(run_id, epic_id, TaskKind::Test, Role::Tester, "t", "p", ".", vec![]);
        store.write_task(&mut task).await.unwrap();

        supervisor.dispatch(worker_id, task.clone()).await.unwrap();

        let reloaded = store.read_task(task.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, TaskStatus::Done);
        assert_eq!(reloaded.artifacts.len(), 1);
    }

    #[tokio::test]
    async fn reap_stale_workers_resets_stuck_task_to_ready() {
        let tmp = tempfile::tempdir().unwrap();
        let run_id = RunId::new();
        let epic_id = EpicId::new();
        let store = Arc::new(TaskStore::new(tmp.path().to_path_buf(), run_id));
        let conversation = Arc::new(ConversationLog::new(tmp.path().to_path_buf(), run_id));
        let supervisor = WorkerSupervisor::new(
            tmp.path().to_path_buf(),
            run_id,
            store.clone(),
            conversation,
            SupervisorConfig {
                heartbeat_interval: Duration::from_millis(1),
                bridge_timeout: Duration::from_secs(30),
                max_retries_per_task: 2,
                test_command: None,
                max_turns: 5,
            },
        );
        supervisor
            .configure(vec![WorkerSpawnConfig {
                role: Role::Implementer,
                max_workers: 1,
                model_priority: vec![claude_code_config()],
            }])
            .await
            .unwrap();
        supervisor.start().await.unwrap();
        let worker_id = supervisor.idle_worker_for(Role::Implementer).await.unwrap();

        let mut task = TaskRecord::new(run_id, epic_id, TaskKind::Impl, Role::Implementer, "t", "p", ".", vec![]);
        task.status = TaskStatus::InProgress;
        task.assignee = Some(worker_id);
        store.write_task(&mut task).await.unwrap();

        {
            let workers = supervisor.workers.lock().await;
            let handle = workers.get(&worker_id).unwrap();
            let mut status = handle.status.lock().await;
            status.task_id = Some(task.id);
            *handle.last_heartbeat.lock().await = Utc::now() - chrono::Duration::seconds(10);
        }

        tokio::time::sleep(Duration::from_millis(5)).await;
        supervisor.reap_stale_workers().await.unwrap();

        let reloaded = store.read_task(task.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, TaskStatus::Ready);
        assert_eq!(reloaded.last_claimed_by, Some(worker_id));
    }
}
