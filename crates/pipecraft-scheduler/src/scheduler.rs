//! The cooperative tick loop: on each tick, claim the first eligible
//! `ready` task for every idle worker and hand it to the supervisor.
//!
//! Claiming is split into a pure selection step ([`select_claimable_task`],
//! easy to test without any I/O) and a write step that re-reads the chosen
//! task immediately before claiming it, so a concurrent claim from another
//! process is caught instead of silently overwritten — the loser's task
//! stays `ready` and the worker tries again on the next tick, matching the
//! "loser re-enters selection" rule.

use pipecraft_core::{PipecraftResult, TaskId, WorkerId};
use pipecraft_store::{Role, TaskRecord, TaskStatus, TaskStore};
use pipecraft_worker::WorkerSupervisor;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Whether any task of `role` is currently `in_progress`. Used to enforce
/// the implementer lock: at most one `implementer` task runs at a time.
fn role_has_in_progress(tasks: &[TaskRecord], role: Role) -> bool {
    tasks.iter().any(|t| t.role == role && t.status == TaskStatus::InProgress)
}

/// Picks the task `worker_role` should claim next, or `None` if nothing is
/// eligible. Pure function of the current task set; does not mutate anything.
///
/// Eligibility: `status == ready`, `role == worker_role`, every dependency
/// is `done`/`approved`, and — for `implementer` — no other implementer
/// task is currently `in_progress`. Ties broken by `created_at` ascending,
/// then by `id`'s string form ascending.
pub fn select_claimable_task(tasks: &[TaskRecord], worker_role: Role) -> Option<TaskId> {
    if worker_role == Role::Implementer && role_has_in_progress(tasks, Role::Implementer) {
        return None;
    }

    let done: HashSet<TaskId> = tasks
        .iter()
        .filter(|t| matches!(t.status, TaskStatus::Done | TaskStatus::Approved))
        .map(|t| t.id)
        .collect();

    let mut candidates: Vec<&TaskRecord> = tasks
        .iter()
        .filter(|t| t.role == worker_role && t.is_claimable(&done))
        .collect();

    candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.to_string().cmp(&b.id.to_string())));
    candidates.first().map(|t| t.id)
}

/// Runs the tick loop until `cancel` fires.
pub struct Scheduler {
    store: Arc<TaskStore>,
    supervisor: Arc<WorkerSupervisor>,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(store: Arc<TaskStore>, supervisor: Arc<WorkerSupervisor>, tick_interval: Duration) -> Self {
        Self { store, supervisor, tick_interval }
    }

    /// One tick: for every currently-idle worker, try to claim and dispatch
    /// one task. Returns the number of tasks claimed.
    pub async fn tick(&self) -> PipecraftResult<usize> {
        let tasks = self.store.read_tasks().await?;
        let statuses = self.supervisor.statuses().await;

        let mut idle_workers: Vec<(String, WorkerId, Role)> = statuses
            .iter()
            .filter(|s| s.state == pipecraft_store::WorkerState::Idle)
            .map(|s| (s.role.to_string(), s.id, s.role))
            .collect();
        idle_workers.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1 .0.cmp(&b.1 .0)));

        let mut claimed = 0;
        // Re-fetch the task list per worker so a claim made earlier in this
        // same tick is visible to the next worker's selection.
        let mut tasks = tasks;
        for (_, worker_id, role) in idle_workers {
            let Some(task_id) = select_claimable_task(&tasks, role) else {
                continue;
            };

            match self.claim(task_id, worker_id).await? {
                Some(task) => {
                    claimed += 1;
                    if let Some(slot) = tasks.iter_mut().find(|t| t.id == task_id) {
                        slot.status = TaskStatus::InProgress;
                    }
                    let store = self.store.clone();
                    let supervisor = self.supervisor.clone();
                    tokio::spawn(async move {
                        if let Err(e) = supervisor.dispatch(worker_id, task).await {
                            warn!(task_id = %task_id, error = %e, "dispatch failed");
                        }
                        let _ = store;
                    });
                }
                None => {
                    debug!(task_id = %task_id, worker_id = %worker_id, "lost claim race, will reselect next tick");
                }
            }
        }

        Ok(claimed)
    }

    /// Re-reads `task_id` and, if it is still `ready`, atomically claims it
    /// for `worker_id`. Returns `None` if a concurrent writer claimed it first.
    async fn claim(&self, task_id: TaskId, worker_id: WorkerId) -> PipecraftResult<Option<TaskRecord>> {
        let Some(mut task) = self.store.read_task(task_id).await? else {
            return Ok(None);
        };
        if task.status != TaskStatus::Ready {
            return Ok(None);
        }

        task.status = TaskStatus::InProgress;
        task.assignee = Some(worker_id);
        task.last_claimed_by = Some(worker_id);
        self.store.write_task(&mut task).await?;
        info!(task_id = %task_id, worker_id = %worker_id, "claimed task");
        Ok(Some(task))
    }

    /// Runs [`Self::tick`] in a loop on `tick_interval`, stopping when
    /// `cancel` fires. Ticks idle at ≤1s by construction of `tick_interval`.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("scheduler loop stopping");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "scheduler tick failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipecraft_core::{EpicId, RunId};
    use pipecraft_store::TaskKind;

    fn task(role: Role, status: TaskStatus, depends_on: Vec<TaskId>) -> TaskRecord {
        let mut t = TaskRecord::new(RunId::new(), EpicId::new(), TaskKind::Impl, role, "t", "p", ".", depends_on);
        t.status = status;
        t
    }

    #[test]
    fn picks_ready_task_matching_role() {
        let a = task(Role::Implementer, TaskStatus::Ready, vec![]);
        let b = task(Role::Tester, TaskStatus::Ready, vec![]);
        let picked = select_claimable_task(&[a.clone(), b], Role::Implementer).unwrap();
        assert_eq!(picked, a.id);
    }

    #[test]
    fn skips_task_with_unmet_dependency() {
        let dep = task(Role::Implementer, TaskStatus::Ready, vec![]);
        let blocked = task(Role::Tester, TaskStatus::Ready, vec![dep.id]);
        assert!(select_claimable_task(&[dep, blocked], Role::Tester).is_none());
    }

    #[test]
    fn implementer_lock_blocks_second_implementer_claim() {
        let running = task(Role::Implementer, TaskStatus::InProgress, vec![]);
        let waiting = task(Role::Implementer, TaskStatus::Ready, vec![]);
        assert!(select_claimable_task(&[running, waiting], Role::Implementer).is_none());
    }

    #[test]
    fn tie_break_prefers_older_created_at() {
        let mut older = task(Role::Implementer, TaskStatus::Ready, vec![]);
        let mut newer = task(Role::Implementer, TaskStatus::Ready, vec![]);
        older.created_at = chrono::Utc::now() - chrono::Duration::seconds(10);
        newer.created_at = chrono::Utc::now();
        let picked = select_claimable_task(&[newer, older.clone()], Role::Implementer).unwrap();
        assert_eq!(picked, older.id);
    }

    #[tokio::test]
    async fn claim_loses_race_when_task_already_taken() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(TaskStore::new(tmp.path().to_path_buf(), RunId::new()));
        let epic_id = EpicId::new();
        let mut t = TaskRecord::new(store.run_id(), epic_id, TaskKind::Impl, Role::Implementer, "t", "p", ".", vec![]);
        store.write_task(&mut t).await.unwrap();

        // Simulate another process claiming it first.
        let mut stolen = store.read_task(t.id).await.unwrap().unwrap();
        stolen.status = TaskStatus::InProgress;
        stolen.assignee = Some(WorkerId::new());
        store.write_task(&mut stolen).await.unwrap();

        let supervisor_stub = test_supervisor(store.clone()).await;
        let scheduler = Scheduler::new(store, supervisor_stub, Duration::from_millis(50));
        let result = scheduler.claim(t.id, WorkerId::new()).await.unwrap();
        assert!(result.is_none());
    }

    async fn test_supervisor(store: Arc<TaskStore>) -> Arc<WorkerSupervisor> {
        let tmp = tempfile::tempdir().unwrap();
        let conversation = Arc::new(pipecraft_store::ConversationLog::new(tmp.path().to_path_buf(), store.run_id()));
        Arc::new(WorkerSupervisor::new(
            tmp.path().to_path_buf(),
            store.run_id(),
            store,
            conversation,
            pipecraft_worker::SupervisorConfig {
                heartbeat_interval: Duration::from_secs(5),
                bridge_timeout: Duration::from_secs(30),
                max_retries_per_task: 2,
                test_command: None,
                max_turns: 5,
            },
        ))
    }
}
