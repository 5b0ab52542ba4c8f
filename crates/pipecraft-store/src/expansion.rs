//! The pipeline state machine: `ensure_workflow_expansion` looks at the
//! current task set and deterministically creates whatever the next stage
//! needs, guarded by an existence check so re-running it after a crash
//! never duplicates work.
//!
//! Concurrent expansion attempts (e.g. two scheduler ticks racing after a
//! restart) are serialized by an OS-level exclusive lock on `.lock` at the
//! run root, held for the whole expansion window.

use crate::model::{find_unresolvable_dependencies, Role, TaskKind, TaskRecord, TaskStatus};
use crate::store::TaskStore;
use fs2::FileExt;
use pipecraft_core::{EpicId, PipecraftError, PipecraftResult};
use std::fs::OpenOptions;
use std::path::PathBuf;
use tracing::info;

struct ExpansionLock {
    file: std::fs::File,
}

impl ExpansionLock {
    async fn acquire(path: PathBuf) -> PipecraftResult<Self> {
        tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).write(true).open(&path)?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await
        .map_err(|e| PipecraftError::Storage(format!("expansion lock task panicked: {e}")))?
        .map(|file| Self { file })
        .map_err(|e| PipecraftError::Storage(format!("acquiring expansion lock: {e}")))
    }
}

impl Drop for ExpansionLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn is_complete(status: TaskStatus) -> bool {
    matches!(status, TaskStatus::Done | TaskStatus::Approved)
}

/// Runs the pipeline state machine once, under the expansion lock.
/// Returns `true` iff it created or mutated any task.
pub async fn ensure_workflow_expansion(store: &TaskStore, epic_id: EpicId) -> PipecraftResult<bool> {
    let _lock = ExpansionLock::acquire(store.lock_path()).await?;
    let mut tasks = store.read_tasks().await?;
    let mut mutated = false;

    for id in find_unresolvable_dependencies(&tasks) {
        let task = tasks.iter_mut().find(|t| t.id == id).expect("id came from this slice");
        if task.status != TaskStatus::Blocked {
            task.status = TaskStatus::Blocked;
            task.summary = Some("blocked: depends on a task that no longer exists".into());
            store.write_task(task).await?;
            mutated = true;
            info!(task_id = %task.id, "blocked task with unresolvable dependency");
        }
    }

    // Rule 1: Analysis -> Consensus.
    let analyst_a = tasks.iter().find(|t| t.epic_id == epic_id && t.role == Role::AnalystA).cloned();
    let analyst_b = tasks.iter().find(|t| t.epic_id == epic_id && t.role == Role::AnalystB).cloned();
    let consensus_exists = tasks
        .iter()
        .any(|t| t.epic_id == epic_id && t.kind == TaskKind::Consensus && t.role == Role::ConsensusBuilder);
    if let (Some(a), Some(b)) = (&analyst_a, &analyst_b) {
        if !consensus_exists && is_complete(a.status) && is_complete(b.status) {
            let mut consensus = TaskRecord::new(
                store.run_id(),
                epic_id,
                TaskKind::Consensus,
                Role::ConsensusBuilder,
                "Reconcile independent analyses",
                "Merge the two independent analyses into a single agreed plan.",
                a.working_dir.clone(),
                vec![a.id, b.id],
            );
            store.write_task(&mut consensus).await?;
            info!(task_id = %consensus.id, "expansion: created consensus task");
            tasks.push(consensus);
            mutated = true;
        }
    }

    // Rule 2: Consensus -> Splitter.
    let consensus_task = tasks
        .iter()
        .find(|t| t.epic_id == epic_id && t.kind == TaskKind::Consensus && t.role == Role::ConsensusBuilder)
        .cloned();
    let splitter_exists = tasks.iter().any(|t| t.epic_id == epic_id && t.role == Role::Splitter);
    if let Some(consensus) = &consensus_task {
        if !splitter_exists && is_complete(consensus.status) {
            let mut splitter = TaskRecord::new(
                store.run_id(),
                epic_id,
                TaskKind::Consensus,
                Role::Splitter,
                "Split the agreed plan into implementation work",
                "Break the agreed plan into implementer/tester/reviewer tasks.",
                consensus.working_dir.clone(),
                vec![consensus.id],
            );
            store.write_task(&mut splitter).await?;
            info!(task_id = %splitter.id, "expansion: created splitter task");
            tasks.push(splitter);
            mutated = true;
        }
    }

    // Rule 3: Splitter -> Impl/Test/Review fanout.
    let splitter_task = tasks.iter().find(|t| t.epic_id == epic_id && t.role == Role::Splitter).cloned();
    let fanout_exists = tasks
        .iter()
        .any(|t| t.epic_id == epic_id && matches!(t.role, Role::Implementer | Role::Tester | Role::Reviewer));
    if let Some(splitter) = &splitter_task {
        if !fanout_exists && is_complete(splitter.status) {
            let mut implementer = TaskRecord::new(
                store.run_id(),
                epic_id,
                TaskKind::Impl,
                Role::Implementer,
                "Implement the change",
                "Implement the plan produced by the splitter.",
                splitter.working_dir.clone(),
                vec![splitter.id],
            );
            store.write_task(&mut implementer).await?;

            let mut tester = TaskRecord::new(
                store.run_id(),
                epic_id,
                TaskKind::Test,
                Role::Tester,
                "Test the change",
                "Write and run tests covering the implemented change.",
                splitter.working_dir.clone(),
                vec![implementer.id],
            );
            store.write_task(&mut tester).await?;

            let mut reviewer = TaskRecord::new(
                store.run_id(),
                epic_id,
                TaskKind::Review,
                Role::Reviewer,
                "Review the change",
                "Review the implementation and tests for correctness and quality.",
                splitter.working_dir.clone(),
                vec![implementer.id, tester.id],
            );
            reviewer.approvals_required = 1;
            store.write_task(&mut reviewer).await?;

            info!(
                implementer = %implementer.id,
                tester = %tester.id,
                reviewer = %reviewer.id,
                "expansion: created impl/test/review fanout"
            );
            mutated = true;
        }
    }

    Ok(mutated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Role, TaskStatus};
    use pipecraft_core::RunId;

    async fn seeded_store() -> (tempfile::TempDir, TaskStore, EpicId) {
        let tmp = tempfile::tempdir().unwrap();
        let store = TaskStore::new(tmp.path().to_path_buf(), RunId::new());
        let epic_id = EpicId::new();
        store.seed_analysis(epic_id, "Add feature X", None, ".").await.unwrap();
        (tmp, store, epic_id)
    }

    async fn complete(store: &TaskStore, role: Role) {
        let mut tasks = store.read_tasks().await.unwrap();
        let task = tasks.iter_mut().find(|t| t.role == role).unwrap();
        task.status = TaskStatus::Done;
        store.write_task(task).await.unwrap();
    }

    #[tokio::test]
    async fn no_expansion_while_analysts_are_not_done() {
        let (_tmp, store, epic_id) = seeded_store().await;
        let mutated = ensure_workflow_expansion(&store, epic_id).await.unwrap();
        assert!(!mutated);
        assert_eq!(store.read_tasks().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn analysis_done_creates_exactly_one_consensus_task() {
        let (_tmp, store, epic_id) = seeded_store().await;
        complete(&store, Role::AnalystA).await;
        complete(&store, Role::AnalystB).await;

        let mutated = ensure_workflow_expansion(&store, epic_id).await.unwrap();
        assert!(mutated);

        let tasks = store.read_tasks().await.unwrap();
        let consensus: Vec<_> = tasks.iter().filter(|t| t.role == Role::ConsensusBuilder).collect();
        assert_eq!(consensus.len(), 1);
        let a_id = tasks.iter().find(|t| t.role == Role::AnalystA).unwrap().id;
        let b_id = tasks.iter().find(|t| t.role == Role::AnalystB).unwrap().id;
        assert_eq!(
            consensus[0].depends_on.iter().collect::<std::collections::HashSet<_>>(),
            std::collections::HashSet::from([&a_id, &b_id])
        );
    }

    #[tokio::test]
    async fn expansion_is_idempotent() {
        let (_tmp, store, epic_id) = seeded_store().await;
        complete(&store, Role::AnalystA).await;
        complete(&store, Role::AnalystB).await;

        assert!(ensure_workflow_expansion(&store, epic_id).await.unwrap());
        assert!(!ensure_workflow_expansion(&store, epic_id).await.unwrap());
    }

    #[tokio::test]
    async fn full_pipeline_fanout_after_splitter_done() {
        let (_tmp, store, epic_id) = seeded_store().await;
        complete(&store, Role::AnalystA).await;
        complete(&store, Role::AnalystB).await;
        ensure_workflow_expansion(&store, epic_id).await.unwrap();

        complete(&store, Role::ConsensusBuilder).await;
        ensure_workflow_expansion(&store, epic_id).await.unwrap();

        complete(&store, Role::Splitter).await;
        let mutated = ensure_workflow_expansion(&store, epic_id).await.unwrap();
        assert!(mutated);

        let tasks = store.read_tasks().await.unwrap();
        let implementer = tasks.iter().find(|t| t.role == Role::Implementer).unwrap();
        let tester = tasks.iter().find(|t| t.role == Role::Tester).unwrap();
        let reviewer = tasks.iter().find(|t| t.role == Role::Reviewer).unwrap();

        assert_eq!(tester.depends_on, vec![implementer.id]);
        assert_eq!(
            reviewer.depends_on.iter().collect::<std::collections::HashSet<_>>(),
            std::collections::HashSet::from([&implementer.id, &tester.id])
        );
        assert_eq!(reviewer.approvals_required, 1);

        assert_eq!(tester.status, TaskStatus::Ready, "tester must be claimable once created");
        assert!(!tester.is_claimable(&std::collections::HashSet::new()), "not yet, implementer isn't done");

        let done = std::collections::HashSet::from([implementer.id]);
        assert!(tester.is_claimable(&done), "tester becomes claimable once the implementer is done");

        let done_with_tester = std::collections::HashSet::from([implementer.id, tester.id]);
        assert_eq!(reviewer.status, TaskStatus::Ready, "reviewer must be claimable once created");
        assert!(reviewer.is_claimable(&done_with_tester), "reviewer becomes claimable once impl+test are done");
    }

    #[tokio::test]
    async fn a_second_epic_expands_independently_of_a_completed_first() {
        let (_tmp, store, epic_id) = seeded_store().await;
        complete(&store, Role::AnalystA).await;
        complete(&store, Role::AnalystB).await;
        ensure_workflow_expansion(&store, epic_id).await.unwrap();
        complete(&store, Role::ConsensusBuilder).await;
        ensure_workflow_expansion(&store, epic_id).await.unwrap();
        complete(&store, Role::Splitter).await;
        ensure_workflow_expansion(&store, epic_id).await.unwrap();

        let next_epic = EpicId::new();
        let mut a = TaskRecord::new(
            store.run_id(),
            next_epic,
            TaskKind::Analysis,
            Role::AnalystA,
            "Independent analysis (A)",
            "Follow-up stage",
            ".",
            vec![],
        );
        let mut b = TaskRecord::new(
            store.run_id(),
            next_epic,
            TaskKind::Analysis,
            Role::AnalystB,
            "Independent analysis (B)",
            "Follow-up stage",
            ".",
            vec![],
        );
        store.write_task(&mut a).await.unwrap();
        store.write_task(&mut b).await.unwrap();

        let mut tasks = store.read_tasks().await.unwrap();
        for t in tasks.iter_mut() {
            if t.epic_id == next_epic && matches!(t.role, Role::AnalystA | Role::AnalystB) {
                t.status = TaskStatus::Done;
                store.write_task(t).await.unwrap();
            }
        }

        let mutated = ensure_workflow_expansion(&store, next_epic).await.unwrap();
        assert!(mutated);

        let tasks = store.read_tasks().await.unwrap();
        let consensus: Vec<_> = tasks.iter().filter(|t| t.epic_id == next_epic && t.role == Role::ConsensusBuilder).collect();
        assert_eq!(consensus.len(), 1, "the new epic should get its own consensus task");
    }

    #[tokio::test]
    async fn task_with_dangling_dependency_is_blocked() {
        let (_tmp, store, epic_id) = seeded_store().await;
        let ghost = pipecraft_core::TaskId::new();
        let mut dangling = TaskRecord::new(
            store.run_id(),
            epic_id,
            TaskKind::Impl,
            Role::Implementer,
            "orphaned",
            "p",
            ".",
            vec![ghost],
        );
        store.write_task(&mut dangling).await.unwrap();

        let mutated = ensure_workflow_expansion(&store, epic_id).await.unwrap();
        assert!(mutated);

        let reloaded = store.read_task(dangling.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, TaskStatus::Blocked);
    }
}
