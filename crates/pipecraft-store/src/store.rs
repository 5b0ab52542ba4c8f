//! Filesystem-backed task and run storage.
//!
//! Every write goes through [`atomic_write_json`]: serialize, write to a
//! sibling temp file, `rename` over the destination. A reader never
//! observes a half-written file. Every read tolerates a malformed sibling:
//! it is quarantined with a `.corrupt` suffix rather than failing the
//! whole load.

use crate::model::{RunRecord, TaskRecord};
use crate::paths;
use pipecraft_core::{EpicId, PipecraftError, PipecraftResult, RunId, TaskId};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

async fn atomic_write_json<T: Serialize + Sync>(path: &Path, value: &T) -> PipecraftResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut body = serde_json::to_string_pretty(value)?;
    body.push('\n');

    let temp_path = path.with_extension(format!("json.{}.tmp", Uuid::new_v4()));
    let mut file = tokio::fs::File::create(&temp_path).await?;
    file.write_all(body.as_bytes()).await?;
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}

/// Renames a malformed record file aside so the rest of the store can load.
async fn quarantine(path: &Path, reason: &serde_json::Error) {
    let corrupt = path.with_extension("json.corrupt");
    warn!(path = %path.display(), error = %reason, "quarantining malformed record");
    if let Err(e) = tokio::fs::rename(path, &corrupt).await {
        warn!(path = %path.display(), error = %e, "failed to quarantine malformed record");
    }
}

/// Owns the `tasks/` directory for a single run.
pub struct TaskStore {
    worktree: PathBuf,
    run_id: RunId,
}

impl TaskStore {
    pub fn new(worktree: PathBuf, run_id: RunId) -> Self {
        Self { worktree, run_id }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn lock_path(&self) -> PathBuf {
        paths::lock_path(&self.worktree, self.run_id)
    }

    /// Idempotently creates the `analyst_a`/`analyst_b` seed tasks. If either
    /// already exists for this run, returns the existing pair unchanged.
    pub async fn seed_analysis(
        &self,
        epic_id: EpicId,
        description: &str,
        guidance: Option<&str>,
        working_dir: &str,
    ) -> PipecraftResult<(TaskRecord, TaskRecord)> {
        use crate::model::{Role, TaskKind};

        let existing = self.read_tasks().await?;
        let a = existing.iter().find(|t| t.role == Role::AnalystA).cloned();
        let b = existing.iter().find(|t| t.role == Role::AnalystB).cloned();
        if let (Some(a), Some(b)) = (a, b) {
            return Ok((a, b));
        }

        let prompt = match guidance {
            Some(g) => format!("{description}\n\nGuidance: {g}"),
            None => description.to_string(),
        };

        let mut a = TaskRecord::new(
            self.run_id,
            epic_id,
            TaskKind::Analysis,
            Role::AnalystA,
            "Independent analysis (A)",
            prompt.clone(),
            working_dir,
            vec![],
        );
        let mut b = TaskRecord::new(
            self.run_id,
            epic_id,
            TaskKind::Analysis,
            Role::AnalystB,
            "Independent analysis (B)",
            prompt,
            working_dir,
            vec![],
        );

        self.write_task(&mut a).await?;
        self.write_task(&mut b).await?;
        Ok((a, b))
    }

    pub async fn write_task(&self, task: &mut TaskRecord) -> PipecraftResult<()> {
        task.updated_at = chrono::Utc::now();
        let path = paths::task_path(&self.worktree, self.run_id, task.id);
        atomic_write_json(&path, task).await.map_err(|e| match e {
            PipecraftError::Io(io) => PipecraftError::Storage(format!("writing task {}: {io}", task.id)),
            other => other,
        })
    }

    pub async fn read_task(&self, task_id: TaskId) -> PipecraftResult<Option<TaskRecord>> {
        let path = paths::task_path(&self.worktree, self.run_id, task_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(data) => match serde_json::from_str(&data) {
                Ok(task) => Ok(Some(task)),
                Err(e) => {
                    quarantine(&path, &e).await;
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PipecraftError::Storage(format!("reading task {task_id}: {e}"))),
        }
    }

    /// Loads every task for this run, quarantining and skipping malformed files.
    pub async fn read_tasks(&self) -> PipecraftResult<Vec<TaskRecord>> {
        let dir = paths::tasks_dir(&self.worktree, self.run_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| PipecraftError::Storage(format!("listing tasks dir: {e}")))?;
        let mut tasks = Vec::new();

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PipecraftError::Storage(format!("iterating tasks dir: {e}")))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| PipecraftError::Storage(format!("reading {}: {e}", path.display())))?;
            match serde_json::from_str::<TaskRecord>(&data) {
                Ok(task) => tasks.push(task),
                Err(e) => quarantine(&path, &e).await,
            }
        }

        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }
}

/// Owns `run.json` manifests across all runs in a worktree.
pub struct RunStore {
    worktree: PathBuf,
}

impl RunStore {
    pub fn new(worktree: PathBuf) -> Self {
        Self { worktree }
    }

    pub async fn write(&self, run: &mut RunRecord) -> PipecraftResult<()> {
        run.updated_at = chrono::Utc::now();
        let path = paths::run_manifest_path(&self.worktree, run.run_id);
        atomic_write_json(&path, run).await.map_err(|e| match e {
            PipecraftError::Io(io) => {
                PipecraftError::Storage(format!("writing run manifest {}: {io}", run.run_id))
            }
            other => other,
        })
    }

    pub async fn read(&self, run_id: RunId) -> PipecraftResult<RunRecord> {
        let path = paths::run_manifest_path(&self.worktree, run_id);
        let data = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| PipecraftError::Storage(format!("reading run manifest {run_id}: {e}")))?;
        serde_json::from_str(&data).map_err(|e| {
            PipecraftError::Storage(format!("malformed run manifest {run_id}: {e}"))
        })
    }

    /// Scans `codex-runs/*/run.json`, used by the Run Controller to rebuild
    /// its projection of every run in a worktree on startup.
    pub async fn list(&self) -> PipecraftResult<Vec<RunRecord>> {
        let root = paths::runs_root(&self.worktree);
        if !root.exists() {
            return Ok(Vec::new());
        }

        let mut entries = tokio::fs::read_dir(&root)
            .await
            .map_err(|e| PipecraftError::Storage(format!("listing runs root: {e}")))?;
        let mut runs = Vec::new();

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PipecraftError::Storage(format!("iterating runs root: {e}")))?
        {
            let manifest = entry.path().join("run.json");
            if !manifest.exists() {
                continue;
            }
            let data = tokio::fs::read_to_string(&manifest)
                .await
                .map_err(|e| PipecraftError::Storage(format!("reading {}: {e}", manifest.display())))?;
            match serde_json::from_str::<RunRecord>(&data) {
                Ok(run) => runs.push(run),
                Err(e) => quarantine(&manifest, &e).await,
            }
        }

        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunMode;

    #[tokio::test]
    async fn seed_analysis_creates_two_ready_tasks_with_no_deps() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TaskStore::new(tmp.path().to_path_buf(), RunId::new());
        let epic_id = EpicId::new();

        let (a, b) = store
            .seed_analysis(epic_id, "Add feature X", None, ".")
            .await
            .unwrap();

        assert_eq!(a.status, crate::model::TaskStatus::Ready);
        assert_eq!(b.status, crate::model::TaskStatus::Ready);
        assert!(a.depends_on.is_empty());
        assert!(b.depends_on.is_empty());

        let loaded = store.read_tasks().await.unwrap();
        assert_eq!(loaded.len(), 2);
    }

    #[tokio::test]
    async fn seed_analysis_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TaskStore::new(tmp.path().to_path_buf(), RunId::new());
        let epic_id = EpicId::new();

        let (a1, _) = store.seed_analysis(epic_id, "d", None, ".").await.unwrap();
        let (a2, _) = store.seed_analysis(epic_id, "d", None, ".").await.unwrap();
        assert_eq!(a1.id, a2.id);

        let loaded = store.read_tasks().await.unwrap();
        assert_eq!(loaded.len(), 2);
    }

    #[tokio::test]
    async fn malformed_task_file_is_quarantined_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let run_id = RunId::new();
        let store = TaskStore::new(tmp.path().to_path_buf(), run_id);
        let epic_id = EpicId::new();
        store.seed_analysis(epic_id, "d", None, ".").await.unwrap();

        let dir = paths::tasks_dir(tmp.path(), run_id);
        tokio::fs::write(dir.join("garbage.json"), b"not json")
            .await
            .unwrap();

        let loaded = store.read_tasks().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(dir.join("garbage.json.corrupt").exists());
        assert!(!dir.join("garbage.json").exists());
    }

    #[tokio::test]
    async fn run_store_round_trips_and_lists() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RunStore::new(tmp.path().to_path_buf());
        let mut run = RunRecord::new("WT1", RunMode::ImplementFeature, "Add feature X");
        store.write(&mut run).await.unwrap();

        let loaded = store.read(run.run_id).await.unwrap();
        assert_eq!(loaded.run_id, run.run_id);
        assert_eq!(loaded.description, "Add feature X");

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 1);
    }
}
