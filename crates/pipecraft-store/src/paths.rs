//! Stable on-disk layout under `<worktree>/codex-runs/<runId>/`.
//!
//! Kept centralized so every crate that touches the filesystem (store,
//! worker, projection recovery) agrees on the same paths without
//! duplicating string formatting.

use pipecraft_core::{RunId, TaskId};
use std::path::{Path, PathBuf};

pub fn runs_root(worktree: &Path) -> PathBuf {
    worktree.join("codex-runs")
}

pub fn run_dir(worktree: &Path, run_id: RunId) -> PathBuf {
    runs_root(worktree).join(run_id.to_string())
}

pub fn run_manifest_path(worktree: &Path, run_id: RunId) -> PathBuf {
    run_dir(worktree, run_id).join("run.json")
}

pub fn tasks_dir(worktree: &Path, run_id: RunId) -> PathBuf {
    run_dir(worktree, run_id).join("tasks")
}

pub fn task_path(worktree: &Path, run_id: RunId, task_id: TaskId) -> PathBuf {
    tasks_dir(worktree, run_id).join(format!("{task_id}.json"))
}

pub fn conversations_dir(worktree: &Path, run_id: RunId) -> PathBuf {
    run_dir(worktree, run_id).join("conversations")
}

pub fn conversation_path(worktree: &Path, run_id: RunId, task_id: TaskId) -> PathBuf {
    conversations_dir(worktree, run_id).join(format!("{task_id}.log"))
}

pub fn artifacts_dir(worktree: &Path, run_id: RunId, task_id: TaskId) -> PathBuf {
    run_dir(worktree, run_id).join("artifacts").join(task_id.to_string())
}

pub fn lock_path(worktree: &Path, run_id: RunId) -> PathBuf {
    run_dir(worktree, run_id).join(".lock")
}
