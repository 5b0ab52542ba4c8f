//! Writes worker output to disk as an artifact file and returns the
//! repo-relative path recorded on the task.
//!
//! Every path returned here is validated to resolve inside the run's
//! artifact directory before anything is written: a worker (or a model
//! that names its own file) cannot escape the worktree with a `..` segment.

use pipecraft_core::{PipecraftError, PipecraftResult, RunId, TaskId};
use pipecraft_store::paths;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Rejects a relative artifact name that would resolve outside `base` once
/// joined, without requiring the file to already exist (`canonicalize`
/// can't be used here — the file is usually being created for the first time).
fn resolve_under(base: &Path, relative: &str) -> PipecraftResult<PathBuf> {
    let candidate = Path::new(relative);
    if candidate.is_absolute() {
        return Err(PipecraftError::Validation(format!(
            "artifact path must be relative: {relative}"
        )));
    }

    let mut depth: i32 = 0;
    for component in candidate.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(PipecraftError::Validation(format!(
                        "artifact path escapes its directory: {relative}"
                    )));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(PipecraftError::Validation(format!(
                    "artifact path must be relative: {relative}"
                )));
            }
        }
    }

    Ok(base.join(candidate))
}

/// Writes `contents` to `<worktree>/codex-runs/<runId>/artifacts/<taskId>/<relative>`
/// and returns the path relative to the worktree, the form stored on
/// [`pipecraft_store::TaskRecord::artifacts`].
pub async fn write_artifact(
    worktree: &Path,
    run_id: RunId,
    task_id: TaskId,
    relative: &str,
    contents: &str,
) -> PipecraftResult<String> {
    let dir = paths::artifacts_dir(worktree, run_id, task_id);
    let path = resolve_under(&dir, relative)?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(&path).await?;
    file.write_all(contents.as_bytes()).await?;
    file.flush().await?;

    let repo_relative = path
        .strip_prefix(worktree)
        .unwrap_or(&path)
        .to_string_lossy()
        .replace('\\', "/");
    Ok(repo_relative)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipecraft_core::{RunId, TaskId};

    #[tokio::test]
    async fn writes_artifact_under_task_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let run_id = RunId::new();
        let task_id = TaskId::new();

        let relative = write_artifact(tmp.path(), run_id, task_id, "summary.md", "hello")
            .await
            .unwrap();

        assert!(relative.contains("artifacts"));
        assert!(relative.ends_with("summary.md"));
        let absolute = tmp.path().join(&relative);
        assert_eq!(tokio::fs::read_to_string(absolute).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn rejects_escaping_relative_path() {
        let tmp = tempfile::tempdir().unwrap();
        let err = write_artifact(tmp.path(), RunId::new(), TaskId::new(), "../../etc/passwd", "x")
            .await
            .unwrap_err();
        assert!(matches!(err, PipecraftError::Validation(_)));
    }

    #[tokio::test]
    async fn rejects_absolute_relative_path() {
        let tmp = tempfile::tempdir().unwrap();
        let err = write_artifact(tmp.path(), RunId::new(), TaskId::new(), "/etc/passwd", "x")
            .await
            .unwrap_err();
        assert!(matches!(err, PipecraftError::Validation(_)));
    }
}
