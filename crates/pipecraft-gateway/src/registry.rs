//! Maps worktree identifiers to their [`RunController`], creating one
//! lazily the first time a given worktree is addressed.

use pipecraft_core::PipecraftResult;
use pipecraft_run::RunController;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

/// Where a worktree's run state lives on disk, keyed by `worktreeId`.
///
/// Worktree creation and git-level management happen outside this crate;
/// the registry only needs a root directory under which `worktreeId`
/// resolves to a subdirectory the controller can read and write.
pub struct WorktreeRegistry {
    root: PathBuf,
    expansion_interval: Duration,
    controllers: Mutex<HashMap<String, Arc<RunController>>>,
}

impl WorktreeRegistry {
    pub fn new(root: PathBuf, expansion_interval: Duration) -> Self {
        Self { root, expansion_interval, controllers: Mutex::new(HashMap::new()) }
    }

    /// Returns the controller for `worktree_id`, creating and recovering
    /// one from disk on first access.
    pub async fn controller(&self, worktree_id: &str) -> PipecraftResult<Arc<RunController>> {
        let mut controllers = self.controllers.lock().await;
        if let Some(existing) = controllers.get(worktree_id) {
            return Ok(existing.clone());
        }

        let controller = Arc::new(RunController::new(
            self.root.join(worktree_id),
            worktree_id,
            self.expansion_interval,
        ));
        if controller.recover().await?.is_some() {
            info!(worktree_id, "recovered in-flight run on first access");
        }
        controllers.insert(worktree_id.to_string(), controller.clone());
        Ok(controller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn controller_is_reused_across_calls() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = WorktreeRegistry::new(tmp.path().to_path_buf(), Duration::from_millis(50));
        let a = registry.controller("wt1").await.unwrap();
        let b = registry.controller("wt1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn distinct_worktree_ids_get_distinct_controllers() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = WorktreeRegistry::new(tmp.path().to_path_buf(), Duration::from_millis(50));
        let a = registry.controller("wt1").await.unwrap();
        let b = registry.controller("wt2").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
