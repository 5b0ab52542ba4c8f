//! Append-only per-task conversation log (`conversations/<taskId>.log`).
//!
//! One JSON object per line, opened in append mode so concurrent writers
//! from different worker processes never truncate each other's entries.

use crate::model::ConversationEntry;
use crate::paths;
use pipecraft_core::{PipecraftError, PipecraftResult, RunId, TaskId};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

pub struct ConversationLog {
    worktree: PathBuf,
    run_id: RunId,
}

impl ConversationLog {
    pub fn new(worktree: PathBuf, run_id: RunId) -> Self {
        Self { worktree, run_id }
    }

    pub fn path(&self, task_id: TaskId) -> PathBuf {
        paths::conversation_path(&self.worktree, self.run_id, task_id)
    }

    pub async fn append(
        &self,
        task_id: TaskId,
        author: impl Into<String>,
        message: impl Into<String>,
    ) -> PipecraftResult<ConversationEntry> {
        let entry = ConversationEntry::new(task_id, author, message);
        let path = self.path(task_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| PipecraftError::Storage(format!("opening conversation log: {e}")))?;

        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| PipecraftError::Storage(format!("appending conversation entry: {e}")))?;
        file.flush().await.map_err(|e| {
            PipecraftError::Storage(format!("flushing conversation log: {e}"))
        })?;

        Ok(entry)
    }

    pub async fn read_all(&self, task_id: TaskId) -> PipecraftResult<Vec<ConversationEntry>> {
        let path = self.path(task_id);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PipecraftError::Storage(format!("reading conversation log: {e}"))),
        };

        let entries = data
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(serde_json::from_str::<ConversationEntry>)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_and_read_round_trip_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let log = ConversationLog::new(tmp.path().to_path_buf(), RunId::new());
        let task_id = TaskId::new();

        log.append(task_id, "reviewer", "please fix the off-by-one")
            .await
            .unwrap();
        log.append(task_id, "implementer", "fixed in latest commit")
            .await
            .unwrap();

        let entries = log.read_all(task_id).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].author, "reviewer");
        assert_eq!(entries[1].message, "fixed in latest commit");
    }

    #[tokio::test]
    async fn missing_log_reads_as_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let log = ConversationLog::new(tmp.path().to_path_buf(), RunId::new());
        let entries = log.read_all(TaskId::new()).await.unwrap();
        assert!(entries.is_empty());
    }
}
