//! Runs a single task: dispatches model-backed roles through a
//! [`ModelSelector`] and the `tester` role through a configured shell
//! command, then turns whatever came back into a [`WorkerOutcome`] plus a
//! set of validated artifact paths.

use crate::artifacts::write_artifact;
use pipecraft_agent::{InvocationRequest, LogSink, ModelSelector};
use pipecraft_core::{PipecraftError, PipecraftResult, RunId};
use pipecraft_store::{Role, TaskRecord, WorkerOutcome, WorkerOutcomeStatus};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

/// Everything [`WorkerExecutor::execute`] needs for one task run.
#[derive(Clone)]
pub struct ExecutionContext {
    pub worktree: PathBuf,
    pub run_id: RunId,
    pub task: TaskRecord,
    pub selector: Arc<ModelSelector>,
    pub cancel: CancellationToken,
}

/// Runs model-backed roles through a [`ModelSelector`]; runs the `tester`
/// role by shelling out to `test_command` instead, when configured.
pub struct WorkerExecutor {
    test_command: Option<String>,
    max_turns: u32,
}

impl WorkerExecutor {
    pub fn new(test_command: Option<String>, max_turns: u32) -> Self {
        Self { test_command, max_turns }
    }

    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        log: &LogSink,
    ) -> PipecraftResult<(Vec<String>, WorkerOutcome)> {
        if ctx.task.role == Role::Tester {
            if let Some(command) = self.test_command.clone() {
                return self.run_test_command(ctx, &command, log).await;
            }
        }
        self.run_model(ctx, log).await
    }

    async fn run_model(
        &self,
        ctx: &ExecutionContext,
        log: &LogSink,
    ) -> PipecraftResult<(Vec<String>, WorkerOutcome)> {
        let request = InvocationRequest {
            prompt: ctx.task.prompt.clone(),
            worktree: ctx.worktree.join(&ctx.task.working_dir),
            max_turns: self.max_turns,
        };

        let outcome = ctx.selector.invoke(&request, log, &ctx.cancel).await?;
        let artifact_path = write_artifact(
            &ctx.worktree,
            ctx.run_id,
            ctx.task.id,
            "summary.md",
            &outcome.summary,
        )
        .await?;

        let status = if outcome.success {
            WorkerOutcomeStatus::Ok
        } else {
            WorkerOutcomeStatus::ChangesRequested
        };

        Ok((
            vec![artifact_path.clone()],
            WorkerOutcome {
                status,
                summary: outcome.summary,
                details: None,
                document_path: Some(artifact_path),
            },
        ))
    }

    async fn run_test_command(
        &self,
        ctx: &ExecutionContext,
        command: &str,
        log: &LogSink,
    ) -> PipecraftResult<(Vec<String>, WorkerOutcome)> {
        let task_dir = ctx.worktree.join(&ctx.task.working_dir);
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&task_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipecraftError::WorkerCrash(format!("spawning test command: {e}")))?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let log_for_stdout = log.clone();
        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut captured = String::new();
            while let Ok(Some(line)) = lines.next_line().await {
                log_for_stdout.emit(line.clone());
                captured.push_str(&line);
                captured.push('\n');
            }
            captured
        });
        let log_for_stderr = log.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log_for_stderr.emit(format!("stderr: {line}"));
            }
        });

        // tokio only exposes `start_kill`, which issues SIGKILL directly on
        // Unix with no SIGTERM step first. A graceful-stop grace period is
        // out of scope for this in-process command runner.
        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| {
                PipecraftError::WorkerCrash(format!("waiting on test command: {e}"))
            })?,
            _ = ctx.cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(PipecraftError::Cancellation);
            }
        };

        let captured = stdout_task.await.unwrap_or_default();
        let artifact_path = write_artifact(
            &ctx.worktree,
            ctx.run_id,
            ctx.task.id,
            "test-output.log",
            &captured,
        )
        .await?;

        let status_kind = if status.success() {
            WorkerOutcomeStatus::Ok
        } else {
            WorkerOutcomeStatus::Blocked
        };
        let summary = match status.code() {
            Some(code) => format!("test command exited with status {code}"),
            None => "test command terminated by signal".to_string(),
        };

        Ok((
            vec![artifact_path.clone()],
            WorkerOutcome {
                status: status_kind,
                summary,
                details: None,
                document_path: Some(artifact_path),
            },
        ))
    }
}
