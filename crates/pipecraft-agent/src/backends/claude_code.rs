use crate::backend::{InvocationOutcome, InvocationRequest, LogSink, ModelBackend};
use crate::config::ModelConfig;
use async_trait::async_trait;
use pipecraft_core::{PipecraftError, PipecraftResult};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const DEFAULT_GRACE: Duration = Duration::from_secs(10);

/// Invokes the local `claude` CLI in headless mode (`-p --output-format json`).
///
/// Uses the caller's existing Claude Code subscription; no API key is needed.
pub struct ClaudeCodeBackend {
    model_id: String,
    grace: Duration,
}

impl ClaudeCodeBackend {
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            model_id: config.model_id.clone(),
            grace: DEFAULT_GRACE,
        }
    }

    /// Overrides the grace window given to the subprocess after cancellation
    /// before it is force-killed. Exposed for tests.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

#[async_trait]
impl ModelBackend for ClaudeCodeBackend {
    async fn health_check(&self) -> bool {
        Command::new("claude")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    async fn invoke(
        &self,
        request: &InvocationRequest,
        log: &LogSink,
        cancel: &CancellationToken,
    ) -> PipecraftResult<InvocationOutcome> {
        let mut cmd = Command::new("claude");
        cmd.current_dir(&request.worktree);
        cmd.arg("-p").arg(&request.prompt);
        cmd.arg("--output-format").arg("json");
        cmd.arg("--max-turns").arg(request.max_turns.to_string());
        if !self.model_id.is_empty() && self.model_id != "default" {
            cmd.arg("--model").arg(&self.model_id);
        }
        cmd.arg("--permission-mode").arg("acceptEdits");
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        tracing::info!(worktree = %request.worktree.display(), "spawning claude CLI");

        let mut child = cmd.spawn().map_err(|e| {
            PipecraftError::WorkerCrash(format!("failed to spawn claude CLI: {e}"))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipecraftError::WorkerCrash("claude CLI has no stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PipecraftError::WorkerCrash("claude CLI has no stderr".into()))?;

        let stdout_buf = Arc::new(Mutex::new(String::new()));
        let stdout_task = tokio::spawn(forward_lines(stdout, log.clone(), Some(stdout_buf.clone())));
        let stderr_task = tokio::spawn(forward_lines(stderr, log.clone(), None));

        let status = tokio::select! {
            status = child.wait() => status.map_err(PipecraftError::Io)?,
            _ = cancel.cancelled() => {
                tracing::warn!("cancellation requested, terminating claude CLI");
                let _ = child.start_kill();
                let _ = tokio::time::timeout(self.grace, child.wait()).await;
                return Err(PipecraftError::Cancellation);
            }
        };

        let _ = stdout_task.await;
        let _ = stderr_task.await;

        if !status.success() {
            return Err(PipecraftError::WorkerCrash(format!(
                "claude CLI exited with {status}"
            )));
        }

        let stdout_text = stdout_buf.lock().await.clone();
        parse_result(&stdout_text)
    }
}

async fn forward_lines(
    reader: impl tokio::io::AsyncRead + Unpin,
    log: LogSink,
    buf: Option<Arc<Mutex<String>>>,
) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        log.emit(line.clone());
        if let Some(buf) = &buf {
            let mut buf = buf.lock().await;
            buf.push_str(&line);
            buf.push('\n');
        }
    }
}

fn parse_result(stdout: &str) -> PipecraftResult<InvocationOutcome> {
    let result_json: serde_json::Value = stdout
        .lines()
        .rev()
        .find_map(|line| serde_json::from_str(line).ok())
        .ok_or_else(|| {
            PipecraftError::WorkerCrash(format!(
                "could not parse claude CLI output as JSON: {}",
                &stdout[..stdout.len().min(500)]
            ))
        })?;

    let is_error = result_json["is_error"].as_bool().unwrap_or(false);
    let summary = result_json["result"].as_str().unwrap_or_default().to_string();

    Ok(InvocationOutcome {
        success: !is_error,
        summary,
    })
}
