use async_trait::async_trait;
use pipecraft_core::PipecraftResult;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Everything a backend needs to invoke a model against one task.
pub struct InvocationRequest {
    /// Fully assembled task prompt (role instructions + task body + context).
    pub prompt: String,
    /// Working copy the model is allowed to read and write inside.
    pub worktree: PathBuf,
    /// Upper bound on agentic turns for backends that support multi-step tool use.
    pub max_turns: u32,
}

/// The result of one model invocation, before the caller turns it into a
/// worker outcome and artifact set.
#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    /// Whether the model reported successful completion of the task.
    pub success: bool,
    /// Human-readable summary surfaced in the conversation log.
    pub summary: String,
}

/// Forwards subprocess/stream output lines to a consumer without blocking
/// the invocation on a slow or absent reader.
#[derive(Clone)]
pub struct LogSink(mpsc::UnboundedSender<String>);

impl LogSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    /// Forwards a line of output. Silently dropped if nothing is listening.
    pub fn emit(&self, line: impl Into<String>) {
        let _ = self.0.send(line.into());
    }
}

/// A model-invocation backend: owns the transport (subprocess or HTTP) for
/// one [`crate::config::ModelConfig`] entry.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Cheap readiness probe used to pick the first usable entry in a
    /// role's `modelPriority` list.
    async fn health_check(&self) -> bool;

    /// Runs the model against `request`, forwarding output to `log` as it
    /// arrives and stopping promptly if `cancel` fires.
    async fn invoke(
        &self,
        request: &InvocationRequest,
        log: &LogSink,
        cancel: &CancellationToken,
    ) -> PipecraftResult<InvocationOutcome>;
}
