//! Isolation boundary between the supervisor and the code that actually
//! runs a task, modeled on the MCP client's subprocess bridge: a background
//! task owns the real work, callers correlate responses by a monotonic
//! message id, and a dead bridge respawns lazily on the next request rather
//! than poisoning every future call.
//!
//! Real OS-process isolation is already provided one layer down, by the
//! subprocess each [`pipecraft_agent::ModelBackend`] spawns for a model
//! invocation. This bridge is an in-process `tokio::spawn`'d task rather
//! than a second OS process; it exists to give abnormal executor exits
//! (panics, not just subprocess failures) the same "fails in flight,
//! respawns lazily" contract the supervisor needs regardless of cause.

use crate::executor::{ExecutionContext, WorkerExecutor};
use pipecraft_agent::LogSink;
use pipecraft_core::{PipecraftError, PipecraftResult};
use pipecraft_store::WorkerOutcome;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

type RunResult = PipecraftResult<(Vec<String>, WorkerOutcome)>;

struct BridgeRequest {
    id: u64,
    ctx: ExecutionContext,
    log: LogSink,
    respond_to: oneshot::Sender<RunResult>,
}

/// Owns the isolated task that runs [`WorkerExecutor`] invocations.
pub struct Bridge {
    executor: Arc<WorkerExecutor>,
    next_id: AtomicU64,
    sender: Mutex<mpsc::UnboundedSender<BridgeRequest>>,
    handle: Mutex<JoinHandle<()>>,
    timeout: Duration,
}

impl Bridge {
    pub fn new(executor: Arc<WorkerExecutor>, timeout: Duration) -> Self {
        let (sender, handle) = Self::spawn_actor(executor.clone());
        Self {
            executor,
            next_id: AtomicU64::new(1),
            sender: Mutex::new(sender),
            handle: Mutex::new(handle),
            timeout,
        }
    }

    fn spawn_actor(
        executor: Arc<WorkerExecutor>,
    ) -> (mpsc::UnboundedSender<BridgeRequest>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<BridgeRequest>();
        let handle = tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let result = executor.execute(&req.ctx, &req.log).await;
                let _ = req.respond_to.send(result);
            }
        });
        (tx, handle)
    }

    /// Runs one task through the bridge, respawning the actor first if the
    /// previous one has exited. Abnormal exit fails the in-flight request
    /// with [`PipecraftError::BridgeLost`]; the supervisor decides whether
    /// the underlying task gets reset to `ready` and requeued.
    pub async fn run(&self, ctx: ExecutionContext, log: LogSink) -> RunResult {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (respond_to, rx) = oneshot::channel();
        let request = BridgeRequest { id, ctx, log, respond_to };

        {
            let mut handle = self.handle.lock().await;
            if handle.is_finished() {
                warn!(message_id = id, "bridge actor exited, respawning before dispatch");
                let (sender, new_handle) = Self::spawn_actor(self.executor.clone());
                *self.sender.lock().await = sender;
                *handle = new_handle;
            }
        }

        let sender = self.sender.lock().await.clone();
        if sender.send(request).is_err() {
            return Err(PipecraftError::BridgeLost(format!(
                "actor channel closed before message {id} was accepted"
            )));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PipecraftError::BridgeLost(format!(
                "actor dropped the response channel for message {id}"
            ))),
            Err(_) => Err(PipecraftError::Timeout(format!(
                "no response for message {id} within {:?}",
                self.timeout
            ))),
        }
    }
}
