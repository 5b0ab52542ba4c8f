use crate::backend::{InvocationOutcome, InvocationRequest, LogSink, ModelBackend};
use pipecraft_core::{PipecraftError, PipecraftResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Configures retry behaviour across a role's `modelPriority` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries per backend before moving to the next one.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

/// Transient failures (subprocess/HTTP flakiness, timeouts) are retried;
/// cancellation and validation errors are not.
fn is_retryable(err: &PipecraftError) -> bool {
    matches!(err, PipecraftError::WorkerCrash(_) | PipecraftError::Timeout(_))
}

fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> u64 {
    let delay = policy.backoff_base_ms.saturating_mul(2u64.saturating_pow(attempt));
    delay.min(policy.backoff_max_ms)
}

/// Picks the first healthy backend from a role's `modelPriority` list and
/// retries transient failures with exponential backoff before falling
/// through to the next backend in priority order.
pub struct ModelSelector {
    backends: Vec<Arc<dyn ModelBackend>>,
    policy: RetryPolicy,
}

impl ModelSelector {
    /// # Panics
    /// Panics if `backends` is empty — a role's `modelPriority` list must
    /// never normalize to zero entries.
    pub fn new(backends: Vec<Arc<dyn ModelBackend>>, policy: RetryPolicy) -> Self {
        assert!(!backends.is_empty(), "ModelSelector requires at least one backend");
        Self { backends, policy }
    }

    /// Returns the first backend in priority order that reports healthy,
    /// or `None` if every backend is currently unavailable.
    pub async fn select_healthy(&self) -> Option<Arc<dyn ModelBackend>> {
        for backend in &self.backends {
            if backend.health_check().await {
                return Some(backend.clone());
            }
        }
        None
    }

    /// Invokes the first healthy backend, retrying transient errors with
    /// backoff before falling through to the next backend in priority order.
    pub async fn invoke(
        &self,
        request: &InvocationRequest,
        log: &LogSink,
        cancel: &CancellationToken,
    ) -> PipecraftResult<InvocationOutcome> {
        let mut last_err: Option<PipecraftError> = None;

        for (idx, backend) in self.backends.iter().enumerate() {
            if !backend.health_check().await {
                info!(backend = idx, "skipping unhealthy backend");
                continue;
            }

            for attempt in 0..=self.policy.max_retries {
                match backend.invoke(request, log, cancel).await {
                    Ok(outcome) => return Ok(outcome),
                    Err(PipecraftError::Cancellation) => return Err(PipecraftError::Cancellation),
                    Err(e) => {
                        if !is_retryable(&e) {
                            warn!(backend = idx, attempt, error = %e, "non-retryable error, moving to next backend");
                            last_err = Some(e);
                            break;
                        }

                        if attempt < self.policy.max_retries {
                            let delay = compute_backoff(&self.policy, attempt);
                            info!(backend = idx, attempt, delay_ms = delay, error = %e, "retryable error, backing off");
                            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                        }
                        last_err = Some(e);
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            PipecraftError::WorkerCrash("all model backends unavailable".into())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    struct MockBackend {
        results: Mutex<Vec<PipecraftResult<InvocationOutcome>>>,
        healthy: bool,
        calls: AtomicU32,
    }

    impl MockBackend {
        fn new(results: Vec<PipecraftResult<InvocationOutcome>>) -> Self {
            Self {
                results: Mutex::new(results),
                healthy: true,
                calls: AtomicU32::new(0),
            }
        }

        fn unhealthy(mut self) -> Self {
            self.healthy = false;
            self
        }
    }

    fn ok(summary: &str) -> PipecraftResult<InvocationOutcome> {
        Ok(InvocationOutcome {
            success: true,
            summary: summary.to_string(),
        })
    }

    #[async_trait]
    impl ModelBackend for MockBackend {
        async fn health_check(&self) -> bool {
            self.healthy
        }

        async fn invoke(
            &self,
            _request: &InvocationRequest,
            _log: &LogSink,
            _cancel: &CancellationToken,
        ) -> PipecraftResult<InvocationOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().await;
            if results.is_empty() {
                Err(PipecraftError::WorkerCrash("no more results".into()))
            } else {
                results.remove(0)
            }
        }
    }

    fn instant_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
        }
    }

    fn dummy_request() -> InvocationRequest {
        InvocationRequest {
            prompt: "do the task".into(),
            worktree: std::path::PathBuf::from("/tmp"),
            max_turns: 1,
        }
    }

    #[tokio::test]
    async fn retries_then_succeeds_on_same_backend() {
        let backend = Arc::new(MockBackend::new(vec![
            Err(PipecraftError::WorkerCrash("flaky".into())),
            ok("done"),
        ]));
        let selector = ModelSelector::new(vec![backend], instant_policy());
        let (log, _rx) = LogSink::new();
        let outcome = selector
            .invoke(&dummy_request(), &log, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.summary, "done");
    }

    #[tokio::test]
    async fn falls_through_to_next_backend_after_retries_exhausted() {
        let first = Arc::new(MockBackend::new(vec![
            Err(PipecraftError::WorkerCrash("down".into())),
            Err(PipecraftError::WorkerCrash("down".into())),
            Err(PipecraftError::WorkerCrash("down".into())),
        ]));
        let second = Arc::new(MockBackend::new(vec![ok("second backend")]));
        let selector = ModelSelector::new(vec![first, second], instant_policy());
        let (log, _rx) = LogSink::new();
        let outcome = selector
            .invoke(&dummy_request(), &log, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.summary, "second backend");
    }

    #[tokio::test]
    async fn skips_unhealthy_backends() {
        let first = Arc::new(MockBackend::new(vec![ok("unreachable")]).unhealthy());
        let second = Arc::new(MockBackend::new(vec![ok("healthy one")]));
        let selector = ModelSelector::new(vec![first, second], instant_policy());
        let (log, _rx) = LogSink::new();
        let outcome = selector
            .invoke(&dummy_request(), &log, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.summary, "healthy one");
    }

    #[test]
    fn backoff_computation() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        };
        assert_eq!(compute_backoff(&policy, 0), 500);
        assert_eq!(compute_backoff(&policy, 3), 4000);
        assert_eq!(compute_backoff(&policy, 6), 30_000);
    }
}
