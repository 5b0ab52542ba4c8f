use crate::backend::{InvocationOutcome, InvocationRequest, LogSink, ModelBackend};
use crate::config::ModelConfig;
use async_trait::async_trait;
use pipecraft_core::{PipecraftError, PipecraftResult};
use tokio_util::sync::CancellationToken;

/// Single-turn completion against the Anthropic Messages API.
pub struct ClaudeBackend {
    config: ModelConfig,
    http: reqwest::Client,
}

impl ClaudeBackend {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ModelBackend for ClaudeBackend {
    async fn health_check(&self) -> bool {
        !self.config.api_key.is_empty()
    }

    async fn invoke(
        &self,
        request: &InvocationRequest,
        log: &LogSink,
        cancel: &CancellationToken,
    ) -> PipecraftResult<InvocationOutcome> {
        let url = format!("{}/v1/messages", self.config.base_url());

        let body = serde_json::json!({
            "model": self.config.model_id,
            "max_tokens": self.config.max_tokens,
            "messages": [
                {"role": "user", "content": request.prompt},
            ],
        });

        log.emit(format!("requesting {url}"));

        let send = self
            .http
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send();

        let resp = tokio::select! {
            resp = send => resp.map_err(|e| PipecraftError::WorkerCrash(format!("request failed: {e}")))?,
            _ = cancel.cancelled() => return Err(PipecraftError::Cancellation),
        };

        let status = resp.status();
        let resp_body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| PipecraftError::WorkerCrash(format!("invalid response body: {e}")))?;

        if !status.is_success() {
            return Err(PipecraftError::WorkerCrash(format!(
                "Claude API error {status}: {resp_body}"
            )));
        }

        let content = resp_body["content"]
            .as_array()
            .ok_or_else(|| PipecraftError::WorkerCrash("missing content in Claude response".into()))?
            .iter()
            .filter_map(|block| block["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n");

        log.emit(content.clone());

        Ok(InvocationOutcome {
            success: true,
            summary: content,
        })
    }
}
