use crate::backend::{InvocationOutcome, InvocationRequest, LogSink, ModelBackend};
use crate::config::ModelConfig;
use async_trait::async_trait;
use pipecraft_core::{PipecraftError, PipecraftResult};
use tokio_util::sync::CancellationToken;

/// Single-turn completion against any OpenAI-compatible chat completions
/// endpoint (OpenAI, OpenRouter, Groq, ...).
pub struct OpenAiBackend {
    config: ModelConfig,
    http: reqwest::Client,
}

impl OpenAiBackend {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ModelBackend for OpenAiBackend {
    async fn health_check(&self) -> bool {
        !self.config.api_key.is_empty()
    }

    async fn invoke(
        &self,
        request: &InvocationRequest,
        log: &LogSink,
        cancel: &CancellationToken,
    ) -> PipecraftResult<InvocationOutcome> {
        let url = format!("{}/v1/chat/completions", self.config.base_url());

        let body = serde_json::json!({
            "model": self.config.model_id,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "messages": [
                {"role": "user", "content": request.prompt},
            ],
        });

        log.emit(format!("requesting {url}"));

        let send = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
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
                "chat completion error {status}: {resp_body}"
            )));
        }

        let content = resp_body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        log.emit(content.clone());

        Ok(InvocationOutcome {
            success: true,
            summary: content,
        })
    }
}
