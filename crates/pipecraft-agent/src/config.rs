use serde::{Deserialize, Serialize};

/// Which transport a [`ModelConfig`] entry talks over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelProvider {
    /// The local `claude` CLI in headless mode (`-p --output-format json`).
    /// No API key needed — uses the invoking user's existing subscription.
    ClaudeCode,
    /// Anthropic Messages API over HTTPS.
    Claude,
    /// Any OpenAI-compatible chat completions endpoint (OpenAI, OpenRouter, Groq, ...).
    OpenAiCompatible,
}

/// One entry in a role's `modelPriority` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: ModelProvider,
    pub model_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

impl ModelConfig {
    pub fn base_url(&self) -> &str {
        if let Some(url) = &self.api_base_url {
            url
        } else {
            match self.provider {
                ModelProvider::Claude => "https://api.anthropic.com",
                ModelProvider::OpenAiCompatible => "https://api.openai.com",
                ModelProvider::ClaudeCode => "local://claude-cli",
            }
        }
    }
}
