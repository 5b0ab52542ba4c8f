pub mod claude;
pub mod claude_code;
pub mod openai;

pub use claude::ClaudeBackend;
pub use claude_code::ClaudeCodeBackend;
pub use openai::OpenAiBackend;

use crate::backend::ModelBackend;
use crate::config::{ModelConfig, ModelProvider};
use std::sync::Arc;

/// Builds the right [`ModelBackend`] implementation for a [`ModelConfig`] entry.
pub fn build_backend(config: &ModelConfig) -> Arc<dyn ModelBackend> {
    match config.provider {
        ModelProvider::ClaudeCode => Arc::new(ClaudeCodeBackend::new(config)),
        ModelProvider::Claude => Arc::new(ClaudeBackend::new(config.clone())),
        ModelProvider::OpenAiCompatible => Arc::new(OpenAiBackend::new(config.clone())),
    }
}
