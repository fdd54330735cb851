pub mod providers;
pub mod retry;
pub mod streaming;

use std::sync::Arc;

use quill_core::config::{AppConfig, ModelConfig};
use quill_core::traits::LlmClient;

pub use providers::openai::OpenAiClient;
pub use retry::RetryingClient;

/// Create an LLM client based on the provider name.
///
/// Every supported provider (OpenAI, Ollama, vLLM, Groq, OpenRouter, ...)
/// speaks the OpenAI chat-completions protocol.
pub fn create_client(config: &ModelConfig) -> Box<dyn LlmClient> {
    tracing::debug!(provider = %config.provider, model = %config.model_id, "Creating LLM client");
    Box::new(OpenAiClient::new())
}

/// Build the generation client for a config, wrapping it in the retry and
/// fallback chain when either is configured.
pub fn build_client(config: &AppConfig) -> Arc<dyn LlmClient> {
    let primary = create_client(&config.model);
    if config.fallback_models.is_empty() && config.model.retry.is_none() {
        return Arc::from(primary);
    }

    let retry_config = config.model.retry.clone().unwrap_or_default();
    let fallbacks = config
        .fallback_models
        .iter()
        .map(|mc| (mc.clone(), create_client(mc)))
        .collect();
    Arc::new(RetryingClient::new(primary, fallbacks, retry_config))
}
