use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::config::ModelConfig;
use crate::error::{QuillError, Result};
use crate::types::*;

/// LLM client: text generation over a role-tagged message sequence.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a chat request and receive a stream of deltas.
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        options: ChatOptions,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>>;

    /// Send a chat request and collect the full text response.
    ///
    /// A stream error part-way through, or a stream that ends without a stop
    /// signal, fails the whole call. Partial text is never returned.
    fn generate<'a>(
        &'a self,
        config: &'a ModelConfig,
        messages: Vec<ChatMessage>,
        options: ChatOptions,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let mut stream = self.chat_stream(config, messages, options).await?;
            let mut text = String::new();
            let mut stopped = false;
            while let Some(delta) = stream.next().await {
                match delta? {
                    StreamDelta::TextDelta(chunk) => text.push_str(&chunk),
                    StreamDelta::Stop(_) => stopped = true,
                    _ => {}
                }
            }
            if !stopped {
                return Err(QuillError::provider(
                    config.provider.clone(),
                    "stream ended without a stop signal",
                ));
            }
            Ok(text)
        })
    }
}

/// Search provider: ranked documents for a query.
pub trait SearchProvider: Send + Sync + 'static {
    /// Provider name (used in logs and error messages).
    fn name(&self) -> &str;

    /// Return at most `k` documents for `query`, best first.
    fn search(&self, query: &str, k: usize) -> BoxFuture<'_, Result<DocumentSet>>;
}
