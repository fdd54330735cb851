pub mod tavily;

use std::sync::Arc;

use quill_core::config::WebSearchConfig;
use quill_core::error::{QuillError, Result};
use quill_core::traits::SearchProvider;

pub use tavily::TavilySearch;

/// Create a search provider from its configuration.
pub fn create_provider(config: &WebSearchConfig) -> Result<Arc<dyn SearchProvider>> {
    match config.provider.as_str() {
        "tavily" => {
            let mut provider = TavilySearch::new(&config.api_key);
            if let Some(ref url) = config.base_url {
                provider = provider.with_base_url(url);
            }
            Ok(Arc::new(provider))
        }
        other => Err(QuillError::Config(format!(
            "unsupported web search provider: {}",
            other
        ))),
    }
}
