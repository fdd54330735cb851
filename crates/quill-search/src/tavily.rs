use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use quill_core::error::{QuillError, Result};
use quill_core::traits::SearchProvider;
use quill_core::types::{Document, DocumentSet};

const TAVILY_API_URL: &str = "https://api.tavily.com/search";

/// Tavily web search.
pub struct TavilySearch {
    api_key: String,
    base_url: String,
    http: reqwest::Client,
}

impl TavilySearch {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            base_url: TAVILY_API_URL.to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.to_string();
        self
    }
}

#[derive(Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Deserialize)]
struct TavilyResult {
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    title: Option<String>,
}

/// Convert a Tavily response body into documents, dropping entries without a URL.
pub(crate) fn parse_results(body: &str) -> Result<DocumentSet> {
    let parsed: TavilyResponse = serde_json::from_str(body)
        .map_err(|e| QuillError::provider("tavily", format!("malformed response: {}", e)))?;

    let docs = parsed
        .results
        .into_iter()
        .filter(|r| !r.url.is_empty())
        .map(|r| Document {
            source_url: r.url,
            content: r.content,
            title: r.title.filter(|t| !t.is_empty()),
        })
        .collect::<Vec<_>>();

    Ok(DocumentSet::new(docs))
}

impl SearchProvider for TavilySearch {
    fn name(&self) -> &str {
        "tavily"
    }

    fn search(&self, query: &str, k: usize) -> BoxFuture<'_, Result<DocumentSet>> {
        let query = query.to_string();

        Box::pin(async move {
            debug!(query = %query, k, "Searching Tavily");

            let resp = self
                .http
                .post(&self.base_url)
                .json(&json!({
                    "api_key": self.api_key,
                    "query": query,
                    "max_results": k,
                }))
                .send()
                .await
                .map_err(|e| QuillError::provider("tavily", e.to_string()))?;

            let status = resp.status();
            let body = resp
                .text()
                .await
                .map_err(|e| QuillError::provider("tavily", e.to_string()))?;

            if !status.is_success() {
                return Err(QuillError::provider(
                    "tavily",
                    format!("HTTP {}: {}", status, body),
                ));
            }

            let docs = parse_results(&body)?;
            debug!(results = docs.len(), "Tavily search complete");
            Ok(docs)
        })
    }
}
