//! Shared fakes and fixtures for Quill tests.
//!
//! `MockLlm` and `MockSearch` are cheap to clone; clones share their script and
//! their request log, so a test can hand one clone to the code under test and
//! keep another to inspect what was sent.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;

use quill_core::config::{AppConfig, ModelConfig};
use quill_core::error::{QuillError, Result};
use quill_core::traits::{LlmClient, SearchProvider};
use quill_core::types::*;

#[derive(Debug, Clone)]
enum Scripted {
    Text(String),
    Fail(String),
}

/// A request captured by [`MockLlm`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub messages: Vec<ChatMessage>,
    pub options: ChatOptions,
}

impl RecordedRequest {
    pub fn system(&self) -> &str {
        self.messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.text())
            .unwrap_or("")
    }

    pub fn user(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text())
            .unwrap_or("")
    }
}

#[derive(Default)]
struct MockLlmInner {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<RecordedRequest>>,
    fallback: Mutex<Option<String>>,
    delay: Mutex<Option<Duration>>,
}

/// Scripted generation provider. Replies are consumed in order.
#[derive(Clone, Default)]
pub struct MockLlm {
    inner: Arc<MockLlmInner>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful reply.
    pub fn then_text(self, text: impl Into<String>) -> Self {
        self.inner
            .script
            .lock()
            .unwrap()
            .push_back(Scripted::Text(text.into()));
        self
    }

    /// Queue a provider failure.
    pub fn then_fail(self, message: impl Into<String>) -> Self {
        self.inner
            .script
            .lock()
            .unwrap()
            .push_back(Scripted::Fail(message.into()));
        self
    }

    /// Reply used once the script is exhausted. Without one, an exhausted
    /// script fails the call.
    pub fn otherwise(self, text: impl Into<String>) -> Self {
        *self.inner.fallback.lock().unwrap() = Some(text.into());
        self
    }

    /// Sleep before answering each call.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.inner.delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.inner.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.inner.requests.lock().unwrap().len()
    }

    fn next_reply(&self) -> Scripted {
        let next = self.inner.script.lock().unwrap().pop_front();
        match next {
            Some(reply) => reply,
            None => match self.inner.fallback.lock().unwrap().clone() {
                Some(text) => Scripted::Text(text),
                None => Scripted::Fail("mock script exhausted".to_string()),
            },
        }
    }
}

impl LlmClient for MockLlm {
    fn chat_stream(
        &self,
        _config: &ModelConfig,
        messages: Vec<ChatMessage>,
        options: ChatOptions,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        Box::pin(async move {
            let delay = *self.inner.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            self.inner
                .requests
                .lock()
                .unwrap()
                .push(RecordedRequest { messages, options });

            match self.next_reply() {
                Scripted::Text(text) => {
                    // Two chunks, so callers must accumulate deltas.
                    let mid = text
                        .char_indices()
                        .nth(text.chars().count() / 2)
                        .map(|(i, _)| i)
                        .unwrap_or(0);
                    let (head, tail) = text.split_at(mid);
                    let deltas = vec![
                        Ok(StreamDelta::TextDelta(head.to_string())),
                        Ok(StreamDelta::TextDelta(tail.to_string())),
                        Ok(StreamDelta::Stop(StopReason::EndTurn)),
                    ];
                    Ok(Box::pin(futures::stream::iter(deltas)) as BoxStream<'_, Result<StreamDelta>>)
                }
                Scripted::Fail(message) => Err(QuillError::provider("mock", message)),
            }
        })
    }
}

#[derive(Default)]
struct MockSearchInner {
    documents: DocumentSet,
    failure: Option<String>,
    queries: Mutex<Vec<(String, usize)>>,
}

/// Search provider returning a fixed document set.
#[derive(Clone)]
pub struct MockSearch {
    inner: Arc<MockSearchInner>,
}

impl MockSearch {
    pub fn new(documents: DocumentSet) -> Self {
        Self {
            inner: Arc::new(MockSearchInner {
                documents,
                ..Default::default()
            }),
        }
    }

    /// A provider whose every call fails.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(MockSearchInner {
                failure: Some(message.into()),
                ..Default::default()
            }),
        }
    }

    /// Queries received so far, with the requested result count.
    pub fn queries(&self) -> Vec<(String, usize)> {
        self.inner.queries.lock().unwrap().clone()
    }
}

impl SearchProvider for MockSearch {
    fn name(&self) -> &str {
        "mock"
    }

    fn search(&self, query: &str, k: usize) -> BoxFuture<'_, Result<DocumentSet>> {
        let query = query.to_string();
        Box::pin(async move {
            self.inner.queries.lock().unwrap().push((query, k));
            if let Some(ref message) = self.inner.failure {
                return Err(QuillError::provider("mock", message.clone()));
            }
            let docs: Vec<Document> = self.inner.documents.iter().take(k).cloned().collect();
            Ok(DocumentSet::new(docs))
        })
    }
}

/// Documents at `http://a`, `http://b`, `http://c`.
pub fn sample_documents() -> DocumentSet {
    DocumentSet::new(vec![
        Document::new("http://a", "Alpha source content").with_title("Alpha"),
        Document::new("http://b", "Beta source content").with_title("Beta"),
        Document::new("http://c", "Gamma source content").with_title("Gamma"),
    ])
}

/// Curator reply selecting the given URLs.
pub fn curate_reply(urls: &[&str]) -> String {
    serde_json::json!({ "urls": urls }).to_string()
}

/// Config for tests: memory checkpoints, short timeout, no logging.
pub fn test_config() -> AppConfig {
    AppConfig::parse(
        r#"
workspace = "/tmp/quill-test"

[model]
model_id = "mock-model"

[research]
step_timeout_secs = 5

[checkpoint]
backend = "memory"
"#,
    )
    .expect("test config parses")
}
