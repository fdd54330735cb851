//! The five research steps.
//!
//! Each step is a [`Step`] over [`RunState`]: it reads what earlier steps
//! produced, makes at most one provider call, and returns a new state. A
//! failed step returns an error and never a partially updated state.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::{debug, warn};

use quill_core::config::ModelConfig;
use quill_core::error::{QuillError, Result};
use quill_core::traits::{LlmClient, SearchProvider};
use quill_core::types::{ChatMessage, ChatOptions, DocumentSet};

use crate::graph::Step;
use crate::state::{Critique, RunState, StatePatch};

/// Topics shorter than this get [`SHORT_TOPIC_PREFIX`] before searching.
pub const MIN_QUERY_CHARS: usize = 5;
pub const SHORT_TOPIC_PREFIX: &str = "topic: ";

/// Substring in a review that approves the article.
pub const APPROVAL_MARKER: &str = "[DONE]";

const DRAFT_PROMPT: &str = "Write a 5-paragraph article in markdown.";
const CRITIQUE_PROMPT: &str =
    "Review the article. Return [DONE] if it is good, or provide brief feedback.";
const REVISE_PROMPT: &str = "Edit the article based on the critique.";

/// The search query for a topic.
pub fn search_query(topic: &str) -> String {
    if topic.chars().count() < MIN_QUERY_CHARS {
        format!("{}{}", SHORT_TOPIC_PREFIX, topic)
    } else {
        topic.to_string()
    }
}

/// Shared handle on the generation provider.
#[derive(Clone)]
pub struct Writer {
    llm: Arc<dyn LlmClient>,
    model: ModelConfig,
}

impl Writer {
    pub fn new(llm: Arc<dyn LlmClient>, model: ModelConfig) -> Self {
        Self { llm, model }
    }

    async fn ask(&self, system: &str, user: String, options: ChatOptions) -> Result<String> {
        let messages = vec![ChatMessage::system(system), ChatMessage::user(user)];
        self.llm.generate(&self.model, messages, options).await
    }
}

fn sources_json(docs: &DocumentSet) -> Result<String> {
    Ok(serde_json::to_string(docs)?)
}

/// Fetch candidate sources for the topic.
pub struct SearchStep {
    search: Arc<dyn SearchProvider>,
    results: usize,
}

impl SearchStep {
    pub fn new(search: Arc<dyn SearchProvider>, results: usize) -> Self {
        Self { search, results }
    }
}

impl Step for SearchStep {
    fn run<'a>(&'a self, state: &'a RunState) -> BoxFuture<'a, Result<RunState>> {
        Box::pin(async move {
            let query = search_query(state.topic());
            debug!(provider = self.search.name(), query = %query, k = self.results, "Searching");
            let docs = self.search.search(&query, self.results).await?;
            debug!(results = docs.len(), "Search returned");
            Ok(state.replace(StatePatch::new().search_results(docs)))
        })
    }
}

#[derive(Deserialize)]
struct CuratedUrls {
    urls: Vec<String>,
}

/// Have the model pick the most relevant sources, then keep only those.
pub struct CurateStep {
    writer: Writer,
    keep: usize,
}

impl CurateStep {
    pub fn new(writer: Writer, keep: usize) -> Self {
        Self { writer, keep }
    }

    fn prompt(&self) -> String {
        format!(
            "Return the {} most relevant article URLs as JSON: {{\"urls\": [\"url1\", ...]}}",
            self.keep
        )
    }
}

/// Parse the curator's reply into its URL list.
pub fn parse_curated_urls(reply: &str) -> Result<Vec<String>> {
    let parsed: CuratedUrls = serde_json::from_str(reply.trim()).map_err(|e| {
        QuillError::Validation(format!("curator returned malformed JSON: {}", e))
    })?;
    Ok(parsed.urls)
}

impl Step for CurateStep {
    fn run<'a>(&'a self, state: &'a RunState) -> BoxFuture<'a, Result<RunState>> {
        Box::pin(async move {
            let candidates = state.search_results().ok_or_else(|| {
                QuillError::Validation("curate requires search results".into())
            })?;

            let user = format!(
                "Topic: {}\nArticles: {}",
                state.topic(),
                sources_json(candidates)?
            );
            let reply = self.writer.ask(&self.prompt(), user, ChatOptions::json()).await?;

            let urls = parse_curated_urls(&reply)?;
            let mut curated = candidates.retain_urls(urls.as_slice());
            // The cap counts matched documents only, in search order.
            curated.truncate(self.keep);

            if curated.is_empty() {
                warn!(
                    topic = %state.topic(),
                    selected = urls.len(),
                    "Curator selected no known sources, continuing without sources"
                );
            } else {
                debug!(kept = curated.len(), of = candidates.len(), "Sources curated");
            }

            Ok(state.replace(StatePatch::new().search_results(curated)))
        })
    }
}

/// Write the first draft from the curated sources.
pub struct DraftStep {
    writer: Writer,
}

impl DraftStep {
    pub fn new(writer: Writer) -> Self {
        Self { writer }
    }
}

impl Step for DraftStep {
    fn run<'a>(&'a self, state: &'a RunState) -> BoxFuture<'a, Result<RunState>> {
        Box::pin(async move {
            let sources = state.search_results().ok_or_else(|| {
                QuillError::Validation("draft requires curated sources".into())
            })?;
            let user = format!(
                "Topic: {}\nSources: {}",
                state.topic(),
                sources_json(sources)?
            );
            let article = self
                .writer
                .ask(DRAFT_PROMPT, user, ChatOptions::default())
                .await?;
            Ok(state.replace(StatePatch::new().article(article)))
        })
    }
}

/// Review the current article.
pub struct CritiqueStep {
    writer: Writer,
}

impl CritiqueStep {
    pub fn new(writer: Writer) -> Self {
        Self { writer }
    }
}

/// Interpret a review: any occurrence of the marker approves.
pub fn classify_review(response: String) -> Critique {
    if response.contains(APPROVAL_MARKER) {
        Critique::Approved
    } else {
        Critique::NeedsRevision(response)
    }
}

impl Step for CritiqueStep {
    fn run<'a>(&'a self, state: &'a RunState) -> BoxFuture<'a, Result<RunState>> {
        Box::pin(async move {
            let article = state
                .article()
                .ok_or_else(|| QuillError::Validation("critique requires an article".into()))?;

            // Show the reviewer its last feedback so it is not repeated.
            let previous = match state.critique().and_then(Critique::feedback) {
                Some(feedback) => format!("Previous critique: {}", feedback),
                None => String::new(),
            };
            let user = format!("{}\nArticle: {}", previous, article);

            let response = self
                .writer
                .ask(CRITIQUE_PROMPT, user, ChatOptions::default())
                .await?;
            let critique = classify_review(response);
            debug!(approved = critique.is_approved(), "Review received");

            Ok(state.replace(StatePatch::new().critique(critique)))
        })
    }
}

/// Rewrite the article to address the current feedback.
pub struct ReviseStep {
    writer: Writer,
}

impl ReviseStep {
    pub fn new(writer: Writer) -> Self {
        Self { writer }
    }
}

impl Step for ReviseStep {
    fn run<'a>(&'a self, state: &'a RunState) -> BoxFuture<'a, Result<RunState>> {
        Box::pin(async move {
            let article = state
                .article()
                .ok_or_else(|| QuillError::Validation("revise requires an article".into()))?;
            let feedback = state
                .critique()
                .and_then(Critique::feedback)
                .ok_or_else(|| QuillError::Validation("revise requires review feedback".into()))?;

            let user = format!("Article: {}\nCritique: {}", article, feedback);
            let revised = self
                .writer
                .ask(REVISE_PROMPT, user, ChatOptions::default())
                .await?;
            Ok(state.replace(StatePatch::new().article(revised)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::types::Document;
    use quill_test_utils::{curate_reply, sample_documents, MockLlm, MockSearch};

    fn writer(llm: &MockLlm) -> Writer {
        Writer::new(Arc::new(llm.clone()), ModelConfig::openai("mock-model", None))
    }

    fn searched(topic: &str) -> RunState {
        RunState::new(topic).replace(StatePatch::new().search_results(sample_documents()))
    }

    fn drafted() -> RunState {
        searched("rust async").replace(StatePatch::new().article("An article."))
    }

    #[test]
    fn test_search_query_prefix() {
        assert_eq!(search_query("AI"), "topic: AI");
        assert_eq!(search_query("rust"), "topic: rust");
        assert_eq!(search_query("tokio"), "tokio");
        // Counted in characters, not bytes.
        assert_eq!(search_query("café"), "topic: café");
    }

    #[tokio::test]
    async fn test_short_topic_search() {
        let search = MockSearch::new(sample_documents());
        let step = SearchStep::new(Arc::new(search.clone()), 10);

        let next = step.run(&RunState::new("AI")).await.unwrap();

        assert_eq!(search.queries(), vec![("topic: AI".to_string(), 10)]);
        assert_eq!(next.search_results().unwrap().len(), 3);
        assert_eq!(next.topic(), "AI");
    }

    #[tokio::test]
    async fn test_search_failure_is_provider_error() {
        let step = SearchStep::new(Arc::new(MockSearch::failing("HTTP 401")), 10);
        let err = step.run(&RunState::new("rust async")).await.unwrap_err();
        assert!(err.is_provider());
    }

    #[tokio::test]
    async fn test_curate_keeps_selected_sources() {
        let llm = MockLlm::new().then_text(curate_reply(&["http://a"]));
        let step = CurateStep::new(writer(&llm), 5);

        let next = step.run(&searched("rust async")).await.unwrap();

        assert_eq!(next.search_results().unwrap().urls(), vec!["http://a"]);
        let request = &llm.requests()[0];
        assert!(request.options.json_mode);
        assert!(request.system().contains("5 most relevant"));
        assert!(request.user().contains("http://b"));
    }

    #[tokio::test]
    async fn test_curate_is_subset_and_capped_after_matching() {
        let llm = MockLlm::new().then_text(curate_reply(&[
            "http://c",
            "http://unknown",
            "http://a",
            "http://b",
        ]));
        let step = CurateStep::new(writer(&llm), 2);

        let before = searched("rust async");
        let next = step.run(&before).await.unwrap();

        let urls = next.search_results().unwrap().urls();
        assert_eq!(urls, vec!["http://a", "http://b"]);
        let original = before.search_results().unwrap();
        assert!(next
            .search_results()
            .unwrap()
            .iter()
            .all(|d| original.iter().any(|o| o == d)));
    }

    #[tokio::test]
    async fn test_curate_unknown_urls_do_not_crowd_out_known_ones() {
        let llm = MockLlm::new().then_text(curate_reply(&[
            "http://x1",
            "http://x2",
            "http://x3",
            "http://x4",
            "http://x5",
            "http://a",
        ]));
        let step = CurateStep::new(writer(&llm), 5);

        let next = step.run(&searched("rust async")).await.unwrap();

        assert_eq!(next.search_results().unwrap().urls(), vec!["http://a"]);
    }

    #[tokio::test]
    async fn test_curate_is_idempotent() {
        let reply = curate_reply(&["http://b", "http://a"]);
        let llm = MockLlm::new().then_text(reply.clone()).then_text(reply);
        let step = CurateStep::new(writer(&llm), 5);

        let state = searched("rust async");
        let first = step.run(&state).await.unwrap();
        let second = step.run(&state).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.search_results().unwrap().urls(), vec!["http://a", "http://b"]);
    }

    #[tokio::test]
    async fn test_curate_empty_intersection_proceeds() {
        let llm = MockLlm::new().then_text(curate_reply(&["http://nowhere"]));
        let step = CurateStep::new(writer(&llm), 5);

        let next = step.run(&searched("rust async")).await.unwrap();
        assert!(next.search_results().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_curate_malformed_json() {
        let llm = MockLlm::new().then_text("Here are the best links: http://a");
        let step = CurateStep::new(writer(&llm), 5);

        let err = step.run(&searched("rust async")).await.unwrap_err();
        assert!(matches!(err, QuillError::Validation(_)));
    }

    #[test]
    fn test_parse_curated_urls_requires_list() {
        assert!(parse_curated_urls(r#"{"links": ["http://a"]}"#).is_err());
        assert_eq!(
            parse_curated_urls(" {\"urls\": [\"http://a\"]}\n").unwrap(),
            vec!["http://a"]
        );
    }

    #[tokio::test]
    async fn test_curate_without_search_results() {
        let llm = MockLlm::new();
        let step = CurateStep::new(writer(&llm), 5);
        let err = step.run(&RunState::new("rust async")).await.unwrap_err();
        assert!(matches!(err, QuillError::Validation(_)));
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_draft_stores_raw_output() {
        let llm = MockLlm::new().then_text("# Title\n\nBody");
        let step = DraftStep::new(writer(&llm));

        let state = RunState::new("rust async").replace(
            StatePatch::new()
                .search_results(DocumentSet::new(vec![Document::new("http://a", "alpha")])),
        );
        let next = step.run(&state).await.unwrap();

        assert_eq!(next.article(), Some("# Title\n\nBody"));
        let request = &llm.requests()[0];
        assert!(request.system().contains("5-paragraph"));
        assert!(request.user().starts_with("Topic: rust async\nSources: "));
        assert!(!request.options.json_mode);
    }

    #[tokio::test]
    async fn test_critique_approval() {
        let llm = MockLlm::new().then_text("[DONE] Looks good");
        let step = CritiqueStep::new(writer(&llm));

        let next = step.run(&drafted()).await.unwrap();

        assert_eq!(next.critique(), Some(&Critique::Approved));
        assert_eq!(next.article(), Some("An article."));
    }

    #[tokio::test]
    async fn test_critique_feedback_and_prior_context() {
        let llm = MockLlm::new()
            .then_text("Add examples.")
            .then_text("Tighten the intro.");
        let step = CritiqueStep::new(writer(&llm));

        let first = step.run(&drafted()).await.unwrap();
        assert_eq!(
            first.critique(),
            Some(&Critique::NeedsRevision("Add examples.".into()))
        );
        let second = step.run(&first).await.unwrap();
        assert_eq!(
            second.critique(),
            Some(&Critique::NeedsRevision("Tighten the intro.".into()))
        );

        let requests = llm.requests();
        assert!(!requests[0].user().contains("Previous critique"));
        assert!(requests[1].user().starts_with("Previous critique: Add examples."));
    }

    #[tokio::test]
    async fn test_critique_requires_article() {
        let step = CritiqueStep::new(writer(&MockLlm::new()));
        let err = step.run(&RunState::new("rust async")).await.unwrap_err();
        assert!(matches!(err, QuillError::Validation(_)));
    }

    #[tokio::test]
    async fn test_revise_leaves_critique_untouched() {
        let llm = MockLlm::new().then_text("A better article.");
        let step = ReviseStep::new(writer(&llm));

        let reviewed =
            drafted().replace(StatePatch::new().critique(Critique::NeedsRevision("More detail".into())));
        let next = step.run(&reviewed).await.unwrap();

        assert_eq!(next.article(), Some("A better article."));
        assert_eq!(next.critique(), reviewed.critique());
        assert_eq!(
            llm.requests()[0].user(),
            "Article: An article.\nCritique: More detail"
        );
    }

    #[tokio::test]
    async fn test_revise_requires_feedback() {
        let llm = MockLlm::new();
        let step = ReviseStep::new(writer(&llm));

        let approved = drafted().replace(StatePatch::new().critique(Critique::Approved));
        assert!(matches!(
            step.run(&approved).await.unwrap_err(),
            QuillError::Validation(_)
        ));
        assert!(step.run(&drafted()).await.is_err());
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_provider_failure_propagates() {
        let llm = MockLlm::new().then_fail("HTTP 429 Too Many Requests");
        let step = DraftStep::new(writer(&llm));
        let err = step.run(&searched("rust async")).await.unwrap_err();
        assert!(err.is_provider());
    }
}
