use serde::{Deserialize, Serialize};

use quill_core::types::DocumentSet;

/// Outcome of a review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "feedback", rename_all = "snake_case")]
pub enum Critique {
    /// The reviewer accepted the article. The only convergence signal.
    Approved,
    /// The reviewer wants changes.
    NeedsRevision(String),
}

impl Critique {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }

    pub fn feedback(&self) -> Option<&str> {
        match self {
            Self::Approved => None,
            Self::NeedsRevision(text) => Some(text),
        }
    }
}

/// The value threaded through every step of a research run.
///
/// Steps never mutate a state in place; each returns a new one built with
/// [`RunState::replace`]. The topic is fixed at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    search_results: Option<DocumentSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    article: Option<String>,
    /// `None` until the first review.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    critique: Option<Critique>,
}

impl RunState {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            search_results: None,
            article: None,
            critique: None,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn search_results(&self) -> Option<&DocumentSet> {
        self.search_results.as_ref()
    }

    pub fn article(&self) -> Option<&str> {
        self.article.as_deref()
    }

    pub fn critique(&self) -> Option<&Critique> {
        self.critique.as_ref()
    }

    /// Build a new state with the patch's fields overriding ours.
    pub fn replace(&self, patch: StatePatch) -> RunState {
        RunState {
            topic: self.topic.clone(),
            search_results: patch.search_results.or_else(|| self.search_results.clone()),
            article: patch.article.or_else(|| self.article.clone()),
            critique: patch.critique.or_else(|| self.critique.clone()),
        }
    }
}

/// Fields to override in [`RunState::replace`]. Unset fields are preserved.
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    search_results: Option<DocumentSet>,
    article: Option<String>,
    critique: Option<Critique>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn search_results(mut self, docs: DocumentSet) -> Self {
        self.search_results = Some(docs);
        self
    }

    pub fn article(mut self, article: impl Into<String>) -> Self {
        self.article = Some(article.into());
        self
    }

    pub fn critique(mut self, critique: Critique) -> Self {
        self.critique = Some(critique);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.search_results.is_none() && self.article.is_none() && self.critique.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::types::Document;

    #[test]
    fn test_new_state_is_empty() {
        let state = RunState::new("rust async");
        assert_eq!(state.topic(), "rust async");
        assert!(state.search_results().is_none());
        assert!(state.article().is_none());
        assert!(state.critique().is_none());
    }

    #[test]
    fn test_replace_with_own_values_is_identity() {
        let state = RunState::new("t").replace(
            StatePatch::new()
                .search_results(DocumentSet::new(vec![Document::new("http://a", "x")]))
                .article("draft")
                .critique(Critique::NeedsRevision("shorter".into())),
        );

        let same = state.replace(
            StatePatch::new()
                .search_results(state.search_results().unwrap().clone())
                .article(state.article().unwrap())
                .critique(state.critique().unwrap().clone()),
        );
        assert_eq!(same, state);
    }

    #[test]
    fn test_replace_preserves_absent_fields() {
        let state = RunState::new("t")
            .replace(StatePatch::new().article("v1"))
            .replace(StatePatch::new().critique(Critique::NeedsRevision("more".into())));

        let next = state.replace(StatePatch::new().article("v2"));
        assert_eq!(next.article(), Some("v2"));
        assert_eq!(next.critique(), state.critique());
        assert_eq!(state.article(), Some("v1"));
    }

    #[test]
    fn test_approval_is_explicit_assignment() {
        let state = RunState::new("t")
            .replace(StatePatch::new().critique(Critique::NeedsRevision("fix".into())));
        let approved = state.replace(StatePatch::new().critique(Critique::Approved));
        assert_eq!(approved.critique(), Some(&Critique::Approved));
        assert!(StatePatch::new().is_empty());
    }

    #[test]
    fn test_critique_serialization() {
        let json = serde_json::to_value(Critique::NeedsRevision("tighten intro".into())).unwrap();
        assert_eq!(json["status"], "needs_revision");
        assert_eq!(json["feedback"], "tighten intro");

        let approved = serde_json::to_value(Critique::Approved).unwrap();
        assert_eq!(approved["status"], "approved");
    }

    #[test]
    fn test_state_json_roundtrip() {
        let state = RunState::new("t")
            .replace(StatePatch::new().article("body").critique(Critique::Approved));
        let json = serde_json::to_string(&state).unwrap();
        assert!(!json.contains("search_results"));
        let back: RunState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
