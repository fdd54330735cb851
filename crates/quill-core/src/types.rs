use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique run identifier. Opaque outside of being a checkpoint key.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(format!("research-{}", Uuid::new_v4()))
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

/// A role-tagged chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn text(&self) -> &str {
        &self.content
    }
}

/// Per-request generation options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChatOptions {
    /// Constrain the provider to emit a single JSON object.
    /// The caller still validates the result.
    pub json_mode: bool,
}

impl ChatOptions {
    pub fn json() -> Self {
        Self { json_mode: true }
    }
}

/// Stop reason from the LLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
}

/// A streaming delta from the LLM.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    /// A chunk of text content.
    TextDelta(String),

    /// The response is complete.
    Stop(StopReason),

    /// Usage information.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
}

/// A single source document returned by the search provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub source_url: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Document {
    pub fn new(source_url: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            content: content.into(),
            title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Ordered sequence of documents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentSet(Vec<Document>);

impl DocumentSet {
    pub fn new(docs: Vec<Document>) -> Self {
        Self(docs)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Document> {
        self.0.iter()
    }

    pub fn urls(&self) -> Vec<&str> {
        self.0.iter().map(|d| d.source_url.as_str()).collect()
    }

    /// Keep only documents whose URL appears in `urls`.
    /// The result is always a subset of `self`.
    pub fn retain_urls<S: AsRef<str>>(&self, urls: &[S]) -> DocumentSet {
        let wanted: HashSet<&str> = urls.iter().map(|u| u.as_ref()).collect();
        DocumentSet(
            self.0
                .iter()
                .filter(|d| wanted.contains(d.source_url.as_str()))
                .cloned()
                .collect(),
        )
    }

    /// Keep at most the first `len` documents.
    pub fn truncate(&mut self, len: usize) {
        self.0.truncate(len);
    }
}

impl From<Vec<Document>> for DocumentSet {
    fn from(docs: Vec<Document>) -> Self {
        Self(docs)
    }
}

impl<'a> IntoIterator for &'a DocumentSet {
    type Item = &'a Document;
    type IntoIter = std::slice::Iter<'a, Document>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Workflow event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// A run was created and is about to execute its first step.
    RunStarted { run_id: RunId, topic: String },
    /// A step began executing.
    StepStarted { run_id: RunId, node: String },
    /// A step finished and its state was checkpointed.
    StepCompleted {
        run_id: RunId,
        node: String,
        sequence: u64,
        elapsed_ms: u64,
    },
    /// The run reached a terminal node.
    RunCompleted { run_id: RunId, steps: usize },
    /// A step failed; the run is over.
    RunFailed { run_id: RunId, node: String, error: String },
    /// The run was cancelled or hit its loop bound.
    RunAborted { run_id: RunId, reason: String },
}

impl WorkflowEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::StepStarted { run_id, .. }
            | Self::StepCompleted { run_id, .. }
            | Self::RunCompleted { run_id, .. }
            | Self::RunFailed { run_id, .. }
            | Self::RunAborted { run_id, .. } => run_id,
        }
    }

    /// Whether this event ends a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunCompleted { .. } | Self::RunFailed { .. } | Self::RunAborted { .. }
        )
    }
}
