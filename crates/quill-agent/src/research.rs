use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::{info, warn};

use quill_core::config::{AppConfig, ModelConfig, ResearchConfig};
use quill_core::error::{QuillError, Result};
use quill_core::event::EventBus;
use quill_core::traits::{LlmClient, SearchProvider};
use quill_core::types::RunId;

use crate::checkpoint::CheckpointStore;
use crate::graph::{
    review_router, ExecutorLimits, Graph, GraphBuilder, GraphExecutor, Run, END, REVIEW_LABELS,
};
use crate::registry::RunRegistry;
use crate::run_log::RunLogger;
use crate::state::RunState;
use crate::steps::{CritiqueStep, CurateStep, DraftStep, ReviseStep, SearchStep, Writer};

fn feedback_pattern() -> &'static Regex {
    static FEEDBACK: OnceLock<Regex> = OnceLock::new();
    FEEDBACK.get_or_init(|| {
        Regex::new(r"(?s)<FEEDBACK>.*?</FEEDBACK>").expect("Invalid feedback pattern")
    })
}

/// Remove every `<FEEDBACK>...</FEEDBACK>` span, across lines.
pub fn strip_feedback(article: &str) -> String {
    feedback_pattern().replace_all(article, "").into_owned()
}

/// search → curate → write → critique ⇄ revise.
pub fn build_graph(
    config: &ResearchConfig,
    llm: Arc<dyn LlmClient>,
    model: ModelConfig,
    search: Arc<dyn SearchProvider>,
) -> Result<Graph> {
    let writer = Writer::new(llm, model);

    GraphBuilder::new()
        .add_node("search", Arc::new(SearchStep::new(search, config.search_results)))
        .add_node(
            "curate",
            Arc::new(CurateStep::new(writer.clone(), config.curated_sources)),
        )
        .add_node("write", Arc::new(DraftStep::new(writer.clone())))
        .add_node("critique", Arc::new(CritiqueStep::new(writer.clone())))
        .add_node("revise", Arc::new(ReviseStep::new(writer)))
        .add_edge("search", "curate")
        .add_edge("curate", "write")
        .add_edge("write", "critique")
        .add_conditional_edges(
            "critique",
            &REVIEW_LABELS,
            review_router,
            &[("continue", "revise"), ("end", END)],
        )
        .add_edge("revise", "critique")
        .set_entry("search")
        .build()
}

/// The research-article workflow, ready to run topics.
pub struct ResearchWorkflow {
    executor: GraphExecutor,
    events: Arc<EventBus>,
    registry: Arc<RunRegistry>,
    log_dir: Option<PathBuf>,
}

impl ResearchWorkflow {
    pub fn new(
        config: &ResearchConfig,
        model: ModelConfig,
        llm: Arc<dyn LlmClient>,
        search: Arc<dyn SearchProvider>,
        store: Arc<dyn CheckpointStore>,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        let graph = build_graph(config, llm, model, search)?;
        let executor = GraphExecutor::new(
            graph,
            store,
            events.clone(),
            ExecutorLimits::from_config(config),
        );
        Ok(Self {
            executor,
            events,
            registry: Arc::new(RunRegistry::new()),
            log_dir: None,
        })
    }

    /// Build from an application config, enabling the run log when configured.
    pub fn from_config(
        config: &AppConfig,
        llm: Arc<dyn LlmClient>,
        search: Arc<dyn SearchProvider>,
        store: Arc<dyn CheckpointStore>,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        let workflow = Self::new(
            &config.research,
            config.model.clone(),
            llm,
            search,
            store,
            events,
        )?;
        Ok(match config.log_dir() {
            Some(dir) => workflow.with_run_log(dir),
            None => workflow,
        })
    }

    pub fn with_run_log(mut self, log_dir: PathBuf) -> Self {
        self.log_dir = Some(log_dir);
        self
    }

    pub fn executor(&self) -> &GraphExecutor {
        &self.executor
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    /// Research `topic` under a fresh run id and return the finished article.
    pub async fn run_research(&self, topic: &str) -> Result<String> {
        self.run_research_as(RunId::new(), topic).await
    }

    /// Like [`run_research`](Self::run_research) with a caller-chosen run id,
    /// so the caller can cancel it through the registry.
    pub async fn run_research_as(&self, run_id: RunId, topic: &str) -> Result<String> {
        let mut run = self.executor.start(run_id, RunState::new(topic));
        info!(run_id = %run.run_id, topic, "Starting research");
        self.drive(&mut run).await
    }

    /// Continue an interrupted run from its last checkpoint.
    pub async fn resume(&self, run_id: &str) -> Result<String> {
        let mut run = self
            .executor
            .resume(run_id)
            .map_err(|e| QuillError::run_failed(run_id, e))?;
        self.drive(&mut run).await
    }

    async fn drive(&self, run: &mut Run) -> Result<String> {
        let cancel = self.registry.register(&run.run_id);
        let logger = self.log_dir.clone().map(|dir| {
            RunLogger::new(dir).spawn(&self.events, run.run_id.clone(), cancel.child_token())
        });

        let outcome = self.executor.execute(run, cancel).await;
        self.registry.remove(run.run_id.as_str());

        if let Some(handle) = logger {
            if let Err(e) = handle.await {
                warn!(error = %e, "Run logger task failed");
            }
        }

        outcome.map_err(|e| QuillError::run_failed(run.run_id.as_str(), e))?;

        let article = run.state.article().ok_or_else(|| {
            QuillError::run_failed(
                run.run_id.as_str(),
                QuillError::Validation("run completed without an article".into()),
            )
        })?;
        Ok(strip_feedback(article))
    }
}
