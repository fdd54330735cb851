use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use quill_core::config::ResearchConfig;
use quill_core::error::{QuillError, Result};
use quill_core::event::EventBus;
use quill_core::types::{RunId, WorkflowEvent};

use super::{Graph, Transition};
use crate::checkpoint::CheckpointStore;
use crate::state::RunState;

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Aborted,
}

/// One execution of a graph for one topic.
#[derive(Debug, Clone)]
pub struct Run {
    pub run_id: RunId,
    /// The node that will execute next.
    pub current_node: String,
    pub state: RunState,
    pub step_count: usize,
    /// Conditional routes taken back into the graph so far.
    pub loop_iterations: usize,
    pub status: RunStatus,
}

/// Bounds applied to every run.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorLimits {
    pub max_loop_iterations: usize,
    pub max_steps: usize,
    pub step_timeout: Duration,
}

impl Default for ExecutorLimits {
    fn default() -> Self {
        Self::from_config(&ResearchConfig::default())
    }
}

impl ExecutorLimits {
    pub fn from_config(config: &ResearchConfig) -> Self {
        Self {
            max_loop_iterations: config.max_loop_iterations,
            max_steps: config.max_steps,
            step_timeout: config.step_timeout(),
        }
    }
}

/// Drives runs through a [`Graph`].
///
/// The executor owns no per-run state: a [`Run`] is created by
/// [`GraphExecutor::start`] or [`GraphExecutor::resume`] and advanced in place
/// by [`GraphExecutor::execute`]. Every completed step is checkpointed before
/// the next transition is decided.
pub struct GraphExecutor {
    graph: Graph,
    store: Arc<dyn CheckpointStore>,
    events: Arc<EventBus>,
    limits: ExecutorLimits,
}

impl GraphExecutor {
    pub fn new(
        graph: Graph,
        store: Arc<dyn CheckpointStore>,
        events: Arc<EventBus>,
        limits: ExecutorLimits,
    ) -> Self {
        Self {
            graph,
            store,
            events,
            limits,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn limits(&self) -> ExecutorLimits {
        self.limits
    }

    /// A fresh run positioned at the entry node.
    pub fn start(&self, run_id: RunId, state: RunState) -> Run {
        Run {
            run_id,
            current_node: self.graph.entry().to_string(),
            state,
            step_count: 0,
            loop_iterations: 0,
            status: RunStatus::Pending,
        }
    }

    /// Rebuild a run from its checkpoints, positioned after the last
    /// completed step.
    ///
    /// A run whose last checkpoint already routes to the end comes back
    /// `Completed`; `execute` then returns immediately.
    pub fn resume(&self, run_id: &str) -> Result<Run> {
        let history = self.store.history(run_id)?;
        let last = history.last().ok_or_else(|| {
            QuillError::Validation(format!("no checkpoints recorded for run {}", run_id))
        })?;

        if self.graph.node(&last.node).is_none() {
            return Err(QuillError::GraphDefinition(format!(
                "checkpointed node '{}' is not part of this graph",
                last.node
            )));
        }

        // Replay the routing decisions already made so the loop budget carries over.
        let mut loop_iterations = history
            .windows(2)
            .filter(|pair| self.routed_conditionally(&pair[0].node, &pair[0].state))
            .count();

        let mut run = Run {
            run_id: RunId::from_string(run_id),
            current_node: last.node.clone(),
            state: last.state.clone(),
            step_count: history.len(),
            loop_iterations,
            status: RunStatus::Pending,
        };

        match self.graph.next(&last.node, &last.state)? {
            Transition::End => run.status = RunStatus::Completed,
            Transition::Next { node, conditional } => {
                if conditional {
                    loop_iterations += 1;
                    run.loop_iterations = loop_iterations;
                }
                run.current_node = node;
            }
        }

        info!(
            run_id = %run.run_id,
            next = %run.current_node,
            step_count = run.step_count,
            loop_iterations = run.loop_iterations,
            "Resuming run from checkpoint"
        );
        Ok(run)
    }

    fn routed_conditionally(&self, from: &str, state: &RunState) -> bool {
        matches!(
            self.graph.next(from, state),
            Ok(Transition::Next { conditional: true, .. })
        )
    }

    /// Advance `run` until it completes, fails, or is aborted.
    ///
    /// Cancellation is observed between steps only. A cancelled or failed run
    /// keeps its last checkpoint as the latest durable state.
    pub async fn execute(&self, run: &mut Run, cancel: CancellationToken) -> Result<()> {
        if run.status == RunStatus::Completed {
            self.events.publish(WorkflowEvent::RunCompleted {
                run_id: run.run_id.clone(),
                steps: run.step_count,
            });
            return Ok(());
        }
        if run.loop_iterations > self.limits.max_loop_iterations {
            return Err(self.abort(
                run,
                QuillError::LoopLimitExceeded {
                    limit: self.limits.max_loop_iterations,
                },
            ));
        }

        run.status = RunStatus::Running;
        self.events.publish(WorkflowEvent::RunStarted {
            run_id: run.run_id.clone(),
            topic: run.state.topic().to_string(),
        });
        info!(run_id = %run.run_id, node = %run.current_node, "Run started");

        loop {
            if cancel.is_cancelled() {
                return Err(self.abort(run, QuillError::Cancelled(run.run_id.to_string())));
            }
            if run.step_count >= self.limits.max_steps {
                warn!(run_id = %run.run_id, max_steps = self.limits.max_steps, "Step cap reached");
                return Err(self.abort(
                    run,
                    QuillError::LoopLimitExceeded {
                        limit: self.limits.max_steps,
                    },
                ));
            }

            let node = match self.graph.node(&run.current_node) {
                Some(n) => n,
                None => {
                    let err = QuillError::GraphDefinition(format!(
                        "node '{}' not found in graph",
                        run.current_node
                    ));
                    return Err(self.fail(run, err));
                }
            };

            self.events.publish(WorkflowEvent::StepStarted {
                run_id: run.run_id.clone(),
                node: node.name.clone(),
            });
            debug!(run_id = %run.run_id, node = %node.name, "Executing step");

            let started = Instant::now();
            let outcome =
                match tokio::time::timeout(self.limits.step_timeout, node.step.run(&run.state))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(QuillError::StepTimeout {
                        step: node.name.clone(),
                        timeout_secs: self.limits.step_timeout.as_secs(),
                    }),
                };
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let next_state = match outcome {
                Ok(state) => state,
                Err(e) => return Err(self.fail(run, e)),
            };

            let sequence = match self.store.append(run.run_id.as_str(), &node.name, &next_state) {
                Ok(seq) => seq,
                Err(e) => return Err(self.fail(run, e)),
            };
            run.state = next_state;
            run.step_count += 1;

            self.events.publish(WorkflowEvent::StepCompleted {
                run_id: run.run_id.clone(),
                node: node.name.clone(),
                sequence,
                elapsed_ms,
            });
            info!(
                run_id = %run.run_id,
                node = %node.name,
                sequence,
                elapsed_ms,
                "Step complete"
            );

            match self.graph.next(&run.current_node, &run.state) {
                Err(e) => return Err(self.fail(run, e)),
                Ok(Transition::End) => {
                    run.status = RunStatus::Completed;
                    self.events.publish(WorkflowEvent::RunCompleted {
                        run_id: run.run_id.clone(),
                        steps: run.step_count,
                    });
                    info!(run_id = %run.run_id, steps = run.step_count, "Run completed");
                    return Ok(());
                }
                Ok(Transition::Next { node, conditional }) => {
                    if conditional {
                        run.loop_iterations += 1;
                        if run.loop_iterations > self.limits.max_loop_iterations {
                            warn!(
                                run_id = %run.run_id,
                                limit = self.limits.max_loop_iterations,
                                "Convergence loop did not settle"
                            );
                            return Err(self.abort(
                                run,
                                QuillError::LoopLimitExceeded {
                                    limit: self.limits.max_loop_iterations,
                                },
                            ));
                        }
                    }
                    run.current_node = node;
                }
            }
        }
    }

    fn fail(&self, run: &mut Run, err: QuillError) -> QuillError {
        run.status = RunStatus::Failed;
        error!(run_id = %run.run_id, node = %run.current_node, error = %err, "Run failed");
        self.events.publish(WorkflowEvent::RunFailed {
            run_id: run.run_id.clone(),
            node: run.current_node.clone(),
            error: err.to_string(),
        });
        err
    }

    fn abort(&self, run: &mut Run, err: QuillError) -> QuillError {
        run.status = RunStatus::Aborted;
        warn!(run_id = %run.run_id, reason = %err, "Run aborted");
        self.events.publish(WorkflowEvent::RunAborted {
            run_id: run.run_id.clone(),
            reason: err.to_string(),
        });
        err
    }
}
