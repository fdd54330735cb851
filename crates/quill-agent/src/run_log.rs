use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use quill_core::event::EventBus;
use quill_core::types::{RunId, WorkflowEvent};

/// JSONL run logger.
///
/// Subscribes to the EventBus and appends one JSON object per workflow event
/// to `{log_dir}/{run_id}.jsonl`. Lines are flushed as they are written, so a
/// crash mid-run leaves every earlier line intact.
pub struct RunLogger {
    log_dir: PathBuf,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    pub fn log_path(&self, run_id: &RunId) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", run_id))
    }

    /// Subscribe now and write in the background.
    ///
    /// Subscribing before the task starts means no event published after
    /// this call returns can be missed.
    pub fn spawn(
        self,
        event_bus: &EventBus,
        run_id: RunId,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, run_id, cancel))
    }

    /// Write entries for `run_id` until its terminal event or cancellation.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<WorkflowEvent>,
        run_id: RunId,
        cancel: CancellationToken,
    ) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let log_path = self.log_path(&run_id);
        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if event.run_id() != &run_id {
                                continue;
                            }
                            if let Ok(json) = serde_json::to_string(&event_to_entry(&event)) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush log");
                                }
                            }
                            if event.is_terminal() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }
}

fn event_to_entry(event: &WorkflowEvent) -> LogEntry {
    let (event_type, node, detail) = match event {
        WorkflowEvent::RunStarted { topic, .. } => {
            ("run_started", None, Some(serde_json::json!({ "topic": topic })))
        }
        WorkflowEvent::StepStarted { node, .. } => ("step_started", Some(node.clone()), None),
        WorkflowEvent::StepCompleted {
            node,
            sequence,
            elapsed_ms,
            ..
        } => (
            "step_completed",
            Some(node.clone()),
            Some(serde_json::json!({
                "sequence": sequence,
                "elapsed_ms": elapsed_ms,
            })),
        ),
        WorkflowEvent::RunCompleted { steps, .. } => {
            ("run_completed", None, Some(serde_json::json!({ "steps": steps })))
        }
        WorkflowEvent::RunFailed { node, error, .. } => (
            "run_failed",
            Some(node.clone()),
            Some(serde_json::json!({ "error": error })),
        ),
        WorkflowEvent::RunAborted { reason, .. } => {
            ("run_aborted", None, Some(serde_json::json!({ "reason": reason })))
        }
    };

    LogEntry {
        timestamp: Utc::now().to_rfc3339(),
        run_id: event.run_id().to_string(),
        event_type,
        node,
        detail,
    }
}
