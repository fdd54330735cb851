use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::debug;

use quill_core::config::{AppConfig, CheckpointBackend};
use quill_core::error::{QuillError, Result};

use crate::state::RunState;

/// A state snapshot taken after a completed step. Never modified once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    /// 1-based, per run.
    pub sequence: u64,
    /// The step that produced `state`.
    pub node: String,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
}

/// Append-only snapshot log keyed by run id.
///
/// Implementations must accept concurrent appends for different runs; each
/// run numbers its checkpoints independently.
pub trait CheckpointStore: Send + Sync {
    /// Record `state` as produced by `node`. Returns the new sequence number.
    fn append(&self, run_id: &str, node: &str, state: &RunState) -> Result<u64>;

    fn latest_checkpoint(&self, run_id: &str) -> Result<Option<Checkpoint>>;

    /// All checkpoints for a run, oldest first.
    fn history(&self, run_id: &str) -> Result<Vec<Checkpoint>>;

    /// Known run ids, in order of first checkpoint.
    fn runs(&self) -> Result<Vec<String>>;

    /// Drop every checkpoint for a run. Returns how many were removed.
    fn delete_run(&self, run_id: &str) -> Result<usize>;

    fn latest(&self, run_id: &str) -> Result<Option<RunState>> {
        Ok(self.latest_checkpoint(run_id)?.map(|cp| cp.state))
    }
}

/// Open the store selected by the config.
///
/// With checkpointing disabled the run still gets an in-memory store, so the
/// executor has somewhere to write; nothing outlives the process.
pub fn open_store(config: &AppConfig) -> Result<Arc<dyn CheckpointStore>> {
    if !config.checkpoint.enabled {
        return Ok(Arc::new(MemoryCheckpointStore::new()));
    }
    match config.checkpoint.backend {
        CheckpointBackend::Memory => Ok(Arc::new(MemoryCheckpointStore::new())),
        CheckpointBackend::Sqlite => {
            let path = config.checkpoint_path();
            Ok(Arc::new(SqliteCheckpointStore::open(&path)?))
        }
    }
}

#[derive(Default)]
struct MemoryInner {
    runs: HashMap<String, Vec<Checkpoint>>,
    order: Vec<String>,
}

/// Process-local checkpoint store.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|_| QuillError::Database("checkpoint store lock poisoned".into()))
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn append(&self, run_id: &str, node: &str, state: &RunState) -> Result<u64> {
        let mut inner = self.lock()?;
        if !inner.runs.contains_key(run_id) {
            inner.order.push(run_id.to_string());
        }
        let history = inner.runs.entry(run_id.to_string()).or_default();
        let sequence = history.len() as u64 + 1;
        history.push(Checkpoint {
            run_id: run_id.to_string(),
            sequence,
            node: node.to_string(),
            state: state.clone(),
            created_at: Utc::now(),
        });
        Ok(sequence)
    }

    fn latest_checkpoint(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        let inner = self.lock()?;
        Ok(inner.runs.get(run_id).and_then(|h| h.last().cloned()))
    }

    fn history(&self, run_id: &str) -> Result<Vec<Checkpoint>> {
        let inner = self.lock()?;
        Ok(inner.runs.get(run_id).cloned().unwrap_or_default())
    }

    fn runs(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.order.clone())
    }

    fn delete_run(&self, run_id: &str) -> Result<usize> {
        let mut inner = self.lock()?;
        inner.order.retain(|id| id != run_id);
        Ok(inner.runs.remove(run_id).map(|h| h.len()).unwrap_or(0))
    }
}

/// Persistent checkpoint store backed by SQLite.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

fn db_err(context: &str, e: impl std::fmt::Display) -> QuillError {
    QuillError::Database(format!("{}: {}", context, e))
}

impl SqliteCheckpointStore {
    /// Open or create the checkpoint database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| db_err("Failed to open checkpoint store", e))?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;

             CREATE TABLE IF NOT EXISTS checkpoints (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 run_id TEXT NOT NULL,
                 sequence INTEGER NOT NULL,
                 node TEXT NOT NULL,
                 state_json TEXT NOT NULL,
                 created_at TEXT NOT NULL,
                 UNIQUE (run_id, sequence)
             );

             CREATE INDEX IF NOT EXISTS idx_cp_run_seq
                 ON checkpoints(run_id, sequence DESC);",
        )
        .map_err(|e| db_err("Failed to initialize checkpoint schema", e))?;

        debug!(path = %path.display(), "Checkpoint store opened");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| QuillError::Database("checkpoint store lock poisoned".into()))
    }
}

type RawCheckpoint = (String, u64, String, String, String);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawCheckpoint> {
    Ok((
        row.get(0)?,
        row.get::<_, i64>(1)? as u64,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn decode(raw: RawCheckpoint) -> Result<Checkpoint> {
    let (run_id, sequence, node, state_json, created_at) = raw;
    Ok(Checkpoint {
        run_id,
        sequence,
        node,
        state: serde_json::from_str(&state_json)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

impl CheckpointStore for SqliteCheckpointStore {
    fn append(&self, run_id: &str, node: &str, state: &RunState) -> Result<u64> {
        let state_json = serde_json::to_string(state)?;
        let mut conn = self.lock()?;
        // IMMEDIATE takes the write lock before reading MAX(sequence), so two
        // processes sharing the file cannot hand out the same number.
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| db_err("Failed to begin checkpoint transaction", e))?;

        let sequence: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM checkpoints WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .map_err(|e| db_err("Failed to read checkpoint sequence", e))?;

        tx.execute(
            "INSERT INTO checkpoints (run_id, sequence, node, state_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id, sequence, node, state_json, Utc::now().to_rfc3339()],
        )
        .map_err(|e| db_err("Failed to save checkpoint", e))?;

        tx.commit()
            .map_err(|e| db_err("Failed to commit checkpoint", e))?;

        Ok(sequence as u64)
    }

    fn latest_checkpoint(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT run_id, sequence, node, state_json, created_at
                 FROM checkpoints
                 WHERE run_id = ?1
                 ORDER BY sequence DESC
                 LIMIT 1",
                params![run_id],
                read_row,
            )
            .optional()
            .map_err(|e| db_err("Failed to load checkpoint", e))?;

        raw.map(decode).transpose()
    }

    fn history(&self, run_id: &str) -> Result<Vec<Checkpoint>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT run_id, sequence, node, state_json, created_at
                 FROM checkpoints
                 WHERE run_id = ?1
                 ORDER BY sequence ASC",
            )
            .map_err(|e| db_err("Failed to prepare query", e))?;

        let rows = stmt
            .query_map(params![run_id], read_row)
            .map_err(|e| db_err("Failed to load history", e))?;

        let mut history = Vec::new();
        for row in rows {
            let raw = row.map_err(|e| db_err("Failed to read checkpoint row", e))?;
            history.push(decode(raw)?);
        }
        Ok(history)
    }

    fn runs(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT run_id FROM checkpoints GROUP BY run_id ORDER BY MIN(id)")
            .map_err(|e| db_err("Failed to prepare query", e))?;

        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| db_err("Failed to list runs", e))?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err("Failed to list runs", e))
    }

    fn delete_run(&self, run_id: &str) -> Result<usize> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM checkpoints WHERE run_id = ?1", params![run_id])
            .map_err(|e| db_err("Failed to delete checkpoints", e))
    }
}
