//! Durable per-run snapshots.
//!
//! After every state-changing call the engine serialises wallet plus orders
//! into a single blob keyed by `run_id`; the blob is overwritten atomically
//! and recovery restores exactly what was last committed. Partial updates
//! never reach storage.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vex_core::{Order, OrderId, Position, Price, Trade};

use crate::wallet::Reservation;

/// Result alias for snapshot operations.
pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Errors surfaced by snapshot backends.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("failed to encode snapshot: {0}")]
    Encode(String),
}

/// Complete wallet-plus-orders state for one run.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RunSnapshot {
    pub cash: Price,
    pub positions: Vec<Position>,
    pub trades: Vec<Trade>,
    pub reservations: Vec<(OrderId, Reservation)>,
    pub orders: Vec<Order>,
    pub next_order_id: OrderId,
}

/// One per-step report fragment appended while a run progresses.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StepFragment {
    pub timestamp: i64,
    pub equity: Price,
    pub fills: u64,
}

/// Abstraction over snapshot persistence backends.
pub trait SnapshotStore: Send + Sync + 'static {
    /// Atomically overwrite the blob stored under `run_id`.
    fn save(&self, run_id: &str, snapshot: &RunSnapshot) -> SnapshotResult<()>;
    /// Load the blob stored under `run_id`, if any.
    fn load(&self, run_id: &str) -> SnapshotResult<Option<RunSnapshot>>;
    /// Append one step fragment to the run's sequence.
    fn append_fragment(&self, run_id: &str, fragment: &StepFragment) -> SnapshotResult<()>;
    /// All fragments appended so far, in order.
    fn fragments(&self, run_id: &str) -> SnapshotResult<Vec<StepFragment>>;
}

const SNAPSHOT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS run_snapshots (
    run_id TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE TABLE IF NOT EXISTS run_fragments (
    run_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    payload TEXT NOT NULL,
    PRIMARY KEY (run_id, seq)
);
"#;

/// [`SnapshotStore`] backed by a SQLite database file.
#[derive(Clone)]
pub struct SqliteSnapshotStore {
    path: PathBuf,
}

impl SqliteSnapshotStore {
    /// Create a store writing to the provided file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn connect(&self) -> SnapshotResult<Connection> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                SnapshotError::Storage(format!(
                    "failed to create snapshot directory {}: {err}",
                    parent.display()
                ))
            })?;
        }
        let conn = Connection::open(&self.path).map_err(|err| {
            SnapshotError::Storage(format!(
                "failed to open snapshot database {}: {err}",
                self.path.display()
            ))
        })?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
            .map_err(|err| SnapshotError::Storage(format!("failed to configure sqlite: {err}")))?;
        conn.execute_batch(SNAPSHOT_SCHEMA)
            .map_err(|err| SnapshotError::Storage(format!("failed to apply schema: {err}")))?;
        Ok(conn)
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn save(&self, run_id: &str, snapshot: &RunSnapshot) -> SnapshotResult<()> {
        let mut conn = self.connect()?;
        let payload = serde_json::to_string(snapshot)
            .map_err(|err| SnapshotError::Encode(err.to_string()))?;
        let tx = conn
            .transaction()
            .map_err(|err| SnapshotError::Storage(format!("failed to begin transaction: {err}")))?;
        tx.execute(
            "INSERT INTO run_snapshots (run_id, payload, updated_at)
             VALUES (?1, ?2, CURRENT_TIMESTAMP)
             ON CONFLICT(run_id) DO UPDATE SET payload=excluded.payload, updated_at=CURRENT_TIMESTAMP",
            params![run_id, payload],
        )
        .map_err(|err| SnapshotError::Storage(format!("failed to upsert snapshot: {err}")))?;
        tx.commit()
            .map_err(|err| SnapshotError::Storage(format!("failed to commit snapshot: {err}")))
    }

    fn load(&self, run_id: &str) -> SnapshotResult<Option<RunSnapshot>> {
        let conn = self.connect()?;
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM run_snapshots WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| SnapshotError::Storage(format!("failed to read snapshot: {err}")))?;
        payload
            .map(|json| {
                serde_json::from_str(&json).map_err(|err| SnapshotError::Encode(err.to_string()))
            })
            .transpose()
    }

    fn append_fragment(&self, run_id: &str, fragment: &StepFragment) -> SnapshotResult<()> {
        let conn = self.connect()?;
        let payload = serde_json::to_string(fragment)
            .map_err(|err| SnapshotError::Encode(err.to_string()))?;
        conn.execute(
            "INSERT INTO run_fragments (run_id, seq, payload)
             SELECT ?1, COALESCE(MAX(seq) + 1, 0), ?2 FROM run_fragments WHERE run_id = ?1",
            params![run_id, payload],
        )
        .map_err(|err| SnapshotError::Storage(format!("failed to append fragment: {err}")))?;
        Ok(())
    }

    fn fragments(&self, run_id: &str) -> SnapshotResult<Vec<StepFragment>> {
        let conn = self.connect()?;
        let mut statement = conn
            .prepare("SELECT payload FROM run_fragments WHERE run_id = ?1 ORDER BY seq")
            .map_err(|err| SnapshotError::Storage(format!("failed to prepare query: {err}")))?;
        let rows = statement
            .query_map(params![run_id], |row| row.get::<_, String>(0))
            .map_err(|err| SnapshotError::Storage(format!("failed to read fragments: {err}")))?;
        let mut fragments = Vec::new();
        for row in rows {
            let payload =
                row.map_err(|err| SnapshotError::Storage(format!("failed to read row: {err}")))?;
            fragments.push(
                serde_json::from_str(&payload)
                    .map_err(|err| SnapshotError::Encode(err.to_string()))?,
            );
        }
        Ok(fragments)
    }
}

/// In-memory store used by tests and short-lived runs.
#[derive(Default)]
pub struct MemorySnapshotStore {
    blobs: Mutex<std::collections::HashMap<String, String>>,
    fragments: Mutex<std::collections::HashMap<String, Vec<String>>>,
}

impl MemorySnapshotStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, run_id: &str, snapshot: &RunSnapshot) -> SnapshotResult<()> {
        let payload = serde_json::to_string(snapshot)
            .map_err(|err| SnapshotError::Encode(err.to_string()))?;
        self.blobs
            .lock()
            .map_err(|_| SnapshotError::Storage("snapshot store poisoned".to_string()))?
            .insert(run_id.to_string(), payload);
        Ok(())
    }

    fn load(&self, run_id: &str) -> SnapshotResult<Option<RunSnapshot>> {
        let blobs = self
            .blobs
            .lock()
            .map_err(|_| SnapshotError::Storage("snapshot store poisoned".to_string()))?;
        blobs
            .get(run_id)
            .map(|json| {
                serde_json::from_str(json).map_err(|err| SnapshotError::Encode(err.to_string()))
            })
            .transpose()
    }

    fn append_fragment(&self, run_id: &str, fragment: &StepFragment) -> SnapshotResult<()> {
        let payload = serde_json::to_string(fragment)
            .map_err(|err| SnapshotError::Encode(err.to_string()))?;
        self.fragments
            .lock()
            .map_err(|_| SnapshotError::Storage("snapshot store poisoned".to_string()))?
            .entry(run_id.to_string())
            .or_default()
            .push(payload);
        Ok(())
    }

    fn fragments(&self, run_id: &str) -> SnapshotResult<Vec<StepFragment>> {
        let fragments = self
            .fragments
            .lock()
            .map_err(|_| SnapshotError::Storage("snapshot store poisoned".to_string()))?;
        fragments
            .get(run_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(|payload| {
                serde_json::from_str(payload).map_err(|err| SnapshotError::Encode(err.to_string()))
            })
            .collect()
    }
}
