//! Durable background task queue.
//!
//! Tasks are download payloads persisted in their own SQLite database and
//! claimed atomically by the worker pool. Delivery is at-least-once: a
//! claim that is never acked (worker crash) is reclaimed after a stale
//! threshold and handed out again, so handlers must tolerate replay.

mod worker;

pub use worker::{TaskHandler, WorkerPool};

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Queue envelope for a download job. Everything else is fetched from the
/// job store by id, so this must survive being replayed verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadPayload {
    pub job_id: String,
    pub source: String,
    pub track_id: String,
    pub pic_id: String,
    pub lyric_id: String,
    pub library_id: String,
    pub quality: String,
}

/// A task handed to a worker, identified for a later ack.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: i64,
    pub payload: DownloadPayload,
}

/// The queue contract the rest of the system consumes: an enqueue
/// primitive plus the claim/ack cycle the worker pool drives.
pub trait JobQueue: Send + Sync {
    /// Append a task. Returns the task id.
    fn enqueue(&self, payload: &DownloadPayload) -> Result<i64>;

    /// Atomically claim the oldest pending task, if any.
    fn claim_next(&self) -> Result<Option<ClaimedTask>>;

    /// Acknowledge a claimed task, removing it from the queue.
    fn ack(&self, task_id: i64) -> Result<()>;

    /// Return tasks claimed more than `older_than_secs` ago to the pending
    /// state. Returns the number of tasks reclaimed.
    fn reclaim_stale(&self, older_than_secs: i64) -> Result<usize>;

    /// Number of tasks waiting to be claimed.
    fn pending_count(&self) -> Result<i64>;
}

/// SQLite-backed queue. Lives in its own database file next to the jobs
/// database, mirroring the one-file-per-store layout of the rest of the
/// system.
pub struct SqliteJobQueue {
    conn: Arc<Mutex<Connection>>,
}

const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queue_tasks (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    payload     TEXT NOT NULL,
    state       TEXT NOT NULL DEFAULT 'pending',
    enqueued_at INTEGER NOT NULL,
    claimed_at  INTEGER
)
"#;

const QUEUE_STATE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_queue_tasks_state ON queue_tasks(state, id)";

impl SqliteJobQueue {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let existed = db_path.as_ref().exists();
        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open queue database at {:?}", db_path.as_ref()))?;
        conn.execute(QUEUE_SCHEMA, [])?;
        conn.execute(QUEUE_STATE_INDEX, [])?;
        if !existed {
            info!("Created new queue database at {:?}", db_path.as_ref());
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute(QUEUE_SCHEMA, [])?;
        conn.execute(QUEUE_STATE_INDEX, [])?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }
}

impl JobQueue for SqliteJobQueue {
    fn enqueue(&self, payload: &DownloadPayload) -> Result<i64> {
        let body = serde_json::to_string(payload).context("Failed to serialize payload")?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO queue_tasks (payload, enqueued_at) VALUES (?1, ?2)",
            rusqlite::params![body, Self::now()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn claim_next(&self) -> Result<Option<ClaimedTask>> {
        let conn = self.conn.lock().unwrap();
        let next: Option<(i64, String)> = conn
            .query_row(
                "SELECT id, payload FROM queue_tasks WHERE state = 'pending' ORDER BY id LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((id, body)) = next else {
            return Ok(None);
        };

        let rows_affected = conn.execute(
            "UPDATE queue_tasks SET state = 'running', claimed_at = ?1 \
             WHERE id = ?2 AND state = 'pending'",
            rusqlite::params![Self::now(), id],
        )?;
        if rows_affected == 0 {
            return Ok(None);
        }

        let payload: DownloadPayload =
            serde_json::from_str(&body).context("Failed to deserialize payload")?;
        Ok(Some(ClaimedTask { id, payload }))
    }

    fn ack(&self, task_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM queue_tasks WHERE id = ?1", [task_id])?;
        Ok(())
    }

    fn reclaim_stale(&self, older_than_secs: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let cutoff = Self::now() - older_than_secs;
        let rows_affected = conn.execute(
            "UPDATE queue_tasks SET state = 'pending', claimed_at = NULL \
             WHERE state = 'running' AND claimed_at < ?1",
            [cutoff],
        )?;
        Ok(rows_affected)
    }

    fn pending_count(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM queue_tasks WHERE state = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
