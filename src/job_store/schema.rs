//! SQLite schema for the jobs database.

use anyhow::Result;
use rusqlite::Connection;

const JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id              TEXT PRIMARY KEY,
    idempotency_key TEXT NOT NULL UNIQUE,
    source          TEXT NOT NULL,
    track_id        TEXT NOT NULL,
    pic_id          TEXT NOT NULL DEFAULT '',
    lyric_id        TEXT NOT NULL DEFAULT '',
    library_id      TEXT NOT NULL,
    quality         TEXT NOT NULL DEFAULT 'best',
    title           TEXT NOT NULL DEFAULT '',
    artist          TEXT NOT NULL DEFAULT '',
    album           TEXT NOT NULL DEFAULT '',
    track_number    INTEGER NOT NULL DEFAULT 0,
    year            INTEGER NOT NULL DEFAULT 0,
    status          TEXT NOT NULL,
    message         TEXT NOT NULL DEFAULT '',
    resolved_url    TEXT,
    progress        INTEGER NOT NULL DEFAULT 0,
    total_bytes     INTEGER NOT NULL DEFAULT 0,
    completed_bytes INTEGER NOT NULL DEFAULT 0,
    file_path       TEXT NOT NULL DEFAULT '',
    file_size       INTEGER NOT NULL DEFAULT 0,
    duration        INTEGER NOT NULL DEFAULT 0,
    bitrate         INTEGER NOT NULL DEFAULT 0,
    error           TEXT NOT NULL DEFAULT '',
    retry_count     INTEGER NOT NULL DEFAULT 0,
    last_retry_at   INTEGER,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
)
"#;

const JOBS_STATUS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_jobs_status_created ON jobs(status, created_at DESC)";

/// Create the jobs schema on a fresh or existing connection.
pub fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute(JOBS_TABLE, [])?;
    conn.execute(JOBS_STATUS_INDEX, [])?;
    Ok(())
}
