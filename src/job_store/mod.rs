//! Durable storage for download jobs.
//!
//! Every admitted job is a row in the `jobs` table, keyed by id and
//! uniquely indexed by idempotency key. The store is the single source of
//! truth for job state; workers and the admission API both go through it.

mod models;
mod schema;

pub use models::{Job, JobStatus};

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Storage operations for download jobs.
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails if the id or idempotency key already exists.
    fn insert(&self, job: &Job) -> Result<()>;

    /// Get a job by id.
    fn get(&self, id: &str) -> Result<Option<Job>>;

    /// Find a job by its idempotency key.
    fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>>;

    /// Write a new status with a short human-readable message.
    fn update_status(&self, id: &str, status: JobStatus, message: &str) -> Result<()>;

    /// Persist download accounting. Last writer wins.
    fn update_progress(
        &self,
        id: &str,
        progress: i64,
        completed_bytes: i64,
        total_bytes: i64,
    ) -> Result<()>;

    /// Persist the results of the resolve stage.
    fn set_resolved(&self, id: &str, resolved_url: &str, total_bytes: i64, bitrate: i64)
        -> Result<()>;

    /// Persist the current audio file location and size.
    fn set_file(&self, id: &str, file_path: &str, file_size: i64) -> Result<()>;

    /// Mark a job done. Sets progress to 100 and clears any stale error.
    fn mark_done(&self, id: &str, file_path: &str, file_size: i64) -> Result<()>;

    /// Mark a job failed with the error text.
    fn mark_failed(&self, id: &str, error: &str) -> Result<()>;

    /// Cancel a job unless it is already done or failed.
    /// Returns true if the row was updated.
    fn try_cancel(&self, id: &str, message: &str) -> Result<bool>;

    /// Reset a failed job back to queued for an operator retry: clears the
    /// error, sets message to "retrying", bumps retry_count and
    /// last_retry_at. Returns true if the row was in `failed` and was reset.
    fn try_reset_for_retry(&self, id: &str) -> Result<bool>;

    /// List jobs, most recent first, optionally filtered by status.
    fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>>;

    /// Count jobs in a given status.
    fn count_by_status(&self, status: JobStatus) -> Result<i64>;

    /// Delete terminal rows (done/failed/cancelled) not updated since the
    /// cutoff. Returns the number of rows removed.
    fn prune_terminal_older_than(&self, cutoff: i64) -> Result<usize>;
}

/// SQLite-backed job store.
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    /// Open an existing database or create a new one with the schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let existed = db_path.as_ref().exists();
        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open jobs database at {:?}", db_path.as_ref()))?;
        schema::create_schema(&conn)?;
        if !existed {
            info!("Created new jobs database at {:?}", db_path.as_ref());
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store for testing.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::create_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        Ok(Job {
            id: row.get("id")?,
            idempotency_key: row.get("idempotency_key")?,
            source: row.get("source")?,
            track_id: row.get("track_id")?,
            pic_id: row.get("pic_id")?,
            lyric_id: row.get("lyric_id")?,
            library_id: row.get("library_id")?,
            quality: row.get("quality")?,
            title: row.get("title")?,
            artist: row.get("artist")?,
            album: row.get("album")?,
            track_number: row.get("track_number")?,
            year: row.get("year")?,
            status: JobStatus::from_str(&row.get::<_, String>("status")?)
                .unwrap_or(JobStatus::Failed),
            message: row.get("message")?,
            resolved_url: row.get("resolved_url")?,
            progress: row.get("progress")?,
            total_bytes: row.get("total_bytes")?,
            completed_bytes: row.get("completed_bytes")?,
            file_path: row.get("file_path")?,
            file_size: row.get("file_size")?,
            duration: row.get("duration")?,
            bitrate: row.get("bitrate")?,
            error: row.get("error")?,
            retry_count: row.get("retry_count")?,
            last_retry_at: row.get("last_retry_at")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }
}

impl JobStore for SqliteJobStore {
    fn insert(&self, job: &Job) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT INTO jobs (
                id, idempotency_key, source, track_id, pic_id, lyric_id,
                library_id, quality, title, artist, album, track_number, year,
                status, message, resolved_url, progress, total_bytes,
                completed_bytes, file_path, file_size, duration, bitrate,
                error, retry_count, last_retry_at, created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26,
                ?27, ?28
            )"#,
            rusqlite::params![
                job.id,
                job.idempotency_key,
                job.source,
                job.track_id,
                job.pic_id,
                job.lyric_id,
                job.library_id,
                job.quality,
                job.title,
                job.artist,
                job.album,
                job.track_number,
                job.year,
                job.status.as_str(),
                job.message,
                job.resolved_url,
                job.progress,
                job.total_bytes,
                job.completed_bytes,
                job.file_path,
                job.file_size,
                job.duration,
                job.bitrate,
                job.error,
                job.retry_count,
                job.last_retry_at,
                job.created_at,
                job.updated_at,
            ],
        )
        .context("Failed to insert job")?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.conn.lock().unwrap();
        let job = conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", [id], Self::row_to_job)
            .optional()?;
        Ok(job)
    }

    fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>> {
        let conn = self.conn.lock().unwrap();
        let job = conn
            .query_row(
                "SELECT * FROM jobs WHERE idempotency_key = ?1",
                [key],
                Self::row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    fn update_status(&self, id: &str, status: JobStatus, message: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE jobs SET status = ?1, message = ?2, updated_at = ?3 WHERE id = ?4",
            rusqlite::params![status.as_str(), message, Self::now(), id],
        )?;
        Ok(())
    }

    fn update_progress(
        &self,
        id: &str,
        progress: i64,
        completed_bytes: i64,
        total_bytes: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"UPDATE jobs
               SET progress = ?1, completed_bytes = ?2, total_bytes = ?3, updated_at = ?4
               WHERE id = ?5"#,
            rusqlite::params![progress, completed_bytes, total_bytes, Self::now(), id],
        )?;
        Ok(())
    }

    fn set_resolved(
        &self,
        id: &str,
        resolved_url: &str,
        total_bytes: i64,
        bitrate: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"UPDATE jobs
               SET resolved_url = ?1, total_bytes = ?2, bitrate = ?3, updated_at = ?4
               WHERE id = ?5"#,
            rusqlite::params![resolved_url, total_bytes, bitrate, Self::now(), id],
        )?;
        Ok(())
    }

    fn set_file(&self, id: &str, file_path: &str, file_size: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE jobs SET file_path = ?1, file_size = ?2, updated_at = ?3 WHERE id = ?4",
            rusqlite::params![file_path, file_size, Self::now(), id],
        )?;
        Ok(())
    }

    fn mark_done(&self, id: &str, file_path: &str, file_size: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"UPDATE jobs
               SET status = 'done', file_path = ?1, file_size = ?2, progress = 100,
                   error = '', updated_at = ?3
               WHERE id = ?4"#,
            rusqlite::params![file_path, file_size, Self::now(), id],
        )?;
        Ok(())
    }

    fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE jobs SET status = 'failed', error = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![error, Self::now(), id],
        )?;
        Ok(())
    }

    fn try_cancel(&self, id: &str, message: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let rows_affected = conn.execute(
            r#"UPDATE jobs
               SET status = 'cancelled', message = ?1, updated_at = ?2
               WHERE id = ?3 AND status NOT IN ('done', 'failed')"#,
            rusqlite::params![message, Self::now(), id],
        )?;
        Ok(rows_affected > 0)
    }

    fn try_reset_for_retry(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let now = Self::now();
        let rows_affected = conn.execute(
            r#"UPDATE jobs
               SET status = 'queued', error = '', message = 'retrying',
                   retry_count = retry_count + 1, last_retry_at = ?1, updated_at = ?1
               WHERE id = ?2 AND status = 'failed'"#,
            rusqlite::params![now, id],
        )?;
        Ok(rows_affected > 0)
    }

    fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        let conn = self.conn.lock().unwrap();
        let jobs = match status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    r#"SELECT * FROM jobs WHERE status = ?1
                       ORDER BY created_at DESC LIMIT ?2"#,
                )?;
                let rows = stmt
                    .query_map(
                        rusqlite::params![status.as_str(), limit as i64],
                        Self::row_to_job,
                    )?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt =
                    conn.prepare("SELECT * FROM jobs ORDER BY created_at DESC LIMIT ?1")?;
                let rows = stmt
                    .query_map([limit as i64], Self::row_to_job)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        Ok(jobs)
    }

    fn count_by_status(&self, status: JobStatus) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            [status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn prune_terminal_older_than(&self, cutoff: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let rows_affected = conn.execute(
            r#"DELETE FROM jobs
               WHERE status IN ('done', 'failed', 'cancelled') AND updated_at < ?1"#,
            [cutoff],
        )?;
        Ok(rows_affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_job(id: &str, key: &str) -> Job {
        Job::new(
            id.to_string(),
            key.to_string(),
            "netease".to_string(),
            "track-1".to_string(),
        )
        .with_library("lib1".to_string(), "best".to_string())
    }

    #[test]
    fn test_insert_and_get() {
        let store = SqliteJobStore::in_memory().unwrap();
        let job = make_job("job-1", "key-1")
            .with_metadata("Song".to_string(), "Artist".to_string(), "Album".to_string(), 4, 2020);
        store.insert(&job).unwrap();

        let loaded = store.get("job-1").unwrap().unwrap();
        assert_eq!(loaded.id, "job-1");
        assert_eq!(loaded.idempotency_key, "key-1");
        assert_eq!(loaded.source, "netease");
        assert_eq!(loaded.status, JobStatus::Queued);
        assert_eq!(loaded.title, "Song");
        assert_eq!(loaded.track_number, 4);
        assert!(loaded.resolved_url.is_none());
        assert!(loaded.last_retry_at.is_none());
    }

    #[test]
    fn test_get_not_found() {
        let store = SqliteJobStore::in_memory().unwrap();
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_idempotency_key_unique() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.insert(&make_job("job-1", "same-key")).unwrap();
        assert!(store.insert(&make_job("job-2", "same-key")).is_err());
    }

    #[test]
    fn test_find_by_idempotency_key() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.insert(&make_job("job-1", "netease:1:lib1")).unwrap();

        let found = store.find_by_idempotency_key("netease:1:lib1").unwrap();
        assert_eq!(found.unwrap().id, "job-1");
        assert!(store.find_by_idempotency_key("other").unwrap().is_none());
    }

    #[test]
    fn test_update_status() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.insert(&make_job("job-1", "key-1")).unwrap();

        store
            .update_status("job-1", JobStatus::Resolving, "resolving audio url")
            .unwrap();
        let job = store.get("job-1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Resolving);
        assert_eq!(job.message, "resolving audio url");
    }

    #[test]
    fn test_update_progress() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.insert(&make_job("job-1", "key-1")).unwrap();

        store.update_progress("job-1", 42, 4200, 10000).unwrap();
        let job = store.get("job-1").unwrap().unwrap();
        assert_eq!(job.progress, 42);
        assert_eq!(job.completed_bytes, 4200);
        assert_eq!(job.total_bytes, 10000);
    }

    #[test]
    fn test_updated_at_non_decreasing() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.insert(&make_job("job-1", "key-1")).unwrap();
        let before = store.get("job-1").unwrap().unwrap().updated_at;

        store.update_progress("job-1", 10, 100, 1000).unwrap();
        store.update_progress("job-1", 20, 200, 1000).unwrap();
        let after = store.get("job-1").unwrap().unwrap().updated_at;
        assert!(after >= before);
    }

    #[test]
    fn test_set_resolved() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.insert(&make_job("job-1", "key-1")).unwrap();

        store
            .set_resolved("job-1", "https://cdn.example.com/a.flac", 12345, 999)
            .unwrap();
        let job = store.get("job-1").unwrap().unwrap();
        assert_eq!(
            job.resolved_url.as_deref(),
            Some("https://cdn.example.com/a.flac")
        );
        assert_eq!(job.total_bytes, 12345);
        assert_eq!(job.bitrate, 999);
    }

    #[test]
    fn test_mark_done_sets_progress_and_clears_error() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.insert(&make_job("job-1", "key-1")).unwrap();
        store.mark_failed("job-1", "boom").unwrap();

        store.mark_done("job-1", "/music/a/b/01 - t.mp3", 999).unwrap();
        let job = store.get("job-1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.progress, 100);
        assert_eq!(job.file_path, "/music/a/b/01 - t.mp3");
        assert_eq!(job.file_size, 999);
        assert_eq!(job.error, "");
    }

    #[test]
    fn test_mark_failed() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.insert(&make_job("job-1", "key-1")).unwrap();

        store.mark_failed("job-1", "url resolution failed: VIP required").unwrap();
        let job = store.get("job-1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.contains("VIP required"));
    }

    #[test]
    fn test_try_cancel_guards_terminal_states() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.insert(&make_job("job-1", "key-1")).unwrap();
        assert!(store.try_cancel("job-1", "cancelled by user").unwrap());
        assert_eq!(
            store.get("job-1").unwrap().unwrap().status,
            JobStatus::Cancelled
        );

        store.insert(&make_job("job-2", "key-2")).unwrap();
        store.mark_done("job-2", "/m/f.mp3", 1).unwrap();
        assert!(!store.try_cancel("job-2", "cancelled by user").unwrap());

        store.insert(&make_job("job-3", "key-3")).unwrap();
        store.mark_failed("job-3", "err").unwrap();
        assert!(!store.try_cancel("job-3", "cancelled by user").unwrap());
    }

    #[test]
    fn test_try_reset_for_retry() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.insert(&make_job("job-1", "key-1")).unwrap();

        // Not failed yet: no reset
        assert!(!store.try_reset_for_retry("job-1").unwrap());

        store.mark_failed("job-1", "boom").unwrap();
        assert!(store.try_reset_for_retry("job-1").unwrap());

        let job = store.get("job-1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.error, "");
        assert_eq!(job.message, "retrying");
        assert_eq!(job.retry_count, 1);
        assert!(job.last_retry_at.is_some());

        store.mark_failed("job-1", "boom again").unwrap();
        assert!(store.try_reset_for_retry("job-1").unwrap());
        assert_eq!(store.get("job-1").unwrap().unwrap().retry_count, 2);
    }

    #[test]
    fn test_list_with_filter_and_limit() {
        let store = SqliteJobStore::in_memory().unwrap();
        for i in 0..5 {
            let mut job = make_job(&format!("job-{i}"), &format!("key-{i}"));
            job.created_at = 1000 + i;
            store.insert(&job).unwrap();
        }
        store.mark_failed("job-0", "x").unwrap();

        let all = store.list(None, 50).unwrap();
        assert_eq!(all.len(), 5);
        // Most recent first
        assert_eq!(all[0].id, "job-4");

        let queued = store.list(Some(JobStatus::Queued), 50).unwrap();
        assert_eq!(queued.len(), 4);

        let failed = store.list(Some(JobStatus::Failed), 50).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, "job-0");

        let limited = store.list(None, 2).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_count_by_status() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.insert(&make_job("job-1", "key-1")).unwrap();
        store.insert(&make_job("job-2", "key-2")).unwrap();
        store.mark_done("job-2", "/m/f.mp3", 1).unwrap();

        assert_eq!(store.count_by_status(JobStatus::Queued).unwrap(), 1);
        assert_eq!(store.count_by_status(JobStatus::Done).unwrap(), 1);
        assert_eq!(store.count_by_status(JobStatus::Failed).unwrap(), 0);
    }

    #[test]
    fn test_prune_terminal_older_than() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.insert(&make_job("old-done", "key-1")).unwrap();
        store.insert(&make_job("old-running", "key-2")).unwrap();
        store.insert(&make_job("fresh-done", "key-3")).unwrap();

        store.mark_done("old-done", "/m/a.mp3", 1).unwrap();
        store.mark_done("fresh-done", "/m/b.mp3", 1).unwrap();
        store
            .update_status("old-running", JobStatus::Downloading, "downloading audio")
            .unwrap();

        // Age out the two "old" rows
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "UPDATE jobs SET updated_at = 100 WHERE id IN ('old-done', 'old-running')",
                [],
            )
            .unwrap();
        }

        let pruned = store.prune_terminal_older_than(1000).unwrap();
        assert_eq!(pruned, 1);
        assert!(store.get("old-done").unwrap().is_none());
        // Non-terminal rows survive regardless of age
        assert!(store.get("old-running").unwrap().is_some());
        assert!(store.get("fresh-done").unwrap().is_some());
    }
}
