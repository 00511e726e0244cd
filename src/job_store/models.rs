//! Data models for the job store.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a download job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Resolving,
    Downloading,
    Tagging,
    Moving,
    Scanning,
    Done,      // terminal
    Failed,    // terminal until an operator retry
    Cancelled, // terminal
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Resolving => "resolving",
            JobStatus::Downloading => "downloading",
            JobStatus::Tagging => "tagging",
            JobStatus::Moving => "moving",
            JobStatus::Scanning => "scanning",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "resolving" => Some(JobStatus::Resolving),
            "downloading" => Some(JobStatus::Downloading),
            "tagging" => Some(JobStatus::Tagging),
            "moving" => Some(JobStatus::Moving),
            "scanning" => Some(JobStatus::Scanning),
            "done" => Some(JobStatus::Done),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states never re-enter the pipeline (Failed can, but only
    /// through an operator retry).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// A download job as persisted in the `jobs` table.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub idempotency_key: String,
    pub source: String,
    pub track_id: String,
    pub pic_id: String,
    pub lyric_id: String,
    pub library_id: String,
    pub quality: String,

    pub title: String,
    pub artist: String,
    pub album: String,
    pub track_number: i64,
    pub year: i64,

    pub status: JobStatus,
    /// Short human-readable note for the current stage.
    pub message: String,
    /// Audio URL produced by the resolve stage, consumed by download.
    pub resolved_url: Option<String>,

    pub progress: i64,
    pub total_bytes: i64,
    pub completed_bytes: i64,

    pub file_path: String,
    pub file_size: i64,
    pub duration: i64,
    pub bitrate: i64,

    pub error: String,
    pub retry_count: i64,
    pub last_retry_at: Option<i64>,

    pub created_at: i64,
    pub updated_at: i64,
}

impl Job {
    /// Create a new job in the `queued` state.
    pub fn new(id: String, idempotency_key: String, source: String, track_id: String) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id,
            idempotency_key,
            source,
            track_id,
            pic_id: String::new(),
            lyric_id: String::new(),
            library_id: String::new(),
            quality: "best".to_string(),
            title: String::new(),
            artist: String::new(),
            album: String::new(),
            track_number: 0,
            year: 0,
            status: JobStatus::Queued,
            message: String::new(),
            resolved_url: None,
            progress: 0,
            total_bytes: 0,
            completed_bytes: 0,
            file_path: String::new(),
            file_size: 0,
            duration: 0,
            bitrate: 0,
            error: String::new(),
            retry_count: 0,
            last_retry_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_library(mut self, library_id: String, quality: String) -> Self {
        self.library_id = library_id;
        self.quality = quality;
        self
    }

    pub fn with_aux_ids(mut self, pic_id: String, lyric_id: String) -> Self {
        self.pic_id = pic_id;
        self.lyric_id = lyric_id;
        self
    }

    pub fn with_metadata(
        mut self,
        title: String,
        artist: String,
        album: String,
        track_number: i64,
        year: i64,
    ) -> Self {
        self.title = title;
        self.artist = artist;
        self.album = album;
        self.track_number = track_number;
        self.year = year;
        self
    }
}
