//! The five-stage download pipeline.
//!
//! resolve -> download -> tag -> move -> scan. Each stage writes its
//! status to the job store before running, and re-reads the row at every
//! stage boundary so an operator cancellation abandons the job instead of
//! finishing it. Stages 1, 2, and 4 are fatal on error; tagging and
//! scanning failures are logged and the job still completes.

mod download;
mod paths;

pub use paths::{build_target_path, move_or_copy, sanitize_filename};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::{StorageSettings, WorkerSettings};
use crate::indexer::Indexer;
use crate::job_store::{Job, JobStatus, JobStore};
use crate::queue::{DownloadPayload, TaskHandler};
use crate::resolver::{quality_to_bitrate, UpstreamResolver};
use crate::tagger::{Tagger, TrackMetadata};

#[derive(Debug, Clone)]
struct StageTimeouts {
    download: Duration,
    tag_write: Duration,
    move_file: Duration,
    scan: Duration,
}

/// Drives queued download jobs through the pipeline. One engine instance
/// is shared by all workers; per-job state lives in the store and the
/// job's workspace directory.
pub struct PipelineEngine {
    store: Arc<dyn JobStore>,
    resolver: Arc<dyn UpstreamResolver>,
    indexer: Arc<dyn Indexer>,
    tagger: Arc<dyn Tagger>,
    http: reqwest::Client,
    storage: StorageSettings,
    timeouts: StageTimeouts,
}

impl PipelineEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        resolver: Arc<dyn UpstreamResolver>,
        indexer: Arc<dyn Indexer>,
        tagger: Arc<dyn Tagger>,
        storage: StorageSettings,
        worker: &WorkerSettings,
    ) -> Self {
        // No overall client timeout: downloads are bounded per stage.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            store,
            resolver,
            indexer,
            tagger,
            http,
            storage,
            timeouts: StageTimeouts {
                download: Duration::from_secs(worker.download_timeout_secs),
                tag_write: Duration::from_secs(worker.tag_write_timeout_secs),
                move_file: Duration::from_secs(worker.move_timeout_secs),
                scan: Duration::from_secs(worker.scan_timeout_secs),
            },
        }
    }

    fn must_get(&self, id: &str) -> Result<Job> {
        self.store
            .get(id)?
            .ok_or_else(|| anyhow!("job {id} not found"))
    }

    /// Record the next stage on the row. Returns false when the row was
    /// cancelled, in which case the job must be abandoned.
    fn enter_stage(&self, id: &str, status: JobStatus, message: &str) -> Result<bool> {
        let job = self.must_get(id)?;
        if job.status == JobStatus::Cancelled {
            info!(job_id = %id, "job cancelled, abandoning");
            return Ok(false);
        }
        self.store.update_status(id, status, message)?;
        Ok(true)
    }

    async fn run_stages(&self, payload: &DownloadPayload) -> Result<bool> {
        let id = &payload.job_id;

        if !self.enter_stage(id, JobStatus::Resolving, "resolving audio url")? {
            return Ok(false);
        }
        self.stage_resolve(payload).await.context("resolving failed")?;

        if !self.enter_stage(id, JobStatus::Downloading, "downloading audio")? {
            return Ok(false);
        }
        self.stage_download(payload).await.context("downloading failed")?;

        if !self.enter_stage(id, JobStatus::Tagging, "writing tags")? {
            return Ok(false);
        }
        self.stage_tagging(payload).await.context("tagging failed")?;

        if !self.enter_stage(id, JobStatus::Moving, "moving to library")? {
            return Ok(false);
        }
        self.stage_moving(payload).await.context("moving failed")?;

        if !self.enter_stage(id, JobStatus::Scanning, "triggering library scan")? {
            return Ok(false);
        }
        self.stage_scanning(payload).await.context("scanning failed")?;

        // A cancellation that landed during the last stage still wins.
        let job = self.must_get(id)?;
        if job.status == JobStatus::Cancelled {
            info!(job_id = %id, "job cancelled, abandoning");
            return Ok(false);
        }
        self.store.mark_done(id, &job.file_path, job.file_size)?;
        Ok(true)
    }

    /// Stage 1: map quality to bitrate and resolve the audio URL.
    async fn stage_resolve(&self, payload: &DownloadPayload) -> Result<()> {
        let bitrate = quality_to_bitrate(&payload.quality);
        let resolved = self
            .resolver
            .resolve_url(&payload.source, &payload.track_id, bitrate)
            .await
            .context("failed to resolve url")?;

        self.store
            .set_resolved(&payload.job_id, &resolved.url, resolved.size, resolved.bitrate)?;
        Ok(())
    }

    /// Stage 2: stream the audio into the per-job workspace.
    async fn stage_download(&self, payload: &DownloadPayload) -> Result<()> {
        let job = self.must_get(&payload.job_id)?;
        let url = job
            .resolved_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| anyhow!("download url not found"))?;

        let workspace = self.storage.work_dir.join(&job.id);
        tokio::fs::create_dir_all(&workspace)
            .await
            .context("failed to create work dir")?;

        let extension = if url.contains(".flac") { "flac" } else { "mp3" };
        let dest = workspace.join(format!("audio.{extension}"));

        timeout(
            self.timeouts.download,
            download::download_with_progress(&self.http, url, &dest, self.store.as_ref(), &job.id),
        )
        .await
        .map_err(|_| anyhow!("download timed out after {}s", self.timeouts.download.as_secs()))?
        .context("failed to download file")?;

        let file_size = tokio::fs::metadata(&dest)
            .await
            .map(|m| m.len() as i64)
            .unwrap_or(0);
        self.store
            .set_file(&job.id, &dest.to_string_lossy(), file_size)?;

        info!(job_id = %job.id, size = file_size, "download completed");
        Ok(())
    }

    /// Stage 3: gather cover art and lyrics, then embed tags. Everything
    /// here is best-effort except the write timeout.
    async fn stage_tagging(&self, payload: &DownloadPayload) -> Result<()> {
        let job = self.must_get(&payload.job_id)?;

        let mut metadata = TrackMetadata {
            title: job.title.clone(),
            artist: job.artist.clone(),
            album: job.album.clone(),
            track_number: job.track_number,
            year: job.year,
            ..Default::default()
        };

        // Aux ids: prefer client-supplied values, then a search-based
        // recovery, then the payload's track-id defaults.
        let mut pic_id = job.pic_id.clone();
        let mut lyric_id = job.lyric_id.clone();
        if pic_id.is_empty() || lyric_id.is_empty() {
            match self
                .resolver
                .resolve_aux_ids(&payload.source, &payload.track_id, &job.title, &job.artist)
                .await
            {
                Ok((found_pic, found_lyric)) => {
                    if pic_id.is_empty() {
                        pic_id = found_pic;
                    }
                    if lyric_id.is_empty() {
                        lyric_id = found_lyric;
                    }
                }
                Err(e) => debug!(job_id = %job.id, "aux id resolution failed: {e:#}"),
            }
        }
        if pic_id.is_empty() {
            pic_id = payload.pic_id.clone();
        }
        if lyric_id.is_empty() {
            lyric_id = payload.lyric_id.clone();
        }

        match self.resolver.resolve_cover(&payload.source, &pic_id).await {
            Ok(cover_url) if !cover_url.is_empty() => {
                match self.resolver.download_cover(&payload.source, &cover_url).await {
                    Ok(bytes) => {
                        metadata.cover_url = cover_url;
                        metadata.cover_bytes = bytes;
                    }
                    Err(e) => warn!(job_id = %job.id, "cover download failed: {e:#}"),
                }
            }
            Ok(_) => {}
            Err(e) => warn!(job_id = %job.id, "cover resolution failed: {e:#}"),
        }

        match self.resolver.resolve_lyrics(&payload.source, &lyric_id).await {
            Ok(Some(lyrics)) => {
                metadata.lyrics = lyrics.lyric;
                metadata.translated_lyrics = lyrics.translation;
            }
            Ok(None) => {}
            Err(e) => warn!(job_id = %job.id, "lyrics resolution failed: {e:#}"),
        }

        let path = PathBuf::from(&job.file_path);

        let write = {
            let tagger = self.tagger.clone();
            let path = path.clone();
            let metadata = metadata.clone();
            tokio::task::spawn_blocking(move || tagger.write_tags(&path, &metadata))
        };
        match timeout(self.timeouts.tag_write, write).await {
            Err(_) => bail!(
                "tag write timed out after {}s",
                self.timeouts.tag_write.as_secs()
            ),
            Ok(Err(join_err)) => warn!(job_id = %job.id, "tag write task failed: {join_err}"),
            Ok(Ok(Err(e))) => warn!(job_id = %job.id, "failed to write tags: {e:#}"),
            Ok(Ok(Ok(()))) => {}
        }

        if !metadata.lyrics.is_empty() {
            let tagger = self.tagger.clone();
            let lyrics = metadata.lyrics.clone();
            let result =
                tokio::task::spawn_blocking(move || tagger.write_lyric_file(&path, &lyrics)).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(job_id = %job.id, "failed to write lyric file: {e:#}"),
                Err(join_err) => warn!(job_id = %job.id, "lyric write task failed: {join_err}"),
            }
        }

        Ok(())
    }

    /// Stage 4: move the file into the library tree.
    async fn stage_moving(&self, payload: &DownloadPayload) -> Result<()> {
        let job = self.must_get(&payload.job_id)?;
        let source = PathBuf::from(&job.file_path);
        let target = build_target_path(&self.storage.music_dir, &job);

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("failed to create target dir")?;
        }

        timeout(self.timeouts.move_file, move_or_copy(&source, &target))
            .await
            .map_err(|_| anyhow!("move timed out after {}s", self.timeouts.move_file.as_secs()))?
            .context("failed to move file")?;

        self.store
            .set_file(&job.id, &target.to_string_lossy(), job.file_size)?;

        // The workspace is spent once the file is placed.
        let workspace = self.storage.work_dir.join(&job.id);
        if let Err(e) = tokio::fs::remove_dir_all(&workspace).await {
            debug!(job_id = %job.id, "workspace cleanup failed: {e}");
        }

        info!(job_id = %job.id, path = %target.display(), "file moved");
        Ok(())
    }

    /// Stage 5: poke the indexer. Both the trigger and the wait are
    /// non-fatal; a delayed rescan beats a dropped file.
    async fn stage_scanning(&self, payload: &DownloadPayload) -> Result<()> {
        if let Err(e) = self.indexer.start_scan().await {
            warn!(job_id = %payload.job_id, "failed to start scan: {e:#}");
            return Ok(());
        }
        if let Err(e) = self.indexer.wait_for_scan(self.timeouts.scan).await {
            warn!(job_id = %payload.job_id, "scan wait failed: {e:#}");
        }
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for PipelineEngine {
    async fn handle(&self, payload: DownloadPayload) -> Result<()> {
        let job_id = payload.job_id.clone();
        let Some(job) = self.store.get(&job_id)? else {
            bail!("job {job_id} not found");
        };
        if job.status == JobStatus::Done || job.status == JobStatus::Cancelled {
            info!(job_id = %job_id, status = job.status.as_str(), "skipping job in terminal state");
            return Ok(());
        }

        info!(
            job_id = %job_id,
            source = %payload.source,
            track_id = %payload.track_id,
            "processing download job"
        );

        match self.run_stages(&payload).await {
            Ok(true) => {
                info!(job_id = %job_id, "download job completed");
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                let text = format!("{e:#}");
                error!(job_id = %job_id, "pipeline failed: {text}");
                if let Err(mark_err) = self.store.mark_failed(&job_id, &text) {
                    error!(job_id = %job_id, "failed to mark job as failed: {mark_err:#}");
                }
                Err(e)
            }
        }
    }
}
