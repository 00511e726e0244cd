//! Streaming audio download with progress reporting.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::warn;

use crate::job_store::JobStore;

const CHUNK_SIZE: usize = 32 * 1024;
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Integer percentage of a download, zero when the total is unknown.
/// Capped at 99: progress only reaches 100 when the job is marked done.
pub(crate) fn progress_pct(completed_bytes: i64, total_bytes: i64) -> i64 {
    if total_bytes <= 0 {
        return 0;
    }
    (completed_bytes * 100 / total_bytes).clamp(0, 99)
}

/// Stream `url` to `dest` in 32 KiB chunks, persisting
/// (progress, completed_bytes, total_bytes) at most once per second.
/// Progress write failures are logged, not fatal; a broken stream is.
pub(crate) async fn download_with_progress(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    store: &dyn JobStore,
    job_id: &str,
) -> Result<i64> {
    let response = client
        .get(url)
        .send()
        .await
        .context("failed to request audio url")?;

    if response.status() != reqwest::StatusCode::OK {
        bail!("unexpected status code: {}", response.status().as_u16());
    }

    let total_bytes = response.content_length().map(|v| v as i64).unwrap_or(0);

    let mut file = tokio::fs::File::create(dest)
        .await
        .context("failed to create audio file")?;

    use futures::TryStreamExt;
    let stream = response
        .bytes_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    let mut reader = tokio_util::io::StreamReader::new(stream);

    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut completed_bytes: i64 = 0;
    let mut last_update = Instant::now();

    loop {
        let n = reader
            .read(&mut buffer)
            .await
            .context("failed to read audio stream")?;
        if n == 0 {
            break;
        }
        file.write_all(&buffer[..n])
            .await
            .context("failed to write audio file")?;
        completed_bytes += n as i64;

        if last_update.elapsed() >= PROGRESS_INTERVAL {
            let progress = progress_pct(completed_bytes, total_bytes);
            if let Err(e) = store.update_progress(job_id, progress, completed_bytes, total_bytes) {
                warn!(job_id, "failed to persist progress: {e:#}");
            }
            last_update = Instant::now();
        }
    }

    file.flush().await.context("failed to flush audio file")?;

    // Final accounting so completed_bytes is exact even for fast downloads.
    let progress = progress_pct(completed_bytes, total_bytes);
    if let Err(e) = store.update_progress(job_id, progress, completed_bytes, total_bytes) {
        warn!(job_id, "failed to persist progress: {e:#}");
    }

    Ok(completed_bytes)
}
