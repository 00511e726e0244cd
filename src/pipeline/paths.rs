//! Library path construction and the move-or-copy primitive.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::job_store::Job;

/// Replace filesystem-hostile characters with underscores and trim outer
/// whitespace. Applied to every path segment derived from metadata.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Compute the library target path for a job:
/// `{music_dir}/{artist}/{album}/{NN - title}{ext}`. Empty artist/album
/// segments are skipped rather than producing empty directories.
pub fn build_target_path(music_dir: &Path, job: &Job) -> PathBuf {
    let artist = sanitize_filename(&job.artist);
    let album = sanitize_filename(&job.album);
    let title = {
        let title = sanitize_filename(&job.title);
        if title.is_empty() {
            sanitize_filename(&job.track_id)
        } else {
            title
        }
    };

    let extension = Path::new(&job.file_path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();

    let mut target = music_dir.to_path_buf();
    if !artist.is_empty() {
        target.push(artist);
    }
    if !album.is_empty() {
        target.push(album);
    }
    target.push(format!("{:02} - {}{}", job.track_number, title, extension));
    target
}

/// Move a file into the library. Tries an atomic rename first and falls
/// back to copy-then-unlink when the rename fails (typically across
/// filesystems). A missing source with an existing target is a replayed
/// move and counts as success.
pub async fn move_or_copy(source: &Path, target: &Path) -> Result<()> {
    let source_exists = tokio::fs::try_exists(source).await.unwrap_or(false);
    if !source_exists {
        if tokio::fs::try_exists(target).await.unwrap_or(false) {
            return Ok(());
        }
        anyhow::bail!("source file not found: {}", source.display());
    }

    if tokio::fs::rename(source, target).await.is_ok() {
        return Ok(());
    }
    copy_then_remove(source, target).await
}

async fn copy_then_remove(source: &Path, target: &Path) -> Result<()> {
    tokio::fs::copy(source, target)
        .await
        .context("failed to copy file")?;
    tokio::fs::remove_file(source)
        .await
        .context("failed to remove source file")?;
    Ok(())
}
