//! Client for the upstream music-source API.
//!
//! Resolves audio URLs, cover art, and lyrics from a signed, mirror-routed
//! third-party API with heterogeneous JSON responses. All fallback ladders
//! (cover sizes, search keywords, cover download candidates) live here.

mod client;
mod models;

pub use client::GdClient;
pub use models::{LyricResult, UrlResult};

use anyhow::Result;
use async_trait::async_trait;

/// Seam between the pipeline and the upstream API client.
#[async_trait]
pub trait UpstreamResolver: Send + Sync {
    /// Resolve the audio URL for a track at the requested bitrate.
    async fn resolve_url(&self, source: &str, track_id: &str, bitrate: u32) -> Result<UrlResult>;

    /// Resolve a cover URL, trying sizes from large to small. An empty
    /// pic_id yields an empty URL.
    async fn resolve_cover(&self, source: &str, pic_id: &str) -> Result<String>;

    /// Resolve lyrics. An empty lyric_id yields None.
    async fn resolve_lyrics(&self, source: &str, lyric_id: &str) -> Result<Option<LyricResult>>;

    /// Recover pic/lyric ids through search when the client did not supply
    /// them. Returns `(pic_id, lyric_id)`.
    async fn resolve_aux_ids(
        &self,
        source: &str,
        track_id: &str,
        title: &str,
        artist: &str,
    ) -> Result<(String, String)>;

    /// Fetch cover bytes, walking the candidate URL ladder.
    async fn download_cover(&self, source: &str, cover_url: &str) -> Result<Vec<u8>>;
}

/// Map a symbolic quality tier to the upstream bitrate parameter.
pub fn quality_to_bitrate(quality: &str) -> u32 {
    match quality.to_ascii_lowercase().as_str() {
        "best" | "lossless" => 999,
        "high" => 320,
        "medium" => 192,
        "low" => 128,
        _ => 320,
    }
}
