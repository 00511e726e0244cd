//! Audio tag writing.
//!
//! The pipeline talks to a `Tagger` trait; the lofty-backed implementation
//! dispatches on file extension, writing ID3v2.4 frames for mp3 and Vorbis
//! comments plus a PICTURE block for flac. Tagging is re-applicable: any
//! prior values for the same keys are replaced, so a replayed job tags the
//! same file twice without accumulating junk.

use anyhow::{bail, Context, Result};
use lofty::config::WriteOptions;
use lofty::file::{AudioFile, TaggedFileExt};
use lofty::picture::{MimeType, Picture, PictureType};
use lofty::probe::Probe;
use lofty::tag::{Accessor, ItemKey, ItemValue, Tag, TagItem, TagType};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Transient metadata record handed to the tagger. Lives only for the
/// duration of the tagging stage.
#[derive(Debug, Clone, Default)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub track_number: i64,
    pub year: i64,
    pub cover_url: String,
    pub cover_bytes: Vec<u8>,
    pub lyrics: String,
    pub translated_lyrics: String,
}

/// Capability the pipeline invokes during the tagging stage.
pub trait Tagger: Send + Sync {
    /// Embed the metadata into the audio file at `path`.
    fn write_tags(&self, path: &Path, metadata: &TrackMetadata) -> Result<()>;

    /// Write a sibling `.lrc` file next to the audio file.
    fn write_lyric_file(&self, audio_path: &Path, lyrics: &str) -> Result<()>;
}

/// Derive the `.lrc` sibling path for an audio file.
fn lyric_file_path(audio_path: &Path) -> PathBuf {
    audio_path.with_extension("lrc")
}

/// lofty-backed tag writer.
pub struct LoftyTagger;

impl LoftyTagger {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LoftyTagger {
    fn default() -> Self {
        Self::new()
    }
}

impl Tagger for LoftyTagger {
    fn write_tags(&self, path: &Path, metadata: &TrackMetadata) -> Result<()> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        let tag_type = match extension.as_str() {
            "mp3" => TagType::Id3v2,
            "flac" => TagType::VorbisComments,
            other => bail!("unsupported file format: .{other}"),
        };

        info!(
            file = %path.display(),
            title = %metadata.title,
            artist = %metadata.artist,
            "writing tags"
        );

        let mut tagged = Probe::open(path)
            .context("failed to open audio file")?
            .read()
            .context("failed to read audio file")?;

        if tagged.tag(tag_type).is_none() {
            tagged.insert_tag(Tag::new(tag_type));
        }
        let Some(tag) = tagged.tag_mut(tag_type) else {
            bail!("failed to attach tag to audio file");
        };

        // Accessor setters replace any existing values for the same keys.
        if !metadata.title.is_empty() {
            tag.set_title(metadata.title.clone());
        }
        if !metadata.artist.is_empty() {
            tag.set_artist(metadata.artist.clone());
        }
        if !metadata.album.is_empty() {
            tag.set_album(metadata.album.clone());
        }
        if metadata.track_number > 0 {
            tag.set_track(metadata.track_number as u32);
        }
        if metadata.year > 0 {
            tag.set_year(metadata.year as u32);
        }

        if !metadata.lyrics.is_empty() {
            tag.insert(TagItem::new(
                ItemKey::Lyrics,
                ItemValue::Text(metadata.lyrics.clone()),
            ));
        }
        if tag_type == TagType::VorbisComments && !metadata.translated_lyrics.is_empty() {
            tag.insert(TagItem::new(
                ItemKey::Unknown("LYRICS_TRANSLATED".to_string()),
                ItemValue::Text(metadata.translated_lyrics.clone()),
            ));
        }

        if !metadata.cover_bytes.is_empty() {
            // Drop any prior front cover before attaching the new one.
            tag.remove_picture_type(PictureType::CoverFront);
            tag.push_picture(Picture::new_unchecked(
                PictureType::CoverFront,
                Some(MimeType::Jpeg),
                Some("Cover".to_string()),
                metadata.cover_bytes.clone(),
            ));
            debug!(size = metadata.cover_bytes.len(), "attached cover");
        }

        tagged
            .save_to_path(path, WriteOptions::default())
            .context("failed to save tags")?;

        info!(file = %path.display(), "tags written successfully");
        Ok(())
    }

    fn write_lyric_file(&self, audio_path: &Path, lyrics: &str) -> Result<()> {
        if lyrics.is_empty() {
            return Ok(());
        }

        let lrc_path = lyric_file_path(audio_path);
        std::fs::write(&lrc_path, lyrics).context("failed to write lyric file")?;
        info!(path = %lrc_path.display(), "wrote lyric file");
        Ok(())
    }
}
