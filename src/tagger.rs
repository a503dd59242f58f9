//! Tagging Service: derives the tag record for a track and writes it.
//!
//! Tags replace whatever the file already carries. Values that fail
//! validation are omitted rather than written wrong.

use std::path::Path;

use lofty::config::WriteOptions;
use lofty::file::TaggedFileExt;
use lofty::picture::{Picture, PictureType};
use lofty::prelude::Accessor;
use lofty::tag::{ItemKey, ItemValue, Tag, TagExt, TagItem, TagType};
use log::debug;

use crate::artwork::ImageData;
use crate::error::TagError;
use crate::models::TrackEntry;
use crate::normalize::{clean_string, clean_youtube_title, title_from_filename};

const TITLE_MAX: usize = 200;
const ALBUM_MAX: usize = 200;
const ARTIST_MAX: usize = 100;
const GENRE_MAX: usize = 50;
const URL_MAX: usize = 200;
const ISRC_LEN: usize = 12;

const MIN_YEAR: u32 = 1900;
const MAX_YEAR: u32 = 2030;
const MAX_TRACK_NUMBER: i64 = 999;
const MAX_DISC_NUMBER: i64 = 99;

pub const UNKNOWN_TITLE: &str = "Unknown Title";
pub const UNKNOWN_ARTIST: &str = "Unknown Artist";

// ============================================================================
// Tag Record
// ============================================================================

/// Normalized tag values for one file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TagRecord {
    pub title: String,
    /// Primary artist
    pub artist: String,
    /// All credited artists joined with ", ", only when there is more than one
    pub all_artists: Option<String>,
    pub album: Option<String>,
    pub year: Option<u32>,
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
    pub length_secs: Option<u64>,
    pub explicit: Option<bool>,
    pub genre: Option<String>,
    pub isrc: Option<String>,
    pub source_url: Option<String>,
}

fn non_empty(text: String) -> Option<String> {
    (!text.is_empty()).then_some(text)
}

/// Year from a release date such as `"1999"`, `"1999-04"` or `"1999-04-12"`.
pub fn parse_release_year(date: &str) -> Option<u32> {
    let year = date.trim().split('-').next()?;
    if year.len() != 4 {
        return None;
    }
    let year: u32 = year.parse().ok()?;
    (MIN_YEAR..=MAX_YEAR).contains(&year).then_some(year)
}

fn bounded(value: Option<i64>, max: i64) -> Option<u32> {
    value
        .filter(|v| (1..=max).contains(v))
        .map(|v| v as u32)
}

impl TagRecord {
    /// Build the record for `entry`, whose audio lives at `file_path`.
    ///
    /// Title falls back from the Spotify name to the cleaned video title to
    /// the file name, and finally to [`UNKNOWN_TITLE`].
    pub fn from_entry(entry: &TrackEntry, file_path: &Path) -> Self {
        let spotify = &entry.spotify;

        let title = spotify
            .name
            .as_deref()
            .map(|n| clean_string(n, Some(TITLE_MAX)))
            .and_then(non_empty)
            .or_else(|| {
                entry
                    .youtube
                    .as_ref()
                    .and_then(|yt| yt.title())
                    .map(|t| clean_string(&clean_youtube_title(t), Some(TITLE_MAX)))
                    .and_then(non_empty)
            })
            .or_else(|| {
                file_path
                    .file_name()
                    .map(|f| clean_string(&title_from_filename(&f.to_string_lossy()), Some(TITLE_MAX)))
                    .and_then(non_empty)
            })
            .unwrap_or_else(|| UNKNOWN_TITLE.to_string());

        let artists: Vec<String> = spotify
            .artists
            .iter()
            .map(|a| clean_string(a, Some(ARTIST_MAX)))
            .filter(|a| !a.is_empty())
            .collect();
        let artist = artists
            .first()
            .cloned()
            .unwrap_or_else(|| UNKNOWN_ARTIST.to_string());
        let all_artists = (artists.len() > 1).then(|| artists.join(", "));

        Self {
            title,
            artist,
            all_artists,
            album: spotify
                .album
                .as_deref()
                .map(|a| clean_string(a, Some(ALBUM_MAX)))
                .and_then(non_empty),
            year: spotify.release_date.as_deref().and_then(parse_release_year),
            track_number: bounded(spotify.track_number, MAX_TRACK_NUMBER),
            disc_number: bounded(spotify.disc_number, MAX_DISC_NUMBER),
            length_secs: spotify
                .duration_ms
                .filter(|ms| *ms > 0)
                .map(|ms| (ms / 1000) as u64),
            explicit: spotify.explicit,
            genre: spotify
                .genres
                .first()
                .map(|g| clean_string(g, Some(GENRE_MAX)))
                .and_then(non_empty),
            isrc: spotify
                .isrc
                .as_deref()
                .map(|i| clean_string(i, None))
                .filter(|i| i.chars().count() == ISRC_LEN),
            source_url: spotify
                .spotify_url
                .as_deref()
                .map(|u| clean_string(u, Some(URL_MAX)))
                .and_then(non_empty),
        }
    }

    fn to_tag(&self, tag_type: TagType) -> Tag {
        let mut tag = Tag::new(tag_type);
        tag.set_title(self.title.clone());
        tag.set_artist(self.artist.clone());
        if let Some(all) = &self.all_artists {
            tag.insert_text(ItemKey::AlbumArtist, all.clone());
        }
        if let Some(album) = &self.album {
            tag.set_album(album.clone());
        }
        if let Some(year) = self.year {
            tag.set_year(year);
        }
        if let Some(track) = self.track_number {
            tag.set_track(track);
        }
        if let Some(disc) = self.disc_number {
            tag.set_disk(disc);
        }
        if let Some(secs) = self.length_secs {
            tag.insert_text(ItemKey::Length, secs.to_string());
        }
        if let Some(explicit) = self.explicit {
            tag.insert_text(
                ItemKey::ParentalAdvisory,
                if explicit { "1" } else { "0" }.to_string(),
            );
        }
        if let Some(genre) = &self.genre {
            tag.set_genre(genre.clone());
        }
        if let Some(isrc) = &self.isrc {
            tag.insert_text(ItemKey::Isrc, isrc.clone());
        }
        if let Some(url) = &self.source_url {
            tag.insert(TagItem::new(
                ItemKey::AudioSourceUrl,
                ItemValue::Locator(url.clone()),
            ));
        }
        tag
    }
}

// ============================================================================
// File Checks
// ============================================================================

/// The file must exist and be non-empty. Returns its size.
pub fn verify_audio_file(path: &Path) -> Result<u64, TagError> {
    let meta = match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => meta,
        _ => return Err(TagError::Missing(path.to_path_buf())),
    };
    if meta.len() == 0 {
        return Err(TagError::Empty(path.to_path_buf()));
    }
    Ok(meta.len())
}

fn verify_after_write(path: &Path) -> Result<(), TagError> {
    match verify_audio_file(path) {
        Ok(_) => Ok(()),
        Err(_) => Err(TagError::Corrupted(path.to_path_buf())),
    }
}

// ============================================================================
// Writers
// ============================================================================

/// Tag writing collaborator.
pub trait TagWriter: Send + Sync {
    /// Replace all tags on `path` with `record`.
    fn apply_tags(&self, path: &Path, record: &TagRecord) -> Result<(), TagError>;
}

/// Writes tags in the file's native tag format using lofty.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoftyTagWriter;

impl TagWriter for LoftyTagWriter {
    fn apply_tags(&self, path: &Path, record: &TagRecord) -> Result<(), TagError> {
        verify_audio_file(path)?;
        let tagged = lofty::read_from_path(path)?;
        let tag_type = tagged.primary_tag_type();

        for existing in tagged.tags() {
            existing.remove_from_path(path)?;
        }
        record.to_tag(tag_type).save_to_path(path, WriteOptions::default())?;
        debug!("Tagged {} ({:?})", path.display(), tag_type);

        verify_after_write(path)
    }
}

/// Embed `image` as the front cover, replacing any existing front cover.
pub fn embed_cover(path: &Path, image: &ImageData) -> Result<(), TagError> {
    verify_audio_file(path)?;
    let mut tagged = lofty::read_from_path(path)?;
    let tag_type = tagged.primary_tag_type();
    if tagged.tag(tag_type).is_none() {
        tagged.insert_tag(Tag::new(tag_type));
    }
    let tag = tagged
        .tag_mut(tag_type)
        .ok_or_else(|| TagError::Corrupted(path.to_path_buf()))?;

    tag.remove_picture_type(PictureType::CoverFront);
    tag.push_picture(Picture::new_unchecked(
        PictureType::CoverFront,
        Some(image.format.lofty_mime()),
        Some("Album Cover".to_string()),
        image.bytes.clone(),
    ));
    tag.save_to_path(path, WriteOptions::default())?;
    debug!(
        "Embedded {} byte {} cover into {}",
        image.bytes.len(),
        image.format.mime_type(),
        path.display()
    );

    verify_after_write(path)
}
