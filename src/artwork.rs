//! Artwork Service: finds a cover image for a track and embeds it.
//!
//! Sources in priority order: Spotify oEmbed cover (640x640 variant first),
//! then the YouTube candidate's thumbnails (maxres upgrade of `high`, then
//! `high`, `medium`, `default`). Every URL gets up to [`MAX_ATTEMPTS`]
//! downloads, and a download only counts once it passes [`validate_image`].

use std::path::Path;
use std::time::Duration;

use lofty::picture::MimeType;
use log::{debug, info, warn};
use serde::Deserialize;

use crate::backoff::Pause;
use crate::error::ArtworkError;
use crate::models::{TrackEntry, YoutubeCandidate};
use crate::tagger::embed_cover;

/// Anything at or below this size is treated as an error page, not an image.
pub const MIN_IMAGE_BYTES: usize = 100;
pub const MAX_ATTEMPTS: usize = 3;
pub const RETRY_PAUSE: Duration = Duration::from_secs(1);

const OEMBED_ENDPOINT: &str = "https://open.spotify.com/oembed";
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

// ============================================================================
// Image Validation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
}

impl ImageFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
            ImageFormat::Gif => "image/gif",
            ImageFormat::Webp => "image/webp",
        }
    }

    pub(crate) fn lofty_mime(&self) -> MimeType {
        match self {
            ImageFormat::Jpeg => MimeType::Jpeg,
            ImageFormat::Png => MimeType::Png,
            ImageFormat::Gif => MimeType::Gif,
            ImageFormat::Webp => MimeType::Unknown(self.mime_type().to_string()),
        }
    }
}

/// Identify an image by its magic bytes.
pub fn detect_image_format(bytes: &[u8]) -> Option<ImageFormat> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some(ImageFormat::Jpeg)
    } else if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some(ImageFormat::Png)
    } else if bytes.starts_with(b"GIF8") {
        Some(ImageFormat::Gif)
    } else if bytes.len() >= 12 && bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP" {
        Some(ImageFormat::Webp)
    } else {
        None
    }
}

/// Validated image bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
}

/// Accept only payloads larger than [`MIN_IMAGE_BYTES`] with a known signature.
pub fn validate_image(bytes: Vec<u8>) -> Result<ImageData, ArtworkError> {
    if bytes.len() <= MIN_IMAGE_BYTES {
        return Err(ArtworkError::TooSmall(bytes.len()));
    }
    let format = detect_image_format(&bytes).ok_or(ArtworkError::NotAnImage)?;
    Ok(ImageData { bytes, format })
}

// ============================================================================
// Source URLs
// ============================================================================

/// Cover URLs for a Spotify oEmbed thumbnail: the 640x640 variant, then the original.
pub fn spotify_cover_variants(thumbnail_url: &str) -> Vec<String> {
    let upscaled = thumbnail_url.replace("300x300", "640x640");
    if upscaled == thumbnail_url {
        vec![thumbnail_url.to_string()]
    } else {
        vec![upscaled, thumbnail_url.to_string()]
    }
}

/// Thumbnail URLs of a video candidate, best first.
pub fn youtube_thumbnail_urls(candidate: &YoutubeCandidate) -> Vec<String> {
    let Some(snippet) = &candidate.snippet else {
        return Vec::new();
    };
    let thumbs = &snippet.thumbnails;
    let mut urls = Vec::new();
    for (quality, thumb) in [
        ("high", &thumbs.high),
        ("medium", &thumbs.medium),
        ("default", &thumbs.default),
    ] {
        let Some(url) = thumb.as_ref().and_then(|t| t.url.as_deref()) else {
            continue;
        };
        if quality == "high" {
            let maxres = url.replace("/hqdefault.jpg", "/maxresdefault.jpg");
            if maxres != url {
                urls.push(maxres);
            }
        }
        urls.push(url.to_string());
    }
    urls
}

// ============================================================================
// Service
// ============================================================================

/// Artwork collaborator: cover lookup, image download, embedding.
pub trait ArtworkService: Send + Sync {
    /// Cover image URLs for a Spotify track URL, best first.
    fn cover_urls(&self, spotify_url: &str) -> Result<Vec<String>, ArtworkError>;

    /// Raw bytes at `url`. Validation is done by the caller.
    fn fetch_image(&self, url: &str) -> Result<Vec<u8>, ArtworkError>;

    /// Embed as front cover, replacing any existing front cover.
    fn embed(&self, path: &Path, image: &ImageData) -> Result<(), ArtworkError>;
}

fn fetch_validated(
    service: &dyn ArtworkService,
    pause: &dyn Pause,
    url: &str,
) -> Result<ImageData, ArtworkError> {
    let mut last_error = ArtworkError::NoSources;
    for attempt in 1..=MAX_ATTEMPTS {
        match service.fetch_image(url).and_then(validate_image) {
            Ok(image) => return Ok(image),
            Err(e) => {
                debug!("Artwork attempt {}/{} for {} failed: {}", attempt, MAX_ATTEMPTS, url, e);
                last_error = e;
                if attempt < MAX_ATTEMPTS {
                    pause.pause(RETRY_PAUSE);
                }
            }
        }
    }
    Err(last_error)
}

/// Find and embed the best available cover for `entry` into `path`.
///
/// A source whose image downloads but fails to embed is abandoned in favour
/// of the next source.
pub fn embed_artwork(
    entry: &TrackEntry,
    path: &Path,
    service: &dyn ArtworkService,
    pause: &dyn Pause,
) -> Result<ImageFormat, ArtworkError> {
    let mut sources: Vec<(&str, Vec<String>)> = Vec::new();

    if let Some(spotify_url) = entry.spotify.spotify_url.as_deref().filter(|u| !u.trim().is_empty()) {
        match service.cover_urls(spotify_url) {
            Ok(urls) => sources.push(("Spotify", urls)),
            Err(e) => warn!("Spotify cover lookup failed: {}", e),
        }
    }
    if let Some(candidate) = &entry.youtube {
        sources.push(("YouTube", youtube_thumbnail_urls(candidate)));
    }

    for (source, urls) in sources {
        for url in urls {
            let image = match fetch_validated(service, pause, &url) {
                Ok(image) => image,
                Err(e) => {
                    warn!("{} artwork {} failed: {}", source, url, e);
                    continue;
                }
            };
            match service.embed(path, &image) {
                Ok(()) => {
                    info!(
                        "Embedded {} artwork ({}, {} bytes)",
                        source,
                        image.format.mime_type(),
                        image.bytes.len()
                    );
                    return Ok(image.format);
                }
                Err(e) => {
                    warn!("{} artwork could not be embedded: {}", source, e);
                    break;
                }
            }
        }
    }

    Err(ArtworkError::NoSources)
}

// ============================================================================
// HTTP Implementation
// ============================================================================

#[derive(Debug, Deserialize)]
struct OEmbedResponse {
    thumbnail_url: Option<String>,
}

/// reqwest-backed artwork service that embeds with lofty.
pub struct HttpArtwork {
    client: reqwest::blocking::Client,
}

impl HttpArtwork {
    pub fn new() -> Result<Self, ArtworkError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }
}

impl ArtworkService for HttpArtwork {
    fn cover_urls(&self, spotify_url: &str) -> Result<Vec<String>, ArtworkError> {
        let response: OEmbedResponse = self
            .client
            .get(OEMBED_ENDPOINT)
            .query(&[("url", spotify_url)])
            .send()?
            .error_for_status()?
            .json()?;
        let thumbnail = response
            .thumbnail_url
            .ok_or_else(|| ArtworkError::Http("no thumbnail_url in oEmbed response".to_string()))?;
        Ok(spotify_cover_variants(&thumbnail))
    }

    fn fetch_image(&self, url: &str) -> Result<Vec<u8>, ArtworkError> {
        let bytes = self
            .client
            .get(url)
            .header(
                reqwest::header::ACCEPT,
                "image/webp,image/apng,image/*,*/*;q=0.8",
            )
            .send()?
            .error_for_status()?
            .bytes()?;
        Ok(bytes.to_vec())
    }

    fn embed(&self, path: &Path, image: &ImageData) -> Result<(), ArtworkError> {
        Ok(embed_cover(path, image)?)
    }
}
