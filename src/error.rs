//! Error types returned by the external collaborators.
//!
//! Per-track failures never escape as errors; the worker and the applier turn
//! these into outcome variants.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Audio fetch failures. `Failed` is the retry-worthy family (checked for bot
/// detection by the worker); `Unavailable` is permanent.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch failed: {message}")]
    Failed { message: String },

    #[error("video unavailable: {message}")]
    Unavailable { message: String },

    #[error("fetch timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("failed to start fetch process: {0}")]
    Spawn(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search failed: {0}")]
    Failed(String),

    #[error("search timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("failed to start search process: {0}")]
    Spawn(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum TagError {
    #[error("file does not exist: {0}")]
    Missing(PathBuf),

    #[error("file is empty: {0}")]
    Empty(PathBuf),

    #[error("file corrupted during tagging: {0}")]
    Corrupted(PathBuf),

    #[error("tag write failed: {0}")]
    Lofty(#[from] lofty::error::LoftyError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ArtworkError {
    #[error("http request failed: {0}")]
    Http(String),

    #[error("downloaded content too small ({0} bytes)")]
    TooSmall(usize),

    #[error("downloaded content is not a JPEG/PNG/GIF/WEBP image")]
    NotAnImage,

    #[error("no artwork source succeeded")]
    NoSources,

    #[error("failed to embed artwork: {0}")]
    Embed(#[from] TagError),
}

impl From<reqwest::Error> for ArtworkError {
    fn from(err: reqwest::Error) -> Self {
        ArtworkError::Http(err.to_string())
    }
}
