//! Core data models for the fetch pipeline.
//!
//! This module contains the input records (one per playlist item), the
//! per-track outcomes produced by the download and metadata phases, and the
//! batch tally.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};

// ============================================================================
// Input Models
// ============================================================================

/// Spotify metadata exported for one playlist item. Every field may be absent.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SpotifyMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "string_or_list")]
    pub artists: Vec<String>,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub release_date: Option<String>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub track_number: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub disc_number: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub explicit: Option<bool>,
    #[serde(default)]
    pub isrc: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub spotify_url: Option<String>,
    #[serde(default, deserialize_with = "string_or_list")]
    pub genres: Vec<String>,
}

impl SpotifyMetadata {
    /// Track name for log lines.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or("Unknown")
    }

    /// All credited artists joined with ", " (used for logs and search queries).
    pub fn artist_line(&self) -> String {
        let artists: Vec<&str> = self
            .artists
            .iter()
            .map(|a| a.trim())
            .filter(|a| !a.is_empty())
            .collect();
        if artists.is_empty() {
            "Unknown".to_string()
        } else {
            artists.join(", ")
        }
    }

    /// Track length in seconds, if a positive duration was exported.
    pub fn duration_secs(&self) -> Option<f64> {
        self.duration_ms
            .filter(|ms| *ms > 0)
            .map(|ms| ms as f64 / 1000.0)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct YoutubeId {
    #[serde(default, rename = "videoId")]
    pub video_id: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Thumbnail {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Thumbnails {
    #[serde(default)]
    pub high: Option<Thumbnail>,
    #[serde(default)]
    pub medium: Option<Thumbnail>,
    #[serde(default)]
    pub default: Option<Thumbnail>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Snippet {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, rename = "channelTitle")]
    pub channel_title: Option<String>,
    #[serde(default)]
    pub thumbnails: Thumbnails,
}

/// Video matched upstream for a playlist item.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct YoutubeCandidate {
    #[serde(default)]
    pub id: Option<YoutubeId>,
    #[serde(default)]
    pub snippet: Option<Snippet>,
}

impl YoutubeCandidate {
    /// The resolvable video id, if any.
    pub fn video_id(&self) -> Option<&str> {
        self.id
            .as_ref()
            .and_then(|id| id.video_id.as_deref())
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    pub fn title(&self) -> Option<&str> {
        self.snippet.as_ref().and_then(|s| s.title.as_deref())
    }
}

/// One object of the enriched playlist JSON array.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct EnrichedEntry {
    #[serde(default)]
    pub spotify: Option<SpotifyMetadata>,
    #[serde(default)]
    pub youtube: Option<YoutubeCandidate>,
}

/// Immutable input record for one playlist item.
///
/// `original_index` is the 1-based position in the batch. It is assigned once
/// on load and is the only key used to restore ordering after the concurrent
/// download phase.
#[derive(Clone, Debug)]
pub struct TrackEntry {
    pub original_index: usize,
    pub spotify: SpotifyMetadata,
    pub youtube: Option<YoutubeCandidate>,
}

impl TrackEntry {
    pub fn new(
        original_index: usize,
        spotify: SpotifyMetadata,
        youtube: Option<YoutubeCandidate>,
    ) -> Self {
        Self {
            original_index,
            spotify,
            youtube,
        }
    }

    pub fn video_id(&self) -> Option<&str> {
        self.youtube.as_ref().and_then(|yt| yt.video_id())
    }
}

/// Parse an enriched playlist JSON document, assigning 1-based indexes.
pub fn parse_entries(json: &str) -> Result<Vec<TrackEntry>> {
    let raw: Vec<EnrichedEntry> =
        serde_json::from_str(json).context("Enriched JSON must be an array of entries")?;
    Ok(raw
        .into_iter()
        .enumerate()
        .map(|(i, e)| TrackEntry::new(i + 1, e.spotify.unwrap_or_default(), e.youtube))
        .collect())
}

/// Load and parse an enriched playlist JSON file.
pub fn load_entries(path: &Path) -> Result<Vec<TrackEntry>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_entries(&json).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Accepts `"A"` or `["A", "B"]`; anything else becomes an empty list.
fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => vec![s],
        Value::Array(items) => items
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    })
}

/// Accepts integers and numeric strings; malformed values become `None`.
fn lenient_int<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

// ============================================================================
// Download Outcomes
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// No YouTube candidate, or the candidate has no video id
    MissingYoutubeMetadata,
    /// The fetch service reported success but nothing is on disk
    FileNotFoundPostDownload,
    /// The batch was stopped before this track started
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::MissingYoutubeMetadata => "missing_youtube_metadata",
            SkipReason::FileNotFoundPostDownload => "file_not_found_post_download",
            SkipReason::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FailureReason {
    /// Primary video blocked; fallback missing or also failed.
    BotDetected {
        delay_applied: f64,
        retry_recommended: bool,
        detail: String,
    },
    /// Private, removed or DRM-affected video. Never retried.
    Unavailable { message: String },
    /// Any other fetch-layer failure.
    FetchFailed { message: String },
    TimedOut { secs: u64 },
    /// A worker panicked; caught at the pool boundary.
    WorkerPanicked { message: String },
}

impl FailureReason {
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::BotDetected { .. } => "bot_detected",
            FailureReason::Unavailable { .. } => "unavailable",
            FailureReason::FetchFailed { .. } => "fetch_failed",
            FailureReason::TimedOut { .. } => "timed_out",
            FailureReason::WorkerPanicked { .. } => "worker_panicked",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::BotDetected {
                delay_applied,
                detail,
                ..
            } => write!(f, "bot_detected (waited {:.1}s): {}", delay_applied, detail),
            FailureReason::Unavailable { message } => write!(f, "unavailable: {}", message),
            FailureReason::FetchFailed { message } => write!(f, "fetch_failed: {}", message),
            FailureReason::TimedOut { secs } => write!(f, "timed_out after {}s", secs),
            FailureReason::WorkerPanicked { message } => {
                write!(f, "worker_panicked: {}", message)
            }
        }
    }
}

/// Result of one Download Worker invocation.
#[derive(Clone, Debug, PartialEq)]
pub enum DownloadOutcome {
    Downloaded {
        file_path: PathBuf,
        bytes_size: u64,
        /// The video the file was actually built from
        video_id: String,
        via_fallback: bool,
    },
    Skipped {
        reason: SkipReason,
    },
    Failed {
        reason: FailureReason,
    },
}

impl DownloadOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, DownloadOutcome::Failed { .. })
    }
}

// ============================================================================
// Final Results
// ============================================================================

/// Terminal per-track result after the metadata phase.
#[derive(Clone, Debug, PartialEq)]
pub enum FinalResult {
    Success { file_path: PathBuf },
    /// Audio is on disk but tagging or artwork failed
    MetadataFailed { file_path: PathBuf, reason: String },
    Skipped { reason: SkipReason },
    Failed { reason: FailureReason },
}

impl FinalResult {
    pub fn status(&self) -> &'static str {
        match self {
            FinalResult::Success { .. } => "success",
            FinalResult::MetadataFailed { .. } => "metadata_failed",
            FinalResult::Skipped { .. } => "skipped",
            FinalResult::Failed { .. } => "failed",
        }
    }

    pub fn reason(&self) -> Option<String> {
        match self {
            FinalResult::Success { .. } => None,
            FinalResult::MetadataFailed { reason, .. } => Some(reason.clone()),
            FinalResult::Skipped { reason } => Some(reason.to_string()),
            FinalResult::Failed { reason } => Some(reason.to_string()),
        }
    }

    pub fn file_path(&self) -> Option<&Path> {
        match self {
            FinalResult::Success { file_path } | FinalResult::MetadataFailed { file_path, .. } => {
                Some(file_path.as_path())
            }
            _ => None,
        }
    }
}

/// Final result together with the identity of the track it belongs to.
#[derive(Clone, Debug)]
pub struct TrackReport {
    pub original_index: usize,
    pub title: String,
    pub spotify_id: Option<String>,
    pub result: FinalResult,
}

impl TrackReport {
    pub fn new(entry: &TrackEntry, result: FinalResult) -> Self {
        Self {
            original_index: entry.original_index,
            title: entry.spotify.display_name().to_string(),
            spotify_id: entry.spotify.id.clone(),
            result,
        }
    }
}

/// Batch-level counts of final results.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResultsTally {
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub metadata_failed: usize,
}

impl ResultsTally {
    pub fn from_reports(reports: &[TrackReport]) -> Self {
        let mut tally = Self::default();
        for report in reports {
            tally.record(&report.result);
        }
        tally
    }

    pub fn record(&mut self, result: &FinalResult) {
        match result {
            FinalResult::Success { .. } => self.success += 1,
            FinalResult::MetadataFailed { .. } => self.metadata_failed += 1,
            FinalResult::Skipped { .. } => self.skipped += 1,
            FinalResult::Failed { .. } => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.success + self.failed + self.skipped + self.metadata_failed
    }

    /// A batch succeeds when at least one track was tagged or legitimately skipped.
    pub fn is_success(&self) -> bool {
        self.success > 0 || self.skipped > 0
    }
}
