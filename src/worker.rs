//! Download Worker: acquires the audio for one track.
//!
//! ```text
//! START -> PRIMARY_ATTEMPT -> SUCCESS
//!                          -> BOT_BLOCKED -> (backoff) -> FALLBACK_ATTEMPT -> SUCCESS | FAILED
//!                          -> OTHER_FAILURE -> FAILED
//! ```
//!
//! Every fetch-layer error is turned into an outcome here; nothing is returned
//! as an error to the pool.

use std::path::Path;
use std::time::Duration;

use log::{debug, info, warn};

use crate::backoff::{compute_delay, is_bot_block, BatchCounters, Pause};
use crate::error::FetchError;
use crate::fallback::{find_alternative, VideoSearch};
use crate::fetcher::{video_url, AudioFetcher, FetchRequest, FetchedAudio};
use crate::models::{DownloadOutcome, FailureReason, SkipReason, TrackEntry};

/// Everything a worker needs besides the track itself.
pub struct WorkerContext<'a> {
    pub fetcher: &'a dyn AudioFetcher,
    pub search: &'a dyn VideoSearch,
    pub pause: &'a dyn Pause,
    pub counters: &'a BatchCounters,
    pub output_dir: &'a Path,
    pub audio_format: &'a str,
    /// Batch size, for `[index/total]` log prefixes
    pub total: usize,
}

/// Per-track retry history, fed into the backoff formula.
#[derive(Debug, Default, Clone, Copy)]
struct SongHistory {
    attempts: usize,
    failures: usize,
}

impl From<FetchError> for FailureReason {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Failed { message } => FailureReason::FetchFailed { message },
            FetchError::Unavailable { message } => FailureReason::Unavailable { message },
            FetchError::Timeout { secs } => FailureReason::TimedOut { secs },
            FetchError::Spawn(e) => FailureReason::FetchFailed {
                message: e.to_string(),
            },
        }
    }
}

fn attempt(
    ctx: &WorkerContext<'_>,
    video_id: &str,
    stem: &str,
    history: &mut SongHistory,
) -> Result<FetchedAudio, FetchError> {
    history.attempts += 1;
    let request = FetchRequest {
        video_id,
        target_dir: ctx.output_dir,
        filename_stem: stem,
        format: ctx.audio_format,
    };
    let result = ctx.fetcher.fetch(&request);
    if result.is_err() {
        history.failures += 1;
    }
    ctx.counters.record(result.is_err());
    result
}

fn verify(fetched: FetchedAudio, video_id: &str, via_fallback: bool, prefix: &str) -> DownloadOutcome {
    match std::fs::metadata(&fetched.path) {
        Ok(meta) if meta.is_file() => {
            info!(
                "{} Download complete: {} ({} bytes)",
                prefix,
                fetched.path.display(),
                meta.len()
            );
            DownloadOutcome::Downloaded {
                file_path: fetched.path,
                bytes_size: meta.len(),
                video_id: video_id.to_string(),
                via_fallback,
            }
        }
        _ => {
            warn!(
                "{} Skipped: downloaded file not found at {}",
                prefix,
                fetched.path.display()
            );
            DownloadOutcome::Skipped {
                reason: SkipReason::FileNotFoundPostDownload,
            }
        }
    }
}

/// Run the worker state machine for one track, writing to `<output_dir>/<stem>.<format>`.
///
/// Every fetch call is recorded in the batch counters as it returns, so a
/// later backoff in any worker sees it.
pub fn download_track(entry: &TrackEntry, stem: &str, ctx: &WorkerContext<'_>) -> DownloadOutcome {
    let prefix = format!("[{}/{}]", entry.original_index, ctx.total);
    let spotify = &entry.spotify;

    let Some(video_id) = entry.video_id() else {
        warn!(
            "{} Skipped: missing YouTube metadata - {}",
            prefix,
            spotify.display_name()
        );
        return DownloadOutcome::Skipped {
            reason: SkipReason::MissingYoutubeMetadata,
        };
    };

    info!(
        "{} Downloading: {} by {}",
        prefix,
        spotify.display_name(),
        spotify.artist_line()
    );
    debug!("{} Video URL: {}", prefix, video_url(video_id));

    let mut history = SongHistory::default();
    match attempt(ctx, video_id, stem, &mut history) {
        Ok(fetched) => verify(fetched, video_id, false, &prefix),
        Err(FetchError::Failed { message }) if is_bot_block(&message) => {
            recover_from_block(entry, ctx, stem, &mut history, &prefix, message)
        }
        Err(err) => {
            warn!("{} Failed: {}", prefix, err);
            DownloadOutcome::Failed {
                reason: err.into(),
            }
        }
    }
}

/// Pay the backoff delay, then try a lyrics-video fallback into the same file.
fn recover_from_block(
    entry: &TrackEntry,
    ctx: &WorkerContext<'_>,
    stem: &str,
    history: &mut SongHistory,
    prefix: &str,
    block_message: String,
) -> DownloadOutcome {
    let inputs = ctx
        .counters
        .delay_inputs(history.failures, history.attempts);
    let delay = compute_delay(&inputs, &mut rand::rng());
    warn!(
        "{} Bot detection on primary video, backing off {:.1}s",
        prefix, delay
    );
    debug!("{} Block text: {}", prefix, block_message);
    ctx.pause.pause(Duration::from_secs_f64(delay));

    let spotify = &entry.spotify;
    let Some(alt_id) = find_alternative(
        ctx.search,
        spotify.display_name(),
        &spotify.artist_line(),
        spotify.duration_secs(),
    ) else {
        warn!("{} Failed: no lyrics video fallback found", prefix);
        return DownloadOutcome::Failed {
            reason: FailureReason::BotDetected {
                delay_applied: delay,
                retry_recommended: true,
                detail: "no lyrics video fallback found".to_string(),
            },
        };
    };

    info!("{} Trying lyrics video: {}", prefix, video_url(&alt_id));
    match attempt(ctx, &alt_id, stem, history) {
        Ok(fetched) => verify(fetched, &alt_id, true, prefix),
        Err(err) => {
            warn!("{} Failed: lyrics video {} also failed: {}", prefix, alt_id, err);
            DownloadOutcome::Failed {
                reason: FailureReason::BotDetected {
                    delay_applied: delay,
                    retry_recommended: true,
                    detail: format!("fallback {} failed: {}", alt_id, err),
                },
            }
        }
    }
}
