//! Metadata Applier: the sequential phase after all downloads are in.
//!
//! Consumes an [`OrderedDownloads`] strictly in order. Tags and artwork are
//! read from the entry the download is paired with, so a file can only ever
//! receive its own track's metadata.

use std::path::Path;

use log::{info, warn};

use crate::artwork::{embed_artwork, ArtworkService};
use crate::backoff::Pause;
use crate::models::{DownloadOutcome, FinalResult, TrackEntry, TrackReport};
use crate::progress::{create_progress_bar, log_progress};
use crate::scheduler::OrderedDownloads;
use crate::tagger::{verify_audio_file, TagRecord, TagWriter};

/// Collaborators of the metadata phase.
#[derive(Clone, Copy)]
pub struct MetadataServices<'a> {
    pub tagger: &'a dyn TagWriter,
    pub artwork: &'a dyn ArtworkService,
    pub pause: &'a dyn Pause,
}

/// Tag and add artwork to one downloaded file.
fn finish_track(
    entry: &TrackEntry,
    file_path: &Path,
    services: MetadataServices<'_>,
    prefix: &str,
) -> FinalResult {
    let failed = |reason: String| {
        warn!("{} Metadata failed: {}", prefix, reason);
        FinalResult::MetadataFailed {
            file_path: file_path.to_path_buf(),
            reason,
        }
    };

    if let Err(e) = verify_audio_file(file_path) {
        return failed(e.to_string());
    }

    let record = TagRecord::from_entry(entry, file_path);
    if let Err(e) = services.tagger.apply_tags(file_path, &record) {
        return failed(e.to_string());
    }
    if let Err(e) = verify_audio_file(file_path) {
        return failed(format!("file damaged by tagging: {}", e));
    }

    if let Err(e) = embed_artwork(entry, file_path, services.artwork, services.pause) {
        return failed(e.to_string());
    }
    if let Err(e) = verify_audio_file(file_path) {
        return failed(format!("file damaged by artwork embed: {}", e));
    }

    info!("{} Tagged: {} - {}", prefix, record.artist, record.title);
    FinalResult::Success {
        file_path: file_path.to_path_buf(),
    }
}

/// Turn every download outcome into a final result, in original order.
///
/// Skipped and failed downloads pass through untouched.
pub fn apply_metadata(downloads: OrderedDownloads, services: MetadataServices<'_>) -> Vec<TrackReport> {
    let total = downloads.len();
    let pb = create_progress_bar(total as u64, "Tagging");
    let mut reports = Vec::with_capacity(total);

    for (i, (entry, outcome)) in downloads.into_iter().enumerate() {
        let prefix = format!("[{}/{}]", entry.original_index, total);
        let result = match outcome {
            DownloadOutcome::Downloaded { file_path, .. } => {
                finish_track(&entry, &file_path, services, &prefix)
            }
            DownloadOutcome::Skipped { reason } => FinalResult::Skipped { reason },
            DownloadOutcome::Failed { reason } => FinalResult::Failed { reason },
        };
        reports.push(TrackReport::new(&entry, result));
        pb.inc(1);
        log_progress("Tagging", (i + 1) as u64, total as u64, 10);
    }

    pb.finish_with_message(format!("Processed metadata for {} tracks", total));
    reports
}
