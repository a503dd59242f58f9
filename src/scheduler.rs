//! Concurrency Scheduler: runs Download Workers on a bounded pool and hands
//! the results back in original order.
//!
//! Workers finish in any order. Each completion is sent over a channel to a
//! collector thread, which keys it by `original_index`. Once the pool is
//! drained the map is turned into an [`OrderedDownloads`], the only form the
//! metadata phase accepts.
//!
//! Output stems are assigned for the whole batch before any worker starts, so
//! two tracks never write the same file.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver};
use log::{debug, info, warn};
use rustc_hash::FxHashMap;

use crate::backoff::{BatchCounters, Pause};
use crate::fallback::VideoSearch;
use crate::fetcher::AudioFetcher;
use crate::models::{DownloadOutcome, FailureReason, SkipReason, TrackEntry};
use crate::normalize::{disambiguate_stems, output_stem};
use crate::progress::{create_progress_bar, log_progress};
use crate::worker::{download_track, WorkerContext};

// ============================================================================
// Cancellation
// ============================================================================

/// Shared stop signal. Tracks already running finish; tracks not yet started
/// are reported as `Skipped { Cancelled }`.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// The underlying flag, for signal handlers that set it directly.
    pub fn handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

// ============================================================================
// Ordered Hand-off
// ============================================================================

/// Download outcomes sorted by ascending `original_index`, one per entry.
///
/// Can only be built by the scheduler, so the metadata phase can never see
/// results in completion order.
#[derive(Debug)]
pub struct OrderedDownloads {
    items: Vec<(TrackEntry, DownloadOutcome)>,
}

impl OrderedDownloads {
    /// Pair every entry with its outcome. Entries that never completed were
    /// never started and are marked cancelled.
    fn assemble(entries: &[TrackEntry], mut completed: FxHashMap<usize, DownloadOutcome>) -> Self {
        let mut items: Vec<(TrackEntry, DownloadOutcome)> = entries
            .iter()
            .map(|entry| {
                let outcome = completed
                    .remove(&entry.original_index)
                    .unwrap_or(DownloadOutcome::Skipped {
                        reason: SkipReason::Cancelled,
                    });
                (entry.clone(), outcome)
            })
            .collect();
        items.sort_by_key(|(entry, _)| entry.original_index);
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(TrackEntry, DownloadOutcome)> {
        self.items.iter()
    }
}

impl IntoIterator for OrderedDownloads {
    type Item = (TrackEntry, DownloadOutcome);
    type IntoIter = std::vec::IntoIter<(TrackEntry, DownloadOutcome)>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

// ============================================================================
// Scheduling
// ============================================================================

/// External collaborators used by the download phase.
#[derive(Clone, Copy)]
pub struct DownloadServices<'a> {
    pub fetcher: &'a dyn AudioFetcher,
    pub search: &'a dyn VideoSearch,
    pub pause: &'a dyn Pause,
}

/// Where and how the download phase writes audio.
#[derive(Debug, Clone, Copy)]
pub struct DownloadPlan<'a> {
    pub output_dir: &'a Path,
    pub audio_format: &'a str,
    /// 0 runs every track in order on the calling thread
    pub worker_count: usize,
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Pair each entry with a stem unique within the batch, in `original_index`
/// order, so the earlier track keeps the plain name.
fn plan_jobs(entries: &[TrackEntry]) -> Vec<(&TrackEntry, String)> {
    let mut ordered: Vec<&TrackEntry> = entries.iter().collect();
    ordered.sort_by_key(|entry| entry.original_index);
    let stems = disambiguate_stems(
        ordered
            .iter()
            .map(|entry| output_stem(entry.spotify.name.as_deref(), entry.original_index))
            .collect(),
    );
    ordered.into_iter().zip(stems).collect()
}

/// Run one worker, turning a panic into a failed outcome.
fn run_guarded(entry: &TrackEntry, stem: &str, ctx: &WorkerContext<'_>) -> DownloadOutcome {
    catch_unwind(AssertUnwindSafe(|| download_track(entry, stem, ctx))).unwrap_or_else(|payload| {
        let message = panic_message(payload);
        warn!(
            "[{}/{}] Worker panicked: {}",
            entry.original_index, ctx.total, message
        );
        DownloadOutcome::Failed {
            reason: FailureReason::WorkerPanicked { message },
        }
    })
}

fn collect_completions(rx: Receiver<(usize, DownloadOutcome)>) -> FxHashMap<usize, DownloadOutcome> {
    let mut completed = FxHashMap::default();
    for (index, outcome) in rx {
        debug!("Collected outcome for track {}", index);
        completed.insert(index, outcome);
    }
    completed
}

/// Run the download phase for every entry.
///
/// Returns one outcome per entry, ordered by `original_index`, regardless of
/// the order in which workers finished.
pub fn run_downloads(
    entries: &[TrackEntry],
    plan: &DownloadPlan<'_>,
    services: DownloadServices<'_>,
    stop: &StopFlag,
) -> Result<OrderedDownloads> {
    let total = entries.len();
    let counters = BatchCounters::new(plan.worker_count);
    let ctx = WorkerContext {
        fetcher: services.fetcher,
        search: services.search,
        pause: services.pause,
        counters: &counters,
        output_dir: plan.output_dir,
        audio_format: plan.audio_format,
        total,
    };

    let pb = create_progress_bar(total as u64, "Downloading");
    let done = AtomicU64::new(0);
    let jobs = plan_jobs(entries);
    let finish_one = || {
        pb.inc(1);
        let current = done.fetch_add(1, Ordering::SeqCst) + 1;
        log_progress("Downloading", current, total as u64, 10);
    };

    let completed = if plan.worker_count == 0 {
        info!("Downloading {} tracks sequentially", total);
        let mut completed = FxHashMap::default();
        for (entry, stem) in &jobs {
            if stop.is_stopped() {
                break;
            }
            let outcome = run_guarded(entry, stem, &ctx);
            finish_one();
            completed.insert(entry.original_index, outcome);
        }
        completed
    } else {
        info!(
            "Downloading {} tracks with {} workers",
            total, plan.worker_count
        );
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(plan.worker_count)
            .thread_name(|i| format!("download-{}", i))
            .build()
            .context("Failed to build download pool")?;

        let (tx, rx) = unbounded::<(usize, DownloadOutcome)>();
        std::thread::scope(|scope| {
            let collector = scope.spawn(move || collect_completions(rx));

            pool.scope(|s| {
                for (entry, stem) in &jobs {
                    let tx = tx.clone();
                    let ctx = &ctx;
                    let finish_one = &finish_one;
                    s.spawn(move |_| {
                        if stop.is_stopped() {
                            return;
                        }
                        let outcome = run_guarded(entry, stem, ctx);
                        finish_one();
                        // The collector outlives the pool.
                        let _ = tx.send((entry.original_index, outcome));
                    });
                }
            });
            drop(tx);

            collector.join().unwrap_or_default()
        })
    };

    if stop.is_stopped() {
        warn!(
            "Stopped: {} of {} tracks were not started",
            total - completed.len(),
            total
        );
    }
    pb.finish_with_message(format!("Downloaded {} tracks", completed.len()));

    Ok(OrderedDownloads::assemble(entries, completed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SpotifyMetadata, YoutubeCandidate, YoutubeId};
    use crate::testing::{FetchScript, RecordingPause, ScriptedFetcher, ScriptedSearch};
    use std::time::Duration;

    fn entries(n: usize) -> Vec<TrackEntry> {
        (1..=n)
            .map(|i| {
                let spotify = SpotifyMetadata {
                    name: Some(format!("Track {}", i)),
                    artists: vec!["Artist".into()],
                    ..Default::default()
                };
                let youtube = YoutubeCandidate {
                    id: Some(YoutubeId {
                        video_id: Some(format!("v{}", i)),
                    }),
                    snippet: None,
                };
                TrackEntry::new(i, spotify, Some(youtube))
            })
            .collect()
    }

    fn titled(titles: &[&str]) -> Vec<TrackEntry> {
        let mut entries = entries(titles.len());
        for (entry, title) in entries.iter_mut().zip(titles) {
            entry.spotify.name = Some(title.to_string());
        }
        entries
    }

    fn file_names(downloads: &OrderedDownloads) -> Vec<String> {
        downloads
            .iter()
            .map(|(_, outcome)| match outcome {
                DownloadOutcome::Downloaded { file_path, .. } => {
                    file_path.file_name().unwrap().to_string_lossy().into_owned()
                }
                other => panic!("unexpected {:?}", other),
            })
            .collect()
    }

    fn indexes(downloads: &OrderedDownloads) -> Vec<usize> {
        downloads.iter().map(|(e, _)| e.original_index).collect()
    }

    fn run(
        entries: &[TrackEntry],
        workers: usize,
        fetcher: &ScriptedFetcher,
        stop: &StopFlag,
    ) -> OrderedDownloads {
        run_with_pause(entries, workers, fetcher, &RecordingPause::default(), stop)
    }

    fn run_with_pause(
        entries: &[TrackEntry],
        workers: usize,
        fetcher: &ScriptedFetcher,
        pause: &RecordingPause,
        stop: &StopFlag,
    ) -> OrderedDownloads {
        let dir = tempfile::tempdir().unwrap();
        let search = ScriptedSearch::new(vec![]);
        let plan = DownloadPlan {
            output_dir: dir.path(),
            audio_format: "mp3",
            worker_count: workers,
        };
        let services = DownloadServices {
            fetcher,
            search: &search,
            pause,
        };
        run_downloads(entries, &plan, services, stop).unwrap()
    }

    #[test]
    fn test_results_in_original_order_despite_completion_order() {
        let entries = entries(6);
        // Earlier tracks take longer, so they finish last.
        let fetcher = ScriptedFetcher::default()
            .script("v1", FetchScript::Delayed(Duration::from_millis(300)))
            .script("v2", FetchScript::Delayed(Duration::from_millis(200)))
            .script("v3", FetchScript::Delayed(Duration::from_millis(100)));
        let downloads = run(&entries, 4, &fetcher, &StopFlag::new());

        assert_eq!(indexes(&downloads), vec![1, 2, 3, 4, 5, 6]);
        for (entry, outcome) in downloads.iter() {
            match outcome {
                DownloadOutcome::Downloaded { file_path, .. } => {
                    let expected = format!("Track {}.mp3", entry.original_index);
                    assert_eq!(file_path.file_name().unwrap().to_string_lossy(), expected);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_sequential_mode() {
        let entries = entries(3);
        let fetcher = ScriptedFetcher::default();
        let downloads = run(&entries, 0, &fetcher, &StopFlag::new());
        assert_eq!(indexes(&downloads), vec![1, 2, 3]);
        let order: Vec<String> = fetcher.calls().into_iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec!["v1", "v2", "v3"]);
    }

    #[test]
    fn test_every_entry_gets_exactly_one_outcome() {
        let mut entries = entries(5);
        entries[2].youtube = None;
        let fetcher = ScriptedFetcher::default()
            .script("v4", FetchScript::Fail("ERROR: unable to extract"));
        let downloads = run(&entries, 2, &fetcher, &StopFlag::new());
        assert_eq!(downloads.len(), 5);
        let outcomes: Vec<&DownloadOutcome> = downloads.iter().map(|(_, o)| o).collect();
        assert!(matches!(outcomes[2], DownloadOutcome::Skipped { .. }));
        assert!(outcomes[3].is_failure());
    }

    #[test]
    fn test_panicking_worker_becomes_failure() {
        let entries = entries(3);
        let fetcher = ScriptedFetcher::default().script("v2", FetchScript::Panic);
        let downloads = run(&entries, 2, &fetcher, &StopFlag::new());
        let outcomes: Vec<&DownloadOutcome> = downloads.iter().map(|(_, o)| o).collect();
        assert!(matches!(
            outcomes[1],
            DownloadOutcome::Failed {
                reason: FailureReason::WorkerPanicked { .. }
            }
        ));
        assert!(matches!(outcomes[0], DownloadOutcome::Downloaded { .. }));
        assert!(matches!(outcomes[2], DownloadOutcome::Downloaded { .. }));
    }

    #[test]
    fn test_stop_before_start_cancels_everything() {
        let entries = entries(4);
        let fetcher = ScriptedFetcher::default();
        let stop = StopFlag::new();
        stop.stop();
        let downloads = run(&entries, 2, &fetcher, &stop);
        assert_eq!(downloads.len(), 4);
        assert!(downloads.iter().all(|(_, o)| *o
            == DownloadOutcome::Skipped {
                reason: SkipReason::Cancelled
            }));
        assert!(fetcher.calls().is_empty());
    }

    #[test]
    fn test_stop_mid_batch_in_sequential_mode() {
        let entries = entries(4);
        let stop = StopFlag::new();
        let fetcher = ScriptedFetcher::default().stop_after("v2", stop.clone());
        let downloads = run(&entries, 0, &fetcher, &stop);
        let outcomes: Vec<&DownloadOutcome> = downloads.iter().map(|(_, o)| o).collect();
        assert!(matches!(outcomes[0], DownloadOutcome::Downloaded { .. }));
        assert!(matches!(outcomes[1], DownloadOutcome::Downloaded { .. }));
        assert_eq!(
            *outcomes[2],
            DownloadOutcome::Skipped {
                reason: SkipReason::Cancelled
            }
        );
        assert_eq!(fetcher.calls().len(), 2);
    }

    #[test]
    fn test_empty_batch() {
        let downloads = run(&[], 2, &ScriptedFetcher::default(), &StopFlag::new());
        assert!(downloads.is_empty());
    }

    #[test]
    fn test_colliding_titles_get_distinct_files() {
        let entries = titled(&["Why?", "Why", "Same", "Same", "Intro", "intro"]);
        let fetcher = ScriptedFetcher::default();
        let downloads = run(&entries, 3, &fetcher, &StopFlag::new());
        let names = file_names(&downloads);

        assert_eq!(names[1], "Why.mp3");
        assert_ne!(names[0], names[1]);
        assert!(names[0].starts_with("Why ["));
        assert_eq!(names[2], "Same.mp3");
        assert_eq!(names[3], "Same (2).mp3");
        assert_eq!(names[4], "Intro.mp3");
        assert_eq!(names[5], "intro (2).mp3");

        let mut stems: Vec<String> = fetcher.calls().into_iter().map(|(_, stem)| stem).collect();
        stems.sort();
        stems.dedup();
        assert_eq!(stems.len(), 6);
    }

    #[test]
    fn test_stems_follow_original_index_not_slice_order() {
        let mut entries = titled(&["Same", "Same"]);
        entries.reverse();
        let downloads = run(&entries, 0, &ScriptedFetcher::default(), &StopFlag::new());
        assert_eq!(indexes(&downloads), vec![1, 2]);
        assert_eq!(file_names(&downloads), vec!["Same.mp3", "Same (2).mp3"]);
    }

    #[test]
    fn test_backoff_reflects_failures_earlier_in_batch() {
        let bot = "ERROR: [youtube] x: Sign in to confirm you're not a bot";

        // Three skipped tracks and one plain failure before the block: the
        // skips never reach the counters, so the batch rate is 2/2.
        let mut failing = entries(5);
        for entry in failing.iter_mut().take(3) {
            entry.youtube = None;
        }
        let fetcher = ScriptedFetcher::default()
            .script("v4", FetchScript::Fail("ERROR: unable to extract"))
            .script("v5", FetchScript::Fail(bot));
        let after_failures = RecordingPause::default();
        run_with_pause(&failing, 0, &fetcher, &after_failures, &StopFlag::new());

        // Three successes before the block: the batch rate is 1/4.
        let fetcher = ScriptedFetcher::default().script("v4", FetchScript::Fail(bot));
        let after_successes = RecordingPause::default();
        run_with_pause(&entries(4), 0, &fetcher, &after_successes, &StopFlag::new());

        let slow = after_failures.pauses();
        let fast = after_successes.pauses();
        assert_eq!((slow.len(), fast.len()), (1, 1));

        // 80 * 2.0 * 1.5 = 240 raw, jittered then clamped
        let slow = slow[0].as_secs_f64();
        assert!((192.0..=240.0).contains(&slow), "{}", slow);
        // 80 * 1.25 * 1.5 = 150 raw
        let fast = fast[0].as_secs_f64();
        assert!((120.0..=180.0).contains(&fast), "{}", fast);
    }

    #[test]
    fn test_stop_handle_is_shared() {
        let stop = StopFlag::new();
        stop.handle().store(true, Ordering::SeqCst);
        assert!(stop.is_stopped());
        assert!(stop.clone().is_stopped());
    }
}
