//! Bot-detection classification and adaptive backoff.
//!
//! The delay grows with configured concurrency, with the running batch's
//! failure rate, and with the current track's own failure history, then gets
//! ±20% jitter and is clamped to [`MIN_DELAY_SECS`, `MAX_DELAY_SECS`].

use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

// ============================================================================
// Classification
// ============================================================================

/// Provider phrases that indicate automated-traffic blocking (lowercase).
pub const BOT_SIGNATURES: &[&str] = &[
    "sign in to confirm you're not a bot",
    "sign in to confirm you\u{2019}re not a bot",
    "confirm you're not a bot",
    "confirm you\u{2019}re not a bot",
    "youtube blocking detected",
    "http error 429",
    "too many requests",
    "unusual traffic",
    "automated queries",
    "rate-limited by youtube",
];

/// Case-insensitive match of a raw failure text against [`BOT_SIGNATURES`].
pub fn is_bot_block(failure_text: &str) -> bool {
    let lower = failure_text.to_lowercase();
    BOT_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

// ============================================================================
// Delay Formula
// ============================================================================

pub const BASE_DELAY_SECS: f64 = 80.0;
pub const MIN_DELAY_SECS: f64 = 60.0;
pub const MAX_DELAY_SECS: f64 = 240.0;
const THREAD_WEIGHT: f64 = 0.4;
const SONG_FAILURE_WEIGHT: f64 = 0.5;
const JITTER: f64 = 0.2;

/// Inputs to the backoff formula. Read-only; they never drive control flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DelayInputs {
    pub thread_count: usize,
    pub batch_failure_count: usize,
    pub batch_attempt_count: usize,
    pub song_failure_count: usize,
    pub song_attempt_count: usize,
}

fn rate(failures: usize, attempts: usize) -> f64 {
    if attempts > 0 {
        failures as f64 / attempts as f64
    } else {
        0.0
    }
}

/// Deterministic part of the delay (before jitter and clamping).
///
/// A thread count of 0 (sequential mode) is treated as a single worker.
pub fn raw_delay(inputs: &DelayInputs) -> f64 {
    let threads = inputs.thread_count.max(1);
    let thread_factor = 1.0 + (threads - 1) as f64 * THREAD_WEIGHT;
    let failure_factor = 1.0 + rate(inputs.batch_failure_count, inputs.batch_attempt_count);
    let song_penalty =
        1.0 + SONG_FAILURE_WEIGHT * rate(inputs.song_failure_count, inputs.song_attempt_count);
    BASE_DELAY_SECS * thread_factor * failure_factor * song_penalty
}

/// Final delay in seconds: uniform in `[0.8 * raw, 1.2 * raw]`, clamped.
pub fn compute_delay<R: Rng>(inputs: &DelayInputs, rng: &mut R) -> f64 {
    let raw = raw_delay(inputs);
    let drawn = rng.random_range(raw * (1.0 - JITTER)..=raw * (1.0 + JITTER));
    drawn.clamp(MIN_DELAY_SECS, MAX_DELAY_SECS)
}

// ============================================================================
// Shared Batch State
// ============================================================================

/// Batch-wide attempt/failure tally, shared by all workers of one batch.
///
/// Incremented once per fetch call as it returns, primary and fallback alike.
/// Tracks skipped before any fetch never touch it. Read by workers that hit
/// bot detection, so later delays reflect the batch as it runs.
#[derive(Debug, Default)]
pub struct BatchCounters {
    thread_count: usize,
    attempts: AtomicUsize,
    failures: AtomicUsize,
}

impl BatchCounters {
    pub fn new(thread_count: usize) -> Self {
        Self {
            thread_count,
            attempts: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    pub fn record(&self, failed: bool) {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if failed {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    /// Formula inputs for a track with the given retry history.
    pub fn delay_inputs(&self, song_failure_count: usize, song_attempt_count: usize) -> DelayInputs {
        DelayInputs {
            thread_count: self.thread_count,
            batch_failure_count: self.failures(),
            batch_attempt_count: self.attempts(),
            song_failure_count,
            song_attempt_count,
        }
    }
}

// ============================================================================
// Pausing
// ============================================================================

/// Blocking wait used for backoff and retry pauses.
pub trait Pause: Send + Sync {
    fn pause(&self, duration: Duration);
}

/// Sleeps the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleep;

impl Pause for ThreadSleep {
    fn pause(&self, duration: Duration) {
        thread::sleep(duration);
    }
}
