//! Batch entry point: download phase, then ordered metadata phase.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use log::info;

use crate::applier::{apply_metadata, MetadataServices};
use crate::artwork::ArtworkService;
use crate::backoff::Pause;
use crate::fallback::VideoSearch;
use crate::fetcher::AudioFetcher;
use crate::models::{ResultsTally, TrackEntry, TrackReport};
use crate::scheduler::{run_downloads, DownloadPlan, DownloadServices, StopFlag};
use crate::tagger::TagWriter;

pub const MAX_WORKERS: usize = 8;
pub const DEFAULT_AUDIO_FORMAT: &str = "mp3";

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub output_dir: PathBuf,
    /// 0 = sequential, otherwise 1..=MAX_WORKERS concurrent downloads
    pub worker_count: usize,
    pub audio_format: String,
}

impl BatchConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            worker_count: 0,
            audio_format: DEFAULT_AUDIO_FORMAT.to_string(),
        }
    }

    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count > MAX_WORKERS {
            bail!(
                "Thread count {} is out of range (0-{})",
                self.worker_count,
                MAX_WORKERS
            );
        }
        if self.audio_format.is_empty()
            || !self.audio_format.chars().all(|c| c.is_ascii_alphanumeric())
        {
            bail!("Invalid audio format '{}'", self.audio_format);
        }
        Ok(())
    }
}

/// All external collaborators of a batch.
#[derive(Clone, Copy)]
pub struct Services<'a> {
    pub fetcher: &'a dyn AudioFetcher,
    pub search: &'a dyn VideoSearch,
    pub tagger: &'a dyn TagWriter,
    pub artwork: &'a dyn ArtworkService,
    pub pause: &'a dyn Pause,
}

#[derive(Debug)]
pub struct BatchReport {
    /// One report per entry, in original order
    pub reports: Vec<TrackReport>,
    pub tally: ResultsTally,
    pub elapsed: Duration,
}

/// Process a whole batch. Per-track failures end up in the tally; only
/// configuration and pool setup problems return an error.
pub fn run_batch(
    entries: &[TrackEntry],
    config: &BatchConfig,
    services: Services<'_>,
    stop: &StopFlag,
) -> Result<BatchReport> {
    config.validate()?;
    let start = Instant::now();
    info!(
        "Processing {} tracks into {}",
        entries.len(),
        config.output_dir.display()
    );

    let plan = DownloadPlan {
        output_dir: &config.output_dir,
        audio_format: &config.audio_format,
        worker_count: config.worker_count,
    };
    let downloads = run_downloads(
        entries,
        &plan,
        DownloadServices {
            fetcher: services.fetcher,
            search: services.search,
            pause: services.pause,
        },
        stop,
    )?;

    info!("All downloads finished, applying metadata in playlist order");
    let reports = apply_metadata(
        downloads,
        MetadataServices {
            tagger: services.tagger,
            artwork: services.artwork,
            pause: services.pause,
        },
    );
    let tally = ResultsTally::from_reports(&reports);

    Ok(BatchReport {
        reports,
        tally,
        elapsed: start.elapsed(),
    })
}
