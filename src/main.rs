use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::time::Duration;

use playlist_fetch::artwork::HttpArtwork;
use playlist_fetch::backoff::ThreadSleep;
use playlist_fetch::fetcher::YtDlp;
use playlist_fetch::models::load_entries;
use playlist_fetch::paths::{prepare_output_dir, validate_input_file};
use playlist_fetch::pipeline::{run_batch, BatchConfig, Services, DEFAULT_AUDIO_FORMAT, MAX_WORKERS};
use playlist_fetch::progress::{format_duration, set_log_only};
use playlist_fetch::scheduler::StopFlag;
use playlist_fetch::status::StatusStore;
use playlist_fetch::tagger::LoftyTagWriter;

#[derive(Parser)]
#[command(name = "playlist-fetch")]
#[command(about = "Download audio for an enriched Spotify playlist and tag it in playlist order")]
struct Args {
    /// Enriched playlist JSON (array of {spotify, youtube} objects)
    #[arg(short, long)]
    input: PathBuf,

    /// Target directory for audio files (created if missing)
    #[arg(short, long)]
    output: PathBuf,

    /// Concurrent downloads, 0 = sequential
    #[arg(short, long, default_value = "0", value_parser = clap::value_parser!(u8).range(0..=MAX_WORKERS as i64))]
    threads: u8,

    #[arg(long, default_value = DEFAULT_AUDIO_FORMAT)]
    audio_format: String,

    /// yt-dlp executable used for downloads and lyrics-video search
    #[arg(long, env = "YT_DLP", default_value = "yt-dlp")]
    yt_dlp: PathBuf,

    #[arg(long, default_value = "300")]
    fetch_timeout_secs: u64,

    /// Write per-track results to this SQLite database
    #[arg(long)]
    status_db: Option<PathBuf>,

    /// Hide progress bars and log progress lines instead (tail-friendly)
    #[arg(long)]
    log_only: bool,

    #[arg(long)]
    debug: bool,

    #[arg(short, long)]
    quiet: bool,
}

fn init_logging(args: &Args) {
    let level = if args.debug {
        "debug"
    } else if args.quiet {
        "warn"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

/// First Ctrl-C stops scheduling new tracks; a second one exits at once.
fn install_stop_handler(stop: &StopFlag) -> Result<()> {
    use signal_hook::consts::SIGINT;
    use signal_hook::flag;

    // Registered first, so it sees the flag before the second handler sets it.
    flag::register_conditional_shutdown(SIGINT, 1, stop.handle())
        .context("Failed to install Ctrl-C handler")?;
    flag::register(SIGINT, stop.handle()).context("Failed to install Ctrl-C handler")?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);
    set_log_only(args.log_only);

    validate_input_file(&args.input)?;
    let output_dir = prepare_output_dir(&args.output, &args.input)?;
    let entries = load_entries(&args.input)?;
    info!("Loaded {} tracks from {}", entries.len(), args.input.display());

    let config = BatchConfig {
        output_dir,
        worker_count: args.threads as usize,
        audio_format: args.audio_format.clone(),
    };

    let ytdlp = YtDlp::new(&args.yt_dlp).with_timeout(Duration::from_secs(args.fetch_timeout_secs));
    let artwork = HttpArtwork::new().context("Failed to build HTTP client")?;
    let services = Services {
        fetcher: &ytdlp,
        search: &ytdlp,
        tagger: &LoftyTagWriter,
        artwork: &artwork,
        pause: &ThreadSleep,
    };

    let stop = StopFlag::new();
    install_stop_handler(&stop)?;
    info!("Ctrl-C stops the batch once running downloads finish");

    let report = run_batch(&entries, &config, services, &stop)?;

    if let Some(db) = &args.status_db {
        let mut store = StatusStore::open(db)?;
        store
            .record_batch(&report.reports)
            .context("Failed to write track status")?;
        info!("Wrote {} status rows to {}", report.reports.len(), db.display());
    }

    let tally = report.tally;
    println!("\n{:=<60}", "");
    println!("Batch complete!");
    println!("  Success: {}", tally.success);
    println!("  Failed: {}", tally.failed);
    println!("  Skipped: {}", tally.skipped);
    if tally.metadata_failed > 0 {
        println!("  Metadata Failed: {}", tally.metadata_failed);
    }
    println!("  Time: {}", format_duration(report.elapsed));
    println!("{:=<60}", "");

    if !tally.is_success() {
        warn!("No track was downloaded or skipped successfully");
        std::process::exit(1);
    }
    Ok(())
}
