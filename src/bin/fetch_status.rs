//! Print the results stored by `playlist-fetch --status-db`.

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;

use playlist_fetch::status::StatusStore;

#[derive(Parser)]
#[command(name = "fetch-status")]
#[command(about = "Show the per-track results of the last playlist-fetch batch")]
struct Args {
    /// Status database written by playlist-fetch
    db: PathBuf,

    /// Also list every track that did not finish with success
    #[arg(long)]
    details: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    if !args.db.exists() {
        bail!("Status database '{}' does not exist", args.db.display());
    }

    let store = StatusStore::open(&args.db)?;
    let tally = store.tally()?;

    println!("{:=<60}", "");
    println!("Tracks: {}", tally.total());
    println!("  Success: {}", tally.success);
    println!("  Failed: {}", tally.failed);
    println!("  Skipped: {}", tally.skipped);
    println!("  Metadata Failed: {}", tally.metadata_failed);
    println!("{:=<60}", "");

    if args.details {
        for row in store.unfinished()? {
            println!(
                "[{}] {} - {}: {}",
                row.original_index,
                row.title,
                row.status,
                row.reason.unwrap_or_default()
            );
            if let Some(path) = row.file_path {
                println!("      {}", path);
            }
        }
    }

    Ok(())
}
