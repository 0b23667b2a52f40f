use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use forecast_ingest::config;
use forecast_ingest::remote::{FtpDirectory, RemoteDirectory};

/// Print the first pages of the remote folder listing.
#[derive(Parser, Debug)]
struct Args {
    /// Path to YAML config
    #[arg(long)]
    config: Option<PathBuf>,

    /// Folder to list; defaults to `ftp.directory`
    #[arg(long)]
    folder: Option<String>,

    /// Number of pages to print
    #[arg(long, default_value_t = 1)]
    pages: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    forecast_ingest::init_tracing();
    let args = Args::parse();

    let cfg = config::load(args.config.as_deref())?;
    let folder = args.folder.unwrap_or_else(|| cfg.ftp.directory.clone());
    let remote = FtpDirectory::from_config(&cfg.ftp);

    let mut listing = remote.list(&folder).await?;
    for page_no in 1..=args.pages {
        let Some(page) = listing.next_page(cfg.observer.page_size) else {
            break;
        };
        println!("Page {}:", page_no);
        for entry in page {
            println!(
                "  {:<40} {:>10} {:>14} {}",
                entry.name,
                entry.size,
                entry.timestamp_ms,
                if entry.is_file { "file" } else { "dir" }
            );
        }
    }
    Ok(())
}
