use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use forecast_ingest::parser::{self, WeatherParser};
use forecast_ingest::remote::decompress_bz2;

/// Parse a local weather file and print its documents as JSON lines.
#[derive(Parser, Debug)]
struct Args {
    /// `.csv` or `.bz2` file
    path: PathBuf,

    /// Only print the final count
    #[arg(long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    forecast_ingest::init_tracing();
    let args = Args::parse();

    let bytes = fs::read(&args.path)
        .with_context(|| format!("failed to read {}", args.path.display()))?;
    let raw = if args.path.extension().is_some_and(|ext| ext == "bz2") {
        decompress_bz2(&bytes)?
    } else {
        bytes
    };

    let mut docs = parser::documents(&raw, &WeatherParser);
    let mut count = 0usize;
    for doc in docs.by_ref() {
        let doc = doc?;
        if !args.quiet {
            println!(
                "{} {}/{} {}",
                doc.id,
                doc.index,
                doc.doc_type,
                doc.source_json()?
            );
        }
        count += 1;
    }
    println!("{} documents from {} rows", count, docs.rows_read());
    Ok(())
}
