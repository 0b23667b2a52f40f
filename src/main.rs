use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use forecast_ingest::config::{self, Config, Params};
use forecast_ingest::db;
use forecast_ingest::indexer::{BulkIndexer, ElasticsearchStore};
use forecast_ingest::observer::Observer;
use forecast_ingest::parser::WeatherParser;
use forecast_ingest::queue::AmqpQueue;
use forecast_ingest::remote::FtpDirectory;
use forecast_ingest::worker::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    /// Poll the remote folder and queue new files
    Observer,
    /// Index queued files
    Worker,
}

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    #[arg(value_enum, ignore_case = true)]
    role: Role,

    /// `--key value` pairs, e.g. `--ftpserver host --ftpdirectory /mos`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    params: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    forecast_ingest::init_tracing();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            err.exit()
        }
        Err(err) => {
            eprint!("{}", err);
            std::process::exit(1);
        }
    };
    let params = match Params::from_pairs(&args.params) {
        Ok(params) => params,
        Err(err) => {
            error!(%err, "invalid arguments");
            std::process::exit(1);
        }
    };
    let cfg = config::resolve(&params).context("failed to load configuration")?;

    let (shutdown_tx, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested");
                let _ = shutdown_tx.send(true);
            }
            Err(err) => {
                error!(%err, "cannot listen for ctrl-c");
                // keep the sender alive so nobody mistakes this for a shutdown
                std::future::pending::<()>().await;
            }
        }
    });

    match args.role {
        Role::Observer => run_observer(cfg, shutdown).await,
        Role::Worker => run_worker(cfg, shutdown).await,
    }
}

async fn run_observer(cfg: Config, shutdown: watch::Receiver<bool>) -> Result<()> {
    info!(server=%cfg.ftp.server, folder=%cfg.ftp.directory, "starting observer");
    let remote = Arc::new(FtpDirectory::from_config(&cfg.ftp));
    let queue = Arc::new(AmqpQueue::from_config(&cfg.amqp));
    let mut observer = Observer::new(remote, queue, cfg.ftp.directory.clone(), cfg.observer.clone());
    if let Some(url) = &cfg.observer.state_db {
        let pool = db::init_pool(url)
            .await
            .with_context(|| format!("failed to open state db {}", url))?;
        db::run_migrations(&pool).await?;
        observer = observer.with_checkpoint(pool).await?;
    }
    observer.run(shutdown).await;
    Ok(())
}

async fn run_worker(cfg: Config, shutdown: watch::Receiver<bool>) -> Result<()> {
    info!(server=%cfg.ftp.server, folder=%cfg.ftp.directory, hosts=%cfg.elasticsearch.hosts, "starting worker");
    let remote = Arc::new(FtpDirectory::from_config(&cfg.ftp));
    let queue = Arc::new(AmqpQueue::from_config(&cfg.amqp));
    let store = Arc::new(
        ElasticsearchStore::from_config(&cfg.elasticsearch)
            .context("failed to set up elasticsearch client")?,
    );
    let (indexer, indexer_task) = BulkIndexer::spawn(store, &cfg.indexer);

    let worker = Arc::new(Worker::new(
        remote,
        queue,
        indexer.clone(),
        Arc::new(WeatherParser),
        cfg.ftp.directory.clone(),
        cfg.worker.clone(),
    ));
    worker.run(shutdown).await;

    let report = indexer.close().await?;
    indexer_task.await.context("indexer task failed")?;
    info!(dropped = report.dropped, stats = ?indexer.stats(), "worker shut down");
    Ok(())
}
