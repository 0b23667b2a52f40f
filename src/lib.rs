//! Weather forecast ingestion: an observer that watches a remote folder and
//! queues new file names, and workers that turn queued files into documents
//! in Elasticsearch.

pub mod config;
pub mod db;
pub mod indexer;
pub mod model;
pub mod observer;
pub mod parser;
pub mod queue;
pub mod remote;
pub mod worker;

/// Install the process-wide log subscriber, filtered by `RUST_LOG`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();
}
