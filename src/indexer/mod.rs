//! Bulk indexer.
//!
//! Documents are sent through a channel to a single task that owns the
//! pending batch. The batch is dispatched to the [`DocumentStore`] when it
//! reaches `bulk_actions` operations or `bulk_size_bytes` bytes, when
//! `flush_interval_ms` has passed since its first operation, or on an
//! explicit [`BulkIndexer::flush`]. At most `concurrent_requests` batches are
//! in flight; item failures the store reports as retryable are re-sent with
//! exponential backoff and everything else is dropped with a log line naming
//! the document.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::IndexerConfig;
use crate::model::IndexableDoc;

pub mod elasticsearch;

pub use elasticsearch::ElasticsearchStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store transport failed: {0}")]
    Transport(String),
    #[error("store answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("document is not addressable: {0}")]
    InvalidDocument(String),
    #[error("unreadable store response: {0}")]
    Response(String),
    #[error("indexer is closed")]
    Closed,
}

impl StoreError {
    /// Whether a whole-request failure is worth sending again.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Transport(_) => true,
            StoreError::Status { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }
}

pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || status >= 500
}

/// One `index` action: the document source already rendered to JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexOp {
    pub index: String,
    pub doc_type: String,
    pub id: String,
    pub source: String,
}

impl IndexOp {
    pub fn from_doc(doc: &IndexableDoc) -> Result<Self, StoreError> {
        if !doc.is_addressable() {
            return Err(StoreError::InvalidDocument(format!(
                "{}/{}/{}",
                doc.index, doc.doc_type, doc.id
            )));
        }
        let source = doc
            .source_json()
            .map_err(|e| StoreError::InvalidDocument(e.to_string()))?;
        Ok(Self {
            index: doc.index.clone(),
            doc_type: doc.doc_type.clone(),
            id: doc.id.clone(),
            source,
        })
    }

    /// Approximate bytes this op adds to a bulk request body.
    pub fn size_bytes(&self) -> usize {
        self.source.len() + self.index.len() + self.doc_type.len() + self.id.len() + 48
    }
}

/// Failure of a single item inside an otherwise answered bulk request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    /// Position of the op in the request.
    pub position: usize,
    pub status: u16,
    pub reason: String,
}

impl ItemFailure {
    pub fn is_retryable(&self) -> bool {
        is_retryable_status(self.status)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkResponse {
    pub failures: Vec<ItemFailure>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn bulk(&self, ops: &[IndexOp]) -> Result<BulkResponse, StoreError>;
}

/// Exponential backoff: `initial`, then doubling, `retries` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub retries: u32,
}

impl Backoff {
    pub fn from_config(config: &IndexerConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.backoff_initial_ms),
            retries: config.backoff_retries,
        }
    }

    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let initial = self.initial;
        (0..self.retries).map(move |i| initial.saturating_mul(1u32 << i.min(16)))
    }
}

/// Runtime counters of the indexer.
#[derive(Debug, Default)]
pub struct IndexerStats {
    batches: AtomicU64,
    indexed: AtomicU64,
    dropped: AtomicU64,
    retried: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub batches: u64,
    pub indexed: u64,
    pub dropped: u64,
    pub retried: u64,
}

impl IndexerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            indexed: self.indexed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of an explicit flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Ops dropped since the previous explicit flush.
    pub dropped: u64,
}

enum Command {
    Add(IndexOp),
    Flush(oneshot::Sender<FlushReport>),
    Close(oneshot::Sender<FlushReport>),
}

/// Cloneable handle to the indexer task.
#[derive(Clone)]
pub struct BulkIndexer {
    tx: mpsc::Sender<Command>,
    stats: Arc<IndexerStats>,
}

impl BulkIndexer {
    /// Start the indexer task.
    pub fn spawn(store: Arc<dyn DocumentStore>, config: &IndexerConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let stats = Arc::new(IndexerStats::default());
        let task = IndexerTask {
            store,
            max_actions: config.bulk_actions.max(1),
            max_bytes: config.bulk_size_bytes.max(1),
            interval: Duration::from_millis(config.flush_interval_ms),
            concurrency: config.concurrent_requests.max(1),
            permits: Arc::new(Semaphore::new(config.concurrent_requests.max(1))),
            backoff: Backoff::from_config(config),
            stats: Arc::clone(&stats),
            unreported: Arc::new(AtomicU64::new(0)),
            batch: Batch::default(),
        };
        let handle = tokio::spawn(task.run(rx));
        (Self { tx, stats }, handle)
    }

    /// Queue `doc` for indexing.
    pub async fn add(&self, doc: &IndexableDoc) -> Result<(), StoreError> {
        let op = IndexOp::from_doc(doc)?;
        self.tx
            .send(Command::Add(op))
            .await
            .map_err(|_| StoreError::Closed)
    }

    /// Dispatch the pending batch and wait for every in-flight request.
    pub async fn flush(&self) -> Result<FlushReport, StoreError> {
        self.request(Command::Flush).await
    }

    /// Final flush; later calls on any handle fail with [`StoreError::Closed`].
    pub async fn close(&self) -> Result<FlushReport, StoreError> {
        self.request(Command::Close).await
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    async fn request(
        &self,
        command: fn(oneshot::Sender<FlushReport>) -> Command,
    ) -> Result<FlushReport, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)
    }
}

#[derive(Default)]
struct Batch {
    ops: Vec<IndexOp>,
    bytes: usize,
    started: Option<Instant>,
}

impl Batch {
    fn push(&mut self, op: IndexOp) {
        if self.ops.is_empty() {
            self.started = Some(Instant::now());
        }
        self.bytes += op.size_bytes();
        self.ops.push(op);
    }

    fn take(&mut self) -> Vec<IndexOp> {
        self.bytes = 0;
        self.started = None;
        std::mem::take(&mut self.ops)
    }
}

struct IndexerTask {
    store: Arc<dyn DocumentStore>,
    max_actions: usize,
    max_bytes: usize,
    interval: Duration,
    concurrency: usize,
    permits: Arc<Semaphore>,
    backoff: Backoff,
    stats: Arc<IndexerStats>,
    /// Drops not yet reported by an explicit flush.
    unreported: Arc<AtomicU64>,
    batch: Batch,
}

impl IndexerTask {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        loop {
            let deadline = self.batch.started.map(|t| t + self.interval);
            let command = tokio::select! {
                command = rx.recv() => command,
                _ = wait_until(deadline) => {
                    debug!(ops = self.batch.ops.len(), "flush interval elapsed");
                    self.dispatch().await;
                    continue;
                }
            };
            match command {
                Some(Command::Add(op)) => {
                    self.batch.push(op);
                    if self.batch.ops.len() >= self.max_actions || self.batch.bytes >= self.max_bytes {
                        self.dispatch().await;
                    }
                }
                Some(Command::Flush(reply)) => {
                    let report = self.barrier().await;
                    let _ = reply.send(report);
                }
                Some(Command::Close(reply)) => {
                    let report = self.barrier().await;
                    info!(stats = ?self.stats.snapshot(), "indexer closed");
                    let _ = reply.send(report);
                    return;
                }
                None => {
                    self.barrier().await;
                    return;
                }
            }
        }
    }

    /// Hand the pending batch to a request task once a slot is free.
    async fn dispatch(&mut self) {
        if self.batch.ops.is_empty() {
            return;
        }
        let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
            return;
        };
        let ops = self.batch.take();
        let store = Arc::clone(&self.store);
        let backoff = self.backoff;
        let stats = Arc::clone(&self.stats);
        let unreported = Arc::clone(&self.unreported);
        tokio::spawn(async move {
            let dropped = send_batch(store.as_ref(), ops, backoff, &stats).await;
            if dropped > 0 {
                unreported.fetch_add(dropped, Ordering::SeqCst);
            }
            drop(permit);
        });
    }

    async fn barrier(&mut self) -> FlushReport {
        self.dispatch().await;
        // every permit back means nothing is in flight
        if let Ok(all) = self.permits.acquire_many(self.concurrency as u32).await {
            drop(all);
        }
        FlushReport {
            dropped: self.unreported.swap(0, Ordering::SeqCst),
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Send one batch, retrying retryable failures. Returns the number of ops
/// that were dropped.
async fn send_batch(
    store: &dyn DocumentStore,
    mut ops: Vec<IndexOp>,
    backoff: Backoff,
    stats: &IndexerStats,
) -> u64 {
    stats.batches.fetch_add(1, Ordering::Relaxed);
    let mut delays = backoff.delays();
    let mut dropped = 0u64;
    loop {
        let (retry, last_error) = match store.bulk(&ops).await {
            Ok(response) => {
                let mut retry = Vec::new();
                let mut failed = vec![false; ops.len()];
                let mut last_error = String::new();
                for failure in response.failures {
                    let Some(op) = ops.get(failure.position) else {
                        warn!(position = failure.position, "store reported unknown item");
                        continue;
                    };
                    failed[failure.position] = true;
                    if failure.is_retryable() {
                        last_error = format!("{}: {}", failure.status, failure.reason);
                        retry.push(op.clone());
                    } else {
                        drop_op(op, &format!("{}: {}", failure.status, failure.reason));
                        dropped += 1;
                    }
                }
                let ok = failed.iter().filter(|f| !**f).count() as u64;
                stats.indexed.fetch_add(ok, Ordering::Relaxed);
                (retry, last_error)
            }
            Err(err) if err.is_retryable() => {
                let reason = err.to_string();
                (ops, reason)
            }
            Err(err) => {
                let reason = err.to_string();
                for op in &ops {
                    drop_op(op, &reason);
                }
                dropped += ops.len() as u64;
                stats.dropped.fetch_add(dropped, Ordering::Relaxed);
                return dropped;
            }
        };

        if retry.is_empty() {
            stats.dropped.fetch_add(dropped, Ordering::Relaxed);
            return dropped;
        }
        match delays.next() {
            Some(delay) => {
                warn!(ops = retry.len(), ?delay, error=%last_error, "bulk items failed; retrying");
                stats.retried.fetch_add(retry.len() as u64, Ordering::Relaxed);
                tokio::time::sleep(delay).await;
                ops = retry;
            }
            None => {
                let reason = format!("retries exhausted: {}", last_error);
                for op in &retry {
                    drop_op(op, &reason);
                }
                dropped += retry.len() as u64;
                stats.dropped.fetch_add(dropped, Ordering::Relaxed);
                return dropped;
            }
        }
    }
}

fn drop_op(op: &IndexOp, reason: &str) {
    error!(index=%op.index, doc_type=%op.doc_type, id=%op.id, reason, "dropping index operation");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_initial() {
        let backoff = Backoff {
            initial: Duration::from_millis(100),
            retries: 3,
        };
        let delays: Vec<_> = backoff.delays().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(409));
        assert!(StoreError::Transport("reset".into()).is_retryable());
        assert!(!StoreError::InvalidDocument("x".into()).is_retryable());
    }

    #[test]
    fn op_requires_addressable_doc() {
        let doc = IndexableDoc::new("weather", "", "1");
        assert!(matches!(
            IndexOp::from_doc(&doc),
            Err(StoreError::InvalidDocument(_))
        ));

        let mut doc = IndexableDoc::new("weather", "forecast", "62830|1");
        doc.add("tx", 95);
        let op = IndexOp::from_doc(&doc).unwrap();
        assert_eq!(op.source, r#"{"tx":95}"#);
        assert!(op.size_bytes() > op.source.len());
    }
}
