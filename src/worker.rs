//! Queue consumer that turns file tokens into indexed documents.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::indexer::{BulkIndexer, StoreError};
use crate::parser::{self, ParseError, RecordParser};
use crate::queue::{TaskHandler, TaskQueue};
use crate::remote::{self, RemoteDirectory, RemoteError};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("decompression task failed: {0}")]
    Join(String),
    #[error("{dropped} documents were not written")]
    Unconfirmed { dropped: u64 },
}

impl ProcessError {
    /// Failures that will repeat no matter how often the file is retried.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ProcessError::Remote(RemoteError::Decode(_))
                | ProcessError::Parse(_)
                | ProcessError::Store(StoreError::InvalidDocument(_))
        )
    }
}

pub struct Worker {
    remote: Arc<dyn RemoteDirectory>,
    queue: Arc<dyn TaskQueue>,
    indexer: BulkIndexer,
    parser: Arc<dyn RecordParser>,
    folder: String,
    config: WorkerConfig,
    failures: Mutex<FailureLog>,
}

/// Tokens not seen failing for this long are forgotten; another worker has
/// most likely handled them.
const FAILURE_TTL: Duration = Duration::from_secs(6 * 60 * 60);
const MAX_TRACKED_FAILURES: usize = 10_000;

/// Permanent failures per token seen by this process, bounded in age and
/// count.
#[derive(Debug)]
struct FailureLog {
    entries: HashMap<String, (u32, Instant)>,
    ttl: Duration,
    capacity: usize,
}

impl FailureLog {
    fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    fn bump(&mut self, token: &str, now: Instant) -> u32 {
        let ttl = self.ttl;
        self.entries
            .retain(|_, (_, last)| now.saturating_duration_since(*last) < ttl);
        if !self.entries.contains_key(token) && self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, (_, last))| *last)
                .map(|(name, _)| name.clone());
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
        }
        let entry = self.entries.entry(token.to_string()).or_insert((0, now));
        entry.0 += 1;
        entry.1 = now;
        entry.0
    }

    fn forget(&mut self, token: &str) {
        self.entries.remove(token);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Worker {
    pub fn new(
        remote: Arc<dyn RemoteDirectory>,
        queue: Arc<dyn TaskQueue>,
        indexer: BulkIndexer,
        parser: Arc<dyn RecordParser>,
        folder: impl Into<String>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            remote,
            queue,
            indexer,
            parser,
            folder: folder.into(),
            config,
            failures: Mutex::new(FailureLog::new(FAILURE_TTL, MAX_TRACKED_FAILURES)),
        }
    }

    /// Fetch, decompress and parse one file, feeding its documents to the
    /// indexer in row order. Returns the number of documents produced.
    pub async fn process(&self, token: &str) -> Result<usize, ProcessError> {
        let path = remote::remote_path(&self.folder, token);
        let compressed = self.remote.fetch(&path).await?;
        let raw = tokio::task::spawn_blocking(move || remote::decompress_bz2(&compressed))
            .await
            .map_err(|e| ProcessError::Join(e.to_string()))??;

        let mut count = 0usize;
        for doc in parser::documents(&raw, self.parser.as_ref()) {
            self.indexer.add(&doc?).await?;
            count += 1;
        }

        if self.config.confirm_writes {
            let report = self.indexer.flush().await?;
            if report.dropped > 0 {
                return Err(ProcessError::Unconfirmed {
                    dropped: report.dropped,
                });
            }
        }
        Ok(count)
    }

    /// Register with the queue and keep a consumer alive until `shutdown`
    /// flips to true. Failed registrations are retried every
    /// `register_retry_ms`; a consumer whose stream ends is registered again.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let retry = Duration::from_millis(self.config.register_retry_ms);
        while !*shutdown.borrow() {
            let handler: Arc<dyn TaskHandler> = Arc::clone(&self) as Arc<dyn TaskHandler>;
            let mut consumer = match self.queue.register_consumer(handler).await {
                Ok(consumer) => consumer,
                Err(err) => {
                    warn!(%err, ?retry, "queue registration failed; retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(retry) => continue,
                        _ = shutdown.changed() => break,
                    }
                }
            };
            info!(folder=%self.folder, "worker registered");
            tokio::select! {
                ended = &mut consumer => {
                    if let Err(err) = ended {
                        error!(%err, "consumer task failed");
                    }
                    warn!("consumer stopped; registering again");
                }
                _ = shutdown.changed() => {
                    consumer.abort();
                    break;
                }
            }
        }
        info!("worker stopped");
    }

    /// Count a permanent failure; once `max_deliveries` is reached the token
    /// is moved to the dead-letter queue and acknowledged.
    async fn settle_permanent(&self, token: &str, err: &ProcessError) -> bool {
        let Some(max) = self.config.max_deliveries else {
            warn!(token, %err, "file cannot be processed; requeueing");
            return false;
        };
        let attempts = self.bump_failures(token);
        if attempts < max {
            warn!(token, attempt = attempts, %err, "file cannot be processed; requeueing");
            return false;
        }
        match self.queue.dead_letter(token).await {
            Ok(()) => {
                error!(token, attempts, %err, "file moved to dead-letter queue");
                self.forget(token);
                true
            }
            Err(queue_err) => {
                error!(token, %queue_err, "dead-lettering failed; requeueing");
                false
            }
        }
    }

    fn bump_failures(&self, token: &str) -> u32 {
        match self.failures.lock() {
            Ok(mut failures) => failures.bump(token, Instant::now()),
            Err(_) => 1,
        }
    }

    fn forget(&self, token: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.forget(token);
        }
    }
}

#[async_trait::async_trait]
impl TaskHandler for Worker {
    #[instrument(skip_all, fields(token = %token, execution_id = %Uuid::new_v4()))]
    async fn handle(&self, token: &str) -> bool {
        match self.process(token).await {
            Ok(documents) => {
                info!(documents, "file indexed");
                self.forget(token);
                true
            }
            Err(err) if err.is_permanent() => self.settle_permanent(token, &err).await,
            Err(err) => {
                warn!(%err, "processing failed; requeueing");
                false
            }
        }
    }
}
