#![allow(dead_code)]

use async_trait::async_trait;
use forecast_ingest::indexer::{BulkResponse, DocumentStore, IndexOp, ItemFailure, StoreError};
use forecast_ingest::model::RemoteFileEntry;
use forecast_ingest::remote::{Listing, RemoteDirectory, RemoteError};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const HEADER: &str = "PROJECT;MODEL;LOCATION;DATE;TIME;LEADTIME;TTT;TX;TN;Td";

pub fn weather_file(rows: &[&str]) -> Vec<u8> {
    let mut out = String::from(HEADER);
    out.push('\n');
    for row in rows {
        out.push_str(row);
        out.push('\n');
    }
    out.into_bytes()
}

pub fn bz2(data: &[u8]) -> Vec<u8> {
    let mut enc = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Remote directory serving scripted listings and in-memory files.
#[derive(Clone, Default)]
pub struct ScriptedRemote {
    listings: Arc<Mutex<VecDeque<Result<Vec<RemoteFileEntry>, String>>>>,
    last_listing: Arc<Mutex<Vec<RemoteFileEntry>>>,
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    failing_fetches: Arc<Mutex<u32>>,
    fetches: Arc<Mutex<Vec<String>>>,
}

impl ScriptedRemote {
    /// Listings returned by successive `list` calls; the last successful one
    /// repeats once the script runs out.
    pub fn with_listings(listings: Vec<Result<Vec<RemoteFileEntry>, String>>) -> Self {
        Self {
            listings: Arc::new(Mutex::new(VecDeque::from(listings))),
            ..Default::default()
        }
    }

    pub async fn put_file(&self, path: &str, data: Vec<u8>) {
        self.files.lock().await.insert(path.to_string(), data);
    }

    pub async fn fail_fetches(&self, n: u32) {
        *self.failing_fetches.lock().await = n;
    }

    pub async fn fetches(&self) -> Vec<String> {
        self.fetches.lock().await.clone()
    }
}

#[async_trait]
impl RemoteDirectory for ScriptedRemote {
    async fn list(&self, _folder: &str) -> Result<Listing, RemoteError> {
        let next = self.listings.lock().await.pop_front();
        match next {
            Some(Ok(entries)) => {
                *self.last_listing.lock().await = entries.clone();
                Ok(Listing::new(entries))
            }
            Some(Err(msg)) => Err(RemoteError::Io(msg)),
            None => Ok(Listing::new(self.last_listing.lock().await.clone())),
        }
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>, RemoteError> {
        self.fetches.lock().await.push(path.to_string());
        {
            let mut failing = self.failing_fetches.lock().await;
            if *failing > 0 {
                *failing -= 1;
                return Err(RemoteError::Io("connection reset".into()));
            }
        }
        self.files
            .lock()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(path.to_string()))
    }
}

/// Document store that records every bulk call and answers from a script,
/// defaulting to full success.
#[derive(Clone, Default)]
pub struct RecordingStore {
    responses: Arc<Mutex<VecDeque<Result<BulkResponse, StoreError>>>>,
    calls: Arc<Mutex<Vec<Vec<IndexOp>>>>,
    delay: Duration,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl RecordingStore {
    pub fn with_responses(responses: Vec<Result<BulkResponse, StoreError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub async fn calls(&self) -> Vec<Vec<IndexOp>> {
        self.calls.lock().await.clone()
    }

    pub async fn indexed_ids(&self) -> Vec<String> {
        self.calls
            .lock()
            .await
            .iter()
            .flatten()
            .map(|op| op.id.clone())
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for RecordingStore {
    async fn bulk(&self, ops: &[IndexOp]) -> Result<BulkResponse, StoreError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().await.push(ops.to_vec());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let next = self.responses.lock().await.pop_front();
        next.unwrap_or_else(|| Ok(BulkResponse::default()))
    }
}

pub fn item_failure(position: usize, status: u16) -> BulkResponse {
    BulkResponse {
        failures: vec![ItemFailure {
            position,
            status,
            reason: format!("status {}", status),
        }],
    }
}
