//! Change detection over a polled remote folder.
//!
//! Each tick lists the folder and publishes every file that is newer than
//! the cursor (minus a grace window for coarse server clocks) and has not
//! been published before. Names are remembered per timestamp; timestamps
//! that fall out of the window are forgotten so memory stays bounded by the
//! files inside `[cursor_ts - grace, now]`.

use anyhow::Result;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ObserverConfig;
use crate::db::{self, Pool};
use crate::model::{FileToken, RemoteFileEntry};
use crate::queue::TaskQueue;
use crate::remote::{RemoteDirectory, RemoteError};

/// Cursor and dedup set owned by the observer task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObserverState {
    cursor_ts: i64,
    seen: BTreeMap<i64, HashSet<FileToken>>,
}

impl ObserverState {
    pub fn new(seed_ts: i64) -> Self {
        Self {
            cursor_ts: seed_ts,
            seen: BTreeMap::new(),
        }
    }

    pub fn from_parts(cursor_ts: i64, seen: BTreeMap<i64, HashSet<FileToken>>) -> Self {
        Self { cursor_ts, seen }
    }

    pub fn cursor_ts(&self) -> i64 {
        self.cursor_ts
    }

    pub fn seen(&self) -> &BTreeMap<i64, HashSet<FileToken>> {
        &self.seen
    }

    /// Total number of remembered names.
    pub fn seen_len(&self) -> usize {
        self.seen.values().map(HashSet::len).sum()
    }

    pub fn contains(&self, ts: i64, name: &str) -> bool {
        self.seen.get(&ts).is_some_and(|names| names.contains(name))
    }

    /// Files newer than `cursor_ts - grace_ms` are candidates for publishing.
    pub fn is_candidate(&self, entry: &RemoteFileEntry, grace_ms: i64) -> bool {
        entry.is_file && entry.timestamp_ms > self.cursor_ts.saturating_sub(grace_ms)
    }

    /// Remember a published name. Returns false if it was already known.
    pub fn record(&mut self, ts: i64, name: FileToken) -> bool {
        self.seen.entry(ts).or_default().insert(name)
    }

    /// Move the cursor forward to `max_ts`; it never moves back.
    pub fn advance(&mut self, max_ts: Option<i64>) -> bool {
        match max_ts {
            Some(ts) if ts > self.cursor_ts => {
                self.cursor_ts = ts;
                true
            }
            _ => false,
        }
    }

    /// Forget every timestamp below `cursor_ts - grace_ms`. Those entries can
    /// no longer be candidates, so nothing is ever published twice.
    pub fn compact(&mut self, grace_ms: i64) -> usize {
        let horizon = self.cursor_ts.saturating_sub(grace_ms);
        let before = self.seen_len();
        self.seen = self.seen.split_off(&horizon);
        before - self.seen_len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverStatus {
    Running,
    /// The last listing failed; the next successful tick resumes.
    PausedTransientError,
}

/// Result of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub listed: usize,
    pub published: usize,
    pub failed: usize,
    pub cursor_ts: i64,
}

pub struct Observer {
    remote: Arc<dyn RemoteDirectory>,
    queue: Arc<dyn TaskQueue>,
    folder: String,
    config: ObserverConfig,
    state: ObserverState,
    status: ObserverStatus,
    checkpoint: Option<Pool>,
}

impl Observer {
    pub fn new(
        remote: Arc<dyn RemoteDirectory>,
        queue: Arc<dyn TaskQueue>,
        folder: impl Into<String>,
        config: ObserverConfig,
    ) -> Self {
        let state = ObserverState::new(config.start_timestamp_ms);
        Self {
            remote,
            queue,
            folder: folder.into(),
            config,
            state,
            status: ObserverStatus::Running,
            checkpoint: None,
        }
    }

    /// Persist state to `pool` after every tick that changes it, starting
    /// from whatever was stored for this folder. The stored cursor only
    /// wins over the configured seed when it is newer.
    pub async fn with_checkpoint(mut self, pool: Pool) -> Result<Self> {
        if let Some(stored) = db::load_checkpoint(&pool, &self.folder).await? {
            let cursor = stored.cursor_ts().max(self.config.start_timestamp_ms);
            let mut state = ObserverState::from_parts(cursor, stored.seen().clone());
            state.compact(self.config.grace_ms);
            info!(folder=%self.folder, cursor_ts = cursor, seen = state.seen_len(), "restored observer checkpoint");
            self.state = state;
        }
        self.checkpoint = Some(pool);
        Ok(self)
    }

    pub fn state(&self) -> &ObserverState {
        &self.state
    }

    pub fn status(&self) -> ObserverStatus {
        self.status
    }

    /// List the folder once and publish everything new.
    #[instrument(skip_all, fields(folder = %self.folder, cursor_ts = self.state.cursor_ts))]
    pub async fn tick(&mut self) -> Result<TickReport, RemoteError> {
        let mut listing = match self.remote.list(&self.folder).await {
            Ok(listing) => listing,
            Err(err) => {
                self.set_status(ObserverStatus::PausedTransientError);
                return Err(err);
            }
        };
        self.set_status(ObserverStatus::Running);

        let grace = self.config.grace_ms;
        let mut report = TickReport::default();
        let mut max_ts: Option<i64> = None;
        while let Some(page) = listing.next_page(self.config.page_size) {
            report.listed += page.len();
            for entry in page {
                if !self.state.is_candidate(&entry, grace)
                    || self.state.contains(entry.timestamp_ms, &entry.name)
                {
                    continue;
                }
                if self.publish(&entry.name).await {
                    self.state.record(entry.timestamp_ms, entry.name);
                    max_ts = max_ts.max(Some(entry.timestamp_ms));
                    report.published += 1;
                } else {
                    report.failed += 1;
                }
            }
        }

        let advanced = self.state.advance(max_ts);
        if advanced {
            debug!(cursor_ts = self.state.cursor_ts(), "cursor advanced");
        }
        let forgotten = self.state.compact(grace);
        report.cursor_ts = self.state.cursor_ts();

        if report.published > 0 || advanced || forgotten > 0 {
            self.save_checkpoint().await;
        }
        Ok(report)
    }

    /// Poll every `period_ms` until `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_millis(self.config.period_ms);
        info!(folder=%self.folder, ?period, cursor_ts = self.state.cursor_ts(), "observer started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.tick().await {
                Ok(report) if report.published > 0 || report.failed > 0 => {
                    info!(
                        published = report.published,
                        failed = report.failed,
                        cursor_ts = report.cursor_ts,
                        "observer tick"
                    );
                }
                Ok(_) => {}
                Err(err) => warn!(%err, "listing failed; retrying next tick"),
            }
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(folder=%self.folder, cursor_ts = self.state.cursor_ts(), "observer stopped");
    }

    async fn publish(&self, token: &str) -> bool {
        let attempts = self.config.publish_retries.max(1);
        for attempt in 1..=attempts {
            match self.queue.publish(token).await {
                Ok(()) => {
                    info!(token, "published new file");
                    return true;
                }
                Err(err) => warn!(token, attempt, %err, "publish failed"),
            }
        }
        error!(token, attempts, "could not publish; will retry next tick");
        false
    }

    async fn save_checkpoint(&self) {
        let Some(pool) = &self.checkpoint else {
            return;
        };
        if let Err(err) = db::save_checkpoint(pool, &self.folder, &self.state).await {
            error!(?err, "failed to save observer checkpoint");
        }
    }

    fn set_status(&mut self, status: ObserverStatus) {
        if self.status != status {
            info!(from = ?self.status, to = ?status, "observer status changed");
            self.status = status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRACE: i64 = 5 * 60 * 1_000;

    #[test]
    fn candidates_respect_grace_window() {
        let state = ObserverState::new(1_000_000);
        assert!(state.is_candidate(&RemoteFileEntry::file("a", 1, 1_000_001), GRACE));
        assert!(state.is_candidate(&RemoteFileEntry::file("a", 1, 1_000_000 - GRACE + 1), GRACE));
        assert!(!state.is_candidate(&RemoteFileEntry::file("a", 1, 1_000_000 - GRACE), GRACE));
        assert!(!state.is_candidate(&RemoteFileEntry::directory("d", 2_000_000), GRACE));
    }

    #[test]
    fn cursor_only_moves_forward() {
        let mut state = ObserverState::new(500);
        assert!(!state.advance(None));
        assert!(!state.advance(Some(400)));
        assert!(state.advance(Some(900)));
        assert_eq!(state.cursor_ts(), 900);
    }

    #[test]
    fn compaction_drops_keys_below_window() {
        let mut state = ObserverState::new(0);
        state.record(1_000, "old".into());
        state.record(GRACE + 2_000, "recent".into());
        state.record(GRACE + 5_000, "newest".into());
        state.advance(Some(GRACE + 5_000));
        assert_eq!(state.compact(GRACE), 1);
        assert!(!state.contains(1_000, "old"));
        assert!(state.contains(GRACE + 2_000, "recent"));
        assert!(state.seen().keys().all(|k| *k >= state.cursor_ts() - GRACE));

        // without a grace window nothing below the cursor is kept
        assert_eq!(state.compact(0), 1);
        assert!(state.seen().keys().all(|k| *k >= state.cursor_ts()));
        assert_eq!(state.seen_len(), 1);
    }

    #[test]
    fn record_reports_duplicates() {
        let mut state = ObserverState::new(0);
        assert!(state.record(10, "a".into()));
        assert!(!state.record(10, "a".into()));
        assert!(state.record(11, "a".into()));
        assert_eq!(state.seen_len(), 2);
    }
}
