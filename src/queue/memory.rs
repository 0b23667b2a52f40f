use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{QueueError, TaskHandler, TaskQueue};
use crate::model::FileToken;

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub token: FileToken,
    pub acked: bool,
}

#[derive(Debug, Default)]
struct State {
    pending: VecDeque<FileToken>,
    published: Vec<FileToken>,
    deliveries: Vec<DeliveryRecord>,
    dead: Vec<FileToken>,
    failing_publishes: u32,
    failing_registrations: u32,
    registrations: u32,
    /// Bumped to end every running consumer.
    generation: u64,
    closed: bool,
}

/// In-process [`TaskQueue`] with the same at-least-once contract as the
/// broker: a rejected token goes back to the head of the queue and is
/// delivered again. Everything that passes through is recorded.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    state: Arc<Mutex<State>>,
    ready: Arc<Notify>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` publishes fail with an I/O error.
    pub async fn fail_publishes(&self, n: u32) {
        self.state.lock().await.failing_publishes = n;
    }

    /// Make the next `n` consumer registrations fail with an I/O error.
    pub async fn fail_registrations(&self, n: u32) {
        self.state.lock().await.failing_registrations = n;
    }

    /// Stop every consumer. Pending tokens stay where they are.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.ready.notify_waiters();
        self.ready.notify_one();
    }

    /// End the running consumers as a dropped broker connection would,
    /// leaving the queue open for new registrations.
    pub async fn disconnect_consumers(&self) {
        self.state.lock().await.generation += 1;
        self.ready.notify_waiters();
    }

    pub async fn published(&self) -> Vec<String> {
        self.state.lock().await.published.clone()
    }

    pub async fn pending(&self) -> Vec<String> {
        self.state.lock().await.pending.iter().cloned().collect()
    }

    pub async fn deliveries(&self) -> Vec<DeliveryRecord> {
        self.state.lock().await.deliveries.clone()
    }

    pub async fn dead_letters(&self) -> Vec<String> {
        self.state.lock().await.dead.clone()
    }

    pub async fn registrations(&self) -> u32 {
        self.state.lock().await.registrations
    }

    async fn next(&self, generation: u64) -> Option<String> {
        loop {
            let notified = self.ready.notified();
            {
                let mut state = self.state.lock().await;
                if state.closed || state.generation != generation {
                    return None;
                }
                if let Some(token) = state.pending.pop_front() {
                    return Some(token);
                }
            }
            notified.await;
        }
    }

    async fn settle(&self, token: String, acked: bool) {
        let mut state = self.state.lock().await;
        state.deliveries.push(DeliveryRecord {
            token: token.clone(),
            acked,
        });
        if !acked {
            state.pending.push_front(token);
            drop(state);
            self.ready.notify_one();
        }
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn publish(&self, token: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(QueueError::Closed);
        }
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(QueueError::Io("injected publish failure".into()));
        }
        state.published.push(token.to_string());
        state.pending.push_back(token.to_string());
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    async fn register_consumer(
        &self,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<JoinHandle<()>, QueueError> {
        let generation = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(QueueError::Closed);
            }
            if state.failing_registrations > 0 {
                state.failing_registrations -= 1;
                return Err(QueueError::Io("injected registration failure".into()));
            }
            state.registrations += 1;
            state.generation
        };
        let queue = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(token) = queue.next(generation).await {
                let acked = handler.handle(&token).await;
                debug!(token=%token, acked, "settled");
                queue.settle(token, acked).await;
            }
        }))
    }

    async fn dead_letter(&self, token: &str) -> Result<(), QueueError> {
        self.state.lock().await.dead.push(token.to_string());
        Ok(())
    }
}
