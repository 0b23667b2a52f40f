use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::{QueueError, TaskHandler, TaskQueue, PREFETCH};
use crate::config::AmqpConfig;

const PERSISTENT: u8 = 2;

/// RabbitMQ-backed [`TaskQueue`].
///
/// Publishing shares one lazily opened channel that is reopened after any
/// failure. Every consumer registration opens its own connection so that a
/// lost consumer can be re-registered without touching the publisher.
pub struct AmqpQueue {
    config: AmqpConfig,
    publisher: Mutex<Option<Session>>,
}

struct Session {
    _connection: Connection,
    channel: Channel,
}

impl AmqpQueue {
    pub fn from_config(config: &AmqpConfig) -> Self {
        Self {
            config: config.clone(),
            publisher: Mutex::new(None),
        }
    }

    async fn open(&self) -> Result<Session, QueueError> {
        let connection = Connection::connect(&self.config.uri(), ConnectionProperties::default())
            .await
            .map_err(|e| QueueError::Io(format!("failed to connect to broker: {}", e)))?;
        let channel = connection.create_channel().await?;
        for queue in [&self.config.queue, &self.config.dead_letter_queue] {
            channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        exclusive: false,
                        auto_delete: false,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await?;
        }
        info!(server=%self.config.server, queue=%self.config.queue, "connected to broker");
        Ok(Session {
            _connection: connection,
            channel,
        })
    }

    async fn send(&self, queue: &str, token: &str) -> Result<(), QueueError> {
        let mut guard = self.publisher.lock().await;
        let stale = guard
            .as_ref()
            .map_or(true, |s| !s.channel.status().connected());
        if stale {
            *guard = Some(self.open().await?);
        }
        let Some(session) = guard.as_ref() else {
            return Err(QueueError::Closed);
        };
        session
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                token.as_bytes(),
                BasicProperties::default().with_delivery_mode(PERSISTENT),
            )
            .await?
            .await?;
        Ok(())
    }

    async fn publish_to(&self, queue: &str, token: &str) -> Result<(), QueueError> {
        let timeout = self.config.publish_timeout();
        let result = match tokio::time::timeout(timeout, self.send(queue, token)).await {
            Ok(result) => result,
            Err(_) => Err(QueueError::Timeout(timeout)),
        };
        if result.is_err() {
            // force a fresh channel on the next publish
            self.publisher.lock().await.take();
        } else {
            debug!(queue, token, "published");
        }
        result
    }
}

#[async_trait]
impl TaskQueue for AmqpQueue {
    async fn publish(&self, token: &str) -> Result<(), QueueError> {
        self.publish_to(&self.config.queue, token).await
    }

    async fn register_consumer(
        &self,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<JoinHandle<()>, QueueError> {
        let session = self.open().await?;
        session
            .channel
            .basic_qos(PREFETCH, BasicQosOptions::default())
            .await?;
        let tag = format!("worker-{}", Uuid::new_v4());
        let consumer = session
            .channel
            .basic_consume(
                &self.config.queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        info!(queue=%self.config.queue, consumer_tag=%tag, "consumer registered");
        let idle = self.config.idle_timeout();
        Ok(tokio::spawn(consume(session, consumer, handler, idle)))
    }

    async fn dead_letter(&self, token: &str) -> Result<(), QueueError> {
        self.publish_to(&self.config.dead_letter_queue, token).await
    }
}

/// Drive one consumer until its delivery stream ends. The session is owned
/// here so the connection lives exactly as long as the consumer.
async fn consume(
    _session: Session,
    mut consumer: Consumer,
    handler: Arc<dyn TaskHandler>,
    idle: Duration,
) {
    loop {
        let delivery = match tokio::time::timeout(idle, consumer.next()).await {
            Err(_) => {
                debug!(?idle, "no deliveries");
                continue;
            }
            Ok(None) => {
                warn!("delivery stream ended");
                return;
            }
            Ok(Some(Err(err))) => {
                error!(%err, "delivery stream failed");
                return;
            }
            Ok(Some(Ok(delivery))) => delivery,
        };
        if let Err(err) = settle(delivery, handler.as_ref()).await {
            error!(%err, "failed to settle delivery");
            return;
        }
    }
}

#[instrument(skip_all, fields(delivery_tag = delivery.delivery_tag))]
async fn settle(delivery: Delivery, handler: &dyn TaskHandler) -> Result<(), lapin::Error> {
    let token = String::from_utf8_lossy(&delivery.data).into_owned();
    if delivery.redelivered {
        debug!(token=%token, "redelivered");
    }
    if handler.handle(&token).await {
        delivery.ack(BasicAckOptions::default()).await
    } else {
        delivery
            .nack(BasicNackOptions {
                requeue: true,
                ..BasicNackOptions::default()
            })
            .await
    }
}
