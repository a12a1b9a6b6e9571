// src/services/event_bus.rs
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing;

use crate::errors::{DispatchError, DispatchResult};

pub const EXCHANGE_RIDE_TOPIC: &str = "ride_topic";
pub const EXCHANGE_DRIVER_TOPIC: &str = "driver_topic";
pub const EXCHANGE_LOCATION_FANOUT: &str = "location_fanout";

pub const QUEUE_RIDE_REQUESTS: &str = "ride_requests";
pub const QUEUE_RIDE_STATUS: &str = "ride_status";
pub const QUEUE_DRIVER_MATCHING: &str = "driver_matching";
pub const QUEUE_DRIVER_RESPONSES: &str = "driver_responses";
pub const QUEUE_DRIVER_STATUS: &str = "driver_status";
pub const QUEUE_LOCATION_UPDATES: &str = "location_updates_ride";

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(3);
const RECONNECT_INITIAL: Duration = Duration::from_secs(2);
const RECONNECT_MAX: Duration = Duration::from_secs(30);
const REPLAY_INTERVAL: Duration = Duration::from_secs(5);

/// The publishing seam services depend on; `EventBus` is the broker-backed
/// implementation.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: serde_json::Value,
    ) -> DispatchResult<()>;

    fn is_alive(&self) -> bool;
}

/// Handles deliveries from one consumed queue.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, routing_key: &str, payload: &[u8]) -> DispatchResult<()>;
}

/// Cancellation handle for a running consumer task.
pub struct ConsumerHandle {
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn cancel(self) {
        self.task.abort();
    }
}

struct PendingPublish {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
}

/// Thin facade over the AMQP broker: idempotent topology, persistent JSON
/// messages, reconnect with capped exponential backoff, and a replay buffer
/// so committed state changes never silently lose their event.
pub struct EventBus {
    uri: String,
    conn: RwLock<Option<Connection>>,
    replay: Mutex<Vec<PendingPublish>>,
    alive: AtomicBool,
}

impl EventBus {
    /// Connect to the broker. A connection failure leaves the bus in
    /// degraded mode; consumers and the replayer keep retrying.
    pub async fn connect(uri: &str) -> Arc<Self> {
        let bus = Arc::new(Self {
            uri: uri.to_string(),
            conn: RwLock::new(None),
            replay: Mutex::new(Vec::new()),
            alive: AtomicBool::new(false),
        });

        match bus.try_connect().await {
            Ok(()) => tracing::info!("connected to message broker"),
            Err(err) => {
                tracing::warn!("broker unreachable at startup, running degraded: {}", err)
            }
        }

        bus
    }

    async fn try_connect(&self) -> DispatchResult<()> {
        let connection =
            Connection::connect(&self.uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        ensure_topology(&channel).await?;
        *self.conn.write().await = Some(connection);
        self.alive.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn channel(&self) -> DispatchResult<Channel> {
        {
            let guard = self.conn.read().await;
            if let Some(conn) = guard.as_ref() {
                if conn.status().connected() {
                    return Ok(conn.create_channel().await?);
                }
            }
        }
        self.alive.store(false, Ordering::SeqCst);
        self.try_connect().await?;
        let guard = self.conn.read().await;
        let conn = guard.as_ref().ok_or(DispatchError::BrokerUnavailable)?;
        Ok(conn.create_channel().await?)
    }

    async fn publish_raw(&self, exchange: &str, routing_key: &str, body: &[u8]) -> DispatchResult<()> {
        let channel = self.channel().await?;
        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2), // persistent
            )
            .await?
            .await?;
        Ok(())
    }

    /// Start a consumer task for a queue bound to an exchange. Each delivery
    /// is acked after the handler returns, so processing is at-least-once.
    pub fn consume(
        self: &Arc<Self>,
        queue: &'static str,
        handler: Arc<dyn MessageHandler>,
    ) -> ConsumerHandle {
        let bus = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut backoff = RECONNECT_INITIAL;
            loop {
                match bus.run_consumer(queue, handler.as_ref()).await {
                    Ok(()) => {
                        // Stream ended: the connection dropped.
                        tracing::warn!(queue, "consumer stream ended, reconnecting");
                    }
                    Err(err) => {
                        tracing::warn!(queue, "consumer error: {}, reconnecting", err);
                    }
                }
                bus.alive.store(false, Ordering::SeqCst);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RECONNECT_MAX);
            }
        });
        ConsumerHandle { task }
    }

    async fn run_consumer(&self, queue: &str, handler: &dyn MessageHandler) -> DispatchResult<()> {
        let channel = self.channel().await?;
        let mut consumer = channel
            .basic_consume(
                queue,
                "sparrow_dispatch",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        self.alive.store(true, Ordering::SeqCst);
        tracing::info!(queue, "consuming");

        while let Some(delivery) = consumer.next().await {
            let delivery = delivery?;
            if let Err(err) = handler
                .handle(delivery.routing_key.as_str(), &delivery.data)
                .await
            {
                // Consumers are idempotent on (ride_id, status); dropping a
                // poison message beats redelivering it forever.
                tracing::error!(queue, "handler failed, dropping message: {}", err);
            }
            delivery.ack(BasicAckOptions::default()).await?;
        }
        Ok(())
    }

    /// Background task that retries failed publishes once the broker is back.
    pub fn spawn_replayer(self: &Arc<Self>) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(REPLAY_INTERVAL).await;
                let pending = {
                    let mut replay = bus.replay.lock().await;
                    if replay.is_empty() {
                        continue;
                    }
                    std::mem::take(&mut *replay)
                };
                let total = pending.len();
                let mut requeue = Vec::new();
                let mut iter = pending.into_iter();
                for item in iter.by_ref() {
                    match bus.publish_raw(&item.exchange, &item.routing_key, &item.body).await {
                        Ok(()) => {}
                        Err(err) => {
                            tracing::warn!("replay publish failed, keeping {} queued: {}", total, err);
                            requeue.push(item);
                            break;
                        }
                    }
                }
                requeue.extend(iter);
                if requeue.is_empty() {
                    tracing::info!("replayed {} queued publishes", total);
                } else {
                    bus.replay.lock().await.extend(requeue);
                }
            }
        })
    }

    pub async fn queued_publishes(&self) -> usize {
        self.replay.lock().await.len()
    }
}

#[async_trait]
impl EventPublisher for EventBus {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: serde_json::Value,
    ) -> DispatchResult<()> {
        let body = serde_json::to_vec(&payload)?;
        let result =
            tokio::time::timeout(PUBLISH_TIMEOUT, self.publish_raw(exchange, routing_key, &body))
                .await
                .unwrap_or(Err(DispatchError::Publish("publish timed out".to_string())));

        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                self.alive.store(false, Ordering::SeqCst);
                tracing::warn!(
                    exchange,
                    routing_key,
                    "publish failed, queueing for replay: {}",
                    err
                );
                self.replay.lock().await.push(PendingPublish {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    body,
                });
                Err(DispatchError::Publish(err.to_string()))
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// Declare exchanges, queues and bindings. Safe to run on every connect.
async fn ensure_topology(channel: &Channel) -> DispatchResult<()> {
    let durable = ExchangeDeclareOptions { durable: true, ..Default::default() };

    for (name, kind) in [
        (EXCHANGE_RIDE_TOPIC, ExchangeKind::Topic),
        (EXCHANGE_DRIVER_TOPIC, ExchangeKind::Topic),
        (EXCHANGE_LOCATION_FANOUT, ExchangeKind::Fanout),
    ] {
        channel
            .exchange_declare(name, kind, durable, FieldTable::default())
            .await?;
    }

    let bindings = [
        (QUEUE_RIDE_REQUESTS, EXCHANGE_RIDE_TOPIC, "ride.request.*"),
        (QUEUE_RIDE_STATUS, EXCHANGE_RIDE_TOPIC, "ride.status.*"),
        (QUEUE_DRIVER_MATCHING, EXCHANGE_RIDE_TOPIC, "ride.request.*"),
        (QUEUE_DRIVER_RESPONSES, EXCHANGE_DRIVER_TOPIC, "driver.response.*"),
        (QUEUE_DRIVER_STATUS, EXCHANGE_DRIVER_TOPIC, "driver.status.*"),
        (QUEUE_LOCATION_UPDATES, EXCHANGE_LOCATION_FANOUT, ""),
    ];

    for (queue, exchange, routing_key) in bindings {
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }

    Ok(())
}
