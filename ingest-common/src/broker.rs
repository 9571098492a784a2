//! # Broker
//!
//! Consumer and producer backed by a durable broker. The broker itself is only known through
//! the `BrokerConnector` and `BrokerChannel` traits; `crate::pgqueue` provides the PostgreSQL
//! implementation used in production.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time;

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::channel::{
    run_handler, ChannelError, Consumer, ConsumerTag, MessageChannel, MessageHandler, Outcome,
    Payload,
};
use crate::retry::RedeliveryPolicy;

/// Errors originating from a broker. sqlx errors are wrapped to provide additional context.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("failed to run broker migrations: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),
    #[error("broker does not support {0}")]
    Unsupported(String),
    #[error("broker channel is closed")]
    ChannelClosed,
    #[error("delivery {tag} was already settled or reclaimed by the janitor")]
    DeliveryReclaimed { tag: i64 },
}

/// A message handed out by the broker, pending acknowledgement.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Broker specific identifier used to settle this delivery.
    pub tag: i64,
    pub queue: String,
    pub payload: Payload,
    /// How many times this message has been delivered, including this delivery.
    pub delivery_count: u32,
}

/// Called by the broker for every delivery of a subscription.
pub type DeliveryHandler = Arc<dyn Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerChannel>, BrokerError>;
}

/// An open channel to a durable broker.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare `queue`, failing if the requested durability cannot be honored.
    async fn assert_queue(&self, queue: &str, durable: bool) -> Result<(), BrokerError>;

    /// Maximum number of unacknowledged deliveries per subscription created afterwards.
    async fn prefetch(&self, count: u32) -> Result<(), BrokerError>;

    async fn publish(&self, queue: &str, payload: &Payload) -> Result<(), BrokerError>;

    async fn consume(
        &self,
        queue: &str,
        handler: DeliveryHandler,
    ) -> Result<ConsumerTag, BrokerError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError>;

    async fn cancel(&self, tag: &ConsumerTag) -> Result<(), BrokerError>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Connection state shared by the broker-backed producer and consumer.
struct BrokerConnection {
    queue: String,
    url: String,
    connector: Arc<dyn BrokerConnector>,
    channel: Mutex<Option<Arc<dyn BrokerChannel>>>,
    closed: AtomicBool,
}

impl BrokerConnection {
    fn new(queue: &str, url: &str, connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            queue: queue.to_owned(),
            url: url.to_owned(),
            connector,
            channel: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<dyn BrokerChannel>>> {
        self.channel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The open channel, or why there is none.
    fn channel(&self) -> Result<Arc<dyn BrokerChannel>, ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed(self.queue.clone()));
        }
        self.slot()
            .clone()
            .ok_or_else(|| ChannelError::NotConnected(self.queue.clone()))
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        let existing = self.slot().clone();
        if let Some(channel) = existing {
            if channel.is_connected() {
                self.closed.store(false, Ordering::SeqCst);
                return Ok(());
            }
        }

        let channel = self.connector.connect(&self.url).await?;
        channel.assert_queue(&self.queue, true).await?;

        *self.slot() = Some(channel);
        self.closed.store(false, Ordering::SeqCst);
        info!(queue = %self.queue, "connected to broker");
        Ok(())
    }

    async fn publish(&self, payload: &Payload) -> Result<(), ChannelError> {
        let channel = self.channel()?;
        channel.publish(&self.queue, payload).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.closed.store(true, Ordering::SeqCst);
        let channel = self.slot().take();
        if let Some(channel) = channel {
            channel.close().await?;
            info!(queue = %self.queue, "broker channel closed");
        }
        Ok(())
    }
}

/// Publishes to a durable broker queue.
pub struct BrokerProducer {
    connection: BrokerConnection,
}

impl BrokerProducer {
    pub fn new(queue: &str, url: &str, connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            connection: BrokerConnection::new(queue, url, connector),
        }
    }
}

#[async_trait]
impl MessageChannel for BrokerProducer {
    fn queue(&self) -> &str {
        &self.connection.queue
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        self.connection.connect().await
    }

    async fn publish(&self, payload: &Payload) -> Result<(), ChannelError> {
        self.connection.publish(payload).await
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.connection.close().await
    }
}

/// Consumes a durable broker queue with at most one unacknowledged message in flight.
pub struct BrokerConsumer {
    connection: BrokerConnection,
    redelivery: RedeliveryPolicy,
    tag: Mutex<Option<ConsumerTag>>,
}

impl BrokerConsumer {
    pub fn new(queue: &str, url: &str, connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            connection: BrokerConnection::new(queue, url, connector),
            redelivery: RedeliveryPolicy::unbounded(),
            tag: Mutex::new(None),
        }
    }

    pub fn with_redelivery(mut self, redelivery: RedeliveryPolicy) -> Self {
        self.redelivery = redelivery;
        self
    }

    fn tag(&self) -> MutexGuard<'_, Option<ConsumerTag>> {
        self.tag.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn consumer_tag(&self) -> Option<ConsumerTag> {
        self.tag().clone()
    }
}

/// Acknowledge or reject `delivery` depending on how `on_message` handled it.
async fn settle(
    channel: &dyn BrokerChannel,
    delivery: Delivery,
    on_message: &MessageHandler,
    timeout: time::Duration,
    redelivery: RedeliveryPolicy,
) -> Outcome {
    let error = match run_handler(on_message, delivery.payload.clone(), timeout).await {
        Ok(()) => {
            return match channel.ack(&delivery).await {
                Ok(()) => Outcome::Acked,
                Err(error) => {
                    error!(queue = %delivery.queue, tag = delivery.tag, "failed to ack message, it will be redelivered: {}", error);
                    Outcome::Abandoned
                }
            };
        }
        Err(error) => error,
    };

    if !channel.is_connected() {
        warn!(
            queue = %delivery.queue,
            tag = delivery.tag,
            "{}, channel already closed, message cannot be nacked and relies on redelivery",
            error
        );
        return Outcome::Abandoned;
    }

    let requeue = redelivery.should_requeue(delivery.delivery_count);
    if requeue {
        warn!(
            queue = %delivery.queue,
            tag = delivery.tag,
            deliveries = delivery.delivery_count,
            "{}, message will be retried",
            error
        );
        if let Err(error) = channel.assert_queue(&delivery.queue, true).await {
            warn!(queue = %delivery.queue, "failed to reassert durable queue: {}", error);
        }
    } else {
        error!(
            queue = %delivery.queue,
            tag = delivery.tag,
            deliveries = delivery.delivery_count,
            "{}, redeliveries exhausted, message dead-lettered",
            error
        );
    }

    match channel.nack(&delivery, requeue).await {
        Ok(()) if requeue => Outcome::Requeued,
        Ok(()) => Outcome::DeadLettered,
        Err(error) => {
            error!(queue = %delivery.queue, tag = delivery.tag, "failed to nack message: {}", error);
            Outcome::Abandoned
        }
    }
}

#[async_trait]
impl MessageChannel for BrokerConsumer {
    fn queue(&self) -> &str {
        &self.connection.queue
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        self.connection.connect().await
    }

    async fn publish(&self, payload: &Payload) -> Result<(), ChannelError> {
        self.connection.publish(payload).await
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.tag().take();
        self.connection.close().await
    }
}

#[async_trait]
impl Consumer for BrokerConsumer {
    async fn handle_live_message(
        &self,
        on_message: MessageHandler,
        timeout: time::Duration,
    ) -> Result<ConsumerTag, ChannelError> {
        let channel = self.connection.channel()?;

        if let Some(tag) = self.consumer_tag() {
            warn!(queue = self.queue(), %tag, "consumer is already consuming");
            return Ok(tag);
        }

        channel.prefetch(1).await?;

        let redelivery = self.redelivery;
        let settle_channel = channel.clone();
        let handler: DeliveryHandler = Arc::new(move |delivery| {
            let channel = settle_channel.clone();
            let on_message = on_message.clone();
            Box::pin(async move {
                let queue = delivery.queue.clone();
                let outcome = settle(channel.as_ref(), delivery, &on_message, timeout, redelivery).await;
                outcome.record(&queue);
            })
        });

        let tag = channel.consume(&self.connection.queue, handler).await?;
        *self.tag() = Some(tag.clone());
        info!(queue = self.queue(), %tag, "waiting for messages");

        Ok(tag)
    }

    async fn stop(&self) -> Result<(), ChannelError> {
        let Some(tag) = self.tag().take() else {
            warn!(queue = self.queue(), "stop() called but consumer is not consuming");
            return Ok(());
        };

        match self.connection.channel() {
            Ok(channel) => {
                channel.cancel(&tag).await?;
                info!(queue = self.queue(), %tag, "consumer cancelled");
            }
            Err(error) => warn!(queue = self.queue(), %tag, "{}, nothing to cancel", error),
        }
        Ok(())
    }
}
