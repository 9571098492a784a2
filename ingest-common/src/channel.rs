//! # Channel
//!
//! The publish/consume contract shared by the broker-backed and the in-memory message channels.
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;

use crate::broker::BrokerError;

/// Messages are opaque JSON records. Their schema belongs to the producer.
pub type Payload = serde_json::Value;

/// Errors returned by channel operations.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("channel for queue {0} is not connected, call connect() first")]
    NotConnected(String),
    #[error("channel for queue {0} is closed")]
    Closed(String),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Why a single message could not be processed. Either way, the message is not acknowledged.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("message handler timed out after {0:?}")]
    Timeout(time::Duration),
    #[error("message handler failed: {0:#}")]
    Failed(anyhow::Error),
}

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// The per-message callback registered with `Consumer::handle_live_message`.
///
/// It may be invoked more than once for the same logical message: every failure leads to a
/// redelivery until the redelivery bound, if any, is reached.
pub type MessageHandler = Arc<dyn Fn(Payload) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as a `MessageHandler`.
pub fn message_handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |payload| Box::pin(f(payload)))
}

/// Run `handler` on `payload`, treating a timeout exactly like a failure.
///
/// On timeout the handler future is dropped at its current suspension point: whatever it was
/// waiting on is abandoned and cannot touch shared state afterwards.
pub async fn run_handler(
    handler: &MessageHandler,
    payload: Payload,
    timeout: time::Duration,
) -> Result<(), HandlerError> {
    match tokio::time::timeout(timeout, handler(payload)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(HandlerError::Failed(error)),
        Err(_) => Err(HandlerError::Timeout(timeout)),
    }
}

/// Opaque handle to an active subscription, used to cancel it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerTag(pub String);

impl ConsumerTag {
    pub fn generate(queue: &str) -> Self {
        ConsumerTag(format!("{}-{}", queue, uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What happened to a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Processed and permanently removed.
    Acked,
    /// Failed, handed back to the queue for another attempt.
    Requeued,
    /// Failed and exhausted its redelivery bound.
    DeadLettered,
    /// Failed, but the channel was gone so nothing could be settled. The broker redelivers it.
    Abandoned,
}

impl Outcome {
    pub fn record(self, queue: &str) {
        let labels = [("queue", queue.to_owned())];
        let name = match self {
            Outcome::Acked => "ingest_messages_acked",
            Outcome::Requeued => "ingest_messages_requeued",
            Outcome::DeadLettered => "ingest_messages_dead_lettered",
            Outcome::Abandoned => "ingest_messages_abandoned",
        };

        metrics::counter!("ingest_messages_total", &labels).increment(1);
        metrics::counter!(name, &labels).increment(1);
    }
}

/// Capabilities shared by producers and consumers.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    fn queue(&self) -> &str;

    /// Idempotent. Re-arms a channel after `close`.
    async fn connect(&self) -> Result<(), ChannelError>;

    /// Fails with `ChannelError::Closed` after `close`.
    async fn publish(&self, payload: &Payload) -> Result<(), ChannelError>;

    async fn close(&self) -> Result<(), ChannelError>;
}

/// The consuming side of a channel.
#[async_trait]
pub trait Consumer: MessageChannel {
    /// Start delivering messages to `on_message`, one at a time, each attempt bounded by `timeout`.
    /// Successes are acknowledged, failures are requeued.
    async fn handle_live_message(
        &self,
        on_message: MessageHandler,
        timeout: time::Duration,
    ) -> Result<ConsumerTag, ChannelError>;

    /// Stop receiving new deliveries. The message in flight, if any, is allowed to finish.
    /// Calling it when not consuming only logs a warning.
    async fn stop(&self) -> Result<(), ChannelError>;
}
