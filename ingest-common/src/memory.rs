//! # In-memory channel
//!
//! A process-local fallback for the broker. Producers and consumers rendezvous on an
//! `InMemoryQueue` that the caller constructs once per topic and hands to both sides. Nothing
//! survives a restart.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{
    run_handler, ChannelError, Consumer, ConsumerTag, MessageChannel, MessageHandler, Outcome,
    Payload,
};
use crate::retry::RedeliveryPolicy;

pub const IN_MEMORY_CONSUMER_TAG: &str = "in-memory-consumer";

#[derive(Debug, Clone)]
struct Envelope {
    payload: Payload,
    deliveries: u32,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Envelope>,
    dead_letters: Vec<Payload>,
}

struct QueueInner {
    name: String,
    state: Mutex<QueueState>,
}

/// A FIFO sequence of messages shared by every channel bound to it.
#[derive(Clone)]
pub struct InMemoryQueue {
    inner: Arc<QueueInner>,
}

impl InMemoryQueue {
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.to_owned(),
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push_back(&self, envelope: Envelope) {
        self.state().pending.push_back(envelope);
    }

    fn pop_front(&self) -> Option<Envelope> {
        self.state().pending.pop_front()
    }

    fn dead_letter(&self, envelope: Envelope) {
        self.state().dead_letters.push(envelope.payload);
    }

    pub fn len(&self) -> usize {
        self.state().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending payloads, head first.
    pub fn pending(&self) -> Vec<Payload> {
        self.state()
            .pending
            .iter()
            .map(|envelope| envelope.payload.clone())
            .collect()
    }

    /// Payloads that exhausted their redelivery bound.
    pub fn dead_letters(&self) -> Vec<Payload> {
        self.state().dead_letters.clone()
    }

    /// Drop every pending and dead-lettered message.
    pub fn reset(&self) {
        let mut state = self.state();
        state.pending.clear();
        state.dead_letters.clear();
    }
}

/// Publishing side of the in-memory channel.
pub struct InMemoryMessenger {
    queue: InMemoryQueue,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl InMemoryMessenger {
    pub fn new(queue: &InMemoryQueue) -> Self {
        Self {
            queue: queue.clone(),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageChannel for InMemoryMessenger {
    fn queue(&self) -> &str {
        self.queue.name()
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        self.closed.store(false, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        debug!(queue = self.queue.name(), "in-memory channel connected");
        Ok(())
    }

    async fn publish(&self, payload: &Payload) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed(self.queue.name().to_owned()));
        }

        self.queue.push_back(Envelope {
            payload: payload.clone(),
            deliveries: 0,
        });
        debug!(queue = self.queue.name(), "published in-memory message");
        Ok(())
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.connected.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        debug!(queue = self.queue.name(), "in-memory channel closed");
        Ok(())
    }
}

/// A running polling loop and the token that ends it.
struct ConsumerRun {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// Consuming side of the in-memory channel: a polling loop over the shared queue.
///
/// A failed message goes to the tail of the queue, so ordering is only kept for messages that
/// never fail. At most one loop runs per consumer.
pub struct InMemoryConsumer {
    channel: InMemoryMessenger,
    poll_delay: time::Duration,
    redelivery: RedeliveryPolicy,
    current: Mutex<Option<ConsumerRun>>,
}

impl InMemoryConsumer {
    pub fn new(queue: &InMemoryQueue, poll_delay: time::Duration) -> Self {
        Self {
            channel: InMemoryMessenger::new(queue),
            poll_delay,
            redelivery: RedeliveryPolicy::unbounded(),
            current: Mutex::new(None),
        }
    }

    pub fn with_redelivery(mut self, redelivery: RedeliveryPolicy) -> Self {
        self.redelivery = redelivery;
        self
    }

    pub fn is_consuming(&self) -> bool {
        self.current()
            .as_ref()
            .is_some_and(|run| !run.shutdown.is_cancelled() && !run.task.is_finished())
    }

    fn current(&self) -> MutexGuard<'_, Option<ConsumerRun>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Process the message at the head of the queue, if any.
    pub async fn process_next(
        &self,
        on_message: &MessageHandler,
        timeout: time::Duration,
    ) -> Option<Outcome> {
        process_next(&self.channel.queue, on_message, timeout, self.redelivery).await
    }
}

async fn process_next(
    queue: &InMemoryQueue,
    on_message: &MessageHandler,
    timeout: time::Duration,
    redelivery: RedeliveryPolicy,
) -> Option<Outcome> {
    let mut envelope = queue.pop_front()?;
    envelope.deliveries += 1;

    let outcome = match run_handler(on_message, envelope.payload.clone(), timeout).await {
        Ok(()) => Outcome::Acked,
        Err(error) if redelivery.should_requeue(envelope.deliveries) => {
            warn!(
                queue = queue.name(),
                deliveries = envelope.deliveries,
                "{}, message will be retried",
                error
            );
            queue.push_back(envelope);
            Outcome::Requeued
        }
        Err(error) => {
            error!(
                queue = queue.name(),
                deliveries = envelope.deliveries,
                "{}, redeliveries exhausted, message dead-lettered",
                error
            );
            queue.dead_letter(envelope);
            Outcome::DeadLettered
        }
    };

    outcome.record(queue.name());
    Some(outcome)
}

#[async_trait]
impl MessageChannel for InMemoryConsumer {
    fn queue(&self) -> &str {
        self.channel.queue()
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        self.channel.connect().await
    }

    async fn publish(&self, payload: &Payload) -> Result<(), ChannelError> {
        self.channel.publish(payload).await
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.channel.close().await
    }
}

#[async_trait]
impl Consumer for InMemoryConsumer {
    async fn handle_live_message(
        &self,
        on_message: MessageHandler,
        timeout: time::Duration,
    ) -> Result<ConsumerTag, ChannelError> {
        if !self.channel.is_connected() {
            return Err(ChannelError::NotConnected(self.queue().to_owned()));
        }

        let tag = ConsumerTag(IN_MEMORY_CONSUMER_TAG.to_owned());
        let mut current = self.current();
        if let Some(run) = current.as_ref() {
            if !run.shutdown.is_cancelled() && !run.task.is_finished() {
                warn!(queue = self.queue(), "in-memory consumer is already consuming");
                return Ok(tag);
            }
        }

        info!(queue = self.queue(), "start consuming in-memory queue");

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let queue = self.channel.queue.clone();
        let poll_delay = self.poll_delay;
        let redelivery = self.redelivery;

        let task = tokio::spawn(async move {
            while !token.is_cancelled() {
                process_next(&queue, &on_message, timeout, redelivery).await;
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(poll_delay) => {}
                }
            }
            debug!(queue = queue.name(), "in-memory consumer loop exited");
        });
        *current = Some(ConsumerRun { shutdown, task });

        Ok(tag)
    }

    async fn stop(&self) -> Result<(), ChannelError> {
        let run = self.current().take();
        let Some(run) = run.filter(|run| !run.shutdown.is_cancelled()) else {
            warn!(queue = self.queue(), "stop() called but consumer is not consuming");
            return Ok(());
        };

        // The message in flight, if any, runs to completion before the loop exits.
        run.shutdown.cancel();
        if let Err(error) = run.task.await {
            error!(queue = self.queue(), "in-memory consumer loop failed: {}", error);
        }

        info!(queue = self.queue(), "stopped consuming in-memory queue");
        self.close().await
    }
}

impl Drop for InMemoryConsumer {
    fn drop(&mut self) {
        if let Some(run) = self.current().as_ref() {
            run.shutdown.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::channel::message_handler;
    use serde_json::json;

    fn recording_handler(
        calls: Arc<Mutex<Vec<Payload>>>,
        fail: impl Fn(&Payload, usize) -> bool + Send + Sync + 'static,
    ) -> MessageHandler {
        let fail = Arc::new(fail);
        message_handler(move |payload| {
            let calls = calls.clone();
            let fail = fail.clone();
            async move {
                let seen = {
                    let mut calls = calls.lock().unwrap();
                    calls.push(payload.clone());
                    calls.iter().filter(|call| **call == payload).count()
                };
                if fail(&payload, seen) {
                    anyhow::bail!("failed to process {payload}");
                }
                Ok(())
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_published_before_start_are_delivered_once() {
        let queue = InMemoryQueue::new("raw-content");
        let producer = InMemoryMessenger::new(&queue);
        for id in ["m1", "m2", "m3"] {
            producer.publish(&json!({ "url": id })).await.unwrap();
        }

        let calls = Arc::new(Mutex::new(Vec::new()));
        let consumer = InMemoryConsumer::new(&queue, time::Duration::from_millis(100));
        consumer.connect().await.unwrap();
        consumer
            .handle_live_message(
                recording_handler(calls.clone(), |_, _| false),
                time::Duration::from_secs(1),
            )
            .await
            .unwrap();

        while calls.lock().unwrap().len() < 3 {
            tokio::time::sleep(time::Duration::from_millis(50)).await;
        }
        tokio::time::sleep(time::Duration::from_secs(1)).await;

        let calls = calls.lock().unwrap().clone();
        assert_eq!(calls, vec![json!({"url": "m1"}), json!({"url": "m2"}), json!({"url": "m3"})]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_failed_message_is_requeued_at_tail() {
        let queue = InMemoryQueue::new("raw-content");
        let producer = InMemoryMessenger::new(&queue);
        producer.publish(&json!({ "url": "m1" })).await.unwrap();
        producer.publish(&json!({ "url": "m2" })).await.unwrap();

        let calls = Arc::new(Mutex::new(Vec::new()));
        let handler = recording_handler(calls.clone(), |payload, seen| {
            payload["url"] == "m1" && seen == 1
        });
        let consumer = InMemoryConsumer::new(&queue, time::Duration::from_millis(1));
        let timeout = time::Duration::from_secs(1);

        assert_eq!(
            consumer.process_next(&handler, timeout).await,
            Some(Outcome::Requeued)
        );
        assert_eq!(queue.pending(), vec![json!({"url": "m2"}), json!({"url": "m1"})]);

        assert_eq!(consumer.process_next(&handler, timeout).await, Some(Outcome::Acked));
        assert_eq!(queue.pending(), vec![json!({"url": "m1"})]);

        assert_eq!(consumer.process_next(&handler, timeout).await, Some(Outcome::Acked));
        assert!(queue.is_empty());
        assert_eq!(consumer.process_next(&handler, timeout).await, None);
    }

    #[tokio::test]
    async fn test_always_failing_message_is_never_lost() {
        let queue = InMemoryQueue::new("raw-content");
        let producer = InMemoryMessenger::new(&queue);
        producer.publish(&json!({ "url": "poison" })).await.unwrap();

        let calls = Arc::new(Mutex::new(Vec::new()));
        let handler = recording_handler(calls.clone(), |_, _| true);
        let consumer = InMemoryConsumer::new(&queue, time::Duration::from_millis(1));

        for _ in 0..5 {
            assert_eq!(
                consumer
                    .process_next(&handler, time::Duration::from_secs(1))
                    .await,
                Some(Outcome::Requeued)
            );
            assert_eq!(queue.pending(), vec![json!({"url": "poison"})]);
        }
        assert_eq!(calls.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_exhausted_message_is_dead_lettered() {
        let queue = InMemoryQueue::new("raw-content");
        let producer = InMemoryMessenger::new(&queue);
        producer.publish(&json!({ "url": "poison" })).await.unwrap();

        let handler = recording_handler(Arc::new(Mutex::new(Vec::new())), |_, _| true);
        let consumer = InMemoryConsumer::new(&queue, time::Duration::from_millis(1))
            .with_redelivery(RedeliveryPolicy::bounded(2));
        let timeout = time::Duration::from_secs(1);

        assert_eq!(
            consumer.process_next(&handler, timeout).await,
            Some(Outcome::Requeued)
        );
        assert_eq!(
            consumer.process_next(&handler, timeout).await,
            Some(Outcome::DeadLettered)
        );
        assert!(queue.is_empty());
        assert_eq!(queue.dead_letters(), vec![json!({"url": "poison"})]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_message_is_requeued() {
        let queue = InMemoryQueue::new("raw-content");
        let producer = InMemoryMessenger::new(&queue);
        producer.publish(&json!({ "url": "slow" })).await.unwrap();

        let handler = message_handler(|_| async {
            tokio::time::sleep(time::Duration::from_secs(3600)).await;
            Ok(())
        });
        let consumer = InMemoryConsumer::new(&queue, time::Duration::from_millis(1));

        let outcome = consumer
            .process_next(&handler, time::Duration::from_millis(10))
            .await;

        assert_eq!(outcome, Some(Outcome::Requeued));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_after_close_fails() {
        let queue = InMemoryQueue::new("raw-content");
        let producer = InMemoryMessenger::new(&queue);

        producer.close().await.unwrap();
        let result = producer.publish(&json!({ "url": "late" })).await;
        assert!(matches!(result, Err(ChannelError::Closed(_))));

        producer.connect().await.unwrap();
        producer.publish(&json!({ "url": "late" })).await.unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_consuming_requires_connect() {
        let queue = InMemoryQueue::new("raw-content");
        let consumer = InMemoryConsumer::new(&queue, time::Duration::from_millis(1));
        let handler = message_handler(|_| async { Ok(()) });

        let result = consumer
            .handle_live_message(handler, time::Duration::from_secs(1))
            .await;

        assert!(matches!(result, Err(ChannelError::NotConnected(_))));
        assert!(!consumer.is_consuming());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let queue = InMemoryQueue::new("raw-content");
        let consumer = InMemoryConsumer::new(&queue, time::Duration::from_millis(1));

        consumer.stop().await.unwrap();
        assert!(!consumer.is_consuming());

        consumer.connect().await.unwrap();
        consumer
            .handle_live_message(
                message_handler(|_| async { Ok(()) }),
                time::Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(consumer.is_consuming());

        consumer.stop().await.unwrap();
        consumer.stop().await.unwrap();
        assert!(!consumer.is_consuming());
        assert!(matches!(
            consumer.publish(&json!({})).await,
            Err(ChannelError::Closed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarted_consumer_keeps_one_message_in_flight() {
        let queue = InMemoryQueue::new("raw-content");
        let producer = InMemoryMessenger::new(&queue);
        for id in 0..3 {
            producer.publish(&json!({ "url": id })).await.unwrap();
        }

        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handled = Arc::new(AtomicUsize::new(0));
        let handler = {
            let (in_flight, peak, handled) = (in_flight.clone(), peak.clone(), handled.clone());
            message_handler(move |_| {
                let (in_flight, peak, handled) = (in_flight.clone(), peak.clone(), handled.clone());
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(time::Duration::from_millis(300)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    handled.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };

        let consumer = InMemoryConsumer::new(&queue, time::Duration::from_millis(100));
        let timeout = time::Duration::from_secs(1);
        consumer.connect().await.unwrap();
        consumer.handle_live_message(handler.clone(), timeout).await.unwrap();
        tokio::time::sleep(time::Duration::from_millis(10)).await;

        consumer.stop().await.unwrap();
        assert!(!consumer.is_consuming());
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);

        consumer.connect().await.unwrap();
        consumer.handle_live_message(handler, timeout).await.unwrap();
        for id in 3..20 {
            producer.publish(&json!({ "url": id })).await.unwrap();
        }
        tokio::time::sleep(time::Duration::from_secs(20)).await;

        assert_eq!(handled.load(Ordering::SeqCst), 20);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_reset_clears_queue() {
        let queue = InMemoryQueue::new("raw-content");
        queue.push_back(Envelope {
            payload: json!({ "url": "m1" }),
            deliveries: 0,
        });

        queue.reset();

        assert!(queue.is_empty());
        assert!(queue.dead_letters().is_empty());
    }
}
