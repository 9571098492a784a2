//! # PgQueue
//!
//! A durable broker implemented on top of a PostgreSQL table. Every queue is a set of rows in
//! `ingest_queue`; consumers poll it with `FOR UPDATE SKIP LOCKED` so concurrent workers never
//! receive the same delivery.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerChannel, BrokerConnector, BrokerError, Delivery, DeliveryHandler};
use crate::channel::{ConsumerTag, Payload};

/// Enumeration of possible statuses for a delivery.
/// Available: A message waiting in the queue to be picked up by a consumer.
/// Running: A message handed to a consumer, pending ack or nack.
/// Failed: A message that was rejected without requeue. Kept for inspection.
#[derive(Debug, PartialEq, Eq, Clone, Copy, sqlx::Type)]
#[sqlx(type_name = "delivery_status")]
#[sqlx(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Available,
    Running,
    Failed,
}

#[derive(sqlx::FromRow)]
struct DeliveryRow {
    id: i64,
    queue: String,
    payload: sqlx::types::Json<Payload>,
    delivery_count: i32,
}

impl From<DeliveryRow> for Delivery {
    fn from(row: DeliveryRow) -> Self {
        Delivery {
            tag: row.id,
            queue: row.queue,
            payload: row.payload.0,
            delivery_count: u32::try_from(row.delivery_count).unwrap_or_default(),
        }
    }
}

pub type PgBrokerResult<T> = std::result::Result<T, BrokerError>;

/// Hand out the oldest available message in `queue`, marking it as running.
async fn dequeue(pool: &PgPool, queue: &str, consumer: &ConsumerTag) -> PgBrokerResult<Option<Delivery>> {
    let base_query = r#"
WITH next_in_queue AS (
    SELECT
        id
    FROM
        ingest_queue
    WHERE
        queue = $1
        AND status = 'available'::delivery_status
    ORDER BY
        id
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE
    ingest_queue
SET
    status = 'running'::delivery_status,
    delivery_count = ingest_queue.delivery_count + 1,
    last_delivered_at = NOW(),
    consumer = $2
FROM
    next_in_queue
WHERE
    ingest_queue.id = next_in_queue.id
RETURNING
    ingest_queue.id,
    ingest_queue.queue,
    ingest_queue.payload,
    ingest_queue.delivery_count
    "#;

    let row: Option<DeliveryRow> = sqlx::query_as(base_query)
        .bind(queue)
        .bind(consumer.as_str())
        .fetch_optional(pool)
        .await
        .map_err(|error| BrokerError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;

    Ok(row.map(Delivery::from))
}

/// A broker backed by the `ingest_queue` table in PostgreSQL.
pub struct PgBroker {
    pool: PgPool,
    poll_interval: time::Duration,
    prefetch: AtomicU32,
    consumers: Mutex<HashMap<ConsumerTag, CancellationToken>>,
    shutdown: CancellationToken,
}

impl PgBroker {
    /// Initialize a new PgBroker connecting to the database at `url`.
    pub async fn new(
        url: &str,
        max_connections: u32,
        poll_interval: time::Duration,
    ) -> PgBrokerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| BrokerError::ConnectionError { error })?;

        Ok(Self::new_from_pool(pool, poll_interval))
    }

    pub fn new_from_pool(pool: PgPool, poll_interval: time::Duration) -> Self {
        Self {
            pool,
            poll_interval,
            prefetch: AtomicU32::new(1),
            consumers: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Run the embedded migrations creating the queue and result tables.
    pub async fn migrate(&self) -> PgBrokerResult<()> {
        sqlx::migrate!("../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Return deliveries of `queue` that have been running for longer than `older_than` to the
    /// queue. Their consumer is assumed to be gone without settling them.
    pub async fn requeue_stalled(
        &self,
        queue: &str,
        older_than: time::Duration,
    ) -> PgBrokerResult<u64> {
        let base_query = r#"
UPDATE
    ingest_queue
SET
    status = 'available'::delivery_status,
    consumer = NULL
WHERE
    queue = $1
    AND status = 'running'::delivery_status
    AND last_delivered_at < NOW() - make_interval(secs => $2)
        "#;

        let result = sqlx::query(base_query)
            .bind(queue)
            .bind(older_than.as_secs_f64())
            .execute(&self.pool)
            .await
            .map_err(|error| BrokerError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(result.rows_affected())
    }

    /// Number of messages in `queue` with the given status.
    pub async fn count(&self, queue: &str, status: DeliveryStatus) -> PgBrokerResult<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM ingest_queue WHERE queue = $1 AND status = $2")
            .bind(queue)
            .bind(status)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| BrokerError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }

    async fn settle(&self, delivery: &Delivery, status: Option<DeliveryStatus>) -> PgBrokerResult<()> {
        let result = match status {
            None => {
                sqlx::query("DELETE FROM ingest_queue WHERE id = $1 AND status = 'running'::delivery_status")
                    .bind(delivery.tag)
                    .execute(&self.pool)
                    .await
            }
            Some(status) => {
                sqlx::query(
                    "UPDATE ingest_queue SET status = $2, consumer = NULL WHERE id = $1 AND status = 'running'::delivery_status",
                )
                .bind(delivery.tag)
                .bind(status)
                .execute(&self.pool)
                .await
            }
        }
        .map_err(|error| BrokerError::QueryError {
            command: if status.is_none() { "DELETE" } else { "UPDATE" }.to_owned(),
            error,
        })?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::DeliveryReclaimed { tag: delivery.tag });
        }
        Ok(())
    }
}

/// Poll `queue` until `cancel` fires, keeping at most `prefetch` deliveries in flight.
async fn consume_loop(
    pool: PgPool,
    queue: String,
    tag: ConsumerTag,
    prefetch: u32,
    poll_interval: time::Duration,
    handler: DeliveryHandler,
    cancel: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(prefetch.max(1) as usize));

    loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        match dequeue(&pool, &queue, &tag).await {
            Ok(Some(delivery)) => {
                debug!(%queue, tag = delivery.tag, "dequeued message");
                let handler = handler.clone();
                tokio::spawn(async move {
                    handler(delivery).await;
                    drop(permit);
                });
                continue;
            }
            Ok(None) => drop(permit),
            Err(error) => {
                drop(permit);
                error!(%queue, "failed to dequeue message: {}", error);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }

    info!(%queue, %tag, "consume loop stopped");
}

#[async_trait]
impl BrokerChannel for PgBroker {
    async fn assert_queue(&self, queue: &str, durable: bool) -> PgBrokerResult<()> {
        if !durable {
            return Err(BrokerError::Unsupported(format!(
                "non-durable queue {queue}"
            )));
        }

        let exists: bool = sqlx::query_scalar("SELECT to_regclass('ingest_queue') IS NOT NULL")
            .fetch_one(&self.pool)
            .await
            .map_err(|error| BrokerError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        if !exists {
            return Err(BrokerError::Unsupported(format!(
                "queue {queue} without the ingest_queue table, run migrations first"
            )));
        }
        Ok(())
    }

    async fn prefetch(&self, count: u32) -> PgBrokerResult<()> {
        self.prefetch.store(count.max(1), Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &Payload) -> PgBrokerResult<()> {
        sqlx::query("INSERT INTO ingest_queue (queue, payload) VALUES ($1, $2)")
            .bind(queue)
            .bind(sqlx::types::Json(payload))
            .execute(&self.pool)
            .await
            .map_err(|error| BrokerError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        handler: DeliveryHandler,
    ) -> PgBrokerResult<ConsumerTag> {
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::ChannelClosed);
        }

        let tag = ConsumerTag::generate(queue);
        let cancel = self.shutdown.child_token();
        self.consumers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(tag.clone(), cancel.clone());

        tokio::spawn(consume_loop(
            self.pool.clone(),
            queue.to_owned(),
            tag.clone(),
            self.prefetch.load(Ordering::SeqCst),
            self.poll_interval,
            handler,
            cancel,
        ));

        Ok(tag)
    }

    async fn ack(&self, delivery: &Delivery) -> PgBrokerResult<()> {
        self.settle(delivery, None).await
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> PgBrokerResult<()> {
        let status = if requeue {
            DeliveryStatus::Available
        } else {
            DeliveryStatus::Failed
        };
        self.settle(delivery, Some(status)).await
    }

    async fn cancel(&self, tag: &ConsumerTag) -> PgBrokerResult<()> {
        let cancel = self
            .consumers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(tag);

        match cancel {
            Some(cancel) => cancel.cancel(),
            None => warn!(%tag, "cancel() called for an unknown consumer"),
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.shutdown.is_cancelled() && !self.pool.is_closed()
    }

    async fn close(&self) -> PgBrokerResult<()> {
        self.shutdown.cancel();
        self.consumers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        self.pool.close().await;
        Ok(())
    }
}

/// Opens a `PgBroker` per connection, optionally migrating the database first.
pub struct PgBrokerConnector {
    pub max_connections: u32,
    pub poll_interval: time::Duration,
    pub run_migrations: bool,
}

#[async_trait]
impl BrokerConnector for PgBrokerConnector {
    async fn connect(&self, url: &str) -> PgBrokerResult<Arc<dyn BrokerChannel>> {
        let broker = PgBroker::new(url, self.max_connections, self.poll_interval).await?;
        if self.run_migrations {
            broker.migrate().await?;
        }
        Ok(Arc::new(broker))
    }
}
