use std::time;

use async_trait::async_trait;
use health::HealthHandle;
use ingest_common::pgqueue::PgBroker;
use tracing::{debug, error, info};

// Lets `cleanup_loop` drive any maintenance task, and tests drive it without a database.
#[async_trait]
pub trait Cleaner: Send + Sync {
    async fn cleanup(&self);
}

/// Returns deliveries whose consumer died mid-message to their queue.
pub struct StalledDeliveryCleaner {
    broker: PgBroker,
    queue: String,
    stalled_timeout: time::Duration,
}

impl StalledDeliveryCleaner {
    pub fn new(broker: PgBroker, queue: &str, stalled_timeout: time::Duration) -> Self {
        Self {
            broker,
            queue: queue.to_owned(),
            stalled_timeout,
        }
    }
}

#[async_trait]
impl Cleaner for StalledDeliveryCleaner {
    async fn cleanup(&self) {
        match self
            .broker
            .requeue_stalled(&self.queue, self.stalled_timeout)
            .await
        {
            Ok(0) => debug!(queue = %self.queue, "no stalled deliveries"),
            Ok(requeued) => {
                let labels = [("queue", self.queue.clone())];
                metrics::counter!("ingest_janitor_requeued_total", &labels).increment(requeued);
                info!(queue = %self.queue, requeued, "requeued stalled deliveries");
            }
            Err(error) => error!(queue = %self.queue, "failed to requeue stalled deliveries: {}", error),
        }
    }
}

pub async fn cleanup_loop(cleaner: Box<dyn Cleaner>, interval: time::Duration, liveness: HealthHandle) {
    let mut interval = tokio::time::interval(interval);

    loop {
        interval.tick().await;
        cleaner.cleanup().await;
        liveness.report_healthy();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use health::HealthRegistry;

    use super::*;

    struct CountingCleaner(Arc<AtomicUsize>);

    #[async_trait]
    impl Cleaner for CountingCleaner {
        async fn cleanup(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_loop_runs_every_interval_and_reports() {
        let runs = Arc::new(AtomicUsize::new(0));
        let registry = HealthRegistry::new("liveness");
        let liveness = registry.register("janitor", ::time::Duration::seconds(30));
        assert!(!registry.get_status().healthy);

        let task = tokio::spawn(cleanup_loop(
            Box::new(CountingCleaner(runs.clone())),
            time::Duration::from_secs(60),
            liveness,
        ));
        tokio::time::sleep(time::Duration::from_secs(150)).await;
        task.abort();

        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert!(registry.get_status().healthy);
    }
}
