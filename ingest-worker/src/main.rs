//! Consume raw crawled content and turn it into persisted job postings.
use std::sync::Arc;
use std::time;

use envconfig::Envconfig;
use health::{ComponentStatus, HealthHandle, HealthRegistry};
use ingest_common::metrics::{serve, setup_metrics_routes};
use ingest_common::pgqueue::PgBroker;
use ingest_common::pool::{ApiKey, ResourcePool};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ingest_worker::channels::Channels;
use ingest_worker::config::{ChannelKind, Config};
use ingest_worker::error::WorkerError;
use ingest_worker::extractor::HttpExtractor;
use ingest_worker::handlers::{app, AppState};
use ingest_worker::janitor::{cleanup_loop, StalledDeliveryCleaner};
use ingest_worker::parser::PooledParser;
use ingest_worker::pipeline::JobPipeline;

const SUPERVISOR_INTERVAL: time::Duration = time::Duration::from_secs(10);

/// Report the pipeline as live and ready for as long as it is running.
async fn supervise(pipeline: Arc<JobPipeline>, liveness: HealthHandle, readiness: HealthHandle) {
    let mut interval = tokio::time::interval(SUPERVISOR_INTERVAL);

    loop {
        interval.tick().await;
        if pipeline.is_running() {
            liveness.report_healthy();
            readiness.report_healthy();
        } else {
            liveness.report_status(ComponentStatus::Unhealthy);
            readiness.report_status(ComponentStatus::Unhealthy);
        }
    }
}

/// Periodically reclaim deliveries left running by crashed workers. Only the broker needs it.
async fn run_janitor(config: &Config, liveness: HealthRegistry) -> Result<(), WorkerError> {
    if config.channel == ChannelKind::InMemory {
        // Nothing outlives the process in memory, so there is nothing to reclaim.
        return futures::future::pending().await;
    }

    let broker = PgBroker::new(&config.database_url, 1, config.poll_interval.0).await?;
    let cleaner = StalledDeliveryCleaner::new(
        broker,
        config.queue_name.as_str(),
        config.stalled_timeout.0,
    );
    let deadline = ::time::Duration::try_from(config.janitor_interval.0.saturating_mul(2))
        .unwrap_or(::time::Duration::WEEK);

    cleanup_loop(
        Box::new(cleaner),
        config.janitor_interval.0,
        liveness.register("janitor", deadline),
    )
    .await;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env()?;
    if config.extraction_api_keys.0.is_empty() {
        return Err(WorkerError::NoApiKeys);
    }

    let liveness = HealthRegistry::new("liveness");
    let readiness = HealthRegistry::new("readiness");
    let health_deadline = ::time::Duration::seconds(30);

    let keys = ResourcePool::seeded(
        "extraction-keys",
        ApiKey::from_keys(config.extraction_api_keys.0.clone()),
    );
    let extractor = HttpExtractor::new(
        &config.extraction_endpoint,
        &config.extraction_model,
        config.request_timeout.0,
    )?;
    let parser = PooledParser::new(
        extractor,
        keys.clone(),
        config.request_timeout.0,
        config.key_cooldown.0,
    );

    let Channels {
        consumer,
        producer,
        repository,
    } = Channels::from_config(&config);

    let pipeline = Arc::new(
        JobPipeline::new(
            consumer,
            Arc::new(parser),
            repository,
            config.retry_policy(),
            config.message_timeout.0,
        )
        .with_redelivery(config.redelivery_policy()),
    );
    pipeline.start().await?;
    producer.connect().await?;

    let janitor = run_janitor(&config, liveness.clone());

    let supervisor = supervise(
        pipeline.clone(),
        liveness.register("pipeline", health_deadline),
        readiness.register("pipeline", health_deadline),
    );

    let router = setup_metrics_routes(app(AppState {
        producer: producer.clone(),
        liveness: liveness.clone(),
        readiness: readiness.clone(),
    }))?;
    let bind = config.bind();
    let http_server = serve(router, &bind);
    info!(%bind, "serving health, metrics and message endpoints");

    tokio::select! {
        result = http_server => {
            if let Err(error) = result {
                error!("http server exited: {}", error);
            }
        }
        result = janitor => {
            if let Err(error) = result {
                error!("janitor exited: {}", error);
            }
        }
        _ = supervisor => error!("pipeline supervisor exited"),
        _ = tokio::signal::ctrl_c() => info!("received shutdown signal"),
    }

    pipeline.stop().await?;
    if let Err(error) = producer.close().await {
        error!("failed to close producer: {}", error);
    }
    keys.close();

    Ok(())
}
