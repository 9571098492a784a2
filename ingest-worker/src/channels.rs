use std::sync::Arc;

use ingest_common::broker::{BrokerConsumer, BrokerProducer};
use ingest_common::channel::{Consumer, MessageChannel};
use ingest_common::memory::{InMemoryConsumer, InMemoryMessenger, InMemoryQueue};
use ingest_common::pgqueue::PgBrokerConnector;

use crate::config::{ChannelKind, Config};
use crate::repository::{MemoryRepository, PgRecruitInfoRepository, Repository};

/// The message channel and the store backing one `ChannelKind`.
///
/// The broker mode persists to PostgreSQL. The in-memory mode keeps everything in the
/// process and needs no database.
pub struct Channels {
    pub consumer: Arc<dyn Consumer>,
    pub producer: Arc<dyn MessageChannel>,
    pub repository: Arc<dyn Repository>,
}

impl Channels {
    /// Nothing is connected yet.
    pub fn from_config(config: &Config) -> Self {
        let queue_name = config.queue_name.as_str();
        let redelivery = config.redelivery_policy();

        match config.channel {
            ChannelKind::Broker => {
                let connector = Arc::new(PgBrokerConnector {
                    max_connections: config.max_pg_connections,
                    poll_interval: config.poll_interval.0,
                    run_migrations: config.run_migrations,
                });
                let consumer =
                    BrokerConsumer::new(queue_name, &config.database_url, connector.clone())
                        .with_redelivery(redelivery);

                Self {
                    consumer: Arc::new(consumer),
                    producer: Arc::new(BrokerProducer::new(
                        queue_name,
                        &config.database_url,
                        connector,
                    )),
                    repository: Arc::new(PgRecruitInfoRepository::new(
                        &config.database_url,
                        config.max_pg_connections,
                    )),
                }
            }
            ChannelKind::InMemory => {
                let queue = InMemoryQueue::new(queue_name);
                let consumer = InMemoryConsumer::new(&queue, config.in_memory_poll_delay.0)
                    .with_redelivery(redelivery);

                Self {
                    consumer: Arc::new(consumer),
                    producer: Arc::new(InMemoryMessenger::new(&queue)),
                    repository: Arc::new(MemoryRepository::new()),
                }
            }
        }
    }
}
