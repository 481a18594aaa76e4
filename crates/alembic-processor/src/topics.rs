//! Topic provisioning and upstream metadata inheritance.

use std::time::Duration;

use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::types::RDKafkaErrorCode;
use tracing::debug;

use alembic_core::ProcessorConfig;

use crate::error::{ProcessorError, Result};

pub(crate) const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn client_config(cfg: &ProcessorConfig) -> ClientConfig {
    let mut config = ClientConfig::new();
    config.set("bootstrap.servers", cfg.bootstrap_servers());
    config
}

/// Creates the topics a projection needs and keeps their parallelism in
/// step with upstream.
pub struct TopicManager {
    admin: AdminClient<DefaultClientContext>,
    metadata: BaseConsumer,
}

impl TopicManager {
    pub fn new(cfg: &ProcessorConfig) -> Result<Self> {
        let admin = client_config(cfg).create()?;
        let metadata = client_config(cfg).create()?;
        Ok(Self { admin, metadata })
    }

    /// Raise the configured partition/replication floors to the highest
    /// values observed on the given upstream topics, so downstream topics
    /// keep pace with upstream parallelism.
    pub fn inherit_from_upstream(
        &self,
        cfg: &mut ProcessorConfig,
        upstream: &[String],
    ) -> Result<()> {
        let md = self.metadata.fetch_metadata(None, METADATA_TIMEOUT)?;

        let mut observed = Vec::new();
        for topic in md.topics() {
            if !upstream.iter().any(|t| t == topic.name()) {
                continue;
            }
            let partitions = topic.partitions();
            if partitions.is_empty() {
                continue;
            }
            observed.push((
                partitions.len() as i32,
                partitions[0].replicas().len() as i32,
            ));
        }

        let (partitions, replication) = adopt_limits(cfg.partitions, cfg.replication, &observed);
        debug!(partitions, replication, "adopted topic limits");
        cfg.partitions = partitions;
        cfg.replication = replication;
        Ok(())
    }

    /// Create a topic if it does not exist; an existing topic is success.
    pub async fn ensure_stream_exists(
        &self,
        topic: &str,
        cfg: &ProcessorConfig,
        compacted: bool,
    ) -> Result<()> {
        let mut new_topic = NewTopic::new(
            topic,
            cfg.partitions,
            TopicReplication::Fixed(cfg.replication),
        );
        if compacted {
            new_topic = new_topic.set("cleanup.policy", "compact");
        }

        let results = self
            .admin
            .create_topics(&[new_topic], &AdminOptions::new())
            .await?;

        for result in results {
            match result {
                Ok(_) => {}
                Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
                Err((name, code)) => {
                    return Err(ProcessorError::TopicProvisioning(format!("{name}: {code}")))
                }
            }
        }
        Ok(())
    }
}

/// Pure half of upstream inheritance: the maximum of the configured floors
/// and every observed (partitions, replication) pair.
pub(crate) fn adopt_limits(
    partitions_floor: i32,
    replication_floor: i32,
    observed: &[(i32, i32)],
) -> (i32, i32) {
    let mut partitions = partitions_floor;
    let mut replication = replication_floor;
    for (p, r) in observed {
        partitions = partitions.max(*p);
        replication = replication.max(*r);
    }
    (partitions, replication)
}
