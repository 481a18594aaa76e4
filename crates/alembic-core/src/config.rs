//! Processor configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Sentinel storage path selecting the ephemeral in-memory state table.
pub const IN_MEMORY_STORAGE: &str = ":in-memory:";

pub const DEFAULT_REPLICATION_FACTOR: i32 = 3;
pub const DEFAULT_PARTITIONS: i32 = 1;

/// Configuration shared by every processor the engine builds.
///
/// `replication` and `partitions` are floors: topic provisioning adopts
/// higher values observed on upstream topics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Bootstrap broker list.
    pub brokers: Vec<String>,

    /// Replication factor floor for created topics.
    pub replication: i32,

    /// Partition count floor for created topics.
    pub partitions: i32,

    /// Directory for disk-backed state tables, or [`IN_MEMORY_STORAGE`].
    pub storage_path: String,
}

impl ProcessorConfig {
    /// Defaults for a broker list: replication capped by the cluster size,
    /// one partition, ephemeral state.
    pub fn new(brokers: Vec<String>) -> Self {
        let replication = DEFAULT_REPLICATION_FACTOR.min(brokers.len() as i32).max(1);
        Self {
            brokers,
            replication,
            partitions: DEFAULT_PARTITIONS,
            storage_path: IN_MEMORY_STORAGE.to_string(),
        }
    }

    pub fn with_replication(mut self, replication: i32) -> Self {
        self.replication = replication;
        self
    }

    pub fn with_partitions(mut self, partitions: i32) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_storage_path(mut self, path: impl Into<String>) -> Self {
        self.storage_path = path.into();
        self
    }

    pub fn in_memory(&self) -> bool {
        self.storage_path == IN_MEMORY_STORAGE
    }

    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    pub fn validate(&self) -> Result<()> {
        if self.brokers.is_empty() {
            return Err(Error::Config("kafka.brokers must not be empty".into()));
        }
        if self.replication < 1 || self.partitions < 1 {
            return Err(Error::Config(
                "replication and partition floors must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
