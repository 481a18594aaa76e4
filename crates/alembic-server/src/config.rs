//! Configuration: optional JSON file plus environment overrides.
//!
//! Dotted config keys map to underscored environment variables
//! (`kafka.brokers` -> `KAFKA_BROKERS`); the environment wins over the
//! file.

use std::path::Path;

use serde::Deserialize;

use alembic_core::{Error, ProcessorConfig};

pub const DEFAULT_PORT: u16 = 9175;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KafkaSection {
    pub brokers: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProcessorSection {
    pub storage_path: Option<String>,
    pub replication: Option<i32>,
    pub partitions: Option<i32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: Option<String>,
    pub format: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub kafka: KafkaSection,
    pub processor: ProcessorSection,
    pub logging: LoggingSection,
}

impl Config {
    /// Read the optional config file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read(path)
                    .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
                serde_json::from_slice(&raw)
                    .map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))?
            }
            None => Config::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn apply_env_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("SERVER_PORT") {
            if let Ok(port) = v.parse() {
                self.server.port = Some(port);
            }
        }
        if let Some(v) = get("KAFKA_BROKERS") {
            self.kafka.brokers = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = get("PROCESSOR_STORAGEPATH") {
            self.processor.storage_path = Some(v);
        }
        if let Some(v) = get("PROCESSOR_REPLICATION") {
            if let Ok(n) = v.parse() {
                self.processor.replication = Some(n);
            }
        }
        if let Some(v) = get("PROCESSOR_PARTITIONS") {
            if let Ok(n) = v.parse() {
                self.processor.partitions = Some(n);
            }
        }
        if let Some(v) = get("LOGGING_LEVEL") {
            self.logging.level = Some(v);
        }
        if let Some(v) = get("LOGGING_FORMAT") {
            self.logging.format = Some(v);
        }
    }

    pub fn port(&self) -> u16 {
        self.server.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.kafka.brokers.is_empty() {
            return Err(Error::Config("kafka.brokers is required".into()));
        }
        Ok(())
    }

    /// Processor defaults for the configured brokers, with explicit floors
    /// applied on top.
    pub fn processor_config(&self) -> ProcessorConfig {
        let mut cfg = ProcessorConfig::new(self.kafka.brokers.clone());
        if let Some(replication) = self.processor.replication {
            if replication > 0 {
                cfg = cfg.with_replication(replication);
            }
        }
        if let Some(partitions) = self.processor.partitions {
            if partitions > 0 {
                cfg = cfg.with_partitions(partitions);
            }
        }
        if let Some(path) = &self.processor.storage_path {
            if !path.is_empty() {
                cfg = cfg.with_storage_path(path.clone());
            }
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port(), DEFAULT_PORT);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars = env(&[
            ("SERVER_PORT", "8080"),
            ("KAFKA_BROKERS", "b1:9092, b2:9092"),
            ("PROCESSOR_STORAGEPATH", "/var/lib/alembic"),
            ("PROCESSOR_PARTITIONS", "4"),
            ("LOGGING_FORMAT", "TEXT"),
        ]);

        let mut config = Config::default();
        config.apply_env_overrides(|key| vars.get(key).cloned());

        assert_eq!(config.port(), 8080);
        assert_eq!(config.kafka.brokers, ["b1:9092", "b2:9092"]);
        assert_eq!(config.processor.storage_path.as_deref(), Some("/var/lib/alembic"));
        assert_eq!(config.processor.partitions, Some(4));
        assert_eq!(config.logging.format.as_deref(), Some("TEXT"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unparseable_env_values_are_ignored() {
        let vars = env(&[("SERVER_PORT", "not-a-port")]);
        let mut config = Config::default();
        config.apply_env_overrides(|key| vars.get(key).cloned());
        assert_eq!(config.port(), DEFAULT_PORT);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"{
                "server": { "port": 9999 },
                "kafka": { "brokers": ["k1:9092"] },
                "processor": { "storagePath": ":in-memory:", "replication": 1 },
                "logging": { "level": "DEBUG", "format": "JSON" }
            }"#,
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.port(), 9999);
        assert_eq!(config.kafka.brokers, ["k1:9092"]);
        assert_eq!(config.logging.level.as_deref(), Some("DEBUG"));

        let processor = config.processor_config();
        assert!(processor.in_memory());
        assert_eq!(processor.replication, 1);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Config::load(Some(Path::new("/nonexistent/alembic.json"))).is_err());
    }

    #[test]
    fn test_processor_floors_apply_only_when_positive() {
        let mut config = Config::default();
        config.kafka.brokers = vec!["b1:9092".into(), "b2:9092".into()];
        config.processor.replication = Some(0);
        config.processor.partitions = Some(3);

        let processor = config.processor_config();
        // A zero floor keeps the broker-derived default.
        assert_eq!(processor.replication, 2);
        assert_eq!(processor.partitions, 3);
    }
}
