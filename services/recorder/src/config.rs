use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;

use vigil_messaging::consumer::BusConsumerConfig;
use vigil_messaging::producer::BusProducerConfig;

/// Recorder configuration. The recorder reads the same file as the manager
/// that started it and deserializes only the sections it needs.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Kafka configuration
    pub kafka: KafkaConfig,
    /// Archive configuration
    pub archive: ArchiveConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log format: "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Seconds between stats log lines
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

/// Kafka connection and topic configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// Consumer group shared by all recorder processes
    #[serde(default = "default_group_id")]
    pub recorder_group_id: String,
    /// Topic carrying I-frame byte offset records
    #[serde(default = "default_topic_iframe_offsets")]
    pub topic_iframe_offsets: String,
    /// Prefix for per-stream media packet topics
    #[serde(default = "default_topic_packets_prefix")]
    pub topic_packets_prefix: String,
    /// Auto offset reset policy
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    /// Required acknowledgments for produced messages
    #[serde(default = "default_acks")]
    pub acks: String,
    /// Delivery timeout for produced messages in milliseconds
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u32,
}

/// Archive configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// Root directory for fragment files; must exist
    pub storage_path: PathBuf,
    /// Fragment length in seconds
    #[serde(default = "default_fragment_length_secs")]
    pub fragment_length_secs: i64,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_stats_interval_secs() -> u64 {
    60
}

fn default_group_id() -> String {
    "vigil-recorders".to_string()
}

fn default_topic_iframe_offsets() -> String {
    "vigil.iframe.offsets".to_string()
}

fn default_topic_packets_prefix() -> String {
    "vigil.packets.".to_string()
}

fn default_auto_offset_reset() -> String {
    "latest".to_string()
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_message_timeout_ms() -> u32 {
    10000
}

fn default_fragment_length_secs() -> i64 {
    300
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

impl Config {
    /// Load configuration from the given file, with `VIGIL__`-prefixed
    /// environment overrides.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("VIGIL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("failed to read {}", path.display()))?;

        config.try_deserialize().map_err(Into::into)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.archive.storage_path.is_dir() {
            bail!(
                "archive.storage_path '{}' is not an existing directory",
                self.archive.storage_path.display()
            );
        }
        if self.archive.fragment_length_secs <= 0 || self.archive.fragment_length_secs > 86_400 {
            bail!(
                "archive.fragment_length_secs must be within 1..=86400, got {}",
                self.archive.fragment_length_secs
            );
        }
        Ok(())
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.service.stats_interval_secs.max(1))
    }

    /// Topic carrying this stream's media packets.
    pub fn packet_topic(&self, stream_uuid: &str) -> String {
        format!("{}{}", self.kafka.topic_packets_prefix, stream_uuid)
    }

    pub fn bus_consumer_config(&self, stream_uuid: &str) -> BusConsumerConfig {
        BusConsumerConfig {
            bootstrap_servers: self.kafka.bootstrap_servers.clone(),
            group_id: self.kafka.recorder_group_id.clone(),
            client_id: format!("vigil-recorder-{stream_uuid}"),
            auto_offset_reset: self.kafka.auto_offset_reset.clone(),
            session_timeout_ms: self.kafka.session_timeout_ms,
        }
    }

    pub fn bus_producer_config(&self, stream_uuid: &str) -> BusProducerConfig {
        BusProducerConfig {
            bootstrap_servers: self.kafka.bootstrap_servers.clone(),
            client_id: format!("vigil-recorder-{stream_uuid}"),
            acks: self.kafka.acks.clone(),
            message_timeout_ms: self.kafka.message_timeout_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_fragment_length_secs(), 300);
        assert_eq!(default_group_id(), "vigil-recorders");
        assert_eq!(default_auto_offset_reset(), "latest");
    }

    #[test]
    fn packet_topic_uses_the_prefix() {
        let kafka = KafkaConfig {
            bootstrap_servers: "localhost:9092".to_owned(),
            recorder_group_id: default_group_id(),
            topic_iframe_offsets: default_topic_iframe_offsets(),
            topic_packets_prefix: default_topic_packets_prefix(),
            auto_offset_reset: default_auto_offset_reset(),
            session_timeout_ms: default_session_timeout_ms(),
            acks: default_acks(),
            message_timeout_ms: default_message_timeout_ms(),
        };
        let config = Config {
            service: ServiceConfig::default(),
            kafka,
            archive: ArchiveConfig {
                storage_path: PathBuf::from("/var/lib/vigil"),
                fragment_length_secs: 300,
            },
        };

        assert_eq!(config.packet_topic("cam1_main"), "vigil.packets.cam1_main");
    }
}
