use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;

use vigil_messaging::consumer::BusConsumerConfig;
use vigil_messaging::producer::BusProducerConfig;

/// Main configuration for the archive manager. The same file is handed to
/// every recorder process it starts.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,
    /// Kafka configuration
    pub kafka: KafkaConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Archive configuration
    pub archive: ArchiveConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging and digests
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log format: "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Prometheus metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// Seconds between service digest heartbeats
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

/// Kafka connection and topic configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// Consumer group ID
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Client ID reported to the brokers
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Topic for service digest heartbeats
    #[serde(default = "default_topic_system_digest")]
    pub topic_system_digest: String,
    /// Compacted topic with per-camera configuration
    #[serde(default = "default_topic_cameras")]
    pub topic_cameras: String,
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

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// Archive and supervision configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// Root directory for fragment files; must exist
    pub storage_path: PathBuf,
    /// Fragment length in seconds
    #[serde(default = "default_fragment_length_secs")]
    pub fragment_length_secs: i64,
    /// Recorder binary started per archived stream
    #[serde(default = "default_recorder_bin")]
    pub recorder_bin: PathBuf,
    /// Milliseconds between reconciliation passes
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Offset records older than this are dropped
    #[serde(default = "default_staleness_window_secs")]
    pub staleness_window_secs: i64,
    /// Attempts per offset record before it is dropped
    #[serde(default = "default_persist_attempts")]
    pub persist_attempts: u32,
    /// Fixed delay between persistence attempts in milliseconds
    #[serde(default = "default_persist_retry_delay_ms")]
    pub persist_retry_delay_ms: u64,
}

// Default value functions
fn default_service_name() -> String {
    "vigil-manager".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

fn default_group_id() -> String {
    "vigil-managers".to_string()
}

fn default_client_id() -> String {
    "vigil-manager".to_string()
}

fn default_topic_system_digest() -> String {
    "vigil.system.digest".to_string()
}

fn default_topic_cameras() -> String {
    "vigil.cameras".to_string()
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

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_run_migrations() -> bool {
    true
}

fn default_fragment_length_secs() -> i64 {
    300
}

fn default_recorder_bin() -> PathBuf {
    PathBuf::from("vigil-recorder")
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_staleness_window_secs() -> i64 {
    300 // 5 minutes
}

fn default_persist_attempts() -> u32 {
    5
}

fn default_persist_retry_delay_ms() -> u64 {
    1000
}

impl Config {
    /// Load configuration from the given file, with `VIGIL__`-prefixed
    /// environment overrides (VIGIL__KAFKA__BOOTSTRAP_SERVERS, ...).
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

    /// Cross-field checks that serde defaults cannot express.
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
        if self.archive.poll_interval_ms == 0 {
            bail!("archive.poll_interval_ms must be positive");
        }
        if self.archive.persist_attempts == 0 {
            bail!("archive.persist_attempts must be positive");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.archive.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.service.heartbeat_interval_secs)
    }

    pub fn bus_consumer_config(&self) -> BusConsumerConfig {
        BusConsumerConfig {
            bootstrap_servers: self.kafka.bootstrap_servers.clone(),
            group_id: self.kafka.group_id.clone(),
            client_id: self.kafka.client_id.clone(),
            auto_offset_reset: self.kafka.auto_offset_reset.clone(),
            session_timeout_ms: self.kafka.session_timeout_ms,
        }
    }

    pub fn bus_producer_config(&self) -> BusProducerConfig {
        BusProducerConfig {
            bootstrap_servers: self.kafka.bootstrap_servers.clone(),
            client_id: self.kafka.client_id.clone(),
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
        assert_eq!(default_staleness_window_secs(), 300);
        assert_eq!(default_persist_attempts(), 5);
        assert_eq!(default_poll_interval_ms(), 1000);
        assert_eq!(default_heartbeat_interval_secs(), 10);
    }
}
