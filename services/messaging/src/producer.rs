//! Kafka producer wrapper.

use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

/// How long to wait for in-flight messages when the producer drops.
const DROP_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that can occur during message production
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Failed to create producer: {0}")]
    Creation(String),

    #[error("Failed to serialize message for topic {topic}: {message}")]
    Serialization { topic: String, message: String },

    #[error("Failed to deliver message to topic {topic}: {message}")]
    Delivery { topic: String, message: String },

    #[error("Producer flush timed out after {0:?}")]
    FlushTimeout(Duration),
}

/// Connection settings for a bus producer, filled from service config.
#[derive(Debug, Clone)]
pub struct BusProducerConfig {
    pub bootstrap_servers: String,
    pub client_id: String,
    /// Required acknowledgments: "0", "1", or "all".
    pub acks: String,
    pub message_timeout_ms: u32,
}

/// Keyed JSON producer shared by every emitting loop in a service.
pub struct BusProducer {
    producer: FutureProducer,
    delivery_timeout: Duration,
}

impl BusProducer {
    pub fn new(config: &BusProducerConfig) -> Result<Self, ProducerError> {
        info!(
            brokers = %config.bootstrap_servers,
            client_id = %config.client_id,
            "Creating Kafka producer"
        );

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("client.id", &config.client_id)
            .set("acks", &config.acks)
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .create()
            .map_err(|e| ProducerError::Creation(e.to_string()))?;

        Ok(Self {
            producer,
            delivery_timeout: Duration::from_millis(u64::from(config.message_timeout_ms)),
        })
    }

    /// Serialize `value` as JSON and send it keyed under `key`, waiting for
    /// delivery confirmation.
    pub async fn send_json<T: Serialize>(
        &self,
        topic: &str,
        key: &str,
        value: &T,
    ) -> Result<(), ProducerError> {
        let payload = serde_json::to_vec(value).map_err(|e| ProducerError::Serialization {
            topic: topic.to_owned(),
            message: e.to_string(),
        })?;

        let record = FutureRecord::to(topic).key(key).payload(&payload);

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.delivery_timeout))
            .await
            .map_err(|(e, _)| ProducerError::Delivery {
                topic: topic.to_owned(),
                message: e.to_string(),
            })?;

        debug!(topic, key, partition, offset, "message delivered");

        Ok(())
    }

    /// Flush all pending messages.
    pub fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|_| ProducerError::FlushTimeout(timeout))
    }
}

impl Drop for BusProducer {
    fn drop(&mut self) {
        if let Err(e) = self.flush(DROP_FLUSH_TIMEOUT) {
            warn!("Failed to flush producer on shutdown: {}", e);
        }
    }
}
