//! Kafka consumer wrapper.
//!
//! Two consumption shapes are supported, matching how the archive services
//! read the bus: a latest-value caching loop feeding a [`TopicStore`]
//! (configuration and offset topics) and an ordered packet loop feeding a
//! channel (one media stream per recorder process).

use std::sync::Arc;

use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::messages::MediaPacket;
use crate::topic_store::TopicStore;

/// Errors that can occur during message consumption
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    Creation(String),

    #[error("Failed to subscribe to topics {topics:?}: {message}")]
    Subscription { topics: Vec<String>, message: String },
}

/// Connection settings for a bus consumer, filled from service config.
#[derive(Debug, Clone)]
pub struct BusConsumerConfig {
    pub bootstrap_servers: String,
    pub group_id: String,
    pub client_id: String,
    /// "earliest" or "latest".
    pub auto_offset_reset: String,
    pub session_timeout_ms: u32,
}

/// Single-threaded bus consumer owned by one run loop.
pub struct BusConsumer {
    consumer: StreamConsumer,
}

impl BusConsumer {
    pub fn new(config: &BusConsumerConfig) -> Result<Self, ConsumerError> {
        info!(
            brokers = %config.bootstrap_servers,
            group = %config.group_id,
            "Creating Kafka consumer"
        );

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.group_id)
            .set("client.id", &config.client_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "true")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .create()
            .map_err(|e| ConsumerError::Creation(e.to_string()))?;

        Ok(Self { consumer })
    }

    fn subscribe(&self, topics: &[&str]) -> Result<(), ConsumerError> {
        info!(?topics, "Subscribing to topics");
        self.consumer
            .subscribe(topics)
            .map_err(|e| ConsumerError::Subscription {
                topics: topics.iter().map(|t| (*t).to_owned()).collect(),
                message: e.to_string(),
            })
    }

    /// Latest-value caching loop: every received message overwrites the
    /// store entry for its (topic, key). Keyless messages are dropped
    /// since the cache has nothing to key them by.
    pub async fn run_cached(
        self,
        store: Arc<TopicStore>,
        topics: &[String],
        shutdown: CancellationToken,
    ) -> Result<(), ConsumerError> {
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.subscribe(&topic_refs)?;
        for topic in topics {
            store.register(topic);
        }

        let mut stream = self.consumer.stream();
        info!("bus consumer started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                message = stream.next() => match message {
                    Some(Ok(message)) => {
                        let Some(key) = message.key().and_then(|k| std::str::from_utf8(k).ok())
                        else {
                            debug!(topic = message.topic(), "dropping message without a key");
                            continue;
                        };
                        let payload = message.payload().unwrap_or_default().to_vec();
                        store.upsert(message.topic(), key, payload);
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "bus consumer error");
                    }
                    None => break,
                }
            }
        }

        info!("bus consumer stopped");
        Ok(())
    }

    /// Ordered packet loop for one stream topic: decodes each envelope and
    /// forwards packets in arrival order. A full channel blocks consumption
    /// (backpressure) rather than dropping packets.
    pub async fn run_packets(
        self,
        topic: &str,
        packets: mpsc::Sender<MediaPacket>,
        shutdown: CancellationToken,
    ) -> Result<(), ConsumerError> {
        self.subscribe(&[topic])?;

        let mut stream = self.consumer.stream();
        info!(topic, "packet consumer started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                message = stream.next() => match message {
                    Some(Ok(message)) => {
                        let Some(payload) = message.payload() else { continue };
                        let packet = match serde_json::from_slice::<MediaPacket>(payload) {
                            Ok(packet) => packet,
                            Err(e) => {
                                warn!(topic, error = %e, "dropping unparseable media packet");
                                continue;
                            }
                        };
                        if packets.send(packet).await.is_err() {
                            // Writer side is gone; nothing left to feed.
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "packet consumer error");
                    }
                    None => break,
                }
            }
        }

        info!(topic, "packet consumer stopped");
        Ok(())
    }
}
