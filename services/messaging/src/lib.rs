//! Vigil messaging - bus layer for the camera archive platform.
//!
//! This library wraps the Kafka client behind the small surface the archive
//! services actually use:
//!
//! - A latest-value-per-key message cache ([`topic_store::TopicStore`]) fed
//!   by one consumer and drained by independent readers
//! - Keyed JSON production ([`producer::BusProducer`])
//! - Ordered per-stream packet consumption ([`consumer::BusConsumer`])
//! - Service digest heartbeats ([`digest`])

pub mod consumer;
pub mod digest;
pub mod messages;
pub mod producer;
pub mod topic_store;

// Re-export main types
pub use consumer::{BusConsumer, BusConsumerConfig, ConsumerError};
pub use digest::{ServiceDigest, ServiceIdentity, ServiceStatus, StatusHandle};
pub use messages::{CameraConfig, MediaPacket, OffsetRecord};
pub use producer::{BusProducer, BusProducerConfig, ProducerError};
pub use topic_store::{TopicMessages, TopicStore};
