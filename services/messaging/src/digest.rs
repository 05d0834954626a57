//! Service digest heartbeats.
//!
//! Every service periodically publishes a digest record on the system
//! digest topic, and immediately on every lifecycle transition, so the
//! platform can tell a healthy archive manager from a degraded one without
//! scraping logs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::producer::BusProducer;

/// Service lifecycle codes shared across the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ServiceStatus {
    Unknown = 100,
    Starting = 101,
    Ready = 102,
    Degraded = 103,
    Maintenance = 104,
    Stopping = 105,
    Stopped = 106,
    Error = 107,
}

impl ServiceStatus {
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Identity fields stamped on every digest a service emits.
#[derive(Debug, Clone)]
pub struct ServiceIdentity {
    pub service_uuid: String,
    pub service_name: String,
    pub service_version: String,
    pub endpoints: Vec<String>,
}

/// The digest record published on the system digest topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDigest {
    pub service_uuid: String,
    pub service_name: String,
    pub service_version: String,
    pub service_status_code: u32,
    pub endpoints: Vec<String>,
    /// Epoch milliseconds of the emission.
    pub last_heartbeat: u64,
}

/// Writable handle to the service's current status. Cloned into whichever
/// loop is allowed to change it; transitions wake the heartbeat loop.
#[derive(Clone)]
pub struct StatusHandle {
    tx: watch::Sender<ServiceStatus>,
}

impl StatusHandle {
    pub fn new() -> (Self, watch::Receiver<ServiceStatus>) {
        let (tx, rx) = watch::channel(ServiceStatus::Starting);
        (Self { tx }, rx)
    }

    pub fn set(&self, status: ServiceStatus) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            info!(status = ?status, code = status.code(), "service status changed");
        }
    }

    pub fn get(&self) -> ServiceStatus {
        *self.tx.borrow()
    }
}

fn build_digest(identity: &ServiceIdentity, status: ServiceStatus) -> ServiceDigest {
    ServiceDigest {
        service_uuid: identity.service_uuid.clone(),
        service_name: identity.service_name.clone(),
        service_version: identity.service_version.clone(),
        service_status_code: status.code(),
        endpoints: identity.endpoints.clone(),
        last_heartbeat: Utc::now().timestamp_millis() as u64,
    }
}

/// Publish one digest, keyed by the service UUID. Failures are logged and
/// swallowed: a missed heartbeat must never take a service down.
pub async fn send_digest(
    producer: &BusProducer,
    topic: &str,
    identity: &ServiceIdentity,
    status: ServiceStatus,
) {
    let digest = build_digest(identity, status);
    if let Err(e) = producer
        .send_json(topic, &identity.service_uuid, &digest)
        .await
    {
        warn!(error = %e, "failed to publish service digest");
    }
}

/// Heartbeat loop: emit immediately, then on every interval tick and on
/// every status transition, until cancelled.
pub async fn run_heartbeat(
    producer: Arc<BusProducer>,
    topic: String,
    identity: ServiceIdentity,
    mut status: watch::Receiver<ServiceStatus>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // the first tick completes at once

    info!(%topic, "service digest heartbeat started");

    loop {
        let current = *status.borrow_and_update();
        send_digest(&producer, &topic, &identity, current).await;

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!("service digest heartbeat stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_the_platform_contract() {
        assert_eq!(ServiceStatus::Unknown.code(), 100);
        assert_eq!(ServiceStatus::Starting.code(), 101);
        assert_eq!(ServiceStatus::Ready.code(), 102);
        assert_eq!(ServiceStatus::Degraded.code(), 103);
        assert_eq!(ServiceStatus::Stopping.code(), 105);
        assert_eq!(ServiceStatus::Stopped.code(), 106);
        assert_eq!(ServiceStatus::Error.code(), 107);
    }

    #[test]
    fn digest_carries_identity_and_status() {
        let identity = ServiceIdentity {
            service_uuid: "uuid-1".to_owned(),
            service_name: "vigil-manager".to_owned(),
            service_version: "0.1.0".to_owned(),
            endpoints: vec!["0.0.0.0:9090".to_owned()],
        };

        let digest = build_digest(&identity, ServiceStatus::Ready);
        assert_eq!(digest.service_uuid, "uuid-1");
        assert_eq!(digest.service_status_code, 102);
        assert!(digest.last_heartbeat > 0);

        let value = serde_json::to_value(&digest).unwrap();
        assert_eq!(value["service_name"], "vigil-manager");
        assert_eq!(value["service_status_code"], 102);
    }

    #[test]
    fn status_handle_only_reports_transitions() {
        let (handle, rx) = StatusHandle::new();
        assert_eq!(handle.get(), ServiceStatus::Starting);

        handle.set(ServiceStatus::Ready);
        assert_eq!(*rx.borrow(), ServiceStatus::Ready);

        // Setting the same status again is a no-op.
        handle.set(ServiceStatus::Ready);
        assert_eq!(handle.get(), ServiceStatus::Ready);
    }
}
