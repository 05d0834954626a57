//! Archive registry: derives the desired set of archived streams from the
//! camera configuration topic.
//!
//! The desired set is shared with the process supervisor; the registry is
//! its only writer. Each pass drains whatever camera messages accumulated
//! in the topic cache and applies them; only the latest message per camera
//! matters, so arrival order between passes is irrelevant.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vigil_messaging::messages::CameraConfig;
use vigil_messaging::topic_store::{TopicMessages, TopicStore};

/// Only a camera's main stream is archived.
pub const MAIN_STREAM_SUFFIX: &str = "_main";

/// A stream that should currently be recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSpec {
    pub stream_uuid: String,
    pub retention_days: u32,
}

/// Desired archives keyed by stream UUID. Every access is a single map
/// operation under the lock; the lock is never held across I/O or spawns.
pub type DesiredArchives = Arc<Mutex<HashMap<String, ArchiveSpec>>>;

/// Outcome of evaluating one camera message.
#[derive(Debug)]
enum CameraDecision {
    /// Camera is on with retention configured: archive its main stream.
    Archive(ArchiveSpec),
    /// Camera is off, retention dropped to zero, or it has no main stream.
    Remove(String),
    /// Message did not parse; the desired set is left untouched.
    Invalid,
}

fn evaluate(camera_uuid: &str, payload: &[u8]) -> CameraDecision {
    let camera: CameraConfig = match serde_json::from_slice(payload) {
        Ok(camera) => camera,
        Err(e) => {
            warn!(camera_uuid, error = %e, "dropping unparseable camera message");
            return CameraDecision::Invalid;
        }
    };

    let stream_uuid = format!("{camera_uuid}{MAIN_STREAM_SUFFIX}");

    if !camera.is_on() || camera.archive_retention_days == 0 || camera.main_rtsp_url.is_empty() {
        CameraDecision::Remove(stream_uuid)
    } else {
        CameraDecision::Archive(ArchiveSpec {
            stream_uuid,
            retention_days: camera.archive_retention_days,
        })
    }
}

/// Apply every pending camera message to the desired set. Each message is
/// removed from the cache once handled, valid or not.
pub fn apply_pending(messages: &TopicMessages, desired: &DesiredArchives) {
    for camera_uuid in messages.keys() {
        let Some(payload) = messages.remove(&camera_uuid) else {
            continue;
        };
        if payload.is_empty() {
            continue;
        }

        match evaluate(&camera_uuid, &payload) {
            CameraDecision::Archive(spec) => {
                debug!(
                    stream_uuid = %spec.stream_uuid,
                    retention_days = spec.retention_days,
                    "archive in desired set"
                );
                desired.lock().insert(spec.stream_uuid.clone(), spec);
                metrics::counter!("manager.cameras.applied").increment(1);
            }
            CameraDecision::Remove(stream_uuid) => {
                if desired.lock().remove(&stream_uuid).is_some() {
                    info!(%stream_uuid, "archive removed from desired set");
                }
                metrics::counter!("manager.cameras.applied").increment(1);
            }
            CameraDecision::Invalid => {
                metrics::counter!("manager.cameras.unparseable").increment(1);
            }
        }
    }
}

/// Reconciliation loop: waits for the cameras topic to show up, then
/// drains it on a fixed interval until cancelled.
pub async fn run(
    store: Arc<TopicStore>,
    topic: String,
    desired: DesiredArchives,
    poll: Duration,
    shutdown: CancellationToken,
) {
    info!(%topic, "archive registry started");

    let Some(messages) = store.wait_for_topic(&topic, &shutdown).await else {
        return;
    };

    loop {
        apply_pending(&messages, &desired);

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(poll) => {}
        }
    }

    info!("archive registry stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn camera_message(status: u8, retention: u32) -> Vec<u8> {
        json!({
            "camera_uuid": "cam1",
            "main_rtsp_url": "rtsp://10.0.0.20:554/main",
            "status_code": status,
            "archive_retention_days": retention,
        })
        .to_string()
        .into_bytes()
    }

    fn desired() -> DesiredArchives {
        Arc::new(Mutex::new(HashMap::new()))
    }

    #[test]
    fn camera_on_with_retention_is_archived() {
        let store = TopicStore::new();
        store.upsert("cameras", "cam1", camera_message(1, 7));
        let desired = desired();

        apply_pending(&store.topic("cameras").unwrap(), &desired);

        let set = desired.lock();
        assert_eq!(set.len(), 1);
        let spec = set.get("cam1_main").unwrap();
        assert_eq!(spec.retention_days, 7);
    }

    #[test]
    fn only_the_latest_message_per_camera_counts() {
        let store = TopicStore::new();
        let desired = desired();
        let messages = store.register("cameras");

        // on → off within one pass: the cache holds only the off message.
        store.upsert("cameras", "cam1", camera_message(1, 7));
        store.upsert("cameras", "cam1", camera_message(0, 7));
        apply_pending(&messages, &desired);
        assert!(desired.lock().is_empty());

        // off → on across passes.
        store.upsert("cameras", "cam1", camera_message(1, 14));
        apply_pending(&messages, &desired);
        assert_eq!(desired.lock().get("cam1_main").unwrap().retention_days, 14);
    }

    #[test]
    fn zero_retention_removes_the_archive() {
        let store = TopicStore::new();
        let desired = desired();
        let messages = store.register("cameras");

        store.upsert("cameras", "cam1", camera_message(1, 7));
        apply_pending(&messages, &desired);
        assert_eq!(desired.lock().len(), 1);

        store.upsert("cameras", "cam1", camera_message(1, 0));
        apply_pending(&messages, &desired);
        assert!(desired.lock().is_empty());
    }

    #[test]
    fn missing_main_url_is_not_archived() {
        let store = TopicStore::new();
        let desired = desired();
        let payload = json!({
            "camera_uuid": "cam1",
            "status_code": 1,
            "archive_retention_days": 7,
        })
        .to_string()
        .into_bytes();
        store.upsert("cameras", "cam1", payload);

        apply_pending(&store.topic("cameras").unwrap(), &desired);
        assert!(desired.lock().is_empty());
    }

    #[test]
    fn unparseable_message_is_skipped_but_drained() {
        let store = TopicStore::new();
        let desired = desired();
        let messages = store.register("cameras");

        store.upsert("cameras", "cam1", camera_message(1, 7));
        apply_pending(&messages, &desired);

        store.upsert("cameras", "cam1", b"not json at all".to_vec());
        apply_pending(&messages, &desired);

        // The bad message is gone but the desired set is unchanged.
        assert!(messages.is_empty());
        assert_eq!(desired.lock().len(), 1);
    }

    #[test]
    fn pass_drains_every_handled_message() {
        let store = TopicStore::new();
        let desired = desired();
        let messages = store.register("cameras");

        store.upsert("cameras", "cam1", camera_message(1, 7));
        store.upsert("cameras", "cam2", camera_message(0, 0));
        apply_pending(&messages, &desired);

        assert!(messages.is_empty());
    }
}
