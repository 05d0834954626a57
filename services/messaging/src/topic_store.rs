//! Shared latest-value message cache.
//!
//! One bus consumer writes into the store; the registry and persister loops
//! read from it independently. Each topic holds the most recent payload per
//! message key, so slow readers observe the newest state rather than a
//! backlog.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How long to sleep between checks while waiting for a topic to appear.
const TOPIC_WAIT: Duration = Duration::from_millis(1000);

/// Latest-value cache for a single topic, keyed by message key.
///
/// Structural changes (new key, erase, key snapshot) go through the outer
/// lock; overwriting an existing entry's value only takes that entry's own
/// mutex. A reader draining one key therefore never blocks the bus consumer
/// for longer than a single value swap.
#[derive(Default)]
pub struct TopicMessages {
    entries: RwLock<HashMap<String, Arc<Mutex<Vec<u8>>>>>,
}

impl TopicMessages {
    /// Snapshot of the keys currently present. Keys inserted or removed
    /// after the snapshot is taken are picked up on the next pass.
    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Current value for a key, if any.
    pub fn read(&self, key: &str) -> Option<Vec<u8>> {
        let entry = self.entries.read().get(key).cloned()?;
        let value = entry.lock().clone();
        Some(value)
    }

    /// Remove a processed entry, returning its last value.
    pub fn remove(&self, key: &str) -> Option<Vec<u8>> {
        let entry = self.entries.write().remove(key)?;
        let value = entry.lock().clone();
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn upsert(&self, key: &str, payload: Vec<u8>) {
        // Fast path: the key exists, only its value mutex is needed.
        if let Some(entry) = self.entries.read().get(key).cloned() {
            *entry.lock() = payload;
            return;
        }

        let mut entries = self.entries.write();
        match entries.get(key) {
            // A reader removed and the consumer re-inserted concurrently;
            // whoever got the write lock first wins, the other overwrites.
            Some(entry) => *entry.lock() = payload,
            None => {
                entries.insert(key.to_owned(), Arc::new(Mutex::new(payload)));
            }
        }
    }
}

/// All subscribed topics, each with its own [`TopicMessages`] cache.
///
/// Absence of a topic means no subscription has been registered yet;
/// readers use [`TopicStore::wait_for_topic`] before treating a missing key
/// as "no data".
#[derive(Default)]
pub struct TopicStore {
    topics: RwLock<HashMap<String, Arc<TopicMessages>>>,
}

impl TopicStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the topic slot if missing and return it. Called by the bus
    /// consumer when it subscribes, before any message arrives.
    pub fn register(&self, topic: &str) -> Arc<TopicMessages> {
        if let Some(messages) = self.topics.read().get(topic).cloned() {
            return messages;
        }
        self.topics.write().entry(topic.to_owned()).or_default().clone()
    }

    /// Look up a topic's cache.
    pub fn topic(&self, topic: &str) -> Option<Arc<TopicMessages>> {
        self.topics.read().get(topic).cloned()
    }

    /// Store the latest value for a key within a topic.
    pub fn upsert(&self, topic: &str, key: &str, payload: Vec<u8>) {
        self.register(topic).upsert(key, payload);
    }

    /// Poll until the topic appears in the store. Returns `None` when the
    /// token fires first.
    pub async fn wait_for_topic(
        &self,
        topic: &str,
        shutdown: &CancellationToken,
    ) -> Option<Arc<TopicMessages>> {
        loop {
            if let Some(messages) = self.topic(topic) {
                return Some(messages);
            }

            debug!(topic, "waiting for topic to appear in the message store");

            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = tokio::time::sleep(TOPIC_WAIT) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_keeps_latest_value_per_key() {
        let store = TopicStore::new();
        store.upsert("cameras", "cam1", b"first".to_vec());
        store.upsert("cameras", "cam1", b"second".to_vec());
        store.upsert("cameras", "cam2", b"other".to_vec());

        let messages = store.topic("cameras").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages.read("cam1"), Some(b"second".to_vec()));
        assert_eq!(messages.read("cam2"), Some(b"other".to_vec()));
    }

    #[test]
    fn remove_drains_the_entry() {
        let store = TopicStore::new();
        store.upsert("offsets", "stream1", b"payload".to_vec());

        let messages = store.topic("offsets").unwrap();
        assert_eq!(messages.remove("stream1"), Some(b"payload".to_vec()));
        assert_eq!(messages.remove("stream1"), None);
        assert!(messages.is_empty());
    }

    #[test]
    fn missing_topic_is_distinguishable_from_empty_topic() {
        let store = TopicStore::new();
        assert!(store.topic("cameras").is_none());

        store.register("cameras");
        let messages = store.topic("cameras").unwrap();
        assert!(messages.is_empty());
    }

    #[test]
    fn keys_returns_a_snapshot() {
        let store = TopicStore::new();
        store.upsert("cameras", "a", vec![1]);
        store.upsert("cameras", "b", vec![2]);

        let messages = store.topic("cameras").unwrap();
        let mut keys = messages.keys();
        keys.sort();
        assert_eq!(keys, vec!["a".to_owned(), "b".to_owned()]);

        // Mutating after the snapshot does not invalidate it.
        messages.remove("a");
        assert_eq!(keys.len(), 2);
    }

    #[tokio::test]
    async fn wait_for_topic_returns_once_registered() {
        let store = Arc::new(TopicStore::new());
        let shutdown = CancellationToken::new();

        let waiter = {
            let store = store.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { store.wait_for_topic("cameras", &shutdown).await })
        };

        store.upsert("cameras", "cam1", vec![1]);
        let messages = waiter.await.unwrap();
        assert!(messages.is_some());
    }

    #[tokio::test]
    async fn wait_for_topic_stops_on_cancellation() {
        let store = TopicStore::new();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        assert!(store.wait_for_topic("never", &shutdown).await.is_none());
    }
}
