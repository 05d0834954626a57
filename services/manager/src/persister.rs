//! Offset persister: drains I-frame offset records from the bus cache into
//! PostgreSQL.
//!
//! Persistence is an idempotent upsert keyed by (stream, folder, file):
//! the first write inserts a single-element index array, conflicts append
//! to it. Re-delivered records append duplicate pairs; the index is a
//! superset, so seeks stay correct and no dedup key is kept.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use vigil_messaging::digest::{ServiceStatus, StatusHandle};
use vigil_messaging::messages::OffsetRecord;
use vigil_messaging::topic_store::{TopicMessages, TopicStore};

use crate::config::{ArchiveConfig, DatabaseConfig};

/// Sleep between drain passes when the offsets topic is idle.
const IDLE_POLL: Duration = Duration::from_millis(500);

/// Why a record was not persisted.
#[derive(Debug, PartialEq, Eq)]
enum Rejection {
    /// Field-level validation failed; worth a warning.
    Invalid(&'static str),
    /// Past the staleness window: superseded data, dropped quietly.
    Stale,
}

/// Validate a record against the persistence contract.
fn screen(record: &OffsetRecord, now_ms: i64, staleness_window: Duration) -> Result<(), Rejection> {
    if record.stream_uuid.is_empty() {
        return Err(Rejection::Invalid("empty stream_uuid"));
    }
    if record.timestamp <= 0 {
        return Err(Rejection::Invalid("non-positive timestamp"));
    }
    if record.folder < 0 || record.file < 0 || record.offset < 0 {
        return Err(Rejection::Invalid("negative folder, file, or offset"));
    }
    if now_ms - record.timestamp > staleness_window.as_millis() as i64 {
        return Err(Rejection::Stale);
    }
    Ok(())
}

/// PostgreSQL-backed store for I-frame byte offsets.
pub struct OffsetStore {
    pool: PgPool,
}

impl OffsetStore {
    /// Connect a pool with the configured limits.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Append one index pair to the fragment's row, creating the row on
    /// first write.
    #[instrument(
        skip(self, record),
        fields(stream_uuid = %record.stream_uuid, folder = record.folder, file = record.file)
    )]
    pub async fn append_offset(&self, record: &OffsetRecord) -> Result<()> {
        let entry = serde_json::json!([{
            "timestamp": record.timestamp,
            "offset": record.offset,
        }]);

        sqlx::query(
            r#"
            INSERT INTO iframe_byte_offsets (stream_uuid, folder, file, iframe_indexes)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (stream_uuid, folder, file)
            DO UPDATE SET iframe_indexes = iframe_byte_offsets.iframe_indexes || EXCLUDED.iframe_indexes
            "#,
        )
        .bind(&record.stream_uuid)
        .bind(record.folder)
        .bind(record.file)
        .bind(&entry)
        .execute(&self.pool)
        .await
        .context("Failed to upsert offset record")?;

        debug!(
            timestamp = record.timestamp,
            offset = record.offset,
            "offset appended"
        );

        Ok(())
    }
}

/// Drain loop around an [`OffsetStore`].
pub struct OffsetPersister {
    store: OffsetStore,
    attempts: u32,
    retry_delay: Duration,
    staleness_window: Duration,
    status: StatusHandle,
}

impl OffsetPersister {
    pub fn new(store: OffsetStore, archive: &ArchiveConfig, status: StatusHandle) -> Self {
        Self {
            store,
            attempts: archive.persist_attempts,
            retry_delay: Duration::from_millis(archive.persist_retry_delay_ms),
            staleness_window: Duration::from_secs(archive.staleness_window_secs.unsigned_abs()),
            status,
        }
    }

    /// Persist one record with bounded retry. The inter-attempt sleep is
    /// cancellable so shutdown never waits on a failing database.
    async fn persist(&self, record: &OffsetRecord, shutdown: &CancellationToken) -> bool {
        for attempt in 1..=self.attempts {
            match self.store.append_offset(record).await {
                Ok(()) => {
                    if self.status.get() == ServiceStatus::Degraded {
                        self.status.set(ServiceStatus::Ready);
                    }
                    return true;
                }
                Err(e) => warn!(attempt, error = %e, "offset write failed"),
            }

            if attempt < self.attempts {
                tokio::select! {
                    _ = shutdown.cancelled() => return false,
                    _ = tokio::time::sleep(self.retry_delay) => {}
                }
            }
        }

        error!(
            stream_uuid = %record.stream_uuid,
            timestamp = record.timestamp,
            attempts = self.attempts,
            "dropping offset record after repeated write failures"
        );
        self.status.set(ServiceStatus::Degraded);
        metrics::counter!("manager.offsets.failed").increment(1);
        false
    }

    /// One drain pass: every pending record is removed from the cache,
    /// screened, and either persisted or dropped.
    async fn drain(&self, messages: &TopicMessages, shutdown: &CancellationToken) {
        for key in messages.keys() {
            if shutdown.is_cancelled() {
                return;
            }

            let Some(payload) = messages.remove(&key) else {
                continue;
            };

            let record: OffsetRecord = match serde_json::from_slice(&payload) {
                Ok(record) => record,
                Err(e) => {
                    warn!(%key, error = %e, "dropping unparseable offset record");
                    metrics::counter!("manager.offsets.unparseable").increment(1);
                    continue;
                }
            };

            match screen(&record, Utc::now().timestamp_millis(), self.staleness_window) {
                Ok(()) => {
                    if self.persist(&record, shutdown).await {
                        metrics::counter!("manager.offsets.persisted").increment(1);
                    }
                }
                Err(Rejection::Invalid(reason)) => {
                    warn!(stream_uuid = %record.stream_uuid, reason, "rejecting offset record");
                    metrics::counter!("manager.offsets.rejected").increment(1);
                }
                Err(Rejection::Stale) => {
                    debug!(
                        stream_uuid = %record.stream_uuid,
                        timestamp = record.timestamp,
                        "dropping stale offset record"
                    );
                    metrics::counter!("manager.offsets.stale").increment(1);
                }
            }
        }
    }

    /// Wait for the offsets topic, then drain it until cancelled.
    pub async fn run(self, store: Arc<TopicStore>, topic: String, shutdown: CancellationToken) {
        info!(%topic, "offset persister started");

        let Some(messages) = store.wait_for_topic(&topic, &shutdown).await else {
            return;
        };

        loop {
            self.drain(&messages, &shutdown).await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(IDLE_POLL) => {}
            }
        }

        info!("offset persister stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(300);

    fn record() -> OffsetRecord {
        OffsetRecord {
            stream_uuid: "cam1_main".to_owned(),
            folder: 20_000,
            file: 600,
            timestamp: 1_700_000_000_000,
            offset: 4096,
        }
    }

    #[test]
    fn fresh_valid_record_passes() {
        let now = record().timestamp + 1_000;
        assert_eq!(screen(&record(), now, WINDOW), Ok(()));
    }

    #[test]
    fn empty_stream_uuid_is_invalid() {
        let mut r = record();
        r.stream_uuid.clear();
        assert_eq!(
            screen(&r, r.timestamp, WINDOW),
            Err(Rejection::Invalid("empty stream_uuid"))
        );
    }

    #[test]
    fn non_positive_timestamp_is_invalid() {
        let mut r = record();
        r.timestamp = 0;
        assert!(matches!(
            screen(&r, 1, WINDOW),
            Err(Rejection::Invalid(_))
        ));
    }

    #[test]
    fn negative_fields_are_invalid() {
        for field in 0..3 {
            let mut r = record();
            match field {
                0 => r.folder = -1,
                1 => r.file = -1,
                _ => r.offset = -1,
            }
            assert_eq!(
                screen(&r, r.timestamp, WINDOW),
                Err(Rejection::Invalid("negative folder, file, or offset"))
            );
        }
    }

    #[test]
    fn zero_offset_is_valid() {
        // The first index point of a fresh fragment sits at byte zero.
        let mut r = record();
        r.offset = 0;
        assert_eq!(screen(&r, r.timestamp, WINDOW), Ok(()));
    }

    #[test]
    fn record_past_the_staleness_window_is_dropped() {
        let r = record();
        // Ten minutes later than the record's timestamp.
        let now = r.timestamp + 10 * 60 * 1000;
        assert_eq!(screen(&r, now, WINDOW), Err(Rejection::Stale));
    }

    #[test]
    fn record_inside_the_staleness_window_is_kept() {
        let r = record();
        let now = r.timestamp + 4 * 60 * 1000;
        assert_eq!(screen(&r, now, WINDOW), Ok(()));
    }
}
