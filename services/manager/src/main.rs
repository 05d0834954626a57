//! Vigil archive manager.
//!
//! Keeps one recorder process running per actively-archived camera stream
//! and persists the random-access index those recorders produce.
//!
//! # Architecture
//!
//! ```text
//! cameras topic ─┐                       ┌─> recorder process (per stream)
//!                ├─> TopicStore ─> registry ─> supervisor ──┘
//! offsets topic ─┘        └──────> persister ─> PostgreSQL
//! ```
//!
//! One task per subsystem; recorders are independent OS processes, not
//! tasks. A single cancellation token stops every loop.

mod config;
mod persister;
mod registry;
mod supervisor;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use vigil_messaging::consumer::BusConsumer;
use vigil_messaging::digest::{self, ServiceIdentity, ServiceStatus, StatusHandle};
use vigil_messaging::producer::BusProducer;
use vigil_messaging::topic_store::TopicStore;

use config::Config;
use persister::{OffsetPersister, OffsetStore};
use supervisor::{RecorderCommand, Supervisor};

#[derive(Parser, Debug)]
#[command(name = "vigil-manager", version, about = "Vigil camera archive manager")]
struct Args {
    /// Path to the configuration file, shared with recorder processes
    #[arg(short, long, default_value = "config/vigil.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config).context("Failed to load configuration")?;
    init_tracing(&config.service.log_level, &config.service.log_format);
    config.validate().context("Invalid configuration")?;

    info!(
        service = %config.service.name,
        config = %args.config.display(),
        "Starting Vigil archive manager"
    );

    init_metrics(config.service.metrics_port)?;

    let identity = ServiceIdentity {
        service_uuid: Uuid::new_v4().to_string(),
        service_name: config.service.name.clone(),
        service_version: env!("CARGO_PKG_VERSION").to_string(),
        endpoints: vec![format!("0.0.0.0:{}", config.service.metrics_port)],
    };
    let (status, status_rx) = StatusHandle::new();

    let producer = Arc::new(
        BusProducer::new(&config.bus_producer_config())
            .context("Failed to create Kafka producer")?,
    );
    digest::send_digest(
        &producer,
        &config.kafka.topic_system_digest,
        &identity,
        ServiceStatus::Starting,
    )
    .await;

    let offset_store = OffsetStore::connect(&config.database)
        .await
        .context("Failed to connect to the offsets database")?;
    if config.database.run_migrations {
        offset_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let consumer =
        BusConsumer::new(&config.bus_consumer_config()).context("Failed to create Kafka consumer")?;

    let store = Arc::new(TopicStore::new());
    let desired = Arc::new(Mutex::new(HashMap::new()));
    let shutdown = CancellationToken::new();

    // Bus consumer: cameras and offsets topics into the shared cache.
    let consumer_handle = tokio::spawn({
        let store = store.clone();
        let topics = vec![
            config.kafka.topic_cameras.clone(),
            config.kafka.topic_iframe_offsets.clone(),
        ];
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = consumer.run_cached(store, &topics, shutdown).await {
                error!(error = %e, "bus consumer failed");
            }
        }
    });

    let registry_handle = tokio::spawn(registry::run(
        store.clone(),
        config.kafka.topic_cameras.clone(),
        desired.clone(),
        config.poll_interval(),
        shutdown.clone(),
    ));

    let launcher = RecorderCommand {
        bin: config.archive.recorder_bin.clone(),
        config_path: args.config.clone(),
    };
    let supervisor_handle = tokio::spawn(
        Supervisor::new(desired.clone(), launcher).run(config.poll_interval(), shutdown.clone()),
    );

    let persister = OffsetPersister::new(offset_store, &config.archive, status.clone());
    let persister_handle = tokio::spawn(persister.run(
        store.clone(),
        config.kafka.topic_iframe_offsets.clone(),
        shutdown.clone(),
    ));

    let heartbeat_handle = tokio::spawn(digest::run_heartbeat(
        producer.clone(),
        config.kafka.topic_system_digest.clone(),
        identity.clone(),
        status_rx,
        config.heartbeat_interval(),
        shutdown.clone(),
    ));

    status.set(ServiceStatus::Ready);
    info!("Archive manager started");

    shutdown_signal().await;

    info!("Shutting down archive manager");
    status.set(ServiceStatus::Stopping);
    digest::send_digest(
        &producer,
        &config.kafka.topic_system_digest,
        &identity,
        ServiceStatus::Stopping,
    )
    .await;
    shutdown.cancel();

    for handle in [
        consumer_handle,
        registry_handle,
        supervisor_handle,
        persister_handle,
        heartbeat_handle,
    ] {
        if let Err(e) = handle.await {
            warn!(error = %e, "task ended abnormally");
        }
    }

    digest::send_digest(
        &producer,
        &config.kafka.topic_system_digest,
        &identity,
        ServiceStatus::Stopped,
    )
    .await;

    info!("Archive manager stopped");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
