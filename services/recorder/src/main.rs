//! Vigil archive recorder.
//!
//! One recorder process per archived stream, started by the manager with
//! `vigil-recorder <stream_uuid> --config=<path>`. It consumes the
//! stream's packet topic in arrival order, appends payloads to
//! time-bucketed fragment files, and publishes an offset record for every
//! index point it writes.
//!
//! Packets are assumed to arrive in producer order (one partition per
//! stream topic); nothing here reorders or gap-detects. On SIGTERM the
//! open fragment is flushed and closed before exit.

mod config;
mod fragment;
mod nal;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vigil_messaging::consumer::BusConsumer;
use vigil_messaging::messages::{MediaPacket, OffsetRecord};
use vigil_messaging::producer::BusProducer;

use config::Config;
use fragment::FragmentWriter;

/// Bounded packet queue between the consumer and the writer; roughly ten
/// seconds of video at 30 fps.
const PACKET_QUEUE: usize = 300;

#[derive(Parser, Debug)]
#[command(name = "vigil-recorder", version, about = "Vigil per-stream archive recorder")]
struct Args {
    /// Stream identity, e.g. `<camera-uuid>_main`
    stream_uuid: String,
    /// Path to the configuration file shared with the manager
    #[arg(long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config).context("Failed to load configuration")?;
    init_tracing(&config.service.log_level, &config.service.log_format);
    config.validate().context("Invalid configuration")?;

    info!(
        stream_uuid = %args.stream_uuid,
        storage = %config.archive.storage_path.display(),
        fragment_secs = config.archive.fragment_length_secs,
        pid = std::process::id(),
        "Starting recorder"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let producer = Arc::new(
        BusProducer::new(&config.bus_producer_config(&args.stream_uuid))
            .context("Failed to create Kafka producer")?,
    );
    let consumer = BusConsumer::new(&config.bus_consumer_config(&args.stream_uuid))
        .context("Failed to create Kafka consumer")?;

    let topic = config.packet_topic(&args.stream_uuid);
    let (packet_tx, packet_rx) = mpsc::channel::<MediaPacket>(PACKET_QUEUE);

    let consumer_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        let topic = topic.clone();
        async move {
            if let Err(e) = consumer.run_packets(&topic, packet_tx, shutdown).await {
                error!(error = %e, "packet consumer failed");
            }
        }
    });

    let writer = FragmentWriter::new(
        &config.archive.storage_path,
        &args.stream_uuid,
        config.archive.fragment_length_secs,
    );

    run_writer(
        writer,
        packet_rx,
        &producer,
        &config,
        &args.stream_uuid,
        shutdown.clone(),
    )
    .await?;

    shutdown.cancel();
    if let Err(e) = consumer_handle.await {
        warn!(error = %e, "consumer task ended abnormally");
    }

    info!(stream_uuid = %args.stream_uuid, "Recorder stopped");
    Ok(())
}

/// Writer loop: drain the packet channel into the fragment writer and
/// publish an offset record per index point. Write errors are logged and
/// the loop keeps consuming; losing one packet beats losing the stream.
async fn run_writer(
    mut writer: FragmentWriter,
    mut packets: mpsc::Receiver<MediaPacket>,
    producer: &BusProducer,
    config: &Config,
    stream_uuid: &str,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut stats_ticker = tokio::time::interval(config.stats_interval());
    stats_ticker.tick().await; // the first tick completes at once

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = stats_ticker.tick() => {
                let stats = writer.stats();
                info!(
                    packets = stats.packets_written,
                    bytes = stats.bytes_written,
                    index_points = stats.index_points,
                    fragments = stats.fragments_opened,
                    "writer stats"
                );
            }
            packet = packets.recv() => {
                let Some(packet) = packet else { break };

                match writer.write_packet(&packet) {
                    Ok(Some(point)) => {
                        let record = OffsetRecord {
                            stream_uuid: stream_uuid.to_owned(),
                            folder: point.key.folder,
                            file: point.key.file,
                            timestamp: point.timestamp,
                            offset: point.offset,
                        };
                        if let Err(e) = producer
                            .send_json(&config.kafka.topic_iframe_offsets, stream_uuid, &record)
                            .await
                        {
                            warn!(error = %e, "failed to publish offset record");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(error = %e, timestamp = packet.timestamp, "failed to write packet");
                    }
                }
            }
        }
    }

    writer.close().context("Failed to close the open fragment")?;

    let stats = writer.stats();
    info!(
        packets = stats.packets_written,
        bytes = stats.bytes_written,
        index_points = stats.index_points,
        fragments = stats.fragments_opened,
        "final writer stats"
    );

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
