//! Train Crossing Recorder
//!
//! Watches the reference camera for the crossing sign, records every camera
//! while a train hides it, and publishes a notification for each finished
//! session.
//!
//! # Architecture
//!
//! ```text
//! Cameras -> CrossingPipeline -> SignDebouncer -> SessionWorker -> Kafka
//!                                                      ^
//!                                    EnrichmentFeed ───┘
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml)
//! 2. Environment variables (prefixed with CROSSWATCH_)
//!
//! See `config.rs` for detailed configuration options.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crosswatch::config::{read_sources, CrosswatchConfig, LoggingConfig, NotifierConfig};
use crosswatch::enrichment::{EnrichmentFeed, EnrichmentStore};
use crosswatch::media::MediaPipeline;
use crosswatch::notifier::{KafkaTransport, NotificationTransport, SessionPublisher};
use crosswatch::orchestrator::{
    spawn_stats_reporter, spawn_timeout_timer, Orchestrator, SessionWorker,
};
use crosswatch::pipeline::CrossingPipeline;
use crosswatch::recorder::RecordingManager;

const STATS_INTERVAL: Duration = Duration::from_secs(5);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "crosswatch",
        version = env!("CARGO_PKG_VERSION"),
        device = %config.notifier.device_name,
        "Starting train crossing recorder"
    );

    // Validate configuration
    config.validate()?;

    let sources = read_sources(
        Path::new(&config.media.sources_file),
        config.media.stream_count,
    )?;

    let result = run_service(config, sources).await;
    match result {
        Ok(()) => {
            info!("Crossing recorder completed successfully");
        }
        Err(e) => {
            error!(error = %e, "Crossing recorder failed");
            return Err(e);
        }
    }

    Ok(())
}

/// Load and validate configuration.
fn load_config() -> anyhow::Result<CrosswatchConfig> {
    // Try loading from files first, fall back to environment
    let config = CrosswatchConfig::load().or_else(|e| {
        warn!(error = %e, "Failed to load config from files, trying environment");
        CrosswatchConfig::from_env()
    })?;

    Ok(config)
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("crosswatch={}", level).parse()?)
        .add_directive("gstreamer=warn".parse()?)
        .add_directive("rdkafka=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);
    let fmt_layer = fmt::layer()
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    if config.format == "json" {
        subscriber.with(fmt_layer.json()).init();
    } else {
        subscriber.with(fmt_layer.pretty()).init();
    }

    Ok(())
}

/// Wire the components together and run until shutdown.
async fn run_service(config: CrosswatchConfig, sources: Vec<String>) -> anyhow::Result<()> {
    let enrichment = Arc::new(EnrichmentStore::new());
    let (orchestrator, commands) = Orchestrator::new(&config.detection);

    // Media pipeline; the probe callback feeds the debouncer on the
    // streaming thread.
    let frame_tap = orchestrator.clone();
    let pipeline = Arc::new(CrossingPipeline::new(
        &config.media,
        &sources,
        move |detections| frame_tap.on_reference_frame(detections),
    )?);

    let manager = Arc::new(RecordingManager::new(
        &config,
        pipeline.clone() as Arc<dyn MediaPipeline>,
        enrichment.clone(),
    ));

    // Notification transport; an unreachable broker at startup is not
    // fatal, the publisher reconnects per delivery attempt.
    let transport = Arc::new(KafkaTransport::new(config.kafka.clone()));
    connect_transport(transport.as_ref(), &config.notifier).await;
    let publisher = SessionPublisher::new(&config, transport.clone(), enrichment.clone());

    let worker = SessionWorker::new(
        &orchestrator,
        commands,
        manager.clone(),
        publisher,
        enrichment.clone(),
    );

    let feed = EnrichmentFeed::new(&config.kafka, enrichment.clone())?;
    feed.subscribe()?;

    let (shutdown_tx, _) = broadcast::channel(4);

    // Spawn the long-running tasks
    let worker_handle = tokio::spawn(worker.run());
    let feed_handle = tokio::spawn({
        let shutdown = shutdown_tx.subscribe();
        async move { feed.run(shutdown).await }
    });
    let timer_handle = spawn_timeout_timer(
        &orchestrator,
        config.recorder.timeout_check_interval(),
        shutdown_tx.subscribe(),
    );
    let stats_handle = spawn_stats_reporter(
        pipeline.clone(),
        manager.clone(),
        config.media.stream_names.clone(),
        STATS_INTERVAL,
        shutdown_tx.subscribe(),
    );

    let bus_handle = pipeline.spawn_bus_watch()?;
    pipeline.start()?;

    // Wait for shutdown signal
    signal::ctrl_c().await?;
    info!("Initiating graceful shutdown...");

    // Close any open session before tearing the pipeline down; the worker
    // drains and publishes it on the way out.
    orchestrator.request_shutdown();
    if let Err(e) = worker_handle.await {
        error!(error = %e, "Session worker join failed");
    }

    let _ = shutdown_tx.send(());
    let _ = timer_handle.await;
    let _ = stats_handle.await;
    let _ = feed_handle.await;

    if let Err(e) = transport.flush(FLUSH_TIMEOUT) {
        warn!(error = %e, "Producer flush failed during shutdown");
    }

    pipeline.shutdown();
    let _ = bus_handle.await;

    log_final_stats(&pipeline, &config.media.stream_names);
    info!("Shutdown complete");
    Ok(())
}

/// Connect the notification transport with exponential backoff.
async fn connect_transport(transport: &KafkaTransport, config: &NotifierConfig) {
    let mut backoff = ExponentialBackoff {
        initial_interval: config.connect_retry_interval(),
        max_elapsed_time: None,
        ..Default::default()
    };

    for attempt in 1..=config.connect_retries {
        match transport.connect().await {
            Ok(()) => {
                info!("Notification transport connected");
                return;
            }
            Err(e) => {
                if attempt == config.connect_retries {
                    warn!(
                        attempts = attempt,
                        error = %e,
                        "Kafka unreachable at startup, publisher will retry per session"
                    );
                    return;
                }
                if let Some(delay) = backoff.next_backoff() {
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Kafka connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Log final statistics on shutdown.
fn log_final_stats(pipeline: &CrossingPipeline, stream_names: &[String]) {
    info!("=== Final Statistics ===");

    for (index, frames) in pipeline.frame_counts().into_iter().enumerate() {
        let name = stream_names.get(index).map(String::as_str).unwrap_or("stream");
        info!(stream = name, frames, "Stream totals");
    }
}
