//! Tally Server Binary
//!
//! Usage metering over NATS JetStream: meters and readings live in KV
//! buckets, events flow through a single stream.

mod config;
mod error;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tally_common::VERSION;
use tally_messaging::{JetStreamChannel, JetStreamConfig};
use tally_store::{MeterRegistry, NatsKvBackend, ReadingStore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::TallyConfig;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = TallyConfig::load()?;
    init_tracing(config.log_json);

    info!("Starting Tally v{}", VERSION);
    info!("Loaded configuration: {:?}", config);

    // Broker and buckets
    let channel = JetStreamChannel::connect(
        &config.nats_url,
        JetStreamConfig {
            stream: config.stream.clone(),
            ..Default::default()
        },
    )
    .await?;
    let meters = NatsKvBackend::open(channel.client(), &config.meters_bucket).await?;
    let readings = NatsKvBackend::open(channel.client(), &config.readings_bucket).await?;

    let registry = MeterRegistry::new(Arc::new(meters));
    let readings = ReadingStore::new(Arc::new(readings))
        .with_max_update_attempts(config.readings.max_update_attempts);

    let shutdown = CancellationToken::new();
    let (service, orchestrator) = tally_engine::start(
        registry,
        readings,
        Arc::new(channel),
        config.consumer.orchestrator(),
        shutdown.clone(),
    )
    .await?;

    let addr: SocketAddr = format!("{}:{}", config.http.host, config.http.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
        info!("Received shutdown signal");
        signal.cancel();
    });

    let graceful = shutdown.clone();
    axum::serve(listener, routes::router(service))
        .with_graceful_shutdown(async move { graceful.cancelled().await })
        .await?;

    shutdown.cancel();
    orchestrator.await?;

    info!("Tally stopped");
    Ok(())
}
