use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use race_strategy_aggregator::aggregator::{Aggregator, TriggerPolicy};
use race_strategy_aggregator::cache::LatestValueCache;
use race_strategy_aggregator::config::Config;
use race_strategy_aggregator::metrics::{self, Metrics};
use race_strategy_aggregator::source::{Overtake, SourceConnection, TireCliff, Undercut};
use race_strategy_aggregator::strategy::StrategyClient;
use race_strategy_aggregator::types::{SOURCE_COUNT, Snapshot, SourceId};

/// Capacity of the mpsc channel between the source connections and the aggregator.
const SNAPSHOT_CHANNEL_CAPACITY: usize = 16 * SOURCE_COUNT;

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, listening for ctrl+c only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    info!(
        period = config.period,
        window = ?config.window_policy,
        strategy_url = %config.strategy_url,
        http_port = config.port,
        "starting race strategy aggregator"
    );

    // Fail fast on an unusable cache or a taken port, before any stream opens.
    let cache = Arc::new(LatestValueCache::open(&config.cache_path)?);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;

    let cancel = CancellationToken::new();
    let metrics = Arc::new(Metrics::default());

    let aggregator = Aggregator::new(
        TriggerPolicy::new(config.period, config.window_policy),
        Arc::clone(&cache),
        StrategyClient::new(config.strategy_url.clone(), config.strategy_timeout()),
        Arc::clone(&metrics),
        cancel.clone(),
    );
    aggregator.restore_from_cache();
    let presentation = aggregator.presentation();
    let tracker = aggregator.tracker();

    let (snapshot_tx, snapshot_rx) = mpsc::channel::<Snapshot>(SNAPSHOT_CHANNEL_CAPACITY);
    let reconnect = !config.no_reconnect;

    let overtake = SourceConnection::new(Overtake, &config.overtake_url, metrics.source(SourceId::Overtake))
        .reconnect(reconnect)
        .open(snapshot_tx.clone(), &cancel);
    let tire_cliff = SourceConnection::new(TireCliff, &config.tire_cliff_url, metrics.source(SourceId::TireCliff))
        .reconnect(reconnect)
        .open(snapshot_tx.clone(), &cancel);
    let undercut = SourceConnection::new(Undercut, &config.undercut_url, metrics.source(SourceId::Undercut))
        .reconnect(reconnect)
        .open(snapshot_tx, &cancel);

    let aggregator_handle = tokio::spawn(aggregator.run(snapshot_rx));

    let http_handle = {
        let cancel = cancel.clone();
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            metrics::serve_http(listener, metrics, presentation, cancel).await;
        })
    };

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("received shutdown signal, draining");
            cancel.cancel();
        });
    }

    // Sources run until shutdown, or until they all end with reconnect off.
    // A failed initial subscription stops only that source.
    let (overtake, tire_cliff, undercut) =
        tokio::join!(overtake.join(), tire_cliff.join(), undercut.join());
    let sources: Result<(), _> = [overtake, tire_cliff, undercut].into_iter().collect();
    if sources.is_err() {
        error!("at least one source never subscribed");
    }

    if let Err(e) = aggregator_handle.await {
        error!(error = %e, "aggregator task failed");
    }

    if tokio::time::timeout(config.shutdown_grace(), tracker.wait()).await.is_err() {
        warn!(
            grace_secs = config.shutdown_grace_secs,
            "strategy computations still in flight at shutdown"
        );
    }
    cancel.cancel();
    let _ = http_handle.await;

    info!("shutdown complete");
    sources?;
    Ok(())
}
