//! NetMonitor - network endpoint monitoring service.

use netmonitor::aggregate::Aggregator;
use netmonitor::config::{ServerConfig, Snapshot, SnapshotWatcher};
use netmonitor::manual::ManualRunController;
use netmonitor::probe::ProbeRegistry;
use netmonitor::scheduler::{ResultPipeline, Scheduler, SchedulerOptions};
use netmonitor::sink::{spawn_batch_writer, JsonLinesSink};
use netmonitor::web::{AppState, Server};

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Late results for a just-ended window are still accepted for this long.
const AGGREGATION_GRACE: Duration = Duration::from_secs(5);
const CLOSE_CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// Closed windows stay readable by the API for this long after they end.
const CLOSED_RETENTION_HOURS: i64 = 48;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("netmonitor=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting NetMonitor on port {}...", cfg.http_port);
    tracing::info!("Using endpoint configuration at {}", cfg.config_path.display());

    let snapshot = Snapshot::load(&cfg.config_path)?.into_shared();

    let aggregator = Arc::new(Aggregator::with_grace(AGGREGATION_GRACE));
    aggregator.assign_regions(&snapshot.load());

    // Result storage
    let (tx, rx) = mpsc::channel(1000);
    let writer = spawn_batch_writer(rx, Arc::new(JsonLinesSink::new(&cfg.results_path)));
    tracing::info!("Writing results to {}", cfg.results_path.display());

    let pipeline = ResultPipeline::new(aggregator.clone(), tx);
    let registry = Arc::new(ProbeRegistry::with_defaults());

    let scheduler = Arc::new(Scheduler::new(
        registry.clone(),
        pipeline.clone(),
        SchedulerOptions {
            workers: cfg.workers,
            ..Default::default()
        },
    ));
    scheduler.start(&snapshot.load())?;

    let manual = Arc::new(ManualRunController::new(registry, snapshot.clone(), pipeline, cfg.manual_workers));

    let shutdown = CancellationToken::new();

    // Config reload
    let (watcher, mut reloads) = SnapshotWatcher::new(&cfg.config_path)?;
    let reload_task = tokio::spawn({
        let scheduler = scheduler.clone();
        let snapshot = snapshot.clone();
        let aggregator = aggregator.clone();
        async move {
            while let Some(next) = reloads.recv().await {
                match scheduler.apply_snapshot(&next) {
                    Ok(diff) => {
                        tracing::info!(
                            "Applied config reload: {} added, {} removed, {} modified",
                            diff.added.len(),
                            diff.removed.len(),
                            diff.modified.len()
                        );
                        for id in &diff.removed {
                            aggregator.invalidate_endpoint(id);
                        }
                        aggregator.assign_regions(&next);
                        snapshot.store(Arc::new(next));
                    }
                    Err(e) => tracing::error!("Config reload rejected: {}", e),
                }
            }
        }
    });

    // Window closing
    tokio::spawn({
        let aggregator = aggregator.clone();
        let shutdown = shutdown.clone();
        async move {
            let mut ticker = tokio::time::interval(CLOSE_CHECK_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => break,
                }
                let now = Utc::now();
                let closed = aggregator.close_elapsed(now);
                if closed > 0 {
                    tracing::info!("Closed {} aggregation windows", closed);
                }
                let cutoff = now - chrono::Duration::hours(CLOSED_RETENTION_HOURS);
                for bucket in aggregator.take_closed_before(cutoff) {
                    tracing::debug!(
                        endpoint = %bucket.endpoint_id,
                        period = %bucket.period,
                        start = %bucket.bucket_start,
                        tests = bucket.stats.test_count,
                        availability = ?bucket.stats.availability_pct,
                        avg_latency_ms = bucket.stats.avg_latency_ms,
                        "Expired aggregation window"
                    );
                }
            }
        }
    });

    // Start web server
    let server = Server::new(AppState {
        config: cfg,
        snapshot,
        aggregator,
        scheduler: scheduler.clone(),
        manual,
    });
    let signal = shutdown.clone();
    server
        .start(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown requested");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    scheduler.stop().await?;

    // The writer exits once every pipeline clone is gone
    drop(watcher);
    reload_task.abort();
    let _ = reload_task.await;
    drop(server);
    drop(scheduler);
    if tokio::time::timeout(Duration::from_secs(5), writer).await.is_err() {
        tracing::warn!("Result writer did not finish flushing in time");
    }

    Ok(())
}
