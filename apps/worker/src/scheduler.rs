//! Background scheduler for periodic price refreshes and retention cleanup.
//!
//! Waits a short initial delay, then refreshes the configured card list on a
//! fixed interval until the cancellation token fires. A second loop prunes
//! stale price rows once a week.

use std::sync::Arc;
use std::time::Duration;

use cardprice_ingest::{IngestError, IngestionPipeline, IngestionResult, PriceQuery};
use cardprice_storage_sqlite::SqlitePriceStore;
use chrono::Utc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Initial delay before the first refresh, so startup logs settle first.
const INITIAL_DELAY_SECS: u64 = 5;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Runs the refresh loop until `cancel` fires.
pub async fn run(
    pipeline: Arc<IngestionPipeline>,
    query: PriceQuery,
    every: Duration,
    cancel: CancellationToken,
) {
    info!(
        "Price refresh scheduler started ({} card(s), {}s interval)",
        query.cards.len(),
        every.as_secs()
    );

    tokio::select! {
        _ = cancel.cancelled() => {
            info!("Price refresh scheduler stopped before the first run");
            return;
        }
        _ = tokio::time::sleep(Duration::from_secs(INITIAL_DELAY_SECS)) => {}
    }

    // First tick is immediate, subsequent ticks are `every` apart
    let mut refresh_interval = interval(every);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = refresh_interval.tick() => {}
        }
        run_refresh(&pipeline, &query, &cancel).await;
    }

    info!("Price refresh scheduler stopped");
}

/// Runs a single refresh across every source that has a client.
pub async fn run_refresh(
    pipeline: &IngestionPipeline,
    query: &PriceQuery,
    cancel: &CancellationToken,
) -> Option<IngestionResult> {
    let sources = pipeline.available_sources();
    if sources.is_empty() {
        warn!("Scheduled refresh skipped: no price sources available");
        return None;
    }

    info!("Running scheduled price refresh...");
    let result = match pipeline.ingest(&sources, query, cancel).await {
        Ok(result) => result,
        Err(IngestError::Cancelled) => {
            info!("Scheduled refresh cancelled before it started");
            return None;
        }
        Err(e) => {
            error!("Scheduled refresh failed: {}", e);
            return None;
        }
    };

    info!(
        "Scheduled refresh completed: {} stored, {} skipped, {} of {} source(s) failed",
        result.stored,
        result.skipped_invalid,
        result.failed_sources.len(),
        result.requested
    );
    for failed in &result.failed_sources {
        warn!(
            "Source '{}' failed ({:?}): {}",
            failed.source, failed.kind, failed.message
        );
    }
    for health in pipeline.registry().health() {
        info!(
            "Source '{}': circuit {}, {} consecutive failure(s), {} request(s) left in window",
            health.source, health.state, health.consecutive_failures, health.remaining_requests
        );
    }
    if let Ok(summary) = serde_json::to_string(&result) {
        debug!("Refresh result: {}", summary);
    }

    Some(result)
}

/// Prunes rows older than `retention_days` now and then weekly, until `cancel` fires.
pub async fn run_retention(
    store: Arc<SqlitePriceStore>,
    retention_days: u32,
    cancel: CancellationToken,
) {
    info!("Price retention cleanup started (keeping {} day(s))", retention_days);
    let keep = chrono::Duration::days(i64::from(retention_days));
    let mut cleanup_interval = interval(CLEANUP_INTERVAL);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = cleanup_interval.tick() => {}
        }
        run_cleanup(&store, keep).await;
    }

    info!("Price retention cleanup stopped");
}

/// Deletes price rows last written more than `keep` ago.
pub async fn run_cleanup(store: &SqlitePriceStore, keep: chrono::Duration) -> Option<usize> {
    let cutoff = Utc::now() - keep;
    match store.delete_before(cutoff).await {
        Ok(deleted) => {
            info!(
                "Retention cleanup removed {} price row(s) older than {}",
                deleted,
                cutoff.to_rfc3339()
            );
            Some(deleted)
        }
        Err(e) => {
            error!("Retention cleanup failed: {}", e);
            None
        }
    }
}
