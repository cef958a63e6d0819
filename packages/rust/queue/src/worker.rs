//! Queue worker: recover, claim, invoke engines, record the outcome.
//!
//! Each claimed item runs in its own task and commits its own result, so a
//! failing or hanging engine call only affects that item.

use std::sync::Arc;
use std::time::Duration;

use dealflow_shared::{QueueItem, Result, WorkerConfig};
use dealflow_storage::ClaimResult;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::coordinator::QueueCoordinator;
use crate::engine::{EngineRequest, EnrichmentEngine};

/// How often `run` sweeps out old and stale items.
const MAINTENANCE_EVERY: Duration = Duration::from_secs(60 * 60);

/// Summary of one [`Worker::run_once`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub reclaimed: usize,
    pub exhausted: usize,
    pub retried: usize,
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub throttled: bool,
}

/// Summary of one maintenance sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub finished_removed: u64,
    pub stale_removed: u64,
}

pub struct Worker {
    coordinator: Arc<QueueCoordinator>,
    engines: Arc<[Arc<dyn EnrichmentEngine>]>,
    config: WorkerConfig,
    engine_timeout: Duration,
}

impl Worker {
    pub fn new(
        coordinator: Arc<QueueCoordinator>,
        engines: Vec<Arc<dyn EnrichmentEngine>>,
        config: WorkerConfig,
        engine_timeout: Duration,
    ) -> Self {
        Self {
            coordinator,
            engines: engines.into(),
            config,
            engine_timeout,
        }
    }

    /// One poll: reclaim stuck items, re-queue retryable failures, claim a
    /// batch, and run every claimed item to completion.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<PassReport> {
        let queue = self.coordinator.config();
        let mut report = PassReport::default();

        let reclaim = self
            .coordinator
            .reclaim_stuck(queue.stuck_threshold_minutes, queue.max_attempts)
            .await?;
        report.reclaimed = reclaim.requeued.len();
        report.exhausted = reclaim.exhausted.len();
        report.retried = self.coordinator.retry_failed(queue.max_attempts).await?;

        let items = match self
            .coordinator
            .claim_batch(self.config.batch_size, self.config.max_concurrent)
            .await?
        {
            ClaimResult::Claimed(items) => items,
            ClaimResult::Throttled { .. } => {
                report.throttled = true;
                return Ok(report);
            }
        };
        report.claimed = items.len();

        let mut tasks = JoinSet::new();
        for item in items {
            let coordinator = Arc::clone(&self.coordinator);
            let engines = Arc::clone(&self.engines);
            let timeout = self.engine_timeout;
            tasks.spawn(async move { process_item(&coordinator, &engines, timeout, item).await });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(true) => report.completed += 1,
                Ok(false) => report.failed += 1,
                Err(e) => {
                    // The item stays processing; the stuck sweep recovers it.
                    error!(error = %e, "item task panicked");
                    report.failed += 1;
                }
            }
        }

        if report.claimed > 0 {
            info!(
                completed = report.completed,
                failed = report.failed,
                "pass finished"
            );
        }
        Ok(report)
    }

    /// Remove old finished items and never-claimed stale ones.
    pub async fn maintenance(&self) -> Result<MaintenanceReport> {
        let queue = self.coordinator.config();
        Ok(MaintenanceReport {
            finished_removed: self.coordinator.cleanup_old(queue.retention_days).await?,
            stale_removed: self
                .coordinator
                .cleanup_stale_queued(queue.stale_queued_days)
                .await?,
        })
    }

    /// Poll until `shutdown` flips to `true`. Pass errors are logged, not fatal.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            batch_size = self.config.batch_size,
            max_concurrent = self.config.max_concurrent,
            engines = self.engines.len(),
            "worker started"
        );
        let mut last_maintenance: Option<Instant> = None;

        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }
            if last_maintenance.is_none_or(|t| t.elapsed() >= MAINTENANCE_EVERY) {
                if let Err(e) = self.maintenance().await {
                    warn!(error = %e, "maintenance failed");
                }
                last_maintenance = Some(Instant::now());
            }

            if let Err(e) = self.run_once().await {
                warn!(error = %e, "worker pass failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("worker stopped");
        Ok(())
    }
}

/// Run every engine for `item` and record the outcome. Returns `true` when
/// the item completed.
#[instrument(skip_all, fields(id = %item.id, entity = %item.entity_id, attempt = item.attempts))]
async fn process_item(
    coordinator: &QueueCoordinator,
    engines: &[Arc<dyn EnrichmentEngine>],
    timeout: Duration,
    item: QueueItem,
) -> bool {
    let request = EngineRequest::for_item(&item);
    let mut errors = Vec::new();

    for engine in engines {
        match tokio::time::timeout(timeout, engine.invoke(&request)).await {
            Ok(Ok(response)) if response.success => {
                debug!(engine = engine.name(), "engine succeeded");
            }
            Ok(Ok(response)) => errors.push(format!(
                "{}: {}",
                engine.name(),
                response.error.as_deref().unwrap_or("reported failure")
            )),
            Ok(Err(e)) => errors.push(format!("{}: {e}", engine.name())),
            Err(_) => errors.push(format!(
                "{}: timed out after {}s",
                engine.name(),
                timeout.as_secs()
            )),
        }
    }

    let success = errors.is_empty();
    let message = errors.join("; ");
    let outcome = coordinator
        .complete_item(&item.id, success, (!success).then_some(message.as_str()))
        .await;

    match outcome {
        Ok(()) => success,
        Err(e) => {
            // Most likely reclaimed by another worker mid-run.
            warn!(error = %e, "could not record item outcome");
            false
        }
    }
}
