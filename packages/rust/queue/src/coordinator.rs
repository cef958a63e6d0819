//! Queue Lifecycle Coordinator.
//!
//! Gates enrichment triggers (block-until, per-reason cooldowns, bulk cap),
//! and drives queue items through `queued → processing → completed|failed`,
//! reclaiming stuck items and retrying failures with bounded attempts.
//!
//! "At most one active attempt per entity" is enforced by the claim, not by
//! enqueue: several queued items for one entity may coexist.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dealflow_shared::{
    Clock, DealflowError, EligibilityDecision, EntityId, FundId, QueueConfig, QueueItem,
    QueuePriority, QueueStatus, Result, TriggerReason,
};
use dealflow_storage::{ClaimResult, Storage};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Result of one stuck-item sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReclaimReport {
    /// Items put back in `queued`.
    pub requeued: Vec<String>,
    /// Items failed because their attempts ran out.
    pub exhausted: Vec<String>,
}

/// Item counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Coordinates admission, claiming, completion and recovery of queue items.
pub struct QueueCoordinator {
    storage: Arc<Storage>,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
}

impl QueueCoordinator {
    pub fn new(storage: Arc<Storage>, config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            config,
            clock,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // -----------------------------------------------------------------------
    // Admission control
    // -----------------------------------------------------------------------

    /// Decide whether `reason` may trigger enrichment for `entity_id` now.
    ///
    /// Denies while the entity is blocked or the reason's cooldown has not
    /// elapsed since its last grant. A grant is recorded, so a second check
    /// inside the cooldown window is denied.
    #[instrument(skip(self), fields(entity = %entity_id, reason = %reason))]
    pub async fn check_eligibility(
        &self,
        entity_id: &EntityId,
        reason: TriggerReason,
        user_id: Option<&str>,
    ) -> Result<EligibilityDecision> {
        let decision = self.evaluate_eligibility(entity_id, reason).await?;
        if decision.allowed {
            self.storage
                .record_trigger(entity_id, reason, user_id, self.clock.now())
                .await?;
        }
        Ok(decision)
    }

    /// [`check_eligibility`](Self::check_eligibility) without recording the
    /// grant. Pair an allowed decision with
    /// [`enqueue_granted`](Self::enqueue_granted).
    pub async fn evaluate_eligibility(
        &self,
        entity_id: &EntityId,
        reason: TriggerReason,
    ) -> Result<EligibilityDecision> {
        let now = self.clock.now();
        let priority = self.config.priority_for(reason);

        if let Some((until, why)) = self.storage.get_block(entity_id).await? {
            if until > now {
                let mut message = format!(
                    "Enrichment is paused for this deal until {}",
                    until.format("%Y-%m-%d %H:%M UTC")
                );
                if let Some(why) = why.filter(|w| !w.trim().is_empty()) {
                    message.push_str(&format!(" ({why})"));
                }
                debug!(entity = %entity_id, %until, "denied: entity blocked");
                return Ok(EligibilityDecision::deny(message, priority));
            }
        }

        let cooldown = self.config.cooldown(reason);
        if cooldown > Duration::zero() {
            if let Some(last) = self.storage.last_trigger(entity_id, reason).await? {
                let elapsed = now - last;
                if elapsed < cooldown {
                    let message = format!(
                        "This deal was already queued for {} {} ago. Try again in {}.",
                        describe_reason(reason),
                        humanize(elapsed),
                        humanize(cooldown - elapsed)
                    );
                    debug!(entity = %entity_id, %last, "denied: cooldown active");
                    return Ok(EligibilityDecision::deny(message, priority));
                }
            }
        }

        Ok(EligibilityDecision::allow(
            priority,
            self.config.delay_for(reason),
        ))
    }

    /// Eligibility for a bulk submission.
    ///
    /// Entities past the batch cap are denied; the rest are checked as
    /// [`TriggerReason::Bulk`] and staggered so they do not land at once.
    /// Grants are recorded as for [`check_eligibility`](Self::check_eligibility).
    #[instrument(skip(self, entity_ids), fields(count = entity_ids.len()))]
    pub async fn check_bulk_eligibility(
        &self,
        entity_ids: &[EntityId],
        user_id: Option<&str>,
    ) -> Result<Vec<(EntityId, EligibilityDecision)>> {
        let decisions = self.evaluate_bulk_eligibility(entity_ids).await?;
        let now = self.clock.now();
        for (entity_id, decision) in &decisions {
            if decision.allowed {
                self.storage
                    .record_trigger(entity_id, TriggerReason::Bulk, user_id, now)
                    .await?;
            }
        }
        Ok(decisions)
    }

    /// [`check_bulk_eligibility`](Self::check_bulk_eligibility) without
    /// recording any grant.
    pub async fn evaluate_bulk_eligibility(
        &self,
        entity_ids: &[EntityId],
    ) -> Result<Vec<(EntityId, EligibilityDecision)>> {
        let cap = self.config.bulk_batch_cap;
        let priority = self.config.priority_for(TriggerReason::Bulk);
        let mut decisions = Vec::with_capacity(entity_ids.len());

        for (position, entity_id) in entity_ids.iter().enumerate() {
            let decision = if position >= cap {
                EligibilityDecision::deny(
                    format!("Bulk requests are limited to {cap} deals at a time."),
                    priority,
                )
            } else {
                let mut decision = self
                    .evaluate_eligibility(entity_id, TriggerReason::Bulk)
                    .await?;
                if decision.allowed {
                    decision.delay_minutes += position as u32 * self.config.bulk_stagger_minutes;
                }
                decision
            };
            decisions.push((entity_id.clone(), decision));
        }

        if entity_ids.len() > cap {
            warn!(cap, requested = entity_ids.len(), "bulk submission over cap");
        }
        Ok(decisions)
    }

    /// Suppress all triggers for `entity_id` until `until`. Does not touch
    /// an item that is already processing.
    pub async fn block_entity(
        &self,
        entity_id: &EntityId,
        until: DateTime<Utc>,
        reason: Option<&str>,
    ) -> Result<()> {
        info!(entity = %entity_id, %until, "blocking entity");
        self.storage.set_block(entity_id, until, reason).await
    }

    pub async fn unblock_entity(&self, entity_id: &EntityId) -> Result<()> {
        info!(entity = %entity_id, "unblocking entity");
        self.storage.clear_block(entity_id).await
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Insert a `queued` item claimable `delay_minutes` from now. Returns its id.
    #[instrument(skip(self), fields(entity = %entity_id))]
    pub async fn enqueue(
        &self,
        entity_id: &EntityId,
        fund_id: &FundId,
        reason: TriggerReason,
        priority: QueuePriority,
        delay_minutes: u32,
    ) -> Result<String> {
        let item = self.new_item(entity_id, fund_id, reason, priority, delay_minutes);
        self.storage.insert_queue_item(&item).await?;
        info!(id = %item.id, scheduled_for = %item.scheduled_for, "enqueued");
        Ok(item.id)
    }

    /// [`enqueue`](Self::enqueue) for an allowed decision from
    /// [`evaluate_eligibility`](Self::evaluate_eligibility): the item and the
    /// grant are written together, so a failed insert starts no cooldown.
    #[instrument(skip(self), fields(entity = %entity_id))]
    pub async fn enqueue_granted(
        &self,
        entity_id: &EntityId,
        fund_id: &FundId,
        reason: TriggerReason,
        priority: QueuePriority,
        delay_minutes: u32,
        user_id: Option<&str>,
    ) -> Result<String> {
        let item = self.new_item(entity_id, fund_id, reason, priority, delay_minutes);
        self.storage.insert_granted_queue_item(&item, user_id).await?;
        info!(id = %item.id, scheduled_for = %item.scheduled_for, "enqueued");
        Ok(item.id)
    }

    fn new_item(
        &self,
        entity_id: &EntityId,
        fund_id: &FundId,
        reason: TriggerReason,
        priority: QueuePriority,
        delay_minutes: u32,
    ) -> QueueItem {
        let now = self.clock.now();
        QueueItem {
            id: Uuid::now_v7().to_string(),
            entity_id: entity_id.clone(),
            fund_id: fund_id.clone(),
            priority,
            trigger_reason: reason,
            status: QueueStatus::Queued,
            attempts: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            scheduled_for: now + Duration::minutes(i64::from(delay_minutes)),
        }
    }

    /// Atomically claim up to `batch_size` due items (see [`Storage::claim_queue_items`]).
    #[instrument(skip(self))]
    pub async fn claim_batch(&self, batch_size: usize, max_concurrent: usize) -> Result<ClaimResult> {
        let result = self
            .storage
            .claim_queue_items(self.clock.now(), batch_size, max_concurrent)
            .await?;
        match &result {
            ClaimResult::Claimed(items) if !items.is_empty() => {
                info!(claimed = items.len(), "claimed batch");
            }
            ClaimResult::Claimed(_) => debug!("nothing due"),
            ClaimResult::Throttled { processing } => {
                debug!(processing, "throttled: concurrency limit reached");
            }
        }
        Ok(result)
    }

    /// Finish a processing item. Failure does not retry by itself; see
    /// [`retry_failed`](Self::retry_failed).
    #[instrument(skip(self, error_message))]
    pub async fn complete_item(
        &self,
        queue_item_id: &str,
        success: bool,
        error_message: Option<&str>,
    ) -> Result<()> {
        let (status, error) = if success {
            (QueueStatus::Completed, None)
        } else {
            (
                QueueStatus::Failed,
                Some(error_message.unwrap_or("enrichment failed without an error message")),
            )
        };
        self.storage
            .finish_queue_item(queue_item_id, status, error, self.clock.now())
            .await?;
        if success {
            info!("item completed");
        } else {
            warn!(error = error.unwrap_or_default(), "item failed");
        }
        Ok(())
    }

    /// Recover items processing for longer than `threshold_minutes`.
    ///
    /// With attempts left they return to `queued`, pushed back by the
    /// configured reclaim delay; otherwise they fail for good.
    #[instrument(skip(self))]
    pub async fn reclaim_stuck(&self, threshold_minutes: u32, max_attempts: u32) -> Result<ReclaimReport> {
        let now = self.clock.now();
        let (requeued, exhausted) = self
            .storage
            .reclaim_stuck_items(
                now - Duration::minutes(i64::from(threshold_minutes)),
                max_attempts,
                now + Duration::minutes(i64::from(self.config.reclaim_delay_minutes)),
                &exhausted_message(max_attempts),
                now,
            )
            .await?;

        if !requeued.is_empty() || !exhausted.is_empty() {
            warn!(
                requeued = requeued.len(),
                exhausted = exhausted.len(),
                "reclaimed stuck items"
            );
        }
        Ok(ReclaimReport {
            requeued,
            exhausted,
        })
    }

    /// Re-queue failed items that still have attempts left, backing off
    /// exponentially with the number of attempts already made.
    #[instrument(skip(self))]
    pub async fn retry_failed(&self, max_attempts: u32) -> Result<usize> {
        let now = self.clock.now();
        let mut retried = 0;
        for item in self.storage.list_retryable_failed(max_attempts).await? {
            let delay = retry_delay(self.config.retry_base_delay_minutes, item.attempts);
            if self.storage.requeue_failed_item(&item.id, now + delay).await? {
                debug!(id = %item.id, attempts = item.attempts, delay_minutes = delay.num_minutes(), "retrying");
                retried += 1;
            }
        }
        if retried > 0 {
            info!(retried, "re-queued failed items");
        }
        Ok(retried)
    }

    /// Delete completed and failed items older than `retention_days`.
    #[instrument(skip(self))]
    pub async fn cleanup_old(&self, retention_days: u32) -> Result<u64> {
        let cutoff = self.clock.now() - Duration::days(i64::from(retention_days));
        let deleted = self.storage.delete_finished_before(cutoff).await?;
        if deleted > 0 {
            info!(deleted, "removed finished queue items");
        }
        Ok(deleted)
    }

    /// Delete queued items that were never claimed within `days`.
    #[instrument(skip(self))]
    pub async fn cleanup_stale_queued(&self, days: u32) -> Result<u64> {
        let cutoff = self.clock.now() - Duration::days(i64::from(days));
        let deleted = self.storage.delete_queued_before(cutoff).await?;
        if deleted > 0 {
            info!(deleted, "removed stale queued items");
        }
        Ok(deleted)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn item(&self, queue_item_id: &str) -> Result<QueueItem> {
        self.storage
            .get_queue_item(queue_item_id)
            .await?
            .ok_or_else(|| DealflowError::Queue(format!("unknown queue item {queue_item_id}")))
    }

    pub async fn items_for_entity(&self, entity_id: &EntityId) -> Result<Vec<QueueItem>> {
        self.storage.list_queue_items_for_entity(entity_id).await
    }

    pub async fn queue_stats(&self, fund_id: Option<&FundId>) -> Result<QueueStats> {
        let mut stats = QueueStats::default();
        for (status, count) in self.storage.count_queue_items_by_status(fund_id).await? {
            match status {
                QueueStatus::Queued => stats.queued = count,
                QueueStatus::Processing => stats.processing = count,
                QueueStatus::Completed => stats.completed = count,
                QueueStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }
}

/// Error recorded on items failed by the stuck-item sweep.
pub fn exhausted_message(max_attempts: u32) -> String {
    format!("Maximum retry attempts exceeded ({max_attempts})")
}

/// `base * 2^(attempts - 1)` minutes, capped at 2^10 multiples.
fn retry_delay(base_minutes: u32, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(10);
    Duration::minutes(i64::from(base_minutes) * (1_i64 << exponent))
}

fn describe_reason(reason: TriggerReason) -> &'static str {
    match reason {
        TriggerReason::Upload => "a document upload",
        TriggerReason::Manual => "a manual refresh",
        TriggerReason::Bulk => "a bulk refresh",
        TriggerReason::Scheduled => "a scheduled refresh",
        TriggerReason::FirstTime => "its first analysis",
    }
}

fn humanize(d: Duration) -> String {
    let minutes = d.num_minutes().max(1);
    if minutes >= 120 {
        format!("{} hours", minutes / 60)
    } else if minutes >= 60 {
        "1 hour".to_string()
    } else if minutes == 1 {
        "1 minute".to_string()
    } else {
        format!("{minutes} minutes")
    }
}
