//! Orchestration Facade: "make sure this deal's facts are fresh".
//!
//! Admission and enqueue happen here; enrichment itself runs out of band in
//! a [`Worker`](dealflow_queue::Worker). Resolution is re-derived on every
//! call from whatever source records exist, never cached.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use dealflow_queue::QueueCoordinator;
use dealflow_shared::{
    AppConfig, Clock, DealflowError, EntityId, Fact, FactSet, FundId, QueueConfig, QueuePriority,
    QueueStatus, ResolvedValue, Result, SourceRecord, SystemClock, TriggerReason,
};
use dealflow_storage::Storage;
use dealflow_waterfall::{SourceBundle, known_providers};

/// Default interval between status polls in [`Dealflow::wait_for_completion`].
const DEFAULT_WAIT_POLL: Duration = Duration::from_millis(250);

/// Options for [`Dealflow::ensure_fresh`].
#[derive(Debug, Clone, Default)]
pub struct EnsureFreshOptions {
    /// Enqueue even when eligibility is denied.
    pub force: bool,
    /// Who asked, recorded with the trigger.
    pub user_id: Option<String>,
}

/// Result of [`Dealflow::ensure_fresh`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FreshnessOutcome {
    Denied {
        reason: String,
    },
    Enqueued {
        queue_item_id: String,
        priority: QueuePriority,
        scheduled_for: DateTime<Utc>,
    },
}

/// Result of [`Dealflow::wait_for_completion`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WaitOutcome {
    Completed,
    Failed { error: Option<String> },
    /// The wait gave up; the item itself is untouched.
    TimedOut,
}

/// Entry point for callers wanting a fresh resolved fact set.
pub struct Dealflow {
    storage: Arc<Storage>,
    coordinator: Arc<QueueCoordinator>,
    clock: Arc<dyn Clock>,
    wait_poll: Duration,
}

impl Dealflow {
    pub fn new(storage: Arc<Storage>, config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        let coordinator = Arc::new(QueueCoordinator::new(
            Arc::clone(&storage),
            config,
            Arc::clone(&clock),
        ));
        Self {
            storage,
            coordinator,
            clock,
            wait_poll: DEFAULT_WAIT_POLL,
        }
    }

    /// Open the configured database with the system clock.
    pub async fn open(config: &AppConfig) -> Result<Self> {
        let path = config.database.resolved_path()?;
        let storage = Arc::new(Storage::open(&path).await?);
        Ok(Self::new(storage, config.queue.clone(), Arc::new(SystemClock)))
    }

    pub fn with_wait_poll(mut self, interval: Duration) -> Self {
        self.wait_poll = interval;
        self
    }

    pub fn coordinator(&self) -> &Arc<QueueCoordinator> {
        &self.coordinator
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    // -----------------------------------------------------------------------
    // Freshness
    // -----------------------------------------------------------------------

    /// Ask for enrichment of `entity_id`.
    ///
    /// A denial without `force` returns immediately and writes nothing. A
    /// grant is recorded only together with its queue item.
    #[instrument(skip(self, options), fields(entity = %entity_id, fund = %fund_id, force = options.force))]
    pub async fn ensure_fresh(
        &self,
        entity_id: &EntityId,
        fund_id: &FundId,
        reason: TriggerReason,
        options: &EnsureFreshOptions,
    ) -> Result<FreshnessOutcome> {
        let decision = self
            .coordinator
            .evaluate_eligibility(entity_id, reason)
            .await?;

        if decision.allowed {
            let id = self
                .coordinator
                .enqueue_granted(
                    entity_id,
                    fund_id,
                    reason,
                    decision.priority,
                    decision.delay_minutes,
                    options.user_id.as_deref(),
                )
                .await?;
            return self.enqueued(id).await;
        }

        if !options.force {
            let reason = decision
                .reason
                .unwrap_or_else(|| "Enrichment is not allowed right now.".to_string());
            debug!(%reason, "denied");
            return Ok(FreshnessOutcome::Denied { reason });
        }

        warn!(reason = decision.reason.as_deref().unwrap_or_default(), "forcing past denial");
        let id = self
            .coordinator
            .enqueue(
                entity_id,
                fund_id,
                reason,
                decision.priority,
                self.coordinator.config().delay_for(reason),
            )
            .await?;
        self.enqueued(id).await
    }

    /// [`ensure_fresh`](Self::ensure_fresh) for a bulk selection: the batch
    /// cap and stagger apply, and `force` is not honoured.
    #[instrument(skip(self, entity_ids), fields(fund = %fund_id, count = entity_ids.len()))]
    pub async fn ensure_fresh_bulk(
        &self,
        entity_ids: &[EntityId],
        fund_id: &FundId,
        user_id: Option<&str>,
    ) -> Result<Vec<(EntityId, FreshnessOutcome)>> {
        let decisions = self
            .coordinator
            .evaluate_bulk_eligibility(entity_ids)
            .await?;

        let mut outcomes = Vec::with_capacity(decisions.len());
        for (entity_id, decision) in decisions {
            let outcome = if decision.allowed {
                let id = self
                    .coordinator
                    .enqueue_granted(
                        &entity_id,
                        fund_id,
                        TriggerReason::Bulk,
                        decision.priority,
                        decision.delay_minutes,
                        user_id,
                    )
                    .await?;
                self.enqueued(id).await?
            } else {
                FreshnessOutcome::Denied {
                    reason: decision.reason.unwrap_or_default(),
                }
            };
            outcomes.push((entity_id, outcome));
        }
        Ok(outcomes)
    }

    async fn enqueued(&self, queue_item_id: String) -> Result<FreshnessOutcome> {
        let item = self.coordinator.item(&queue_item_id).await?;
        Ok(FreshnessOutcome::Enqueued {
            queue_item_id,
            priority: item.priority,
            scheduled_for: item.scheduled_for,
        })
    }

    /// Poll the item until it finishes or `timeout` elapses.
    ///
    /// Timing out only stops waiting; the item keeps its state and will
    /// still be processed.
    #[instrument(skip(self))]
    pub async fn wait_for_completion(&self, queue_item_id: &str, timeout: Duration) -> Result<WaitOutcome> {
        match tokio::time::timeout(timeout, self.poll_until_finished(queue_item_id)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                info!(timeout_secs = timeout.as_secs_f64(), "stopped waiting");
                Ok(WaitOutcome::TimedOut)
            }
        }
    }

    async fn poll_until_finished(&self, queue_item_id: &str) -> Result<WaitOutcome> {
        loop {
            let item = self.coordinator.item(queue_item_id).await?;
            match item.status {
                QueueStatus::Completed => return Ok(WaitOutcome::Completed),
                QueueStatus::Failed => {
                    return Ok(WaitOutcome::Failed {
                        error: item.error_message,
                    });
                }
                QueueStatus::Queued | QueueStatus::Processing => {
                    tokio::time::sleep(self.wait_poll).await;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------------

    /// Resolve one fact from the latest record of each provider.
    #[instrument(skip(self), fields(entity = %entity_id, %fact))]
    pub async fn resolve(&self, entity_id: &EntityId, fact: Fact) -> Result<ResolvedValue> {
        let bundle = self.load_bundle(entity_id).await?;
        dealflow_waterfall::resolve(fact, &bundle)
    }

    /// Resolve every fact for `entity_id`.
    #[instrument(skip(self), fields(entity = %entity_id))]
    pub async fn resolve_all(&self, entity_id: &EntityId) -> Result<FactSet> {
        let bundle = self.load_bundle(entity_id).await?;
        dealflow_waterfall::resolve_all(&bundle)
    }

    async fn load_bundle(&self, entity_id: &EntityId) -> Result<SourceBundle> {
        let records = self.storage.latest_source_records(entity_id).await?;
        SourceBundle::from_records(entity_id.clone(), records)
    }

    /// Store a new snapshot of `provider`'s data for `entity_id`, stamped now.
    #[instrument(skip(self, payload), fields(entity = %entity_id))]
    pub async fn record_source(
        &self,
        entity_id: &EntityId,
        provider: &str,
        payload: Value,
    ) -> Result<SourceRecord> {
        let provider = provider.trim();
        if provider.is_empty() {
            return Err(DealflowError::validation("provider name must not be empty"));
        }
        if !known_providers().contains(&provider) {
            warn!(provider, "provider is not used by any fact");
        }

        let record = SourceRecord {
            id: Uuid::now_v7().to_string(),
            entity_id: entity_id.clone(),
            provider: provider.to_string(),
            payload,
            retrieved_at: self.clock.now(),
        };
        self.storage.insert_source_record(&record).await?;
        info!(provider, id = %record.id, "source recorded");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use dealflow_queue::{EngineRequest, EngineResponse, EnrichmentEngine, Worker};
    use dealflow_shared::{Confidence, FactValue, ManualClock, WorkerConfig};
    use serde_json::json;

    use super::*;

    async fn setup() -> (Dealflow, ManualClock) {
        let path = std::env::temp_dir().join(format!("dealflow_facade_{}.db", Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&path).await.expect("open test db"));
        let clock = ManualClock::new(
            DateTime::parse_from_rfc3339("2025-03-10T09:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        );
        let facade = Dealflow::new(storage, QueueConfig::default(), Arc::new(clock.clone()))
            .with_wait_poll(Duration::from_millis(10));
        (facade, clock)
    }

    fn entity(id: &str) -> EntityId {
        EntityId::new(id).unwrap()
    }

    fn fund() -> FundId {
        FundId::new("F1").unwrap()
    }

    fn enqueued_id(outcome: &FreshnessOutcome) -> String {
        match outcome {
            FreshnessOutcome::Enqueued { queue_item_id, .. } => queue_item_id.clone(),
            FreshnessOutcome::Denied { reason } => panic!("denied: {reason}"),
        }
    }

    /// Stands in for a hosted function that writes a fresh profile export.
    struct ProfileEngine {
        storage: Arc<Storage>,
        now: DateTime<Utc>,
    }

    #[async_trait]
    impl EnrichmentEngine for ProfileEngine {
        fn name(&self) -> &str {
            "profile"
        }

        async fn invoke(&self, request: &EngineRequest) -> Result<EngineResponse> {
            let record = SourceRecord {
                id: Uuid::now_v7().to_string(),
                entity_id: request.entity_id.clone(),
                provider: "LinkedIn".into(),
                payload: json!({"employee_count": 42}),
                retrieved_at: self.now,
            };
            self.storage.insert_source_record(&record).await?;
            Ok(EngineResponse::ok(None))
        }
    }

    #[tokio::test]
    async fn resolves_recorded_founding_year() {
        let (facade, clock) = setup().await;
        let d1 = entity("D1");
        facade
            .record_source(&d1, "Crunchbase", json!({"founded_date": "2019-03-01"}))
            .await
            .unwrap();

        let v = facade.resolve(&d1, Fact::FoundingYear).await.unwrap();
        assert_eq!(v.value, FactValue::Integer(2019));
        assert_eq!(v.source, "Crunchbase");
        assert_eq!(v.confidence, Confidence::High);
        assert_eq!(v.last_updated, Some(clock.now()));
    }

    #[tokio::test]
    async fn unknown_entity_resolves_to_fallbacks() {
        let (facade, _clock) = setup().await;
        let set = facade.resolve_all(&entity("D2")).await.unwrap();
        assert_eq!(set.missing().len(), Fact::ALL.len());
        let v = set.get(Fact::EmployeeCount).unwrap();
        assert!(v.is_fallback);
        assert_eq!(v.source, "fallback");
    }

    #[tokio::test]
    async fn newer_record_replaces_older() {
        let (facade, clock) = setup().await;
        let d1 = entity("D1");
        facade
            .record_source(&d1, "LinkedIn", json!({"employee_count": 10}))
            .await
            .unwrap();
        clock.advance(ChronoDuration::days(1));
        facade
            .record_source(&d1, "LinkedIn", json!({"employee_count": "51-200"}))
            .await
            .unwrap();

        let v = facade.resolve(&d1, Fact::EmployeeCount).await.unwrap();
        assert_eq!(v.value, FactValue::Integer(51));
    }

    #[tokio::test]
    async fn blank_provider_is_rejected() {
        let (facade, _clock) = setup().await;
        assert!(facade.record_source(&entity("D1"), "  ", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn denial_has_no_side_effects() {
        let (facade, clock) = setup().await;
        let d1 = entity("D1");
        let opts = EnsureFreshOptions::default();

        let first = facade
            .ensure_fresh(&d1, &fund(), TriggerReason::Upload, &opts)
            .await
            .unwrap();
        enqueued_id(&first);
        let granted_at = facade
            .storage()
            .last_trigger(&d1, TriggerReason::Upload)
            .await
            .unwrap();

        clock.advance(ChronoDuration::hours(1));
        let second = facade
            .ensure_fresh(&d1, &fund(), TriggerReason::Upload, &opts)
            .await
            .unwrap();
        match second {
            FreshnessOutcome::Denied { reason } => assert!(!reason.is_empty()),
            other => panic!("expected denial, got {other:?}"),
        }

        let items = facade.coordinator().items_for_entity(&d1).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(
            facade
                .storage()
                .last_trigger(&d1, TriggerReason::Upload)
                .await
                .unwrap(),
            granted_at
        );
    }

    #[tokio::test]
    async fn failed_enqueue_keeps_entity_eligible() {
        let path = std::env::temp_dir().join(format!("dealflow_facade_{}.db", Uuid::now_v7()));
        let writable = Arc::new(Storage::open(&path).await.expect("open test db"));
        let readonly = Arc::new(Storage::open_readonly(&path).await.expect("open readonly"));
        let clock = ManualClock::new(Utc::now());
        let d1 = entity("D1");
        let opts = EnsureFreshOptions::default();

        let broken = Dealflow::new(readonly, QueueConfig::default(), Arc::new(clock.clone()));
        assert!(
            broken
                .ensure_fresh(&d1, &fund(), TriggerReason::Upload, &opts)
                .await
                .is_err()
        );
        let bulk = broken.ensure_fresh_bulk(&[d1.clone()], &fund(), None).await;
        assert!(bulk.is_err());

        let facade = Dealflow::new(writable, QueueConfig::default(), Arc::new(clock.clone()));
        assert!(
            facade
                .storage()
                .last_trigger(&d1, TriggerReason::Upload)
                .await
                .unwrap()
                .is_none()
        );
        let retry = facade
            .ensure_fresh(&d1, &fund(), TriggerReason::Upload, &opts)
            .await
            .unwrap();
        enqueued_id(&retry);
        let bulk = facade.ensure_fresh_bulk(&[d1.clone()], &fund(), None).await.unwrap();
        enqueued_id(&bulk[0].1);
    }

    #[tokio::test]
    async fn force_enqueues_past_denial() {
        let (facade, clock) = setup().await;
        let d1 = entity("D1");
        facade
            .coordinator()
            .block_entity(&d1, clock.now() + ChronoDuration::hours(3), None)
            .await
            .unwrap();

        let plain = facade
            .ensure_fresh(&d1, &fund(), TriggerReason::Manual, &EnsureFreshOptions::default())
            .await
            .unwrap();
        assert!(matches!(plain, FreshnessOutcome::Denied { .. }));

        let forced = facade
            .ensure_fresh(
                &d1,
                &fund(),
                TriggerReason::Manual,
                &EnsureFreshOptions {
                    force: true,
                    user_id: Some("admin".into()),
                },
            )
            .await
            .unwrap();
        match forced {
            FreshnessOutcome::Enqueued {
                priority,
                scheduled_for,
                ..
            } => {
                assert_eq!(priority, QueuePriority::High);
                assert_eq!(scheduled_for, clock.now());
            }
            other => panic!("expected enqueue, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bulk_applies_cap_and_stagger() {
        let (facade, clock) = setup().await;
        let ids: Vec<EntityId> = (0..6).map(|i| entity(&format!("B{i}"))).collect();

        let outcomes = facade.ensure_fresh_bulk(&ids, &fund(), None).await.unwrap();
        assert_eq!(outcomes.len(), 6);
        match &outcomes[2].1 {
            FreshnessOutcome::Enqueued { scheduled_for, .. } => {
                assert_eq!(*scheduled_for, clock.now() + ChronoDuration::minutes(2));
            }
            other => panic!("expected enqueue, got {other:?}"),
        }
        assert!(matches!(outcomes[5].1, FreshnessOutcome::Denied { .. }));
        assert_eq!(facade.coordinator().queue_stats(None).await.unwrap().queued, 5);
    }

    #[tokio::test]
    async fn wait_timeout_leaves_item_queued() {
        let (facade, _clock) = setup().await;
        let d1 = entity("D1");
        let outcome = facade
            .ensure_fresh(&d1, &fund(), TriggerReason::FirstTime, &EnsureFreshOptions::default())
            .await
            .unwrap();
        let id = enqueued_id(&outcome);

        let waited = facade
            .wait_for_completion(&id, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(waited, WaitOutcome::TimedOut);

        let item = facade.coordinator().item(&id).await.unwrap();
        assert_eq!(item.status, QueueStatus::Queued);
        assert_eq!(item.attempts, 0);
    }

    #[tokio::test]
    async fn wait_reports_failure() {
        let (facade, _clock) = setup().await;
        let outcome = facade
            .ensure_fresh(&entity("D1"), &fund(), TriggerReason::Manual, &EnsureFreshOptions::default())
            .await
            .unwrap();
        let id = enqueued_id(&outcome);
        facade.coordinator().claim_batch(1, 1).await.unwrap();
        facade
            .coordinator()
            .complete_item(&id, false, Some("engine unavailable"))
            .await
            .unwrap();

        let waited = facade
            .wait_for_completion(&id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            waited,
            WaitOutcome::Failed {
                error: Some("engine unavailable".into())
            }
        );
    }

    #[tokio::test]
    async fn enrichment_round_trip_refreshes_resolution() {
        let (facade, clock) = setup().await;
        let d1 = entity("D1");
        assert!(facade.resolve(&d1, Fact::EmployeeCount).await.unwrap().is_fallback);

        let outcome = facade
            .ensure_fresh(&d1, &fund(), TriggerReason::FirstTime, &EnsureFreshOptions::default())
            .await
            .unwrap();
        let id = enqueued_id(&outcome);

        let engine: Arc<dyn EnrichmentEngine> = Arc::new(ProfileEngine {
            storage: Arc::clone(facade.storage()),
            now: clock.now(),
        });
        let worker = Worker::new(
            Arc::clone(facade.coordinator()),
            vec![engine],
            WorkerConfig::default(),
            Duration::from_secs(5),
        );
        let report = worker.run_once().await.unwrap();
        assert_eq!(report.completed, 1);

        let waited = facade
            .wait_for_completion(&id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(waited, WaitOutcome::Completed);

        let v = facade.resolve(&d1, Fact::EmployeeCount).await.unwrap();
        assert_eq!(v.value, FactValue::Integer(42));
        assert_eq!(v.source, "LinkedIn");
        assert!(!v.is_fallback);
    }
}
