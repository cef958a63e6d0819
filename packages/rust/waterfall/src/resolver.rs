//! Waterfall Resolver: pick one authoritative value per fact.
//!
//! Walk the fact's priority order, take the first provider whose most recent
//! record yields a non-missing normalized value, and report that provider as
//! the source. No blending or voting across providers: a lower-priority
//! provider is only consulted when every higher one is absent or missing.

use std::collections::HashMap;

use dealflow_shared::{
    DealflowError, EntityId, Fact, FactSet, ResolvedValue, Result, SourceRecord,
};
use tracing::{debug, trace};

use crate::normalize::{get_nested_value, is_missing};
use crate::registry::fact_spec;

/// The most recent source record per provider for one entity.
#[derive(Debug, Clone)]
pub struct SourceBundle {
    entity_id: EntityId,
    latest: HashMap<String, SourceRecord>,
}

impl SourceBundle {
    pub fn new(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            latest: HashMap::new(),
        }
    }

    /// Build a bundle from any number of records; for each provider only the
    /// newest (by `retrieved_at`, then id) is kept, whatever the input order.
    pub fn from_records(
        entity_id: EntityId,
        records: impl IntoIterator<Item = SourceRecord>,
    ) -> Result<Self> {
        let mut bundle = Self::new(entity_id);
        for record in records {
            bundle.insert(record)?;
        }
        Ok(bundle)
    }

    /// Add a record, replacing the provider's current one only if newer.
    ///
    /// Records for a different entity are a caller bug.
    pub fn insert(&mut self, record: SourceRecord) -> Result<()> {
        if record.entity_id != self.entity_id {
            return Err(DealflowError::validation(format!(
                "source record {} belongs to entity {}, not {}",
                record.id, record.entity_id, self.entity_id
            )));
        }

        let newer = match self.latest.get(&record.provider) {
            Some(current) => {
                (record.retrieved_at, &record.id) > (current.retrieved_at, &current.id)
            }
            None => true,
        };
        if newer {
            self.latest.insert(record.provider.clone(), record);
        }
        Ok(())
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn latest(&self, provider: &str) -> Option<&SourceRecord> {
        self.latest.get(provider)
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

/// Resolve one fact for the bundle's entity.
///
/// Absence never errors: it falls through to the next provider and finally
/// to the fact's fallback value. Malformed registry paths do error.
pub fn resolve(fact: Fact, bundle: &SourceBundle) -> Result<ResolvedValue> {
    let spec = fact_spec(fact);

    for source in spec.order {
        let Some(record) = bundle.latest(source.provider) else {
            trace!(%fact, provider = source.provider, "no record");
            continue;
        };

        let raw = get_nested_value(&record.payload, source.path)?;
        if is_missing(raw) {
            trace!(%fact, provider = source.provider, path = source.path, "field missing");
            continue;
        }
        let Some(raw) = raw else { continue };

        match spec.normalizer.apply(raw) {
            Some(value) if !value.is_missing() => {
                debug!(
                    entity = %bundle.entity_id(),
                    %fact,
                    provider = source.provider,
                    confidence = %source.confidence,
                    "fact resolved"
                );
                return Ok(ResolvedValue::found(
                    value,
                    source.provider,
                    source.confidence,
                    record.retrieved_at,
                ));
            }
            _ => {
                trace!(%fact, provider = source.provider, path = source.path, "value not usable");
            }
        }
    }

    debug!(entity = %bundle.entity_id(), %fact, "no provider answered, using fallback");
    Ok(ResolvedValue::fallback(spec.fallback))
}

/// Resolve every known fact for the bundle's entity.
pub fn resolve_all(bundle: &SourceBundle) -> Result<FactSet> {
    let mut set = FactSet {
        entity_id: Some(bundle.entity_id().clone()),
        ..Default::default()
    };
    for fact in Fact::ALL {
        set.values.insert(fact, resolve(fact, bundle)?);
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};
    use dealflow_shared::{Confidence, FactValue};
    use serde_json::{Value, json};

    use super::*;
    use crate::registry::{CRUNCHBASE, DEAL, ENRICHMENT, LINKEDIN};

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn record(entity: &str, provider: &str, payload: Value, retrieved_at: DateTime<Utc>) -> SourceRecord {
        SourceRecord {
            id: format!("{provider}-{}", retrieved_at.timestamp()),
            entity_id: EntityId::new(entity).unwrap(),
            provider: provider.into(),
            payload,
            retrieved_at,
        }
    }

    fn bundle(entity: &str, records: Vec<SourceRecord>) -> SourceBundle {
        SourceBundle::from_records(EntityId::new(entity).unwrap(), records).unwrap()
    }

    #[test]
    fn founding_year_from_crunchbase_date() {
        let when = at("2024-04-02T09:00:00Z");
        let b = bundle(
            "D1",
            vec![record("D1", CRUNCHBASE, json!({"founded_date": "2019-03-01"}), when)],
        );
        let v = resolve(Fact::FoundingYear, &b).unwrap();
        assert_eq!(v.value, FactValue::Integer(2019));
        assert_eq!(v.source, "Crunchbase");
        assert_eq!(v.confidence, Confidence::High);
        assert_eq!(v.last_updated, Some(when));
        assert!(!v.is_fallback);
    }

    #[test]
    fn malformed_year_falls_through_to_next_provider() {
        let when = at("2024-04-02T09:00:00Z");
        let b = bundle(
            "D1",
            vec![
                record("D1", LINKEDIN, json!({"founded_year": "-123"}), when),
                record("D1", CRUNCHBASE, json!({"founded_date": "2016-08-12"}), when),
            ],
        );
        let v = resolve(Fact::FoundingYear, &b).unwrap();
        assert_eq!(v.value, FactValue::Integer(2016));
        assert_eq!(v.source, CRUNCHBASE);
    }

    #[test]
    fn no_records_yields_fallback() {
        let b = bundle("D2", vec![]);
        let v = resolve(Fact::EmployeeCount, &b).unwrap();
        assert_eq!(
            v.value,
            FactValue::Text("Require more information. Add LinkedIn or Crunchbase".into())
        );
        assert_eq!(v.source, "fallback");
        assert_eq!(v.confidence, Confidence::Low);
        assert!(v.is_fallback);
        assert!(v.last_updated.is_none());
    }

    #[test]
    fn higher_priority_wins_regardless_of_insertion_order() {
        let now = at("2024-04-02T09:00:00Z");
        let linkedin = record("D1", LINKEDIN, json!({"employee_count": 42}), now);
        let crunchbase = record("D1", CRUNCHBASE, json!({"num_employees": "51-100"}), now);

        let forward = bundle("D1", vec![linkedin.clone(), crunchbase.clone()]);
        let backward = bundle("D1", vec![crunchbase, linkedin]);
        for b in [&forward, &backward] {
            let v = resolve(Fact::EmployeeCount, b).unwrap();
            assert_eq!(v.source, LINKEDIN);
            assert_eq!(v.value, FactValue::Integer(42));
        }
    }

    #[test]
    fn missing_sentinel_falls_through() {
        let now = at("2024-04-02T09:00:00Z");
        let b = bundle(
            "D1",
            vec![
                record("D1", LINKEDIN, json!({"employee_count": "Not Found"}), now),
                record("D1", CRUNCHBASE, json!({"num_employees": "11-50"}), now),
            ],
        );
        let v = resolve(Fact::EmployeeCount, &b).unwrap();
        assert_eq!(v.source, CRUNCHBASE);
        assert_eq!(v.value, FactValue::Integer(11));
    }

    #[test]
    fn all_missing_yields_fallback() {
        let now = at("2024-04-02T09:00:00Z");
        let b = bundle(
            "D1",
            vec![
                record("D1", LINKEDIN, json!({"employee_count": null}), now),
                record("D1", CRUNCHBASE, json!({"num_employees": "  not listed "}), now),
                record("D1", ENRICHMENT, json!({"linkedin": {}}), now),
            ],
        );
        let v = resolve(Fact::EmployeeCount, &b).unwrap();
        assert!(v.is_fallback);
        assert_eq!(v.source, "fallback");
    }

    #[test]
    fn unparseable_count_is_present_zero() {
        // Known edge: "abc" normalizes to 0 and still beats a real number lower down.
        let now = at("2024-04-02T09:00:00Z");
        let b = bundle(
            "D1",
            vec![
                record("D1", LINKEDIN, json!({"employee_count": "abc"}), now),
                record("D1", CRUNCHBASE, json!({"num_employees": 250}), now),
            ],
        );
        let v = resolve(Fact::EmployeeCount, &b).unwrap();
        assert_eq!(v.source, LINKEDIN);
        assert_eq!(v.value, FactValue::Integer(0));
        assert!(!v.is_fallback);
    }

    #[test]
    fn unparseable_year_falls_through() {
        let now = at("2024-04-02T09:00:00Z");
        let b = bundle(
            "D1",
            vec![
                record("D1", LINKEDIN, json!({"founded_year": "sometime"}), now),
                record("D1", ENRICHMENT, json!({"crunchbase": {"founded_date": "2012-01-15"}}), now),
            ],
        );
        let v = resolve(Fact::FoundingYear, &b).unwrap();
        assert_eq!(v.source, ENRICHMENT);
        assert_eq!(v.confidence, Confidence::Medium);
        assert_eq!(v.value, FactValue::Integer(2012));
    }

    #[test]
    fn business_model_rejects_numbers() {
        let now = at("2024-04-02T09:00:00Z");
        let b = bundle(
            "D1",
            vec![
                record("D1", DEAL, json!({"business_model": 7}), now),
                record("D1", CRUNCHBASE, json!({"business_model": "Marketplace"}), now),
            ],
        );
        let v = resolve(Fact::BusinessModel, &b).unwrap();
        assert_eq!(v.source, CRUNCHBASE);
        assert_eq!(v.value, FactValue::Text("Marketplace".into()));
    }

    #[test]
    fn only_newest_record_per_provider_counts() {
        let old = at("2024-01-01T00:00:00Z");
        let new = old + Duration::days(30);
        let b = bundle(
            "D1",
            vec![
                record("D1", LINKEDIN, json!({"employee_count": 80}), new),
                record("D1", LINKEDIN, json!({"employee_count": 20}), old),
            ],
        );
        let v = resolve(Fact::EmployeeCount, &b).unwrap();
        assert_eq!(v.value, FactValue::Integer(80));
        assert_eq!(v.last_updated, Some(new));

        // The newest record lacks the field: the older one is not consulted.
        let b = bundle(
            "D1",
            vec![
                record("D1", LINKEDIN, json!({"employee_count": 20}), old),
                record("D1", LINKEDIN, json!({}), new),
                record("D1", CRUNCHBASE, json!({"num_employees": 33}), old),
            ],
        );
        let v = resolve(Fact::EmployeeCount, &b).unwrap();
        assert_eq!(v.source, CRUNCHBASE);
    }

    #[test]
    fn resolution_is_deterministic() {
        let now = at("2024-04-02T09:00:00Z");
        let b = bundle(
            "D1",
            vec![
                record("D1", CRUNCHBASE, json!({"num_employees": "11-50", "industry": "Fintech"}), now),
                record("D1", DEAL, json!({"total_funding": "$4.5M"}), now),
            ],
        );
        let first = resolve_all(&b).unwrap();
        let second = resolve_all(&b).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
        assert_eq!(
            first.get(Fact::TotalFunding).unwrap().value,
            FactValue::Integer(4_500_000)
        );
        assert_eq!(first.missing(), vec![Fact::FoundingYear, Fact::BusinessModel]);
    }

    #[test]
    fn foreign_records_are_rejected() {
        let now = at("2024-04-02T09:00:00Z");
        let result = SourceBundle::from_records(
            EntityId::new("D1").unwrap(),
            vec![record("D9", LINKEDIN, json!({}), now)],
        );
        assert!(result.is_err());
    }
}
