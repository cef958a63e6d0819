//! Core domain types for Dealflow: facts, source records, resolved values,
//! and the enrichment queue.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DealflowError, Result};

/// The `source` reported by a resolved value when no provider answered.
pub const FALLBACK_SOURCE: &str = "fallback";

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identifier of the entity (deal) being enriched and resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Wrap a non-empty identifier. Blank ids are a caller bug.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(DealflowError::validation("entity id must not be empty"));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityId {
    type Err = DealflowError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Identifier of the owning fund (group) of a queue item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FundId(String);

impl FundId {
    /// Wrap a non-empty fund identifier.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(DealflowError::validation("fund id must not be empty"));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for FundId {
    type Err = DealflowError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

// ---------------------------------------------------------------------------
// Facts & resolved values
// ---------------------------------------------------------------------------

/// A named piece of information resolved independently for each entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fact {
    EmployeeCount,
    FoundingYear,
    BusinessModel,
    Industry,
    TotalFunding,
}

impl Fact {
    /// Every fact, in display order.
    pub const ALL: [Fact; 5] = [
        Fact::EmployeeCount,
        Fact::FoundingYear,
        Fact::BusinessModel,
        Fact::Industry,
        Fact::TotalFunding,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmployeeCount => "employee_count",
            Self::FoundingYear => "founding_year",
            Self::BusinessModel => "business_model",
            Self::Industry => "industry",
            Self::TotalFunding => "total_funding",
        }
    }
}

impl fmt::Display for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Fact {
    type Err = DealflowError;

    fn from_str(s: &str) -> Result<Self> {
        Fact::ALL
            .into_iter()
            .find(|fact| fact.as_str() == s)
            .ok_or_else(|| DealflowError::validation(format!("unknown fact '{s}'")))
    }
}

/// A normalized fact value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FactValue {
    Integer(i64),
    Text(String),
}

impl FactValue {
    /// Same rule as the registry's raw-value check: blank, "not found" and
    /// "not listed" text count as absent. Numbers are always present.
    pub fn is_missing(&self) -> bool {
        match self {
            Self::Integer(_) => false,
            Self::Text(s) => is_missing_text(s),
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            Self::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Integer(_) => None,
        }
    }
}

impl fmt::Display for FactValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Text sentinels providers use instead of omitting a field.
pub fn is_missing_text(s: &str) -> bool {
    matches!(
        s.trim().to_lowercase().as_str(),
        "" | "not found" | "not listed"
    )
}

/// Trust tier of a resolved value, determined by which provider answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single best value for one (entity, fact), with provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedValue {
    /// Normalized value, or the fact's fallback instruction text.
    pub value: FactValue,
    /// Provider name, or [`FALLBACK_SOURCE`].
    pub source: String,
    pub confidence: Confidence,
    /// Retrieval time of the answering source record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    pub is_fallback: bool,
}

impl ResolvedValue {
    /// A value answered by `source`.
    pub fn found(
        value: FactValue,
        source: impl Into<String>,
        confidence: Confidence,
        last_updated: DateTime<Utc>,
    ) -> Self {
        Self {
            value,
            source: source.into(),
            confidence,
            last_updated: Some(last_updated),
            is_fallback: false,
        }
    }

    /// The canned "need more information" value.
    pub fn fallback(message: impl Into<String>) -> Self {
        Self {
            value: FactValue::Text(message.into()),
            source: FALLBACK_SOURCE.into(),
            confidence: Confidence::Low,
            last_updated: None,
            is_fallback: true,
        }
    }
}

/// Resolved values for every fact of one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FactSet {
    pub entity_id: Option<EntityId>,
    pub values: BTreeMap<Fact, ResolvedValue>,
}

impl FactSet {
    pub fn get(&self, fact: Fact) -> Option<&ResolvedValue> {
        self.values.get(&fact)
    }

    /// Facts that still show the fallback message.
    pub fn missing(&self) -> Vec<Fact> {
        self.values
            .iter()
            .filter(|(_, v)| v.is_fallback)
            .map(|(f, _)| *f)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Source records
// ---------------------------------------------------------------------------

/// One provider's snapshot of raw data for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Unique record identifier (UUID v7).
    pub id: String,
    pub entity_id: EntityId,
    /// Provider name, e.g. `LinkedIn` or `Crunchbase`.
    pub provider: String,
    /// Loosely typed provider payload.
    pub payload: serde_json::Value,
    pub retrieved_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Scheduling priority of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuePriority {
    High,
    Normal,
    Low,
}

/// Why an enrichment attempt was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    Upload,
    Manual,
    Bulk,
    Scheduled,
    FirstTime,
}

/// Lifecycle state of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    /// Can an item move from `self` to `to`?
    pub fn can_transition_to(self, to: QueueStatus) -> bool {
        use QueueStatus::*;
        matches!(
            (self, to),
            (Queued, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Queued) // stuck item reclaimed
                | (Failed, Queued) // retried while attempts remain
        )
    }

    /// Completed and failed items only leave the queue through retention cleanup
    /// (or a retry, for failed items with attempts left).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

macro_rules! text_enum {
    ($ty:ty, $what:literal, { $($variant:path => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = DealflowError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($variant),)+
                    other => Err(DealflowError::validation(format!(
                        concat!("unknown ", $what, " '{}'"),
                        other
                    ))),
                }
            }
        }
    };
}

text_enum!(QueuePriority, "priority", {
    QueuePriority::High => "high",
    QueuePriority::Normal => "normal",
    QueuePriority::Low => "low",
});

text_enum!(TriggerReason, "trigger reason", {
    TriggerReason::Upload => "upload",
    TriggerReason::Manual => "manual",
    TriggerReason::Bulk => "bulk",
    TriggerReason::Scheduled => "scheduled",
    TriggerReason::FirstTime => "first_time",
});

text_enum!(QueueStatus, "queue status", {
    QueueStatus::Queued => "queued",
    QueueStatus::Processing => "processing",
    QueueStatus::Completed => "completed",
    QueueStatus::Failed => "failed",
});

/// One tracked attempt to run enrichment for an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub entity_id: EntityId,
    pub fund_id: FundId,
    pub priority: QueuePriority,
    pub trigger_reason: TriggerReason,
    pub status: QueueStatus,
    /// Number of times the item has been claimed.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Earliest time a worker may claim the item.
    pub scheduled_for: DateTime<Utc>,
}

/// Admission-control result for a trigger request. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EligibilityDecision {
    pub allowed: bool,
    /// Human-readable explanation; always present when `allowed` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub priority: QueuePriority,
    pub delay_minutes: u32,
}

impl EligibilityDecision {
    pub fn allow(priority: QueuePriority, delay_minutes: u32) -> Self {
        Self {
            allowed: true,
            reason: None,
            priority,
            delay_minutes,
        }
    }

    pub fn deny(reason: impl Into<String>, priority: QueuePriority) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            priority,
            delay_minutes: 0,
        }
    }
}
