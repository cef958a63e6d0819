//! Shared types, error model, configuration, and clock for Dealflow.
//!
//! This crate is the foundation depended on by all other Dealflow crates.
//! It provides:
//! - [`DealflowError`]: the unified error type
//! - Domain types ([`Fact`], [`ResolvedValue`], [`SourceRecord`], [`QueueItem`])
//! - Configuration ([`AppConfig`], [`QueueConfig`], config loading)
//! - [`Clock`]: the injectable "now"

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AppConfig, CooldownConfig, DatabaseConfig, EnginesConfig, QueueConfig, WorkerConfig,
    config_dir, config_file_path, init_config, load_config, load_config_from,
    validate_service_key,
};
pub use error::{DealflowError, Result};
pub use types::{
    Confidence, EligibilityDecision, EntityId, FALLBACK_SOURCE, Fact, FactSet, FactValue, FundId,
    QueueItem, QueuePriority, QueueStatus, ResolvedValue, SourceRecord, TriggerReason,
    is_missing_text,
};
