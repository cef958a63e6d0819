//! Queue lifecycle coordination for Dealflow enrichment.
//!
//! - [`coordinator`]: admission control and the queue item state machine
//! - [`engine`]: the [`EnrichmentEngine`] contract
//! - [`worker`]: the polling worker that claims items and calls engines

pub mod coordinator;
pub mod engine;
pub mod worker;

pub use coordinator::{QueueCoordinator, QueueStats, ReclaimReport, exhausted_message};
pub use dealflow_storage::ClaimResult;
pub use engine::{EngineRequest, EngineResponse, EnrichmentEngine};
pub use worker::{MaintenanceReport, PassReport, Worker};
