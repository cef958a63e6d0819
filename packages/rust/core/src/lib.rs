//! Orchestration for Dealflow.
//!
//! This crate ties together the waterfall resolver, the enrichment queue,
//! and the hosted enrichment engines into the caller-facing [`Dealflow`]
//! facade.

pub mod facade;
pub mod http_engine;

pub use facade::{Dealflow, EnsureFreshOptions, FreshnessOutcome, WaitOutcome};
pub use http_engine::HttpEngine;
