//! Waterfall data resolution for Dealflow.
//!
//! Given the same fact recorded by several providers of varying trust, pick
//! one value deterministically, tag it with its provider and confidence, and
//! fall back to an instruction message when nobody has it.
//!
//! - [`normalize`]: `is_missing`, dotted path lookup, per-fact normalizers
//! - [`registry`]: the static priority order per fact
//! - [`resolver`]: [`resolve`] / [`resolve_all`] over a [`SourceBundle`]

pub mod normalize;
pub mod registry;
pub mod resolver;

pub use normalize::{Normalizer, get_nested_value, is_missing};
pub use registry::{FactSpec, SourceSpec, fact_spec, known_providers};
pub use resolver::{SourceBundle, resolve, resolve_all};
