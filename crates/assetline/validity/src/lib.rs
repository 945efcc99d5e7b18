//! Interval-conflict store.
//!
//! A [`ValidityStore`] maps each key to a list of values that carry a
//! validity window (see [`assetline_types::Validity`]). For any key, no two
//! stored windows overlap by more than the tolerance in force for the
//! operation that added them.

pub mod store;

pub use store::{AddOrUpdateOutcome, ValidityStore};
