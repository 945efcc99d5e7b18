//! Gated entity collection.
//!
//! A [`GatedCollection`] is a concurrent key → entity map whose every
//! mutation goes through a two-phase gate:
//!
//! 1. **Vote**: each observer registered on the collection's [`Gatekeeper`]
//!    is asked whether the proposed change may proceed. One veto blocks it.
//! 2. **Apply**: the atomic map operation (insert-if-absent, compare-and-swap,
//!    remove-if-same) runs only after a unanimous vote.
//! 3. **Notify**: observers learn about the committed change. No veto is
//!    possible at this point.
//!
//! Data failures (veto, key already taken, deadline missed) are reported as
//! values. Only an observer failing while voting surfaces as an error.

pub mod collection;
pub mod entity;
pub mod error;
pub mod gatekeeper;
pub mod result;

pub use collection::{GatedCollection, RegistryStats};
pub use entity::Entity;
pub use error::{RegistryError, Result, VoteError};
pub use gatekeeper::{ChangeKind, Gatekeeper, Observer, ObserverId, PredicateObserver, Proposal};
pub use result::{AddOptions, AddOutcome, AddResult};
