//! Shared vocabulary for the assetline container crates.
//!
//! Every container in the workspace speaks the same language:
//! - an injected [`Clock`] instead of reading wall time directly,
//! - a [`MutationContext`] (correlation id, acting user, optional data
//!   context) attached to every mutation,
//! - [`Timestamped`] values and the [`Validity`] capability for values that
//!   carry a validity window.

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod ids;
pub mod temporal;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{ContainerConfig, HistoryConfig, RaceConfig, ValidityConfig};
pub use context::{DataContext, MutationContext};
pub use error::ConfigError;
pub use ids::{ActorId, CorrelationId};
pub use temporal::{Timestamped, Validity, ValidityWindow};
