//! Temporal status history.
//!
//! A [`StatusHistory`] keeps a bounded, newest-first log of timestamped
//! values and derives two views relative to the injected clock:
//!
//! - **current**: the newest entry whose timestamp is not in the future,
//! - **next**: the oldest entry whose timestamp is in the future.
//!
//! A [`StatusChange`] is broadcast whenever the *value* of current changes,
//! whether because of a mutation or because time moved past a scheduled
//! entry.

pub mod history;

pub use history::{SetMode, StatusChange, StatusHistory};
