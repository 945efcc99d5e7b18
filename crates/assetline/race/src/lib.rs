//! Priority race executor.
//!
//! A [`PriorityRace`] holds an ordered set of workers and runs one async
//! invocation per worker, either joining all of them
//! ([`PriorityRace::when_all`]) or returning the first verified answer and
//! cancelling the rest ([`PriorityRace::when_first`]).

pub mod error;
pub mod race;

pub use error::{RaceError, WorkerFailure};
pub use race::PriorityRace;
pub use tokio_util::sync::CancellationToken;
