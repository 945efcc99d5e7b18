use thiserror::Error;

/// Failure of [`PriorityRace::when_all`](crate::PriorityRace::when_all).
#[derive(Debug, Error)]
pub enum RaceError<E> {
    #[error("worker failed: {0}")]
    Worker(E),

    #[error("worker panicked: {0}")]
    Panicked(String),

    #[error("race cancelled")]
    Cancelled,
}

/// A worker failure swallowed by
/// [`PriorityRace::when_first`](crate::PriorityRace::when_first) and handed to
/// its error handler.
#[derive(Debug)]
pub enum WorkerFailure<E> {
    Failed { index: usize, error: E },
    Panicked { message: String },
}

impl<E> WorkerFailure<E> {
    pub fn into_error(self) -> Option<E> {
        match self {
            WorkerFailure::Failed { error, .. } => Some(error),
            WorkerFailure::Panicked { .. } => None,
        }
    }
}
