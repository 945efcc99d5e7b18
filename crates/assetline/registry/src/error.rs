use thiserror::Error;

/// Result type for gated collection operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors raised by gated collection operations.
///
/// Vetoes and key conflicts are not errors; they come back as outcomes.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// An observer failed while casting its vote.
    #[error("observer '{observer}' failed while voting: {source}")]
    Vote {
        observer: String,
        #[source]
        source: VoteError,
    },
}

/// Failure raised by an observer's vote callback.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct VoteError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl VoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}
