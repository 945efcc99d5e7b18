//! Context attached to every container mutation.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::{ActorId, CorrelationId};

/// Where a mutation's data came from (feed name, import batch, operator
/// console...). Purely informational; containers pass it through to
/// observers and events untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataContext {
    /// Originating system or feed.
    pub source: String,

    /// Free-form detail (batch number, file name).
    pub detail: Option<String>,
}

impl DataContext {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl fmt::Display for DataContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{} ({})", self.source, detail),
            None => write!(f, "{}", self.source),
        }
    }
}

/// Who is mutating, under which correlation id, and from which data source.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MutationContext {
    pub correlation_id: CorrelationId,
    pub actor: ActorId,
    pub data_context: Option<DataContext>,
}

impl MutationContext {
    /// Fresh correlation id on behalf of `actor`.
    pub fn for_actor(actor: ActorId) -> Self {
        Self {
            actor,
            ..Self::default()
        }
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_data_context(mut self, data_context: DataContext) -> Self {
        self.data_context = Some(data_context);
        self
    }
}
