//! Structured outcome of adding an entity.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use assetline_types::MutationContext;
use serde::{Deserialize, Serialize};

/// How an add attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddOutcome {
    /// The entity was added.
    Success,

    /// Vetoed, or the key was already taken.
    Error,

    /// Already present (if-not-exists adds only).
    NoOperation,

    /// Administratively disabled; nothing was attempted.
    AdminDown,

    /// Accepted for deferred processing; nothing was applied yet.
    Enqueued,

    /// The vote phase did not finish before the deadline.
    Timeout,

    /// The batch apply lock could not be taken before the deadline.
    LockTimeout,
}

impl AddOutcome {
    /// Whether a caller may reasonably retry the same add.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AddOutcome::Timeout | AddOutcome::LockTimeout)
    }
}

impl fmt::Display for AddOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddOutcome::Success => write!(f, "success"),
            AddOutcome::Error => write!(f, "error"),
            AddOutcome::NoOperation => write!(f, "no-operation"),
            AddOutcome::AdminDown => write!(f, "admin-down"),
            AddOutcome::Enqueued => write!(f, "enqueued"),
            AddOutcome::Timeout => write!(f, "timeout"),
            AddOutcome::LockTimeout => write!(f, "lock-timeout"),
        }
    }
}

/// Result of an add, with a back-reference to the collection's owner.
#[derive(Debug, Clone)]
pub struct AddResult<E, P> {
    pub entity: Arc<E>,
    pub outcome: AddOutcome,
    pub description: Option<String>,
    pub warnings: Vec<String>,
    pub parent: P,
}

impl<E, P> AddResult<E, P> {
    pub fn new(entity: Arc<E>, outcome: AddOutcome, parent: P) -> Self {
        Self {
            entity,
            outcome,
            description: None,
            warnings: Vec::new(),
            parent,
        }
    }

    pub fn success(entity: Arc<E>, parent: P) -> Self {
        Self::new(entity, AddOutcome::Success, parent)
    }

    pub fn error(entity: Arc<E>, parent: P, description: impl Into<String>) -> Self {
        Self::new(entity, AddOutcome::Error, parent).with_description(description)
    }

    /// The owner is administratively down; the add was not attempted.
    pub fn admin_down(entity: Arc<E>, parent: P, reason: impl Into<String>) -> Self {
        Self::new(entity, AddOutcome::AdminDown, parent).with_description(reason)
    }

    /// The add was handed to a deferred queue.
    pub fn enqueued(entity: Arc<E>, parent: P) -> Self {
        Self::new(entity, AddOutcome::Enqueued, parent)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == AddOutcome::Success
    }
}

type CommitCallback<E> = Box<dyn FnOnce(&Arc<E>) + Send>;

/// Knobs for [`GatedCollection::try_add_with`].
///
/// [`GatedCollection::try_add_with`]: crate::GatedCollection::try_add_with
pub struct AddOptions<E> {
    pub context: MutationContext,

    /// Upper bound on the vote phase.
    pub deadline: Option<Duration>,

    /// Report `NoOperation` instead of `Error` when the key is taken.
    pub if_not_exists: bool,

    /// Runs once after the entity is committed and observers are notified.
    pub on_committed: Option<CommitCallback<E>>,
}

impl<E> AddOptions<E> {
    pub fn new() -> Self {
        Self {
            context: MutationContext::default(),
            deadline: None,
            if_not_exists: false,
            on_committed: None,
        }
    }

    pub fn with_context(mut self, context: MutationContext) -> Self {
        self.context = context;
        self
    }

    pub fn within(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn if_not_exists(mut self) -> Self {
        self.if_not_exists = true;
        self
    }

    pub fn on_committed(mut self, callback: impl FnOnce(&Arc<E>) + Send + 'static) -> Self {
        self.on_committed = Some(Box::new(callback));
        self
    }
}

impl<E> Default for AddOptions<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for AddOptions<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddOptions")
            .field("context", &self.context)
            .field("deadline", &self.deadline)
            .field("if_not_exists", &self.if_not_exists)
            .field("on_committed", &self.on_committed.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_administrative_results() {
        let down = AddResult::admin_down(Arc::new(1u32), "depot", "maintenance window");
        assert_eq!(down.outcome, AddOutcome::AdminDown);
        assert_eq!(down.description.as_deref(), Some("maintenance window"));
        assert!(!down.is_success());

        let queued = AddResult::enqueued(Arc::new(2u32), "depot").with_warning("queue is deep");
        assert_eq!(queued.outcome, AddOutcome::Enqueued);
        assert_eq!(queued.warnings, vec!["queue is deep".to_string()]);
        assert_eq!(queued.parent, "depot");
    }

    #[test]
    fn test_retryable_outcomes() {
        assert!(AddOutcome::Timeout.is_retryable());
        assert!(AddOutcome::LockTimeout.is_retryable());
        assert!(!AddOutcome::Error.is_retryable());
        assert_eq!(AddOutcome::NoOperation.to_string(), "no-operation");
    }
}
