//! Multicast voting and notification.
//!
//! The [`Gatekeeper`] keeps observers in registration order. Voting is a
//! logical AND across all of them and stops at the first veto; an empty
//! gatekeeper approves everything.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use assetline_types::{ActorId, CorrelationId, DataContext};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RegistryError, Result, VoteError};

/// Kind of mutation being proposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Add,
    Update,
    Remove,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Add => write!(f, "add"),
            ChangeKind::Update => write!(f, "update"),
            ChangeKind::Remove => write!(f, "remove"),
        }
    }
}

/// A mutation as presented to observers, both for the vote and for the
/// post-commit notification.
#[derive(Debug)]
pub struct Proposal<E, P> {
    pub timestamp: DateTime<Utc>,
    pub correlation_id: CorrelationId,
    pub actor: ActorId,
    /// Handle of the collection's owner.
    pub parent: P,
    pub kind: ChangeKind,
    /// Entity being added, the replacement for updates, or the entity being
    /// removed.
    pub entity: Arc<E>,
    /// The entity being replaced (updates only).
    pub other: Option<Arc<E>>,
    pub data_context: Option<DataContext>,
}

impl<E, P: Clone> Clone for Proposal<E, P> {
    fn clone(&self) -> Self {
        Self {
            timestamp: self.timestamp,
            correlation_id: self.correlation_id,
            actor: self.actor.clone(),
            parent: self.parent.clone(),
            kind: self.kind,
            entity: Arc::clone(&self.entity),
            other: self.other.clone(),
            data_context: self.data_context.clone(),
        }
    }
}

/// Participant in the gate.
///
/// Both callbacks default to "approve" and "ignore", so an observer only
/// overrides the phase it cares about.
#[async_trait]
pub trait Observer<E, P>: Send + Sync
where
    E: Send + Sync + 'static,
    P: Send + Sync + 'static,
{
    /// Name used in logs and error reports.
    fn name(&self) -> &str {
        "observer"
    }

    /// Approve (`Ok(true)`) or veto (`Ok(false)`) a proposed change.
    ///
    /// An `Err` aborts the whole operation and reaches the caller.
    async fn vote(&self, _proposal: &Proposal<E, P>) -> std::result::Result<bool, VoteError> {
        Ok(true)
    }

    /// Learn about a committed change.
    async fn notify(&self, _proposal: &Proposal<E, P>) {}
}

/// Handle returned by [`Gatekeeper::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer:{}", self.0)
    }
}

/// Ordered set of observers consulted by a gated collection.
pub struct Gatekeeper<E, P>
where
    E: Send + Sync + 'static,
    P: Send + Sync + 'static,
{
    observers: RwLock<Vec<(ObserverId, Arc<dyn Observer<E, P>>)>>,
    next_id: AtomicU64,
}

impl<E, P> Gatekeeper<E, P>
where
    E: Send + Sync + 'static,
    P: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Append an observer; it votes after every observer registered before it.
    pub fn register(&self, observer: Arc<dyn Observer<E, P>>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(observer_id = %id, name = observer.name(), "Observer registered");
        self.observers.write().push((id, observer));
        id
    }

    /// Register a vote predicate and a notification handler as one observer.
    pub fn register_fn<V, N>(&self, name: impl Into<String>, vote: V, notify: N) -> ObserverId
    where
        V: Fn(&Proposal<E, P>) -> bool + Send + Sync + 'static,
        N: Fn(&Proposal<E, P>) + Send + Sync + 'static,
    {
        self.register(Arc::new(PredicateObserver::new(name, vote, notify)))
    }

    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<dyn Observer<E, P>>> {
        self.observers
            .read()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect()
    }

    /// Ask every observer, in registration order, to approve `proposal`.
    pub async fn send_voting(&self, proposal: &Proposal<E, P>) -> Result<bool> {
        for observer in self.snapshot() {
            match observer.vote(proposal).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(
                        observer = observer.name(),
                        kind = %proposal.kind,
                        correlation_id = %proposal.correlation_id,
                        "Change vetoed"
                    );
                    return Ok(false);
                }
                Err(source) => {
                    return Err(RegistryError::Vote {
                        observer: observer.name().to_string(),
                        source,
                    });
                }
            }
        }
        Ok(true)
    }

    /// Tell every observer about a committed change.
    pub async fn send_notification(&self, proposal: &Proposal<E, P>) {
        for observer in self.snapshot() {
            observer.notify(proposal).await;
        }
    }
}

impl<E, P> Default for Gatekeeper<E, P>
where
    E: Send + Sync + 'static,
    P: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

type VoteFn<E, P> = Box<dyn Fn(&Proposal<E, P>) -> bool + Send + Sync>;
type NotifyFn<E, P> = Box<dyn Fn(&Proposal<E, P>) + Send + Sync>;

/// Observer built from a synchronous predicate and handler.
pub struct PredicateObserver<E, P> {
    name: String,
    vote: VoteFn<E, P>,
    notify: NotifyFn<E, P>,
}

impl<E, P> PredicateObserver<E, P> {
    pub fn new<V, N>(name: impl Into<String>, vote: V, notify: N) -> Self
    where
        V: Fn(&Proposal<E, P>) -> bool + Send + Sync + 'static,
        N: Fn(&Proposal<E, P>) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            vote: Box::new(vote),
            notify: Box::new(notify),
        }
    }
}

#[async_trait]
impl<E, P> Observer<E, P> for PredicateObserver<E, P>
where
    E: Send + Sync + 'static,
    P: Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn vote(&self, proposal: &Proposal<E, P>) -> std::result::Result<bool, VoteError> {
        Ok((self.vote)(proposal))
    }

    async fn notify(&self, proposal: &Proposal<E, P>) {
        (self.notify)(proposal)
    }
}
