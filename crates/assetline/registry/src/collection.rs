//! Concurrent key → entity map with veto-gated mutation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assetline_types::{MutationContext, SharedClock};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::entity::Entity;
use crate::error::Result;
use crate::gatekeeper::{ChangeKind, Gatekeeper, Proposal};
use crate::result::{AddOptions, AddOutcome, AddResult};

/// Keyed store of externally owned entities.
///
/// Operations on different keys never block each other; operations racing
/// on the same key are decided by the underlying atomic map primitive, and
/// the loser sees a failure outcome.
pub struct GatedCollection<E, P>
where
    E: Entity,
    P: Clone + Send + Sync + 'static,
{
    entities: DashMap<E::Key, Arc<E>>,
    gatekeeper: Arc<Gatekeeper<E, P>>,
    parent: P,
    clock: SharedClock,
    /// Single-entity applies share it; a batch apply holds it exclusively,
    /// so a batch checks and inserts all its keys with no writer in between.
    apply_lock: RwLock<()>,
    counters: Counters,
}

impl<E, P> GatedCollection<E, P>
where
    E: Entity,
    P: Clone + Send + Sync + 'static,
{
    /// Create an empty collection owned by `parent`.
    pub fn new(parent: P, gatekeeper: Arc<Gatekeeper<E, P>>, clock: SharedClock) -> Self {
        Self {
            entities: DashMap::new(),
            gatekeeper,
            parent,
            clock,
            apply_lock: RwLock::new(()),
            counters: Counters::default(),
        }
    }

    pub fn parent(&self) -> &P {
        &self.parent
    }

    pub fn gatekeeper(&self) -> &Arc<Gatekeeper<E, P>> {
        &self.gatekeeper
    }

    /// Add an entity; fails if its key is taken.
    pub async fn try_add(
        &self,
        entity: Arc<E>,
        context: MutationContext,
    ) -> Result<AddResult<E, P>> {
        self.try_add_with(entity, AddOptions::new().with_context(context))
            .await
    }

    /// Add an entity unless its key is taken, in which case the result is
    /// `NoOperation`.
    pub async fn try_add_if_not_exists(
        &self,
        entity: Arc<E>,
        context: MutationContext,
    ) -> Result<AddResult<E, P>> {
        self.try_add_with(entity, AddOptions::new().with_context(context).if_not_exists())
            .await
    }

    /// Add an entity through the full vote / apply / notify protocol.
    pub async fn try_add_with(
        &self,
        entity: Arc<E>,
        options: AddOptions<E>,
    ) -> Result<AddResult<E, P>> {
        let AddOptions {
            context,
            deadline,
            if_not_exists,
            on_committed,
        } = options;
        let key = entity.key();

        if if_not_exists {
            if let Some(existing) = self.get(&key) {
                return Ok(self.already_present(entity, &existing));
            }
        }

        let proposal = self.proposal(ChangeKind::Add, Arc::clone(&entity), None, &context);

        let approved = match deadline {
            Some(limit) => {
                match tokio::time::timeout(limit, self.gatekeeper.send_voting(&proposal)).await {
                    Ok(vote) => vote?,
                    Err(_) => {
                        self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            key = %key,
                            correlation_id = %context.correlation_id,
                            deadline_ms = limit.as_millis() as u64,
                            "Vote phase exceeded deadline"
                        );
                        return Ok(AddResult::new(entity, AddOutcome::Timeout, self.parent.clone())
                            .with_description("vote phase did not complete before the deadline"));
                    }
                }
            }
            None => self.gatekeeper.send_voting(&proposal).await?,
        };

        if !approved {
            self.counters.vetoed.fetch_add(1, Ordering::Relaxed);
            return Ok(AddResult::error(
                entity,
                self.parent.clone(),
                format!("add of {} vetoed by an observer", key),
            ));
        }

        let applying = self.apply_lock.read().await;
        let conflict = match self.entities.entry(key.clone()) {
            Entry::Occupied(existing) => Some(Arc::clone(existing.get())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&entity));
                None
            }
        };
        drop(applying);

        if let Some(existing) = conflict {
            if if_not_exists {
                return Ok(self.already_present(entity, &existing));
            }
            self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, correlation_id = %context.correlation_id, "Key already taken");
            return Ok(AddResult::error(
                entity,
                self.parent.clone(),
                format!("an entity with key {} is already present", key),
            ));
        }

        self.counters.added.fetch_add(1, Ordering::Relaxed);
        self.gatekeeper.send_notification(&proposal).await;

        if let Some(callback) = on_committed {
            callback(&entity);
        }

        Ok(AddResult::success(entity, self.parent.clone()))
    }

    /// Add several entities all-or-nothing.
    ///
    /// Every entity must be approved by every observer before any of them is
    /// applied. At apply time every key must still be vacant; otherwise
    /// nothing is inserted.
    pub async fn try_add_range(
        &self,
        entities: Vec<Arc<E>>,
        context: MutationContext,
    ) -> Result<Vec<AddResult<E, P>>> {
        self.try_add_range_within(entities, context, None).await
    }

    /// [`try_add_range`](Self::try_add_range) with a deadline applied to the
    /// vote phase and, separately, to taking the exclusive apply lock.
    pub async fn try_add_range_within(
        &self,
        entities: Vec<Arc<E>>,
        context: MutationContext,
        deadline: Option<Duration>,
    ) -> Result<Vec<AddResult<E, P>>> {
        if entities.is_empty() {
            return Ok(Vec::new());
        }

        let mut seen = HashSet::new();
        if let Some(duplicate) = entities.iter().map(|e| e.key()).find(|k| !seen.insert(k.clone())) {
            return Ok(self.fail_batch(
                entities,
                AddOutcome::Error,
                format!("key {} appears more than once in the batch", duplicate),
            ));
        }

        let proposals: Vec<Proposal<E, P>> = entities
            .iter()
            .map(|e| self.proposal(ChangeKind::Add, Arc::clone(e), None, &context))
            .collect();

        let vote_all = async {
            for proposal in &proposals {
                match self.gatekeeper.send_voting(proposal).await {
                    Ok(true) => {}
                    Ok(false) => return Ok(Some(proposal.entity.key())),
                    Err(e) => return Err(e),
                }
            }
            Ok(None)
        };
        let vetoed: Result<Option<E::Key>> = match deadline {
            Some(limit) => match tokio::time::timeout(limit, vote_all).await {
                Ok(vote) => vote,
                Err(_) => {
                    self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        batch_size = entities.len(),
                        correlation_id = %context.correlation_id,
                        "Batch vote phase exceeded deadline"
                    );
                    return Ok(self.fail_batch(
                        entities,
                        AddOutcome::Timeout,
                        "vote phase did not complete before the deadline".into(),
                    ));
                }
            },
            None => vote_all.await,
        };

        if let Some(key) = vetoed? {
            self.counters.vetoed.fetch_add(1, Ordering::Relaxed);
            return Ok(self.fail_batch(
                entities,
                AddOutcome::Error,
                format!("batch rejected: add of {} vetoed by an observer", key),
            ));
        }

        let guard = match deadline {
            Some(limit) => match tokio::time::timeout(limit, self.apply_lock.write()).await {
                Ok(guard) => guard,
                Err(_) => {
                    self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        batch_size = entities.len(),
                        correlation_id = %context.correlation_id,
                        "Batch apply lock not acquired before deadline"
                    );
                    return Ok(self.fail_batch(
                        entities,
                        AddOutcome::LockTimeout,
                        "batch apply lock not acquired before the deadline".into(),
                    ));
                }
            },
            None => self.apply_lock.write().await,
        };

        if let Some(key) = entities
            .iter()
            .map(|e| e.key())
            .find(|k| self.entities.contains_key(k))
        {
            drop(guard);
            self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
            warn!(
                key = %key,
                correlation_id = %context.correlation_id,
                "Batch rejected: key already taken"
            );
            return Ok(self.fail_batch(
                entities,
                AddOutcome::Error,
                format!("batch rejected: an entity with key {} is already present", key),
            ));
        }

        for entity in &entities {
            self.entities.insert(entity.key(), Arc::clone(entity));
        }
        drop(guard);

        self.counters
            .added
            .fetch_add(entities.len() as u64, Ordering::Relaxed);
        for proposal in &proposals {
            self.gatekeeper.send_notification(proposal).await;
        }

        Ok(entities
            .into_iter()
            .map(|e| AddResult::success(e, self.parent.clone()))
            .collect())
    }

    /// Replace the entity under `key` with `replacement`, provided the
    /// current entity is the `expected` handle.
    pub async fn try_update(
        &self,
        key: &E::Key,
        replacement: Arc<E>,
        expected: &Arc<E>,
        context: MutationContext,
    ) -> Result<bool> {
        if replacement.key() != *key {
            warn!(key = %key, replacement_key = %replacement.key(), "Update would change the key");
            return Ok(false);
        }

        let proposal = self.proposal(
            ChangeKind::Update,
            Arc::clone(&replacement),
            Some(Arc::clone(expected)),
            &context,
        );
        if !self.gatekeeper.send_voting(&proposal).await? {
            self.counters.vetoed.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }

        let applying = self.apply_lock.read().await;
        let swapped = match self.entities.get_mut(key) {
            Some(mut current) if Arc::ptr_eq(current.value(), expected) => {
                *current.value_mut() = replacement;
                true
            }
            _ => false,
        };
        drop(applying);

        if !swapped {
            self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, correlation_id = %context.correlation_id, "Update lost compare-and-swap");
            return Ok(false);
        }

        self.counters.updated.fetch_add(1, Ordering::Relaxed);
        self.gatekeeper.send_notification(&proposal).await;
        Ok(true)
    }

    /// Remove whatever entity is stored under `key`.
    pub async fn try_remove(&self, key: &E::Key, context: MutationContext) -> Result<bool> {
        match self.get(key) {
            Some(current) => self.remove_gated(key, current, context).await,
            None => Ok(false),
        }
    }

    /// Remove `entity`, provided it is still the one stored under its key.
    pub async fn try_remove_entity(&self, entity: &Arc<E>, context: MutationContext) -> Result<bool> {
        let key = entity.key();
        if !self.contains(entity) {
            return Ok(false);
        }
        self.remove_gated(&key, Arc::clone(entity), context).await
    }

    async fn remove_gated(&self, key: &E::Key, current: Arc<E>, context: MutationContext) -> Result<bool> {
        let proposal = self.proposal(ChangeKind::Remove, Arc::clone(&current), None, &context);
        if !self.gatekeeper.send_voting(&proposal).await? {
            self.counters.vetoed.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }

        let applying = self.apply_lock.read().await;
        let removed = self
            .entities
            .remove_if(key, |_, stored| Arc::ptr_eq(stored, &current))
            .is_some();
        drop(applying);
        if !removed {
            self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, correlation_id = %context.correlation_id, "Entity changed before removal");
            return Ok(false);
        }

        self.counters.removed.fetch_add(1, Ordering::Relaxed);
        self.gatekeeper.send_notification(&proposal).await;
        Ok(true)
    }

    pub fn get(&self, key: &E::Key) -> Option<Arc<E>> {
        self.entities.get(key).map(|e| Arc::clone(e.value()))
    }

    /// Whether this exact handle is stored under its key.
    pub fn contains(&self, entity: &Arc<E>) -> bool {
        self.entities
            .get(&entity.key())
            .is_some_and(|stored| Arc::ptr_eq(stored.value(), entity))
    }

    pub fn contains_key(&self, key: &E::Key) -> bool {
        self.entities.contains_key(key)
    }

    /// Drop every entity. Not gated; observers are not consulted.
    pub fn clear(&self) {
        let count = self.entities.len();
        self.entities.clear();
        info!(cleared = count, "Gated collection cleared");
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn keys(&self) -> Vec<E::Key> {
        self.entities.iter().map(|e| e.key().clone()).collect()
    }

    /// Snapshot of the current entities, in no particular order.
    pub fn entities(&self) -> Vec<Arc<E>> {
        self.entities.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            entities: self.entities.len(),
            added: self.counters.added.load(Ordering::Relaxed),
            updated: self.counters.updated.load(Ordering::Relaxed),
            removed: self.counters.removed.load(Ordering::Relaxed),
            vetoed: self.counters.vetoed.load(Ordering::Relaxed),
            conflicts: self.counters.conflicts.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
        }
    }

    fn proposal(
        &self,
        kind: ChangeKind,
        entity: Arc<E>,
        other: Option<Arc<E>>,
        context: &MutationContext,
    ) -> Proposal<E, P> {
        Proposal {
            timestamp: self.clock.now(),
            correlation_id: context.correlation_id,
            actor: context.actor.clone(),
            parent: self.parent.clone(),
            kind,
            entity,
            other,
            data_context: context.data_context.clone(),
        }
    }

    fn already_present(&self, entity: Arc<E>, existing: &Arc<E>) -> AddResult<E, P> {
        let result = AddResult::new(entity, AddOutcome::NoOperation, self.parent.clone())
            .with_description("entity already present");
        if Arc::ptr_eq(existing, &result.entity) {
            result
        } else {
            result.with_warning(format!(
                "a different entity is stored under key {}",
                existing.key()
            ))
        }
    }

    fn fail_batch(
        &self,
        entities: Vec<Arc<E>>,
        outcome: AddOutcome,
        description: String,
    ) -> Vec<AddResult<E, P>> {
        entities
            .into_iter()
            .map(|e| {
                AddResult::new(e, outcome, self.parent.clone()).with_description(description.clone())
            })
            .collect()
    }
}

#[derive(Default)]
struct Counters {
    added: AtomicU64,
    updated: AtomicU64,
    removed: AtomicU64,
    vetoed: AtomicU64,
    conflicts: AtomicU64,
    timed_out: AtomicU64,
}

/// Point-in-time counters for a gated collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    /// Entities currently stored.
    pub entities: usize,
    pub added: u64,
    pub updated: u64,
    pub removed: u64,
    /// Mutations blocked by an observer.
    pub vetoed: u64,
    /// Mutations that lost a race for their key.
    pub conflicts: u64,
    /// Adds that missed their deadline.
    pub timed_out: u64,
}
