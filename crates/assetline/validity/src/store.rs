//! Per-key validity-window storage.
//!
//! Each key owns a small list guarded by its own lock; the map of keys is a
//! `DashMap`, so writers on different keys never contend.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use assetline_types::{SharedClock, Validity, ValidityConfig};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Result of [`ValidityStore::add_or_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddOrUpdateOutcome {
    /// Appended as a new window.
    Add,
    /// Replaced a value with the same window.
    Update,
    /// Rejected: the window overlaps an existing one.
    Failed,
}

impl fmt::Display for AddOrUpdateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddOrUpdateOutcome::Add => write!(f, "add"),
            AddOrUpdateOutcome::Update => write!(f, "update"),
            AddOrUpdateOutcome::Failed => write!(f, "failed"),
        }
    }
}

/// One key's list and its lock.
struct KeySlot<V> {
    state: Mutex<SlotState<V>>,
}

struct SlotState<V> {
    values: Vec<V>,
    /// Set when the key is removed; writers holding this slot must retry
    /// against a fresh one.
    retired: bool,
}

impl<V> Default for KeySlot<V> {
    fn default() -> Self {
        Self {
            state: Mutex::new(SlotState {
                values: Vec::new(),
                retired: false,
            }),
        }
    }
}

/// Key → validity-window values, with overlap rejection per key.
///
/// Each key has its own lock: operations on different keys never contend,
/// and the scan, overlap check and mutation of one operation happen under
/// the key's lock.
pub struct ValidityStore<K, V> {
    slots: DashMap<K, Arc<KeySlot<V>>>,
    clock: SharedClock,
    tolerance: Duration,
}

impl<K, V> ValidityStore<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync,
    V: Validity + Clone + Send,
{
    pub fn new(clock: SharedClock, config: &ValidityConfig) -> Self {
        Self::with_tolerance(clock, config.tolerance())
    }

    pub fn with_tolerance(clock: SharedClock, tolerance: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            clock,
            tolerance,
        }
    }

    /// Tolerance used when an operation is not given one.
    pub fn default_tolerance(&self) -> Duration {
        self.tolerance
    }

    /// Append `value` unless its window overlaps any window stored for `key`.
    pub fn try_add(&self, key: &K, value: V, tolerance: Option<Duration>) -> bool {
        let tol = self.resolve(tolerance);
        self.write_slot(key, |values| {
            if values.iter().any(|existing| existing.overlaps(&value, tol)) {
                debug!(key = ?key, "Validity window conflicts with an existing one");
                return false;
            }
            values.push(value.clone());
            true
        })
    }

    /// Replace the value whose window matches `value`'s within tolerance, or
    /// append `value` if it overlaps nothing.
    ///
    /// A replacement must not overlap any of the key's other windows.
    pub fn add_or_update(&self, key: &K, value: V, tolerance: Option<Duration>) -> AddOrUpdateOutcome {
        let tol = self.resolve(tolerance);
        self.write_slot(key, |values| {
            if let Some(index) = values.iter().position(|existing| existing.same_window(&value, tol)) {
                let conflict = values
                    .iter()
                    .enumerate()
                    .any(|(i, other)| i != index && other.overlaps(&value, tol));
                if conflict {
                    debug!(key = ?key, "Replacement window conflicts with another value");
                    return AddOrUpdateOutcome::Failed;
                }
                values[index] = value.clone();
                return AddOrUpdateOutcome::Update;
            }
            if values.iter().any(|existing| existing.overlaps(&value, tol)) {
                debug!(key = ?key, "Validity window conflicts with an existing one");
                return AddOrUpdateOutcome::Failed;
            }
            values.push(value.clone());
            AddOrUpdateOutcome::Add
        })
    }

    /// Substitute the value whose window matches `current`'s with
    /// `replacement`.
    ///
    /// The replacement is checked against every other window for the key and
    /// rejected if it would overlap one of them.
    pub fn try_update(&self, key: &K, current: &V, replacement: V, tolerance: Option<Duration>) -> bool {
        let tol = self.resolve(tolerance);
        let Some(slot) = self.slot(key) else {
            return false;
        };
        let mut state = slot.state.lock();
        if state.retired {
            return false;
        }

        let Some(index) = state.values.iter().position(|v| v.same_window(current, tol)) else {
            return false;
        };
        let conflict = state
            .values
            .iter()
            .enumerate()
            .any(|(i, other)| i != index && other.overlaps(&replacement, tol));
        if conflict {
            debug!(key = ?key, "Replacement window conflicts with another value");
            return false;
        }

        state.values[index] = replacement;
        true
    }

    /// Without `at`: whether the key has any value. With `at`: whether one
    /// of its values is valid at that instant.
    pub fn contains_key(&self, key: &K, at: Option<DateTime<Utc>>, tolerance: Option<Duration>) -> bool {
        let tol = self.resolve(tolerance);
        self.read_slot(key, |values| match at {
            Some(at) => values.iter().any(|v| v.is_valid_at(at, tol)),
            None => !values.is_empty(),
        })
        .unwrap_or(false)
    }

    /// The key's value valid at `at` (or, without `at`, any of its values).
    ///
    /// When several qualify, the one with the latest `not_before` wins; an
    /// open start counts as earliest.
    pub fn try_get_value(&self, key: &K, at: Option<DateTime<Utc>>, tolerance: Option<Duration>) -> Option<V> {
        let tol = self.resolve(tolerance);
        self.read_slot(key, |values| pick(values, at, tol)).flatten()
    }

    /// The key's value valid now, according to the store's clock.
    pub fn current_value(&self, key: &K) -> Option<V> {
        self.try_get_value(key, Some(self.clock.now()), None)
    }

    /// All values stored for the key, in insertion order.
    pub fn try_get_values(&self, key: &K) -> Option<Vec<V>> {
        self.read_slot(key, |values| values.to_vec())
            .filter(|values| !values.is_empty())
    }

    /// Remove the key with all its values.
    pub fn remove(&self, key: &K) -> Option<Vec<V>> {
        let (_, slot) = self.slots.remove(key)?;
        let mut state = slot.state.lock();
        state.retired = true;
        let values = std::mem::take(&mut state.values);
        (!values.is_empty()).then_some(values)
    }

    /// Without `at`: every stored value. With `at`: for each key, the value
    /// [`try_get_value`](Self::try_get_value) would return.
    pub fn values(&self, at: Option<DateTime<Utc>>, tolerance: Option<Duration>) -> Vec<V> {
        let tol = self.resolve(tolerance);
        self.slots_snapshot()
            .into_iter()
            .flat_map(|(_, slot)| {
                let state = slot.state.lock();
                match at {
                    Some(at) => pick(&state.values, Some(at), tol).into_iter().collect::<Vec<_>>(),
                    None => state.values.clone(),
                }
            })
            .collect()
    }

    /// Values valid now, according to the store's clock.
    pub fn current_values(&self) -> Vec<V> {
        self.values(Some(self.clock.now()), None)
    }

    /// Keys that hold at least one value.
    pub fn keys(&self) -> Vec<K> {
        self.snapshot().into_iter().map(|(key, _)| key).collect()
    }

    /// Every key with its values.
    pub fn snapshot(&self) -> Vec<(K, Vec<V>)> {
        self.slots_snapshot()
            .into_iter()
            .filter_map(|(key, slot)| {
                let values = slot.state.lock().values.clone();
                (!values.is_empty()).then_some((key, values))
            })
            .collect()
    }

    /// Number of keys holding at least one value.
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn resolve(&self, tolerance: Option<Duration>) -> Duration {
        tolerance.unwrap_or(self.tolerance)
    }

    fn slot(&self, key: &K) -> Option<Arc<KeySlot<V>>> {
        self.slots.get(key).map(|slot| Arc::clone(slot.value()))
    }

    /// Clone the slot handles so no map shard lock is held while a key lock
    /// is taken.
    fn slots_snapshot(&self) -> Vec<(K, Arc<KeySlot<V>>)> {
        self.slots
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    fn read_slot<R>(&self, key: &K, op: impl FnOnce(&[V]) -> R) -> Option<R> {
        let slot = self.slot(key)?;
        let state = slot.state.lock();
        Some(op(&state.values))
    }

    /// Run `op` on the key's list under its lock, creating the key if needed.
    fn write_slot<R>(&self, key: &K, mut op: impl FnMut(&mut Vec<V>) -> R) -> R {
        loop {
            let slot = Arc::clone(self.slots.entry(key.clone()).or_default().value());
            let mut state = slot.state.lock();
            if state.retired {
                // lost a race with remove(); the map now holds a fresh slot
                continue;
            }
            return op(&mut state.values);
        }
    }
}

fn pick<V: Validity + Clone>(values: &[V], at: Option<DateTime<Utc>>, tol: Duration) -> Option<V> {
    values
        .iter()
        .filter(|v| at.map_or(true, |at| v.is_valid_at(at, tol)))
        .max_by_key(|v| v.not_before())
        .cloned()
}
