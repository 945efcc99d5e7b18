//! Timestamped status history with clock-driven current/next resolution.

use std::collections::BTreeMap;

use assetline_types::{DataContext, HistoryConfig, SharedClock, Timestamped};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Capacity of the change event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How a batch of values is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetMode {
    /// Merge into the existing history.
    Insert,
    /// Discard the existing history first.
    Replace,
}

/// Raised when the value of the current status changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange<T> {
    pub previous: Option<T>,
    pub current: Option<T>,
    /// Timestamp of the entry that is now current.
    pub effective_at: Option<DateTime<Utc>>,
    /// Clock reading when the change was observed.
    pub observed_at: DateTime<Utc>,
    /// Context of the mutation that caused the change; `None` when the change
    /// came from time passing.
    pub context: Option<DataContext>,
}

struct HistoryState<T> {
    /// Newest first, one entry per timestamp.
    entries: Vec<Timestamped<T>>,
    last_inserted: Option<T>,
    current: Option<Timestamped<T>>,
    next: Option<Timestamped<T>>,
}

/// Bounded log of timestamped values with derived current/next views.
///
/// All mutation and view recomputation happens under one lock, so readers
/// never see the log and the views out of step.
pub struct StatusHistory<T> {
    state: Mutex<HistoryState<T>>,
    clock: SharedClock,
    max_size: usize,
    events: broadcast::Sender<StatusChange<T>>,
}

impl<T> StatusHistory<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create an empty history.
    pub fn new(clock: SharedClock, config: &HistoryConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(HistoryState {
                entries: Vec::new(),
                last_inserted: None,
                current: None,
                next: None,
            }),
            clock,
            max_size: config.max_size.max(1),
            events,
        }
    }

    /// Create a history seeded with one value stamped with the current time.
    pub fn with_value(clock: SharedClock, config: &HistoryConfig, value: T) -> Self {
        let history = Self::new(clock, config);
        history.insert(value, None);
        history
    }

    /// Create a history seeded with many values.
    pub fn with_values(
        clock: SharedClock,
        config: &HistoryConfig,
        values: impl IntoIterator<Item = Timestamped<T>>,
    ) -> Self {
        let history = Self::new(clock, config);
        history.insert_many(values, None);
        history
    }

    /// Receive a [`StatusChange`] every time the current value changes.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange<T>> {
        self.events.subscribe()
    }

    /// Record `value` as of now. See [`insert_at`](Self::insert_at).
    pub fn insert(&self, value: T, context: Option<DataContext>) -> bool {
        let now = self.clock.now();
        self.insert_at(value, now, context)
    }

    /// Record `value` at `timestamp`.
    ///
    /// Ignored (returning `false`) when `value` equals the most recently
    /// inserted value, whatever the timestamps. An existing entry with the
    /// same timestamp is replaced.
    pub fn insert_at(&self, value: T, timestamp: DateTime<Utc>, context: Option<DataContext>) -> bool {
        let mut state = self.state.lock();

        if state.last_inserted.as_ref() == Some(&value) {
            trace!(%timestamp, "Repeated status ignored");
            return false;
        }

        state.entries.retain(|e| e.timestamp != timestamp);
        state.entries.push(Timestamped::new(timestamp, value.clone()));
        state.entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        state.entries.truncate(self.max_size);
        state.last_inserted = Some(value);

        self.recompute(&mut state, context);
        true
    }

    /// Merge timestamped values into the history. Where timestamps collide,
    /// the incoming value wins (the later one, within `values`).
    pub fn insert_many(
        &self,
        values: impl IntoIterator<Item = Timestamped<T>>,
        context: Option<DataContext>,
    ) -> bool {
        self.set(values, SetMode::Insert, context)
    }

    /// Overwrite the whole history with `values`.
    pub fn replace(
        &self,
        values: impl IntoIterator<Item = Timestamped<T>>,
        context: Option<DataContext>,
    ) -> bool {
        self.set(values, SetMode::Replace, context)
    }

    /// Apply a batch of values. An empty batch is a no-op, even in
    /// [`SetMode::Replace`].
    pub fn set(
        &self,
        values: impl IntoIterator<Item = Timestamped<T>>,
        mode: SetMode,
        context: Option<DataContext>,
    ) -> bool {
        let incoming: Vec<Timestamped<T>> = values.into_iter().collect();
        if incoming.is_empty() {
            return false;
        }

        let mut state = self.state.lock();

        let mut merged: BTreeMap<DateTime<Utc>, T> = match mode {
            SetMode::Insert => state
                .entries
                .drain(..)
                .map(|e| (e.timestamp, e.value))
                .collect(),
            SetMode::Replace => BTreeMap::new(),
        };
        let newest_incoming = incoming
            .iter()
            .max_by_key(|e| e.timestamp)
            .map(|e| e.value.clone());
        for entry in incoming {
            merged.insert(entry.timestamp, entry.value);
        }

        state.entries = merged
            .into_iter()
            .rev()
            .take(self.max_size)
            .map(|(timestamp, value)| Timestamped::new(timestamp, value))
            .collect();
        state.last_inserted = newest_incoming;

        debug!(
            mode = ?mode,
            entries = state.entries.len(),
            "Status history batch applied"
        );
        self.recompute(&mut state, context);
        true
    }

    /// Newest entry at or before now.
    pub fn current_status(&self) -> Option<Timestamped<T>> {
        let mut state = self.state.lock();
        self.recompute(&mut state, None);
        state.current.clone()
    }

    /// Value of [`current_status`](Self::current_status).
    pub fn current_value(&self) -> Option<T> {
        self.current_status().map(|s| s.value)
    }

    /// Oldest entry after now.
    pub fn next_status(&self) -> Option<Timestamped<T>> {
        let mut state = self.state.lock();
        self.recompute(&mut state, None);
        state.next.clone()
    }

    /// Re-evaluate current/next against the clock. Returns whether the
    /// current value changed.
    pub fn refresh(&self) -> bool {
        let mut state = self.state.lock();
        self.recompute(&mut state, None)
    }

    /// All retained entries, newest first.
    pub fn entries(&self) -> Vec<Timestamped<T>> {
        self.state.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Derive current/next and broadcast a change if the current value moved.
    ///
    /// Runs under the state lock; the event is sent before the lock is
    /// released so subscribers observe changes in mutation order.
    fn recompute(&self, state: &mut HistoryState<T>, context: Option<DataContext>) -> bool {
        let now = self.clock.now();
        let current = state.entries.iter().find(|e| e.timestamp <= now).cloned();
        let next = state
            .entries
            .iter()
            .rev()
            .find(|e| e.timestamp > now)
            .cloned();

        let previous = state.current.as_ref().map(|c| c.value.clone());
        let changed = previous.as_ref() != current.as_ref().map(|c| &c.value);

        state.current = current;
        state.next = next;

        if changed {
            let change = StatusChange {
                previous,
                current: state.current.as_ref().map(|c| c.value.clone()),
                effective_at: state.current.as_ref().map(|c| c.timestamp),
                observed_at: now,
                context,
            };
            // No subscribers is fine
            let _ = self.events.send(change);
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assetline_types::ManualClock;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;
    use tokio::sync::broadcast::error::TryRecvError;

    #[derive(Debug, Clone, PartialEq)]
    enum Status {
        Active,
        Maintenance,
        Retired,
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    }

    fn setup() -> (Arc<ManualClock>, StatusHistory<Status>) {
        let clock = Arc::new(ManualClock::new(start()));
        let history = StatusHistory::new(clock.clone(), &HistoryConfig::default());
        (clock, history)
    }

    fn at(secs: i64, value: Status) -> Timestamped<Status> {
        Timestamped::new(start() + Duration::seconds(secs), value)
    }

    #[test]
    fn test_repeated_value_is_ignored() {
        let (clock, history) = setup();
        assert!(history.insert(Status::Active, None));
        clock.advance(Duration::seconds(5));
        assert!(!history.insert(Status::Active, None));
        assert_eq!(history.len(), 1);

        assert!(history.insert(Status::Maintenance, None));
        assert!(history.insert(Status::Active, None));
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_current_and_next_follow_the_clock() {
        let (clock, history) = setup();
        history.insert_many(vec![at(-10, Status::Active), at(10, Status::Maintenance)], None);

        assert_eq!(history.current_value(), Some(Status::Active));
        assert_eq!(
            history.next_status().map(|s| s.value),
            Some(Status::Maintenance)
        );

        clock.advance(Duration::seconds(11));
        assert_eq!(history.current_value(), Some(Status::Maintenance));
        assert!(history.next_status().is_none());
    }

    #[test]
    fn test_next_is_the_oldest_future_entry() {
        let (_clock, history) = setup();
        history.insert_many(
            vec![at(30, Status::Retired), at(10, Status::Maintenance)],
            None,
        );
        assert!(history.current_status().is_none());
        assert_eq!(history.next_status().unwrap().timestamp, start() + Duration::seconds(10));
    }

    #[test]
    fn test_same_timestamp_is_replaced() {
        let (_clock, history) = setup();
        let ts = start() - Duration::seconds(1);
        history.insert_at(Status::Active, ts, None);
        history.insert_at(Status::Maintenance, ts, None);

        assert_eq!(history.len(), 1);
        assert_eq!(history.current_value(), Some(Status::Maintenance));
    }

    #[test]
    fn test_truncation_keeps_newest() {
        let clock = Arc::new(ManualClock::new(start()));
        let history = StatusHistory::new(clock, &HistoryConfig { max_size: 3 });

        let statuses = [Status::Active, Status::Maintenance];
        for i in 0..10 {
            history.insert_at(statuses[i % 2].clone(), start() - Duration::seconds(100 - i as i64), None);
        }

        let entries = history.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].timestamp, start() - Duration::seconds(91));
        assert!(entries.windows(2).all(|w| w[0].timestamp > w[1].timestamp));
    }

    #[test]
    fn test_batch_insert_merges_and_collapses_timestamps() {
        let (_clock, history) = setup();
        history.insert_many(vec![at(-30, Status::Active), at(-20, Status::Maintenance)], None);
        history.insert_many(
            vec![at(-20, Status::Retired), at(-10, Status::Active), at(-10, Status::Maintenance)],
            None,
        );

        let entries = history.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].value, Status::Maintenance);
        assert_eq!(entries[1].value, Status::Retired);
        assert_eq!(entries[2].value, Status::Active);
    }

    #[test]
    fn test_replace_discards_existing() {
        let (_clock, history) = setup();
        history.insert_many(vec![at(-30, Status::Active), at(-20, Status::Maintenance)], None);
        history.set(vec![at(-5, Status::Retired)], SetMode::Replace, None);

        assert_eq!(history.len(), 1);
        assert_eq!(history.current_value(), Some(Status::Retired));
    }

    #[test]
    fn test_empty_batches_are_no_ops() {
        let (_clock, history) = setup();
        history.insert(Status::Active, None);
        assert!(!history.replace(Vec::new(), None));
        assert!(!history.insert_many(Vec::new(), None));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_change_event_only_on_value_change() {
        let (_clock, history) = setup();
        let mut rx = history.subscribe();

        history.insert_at(Status::Active, start() - Duration::seconds(10), Some(DataContext::new("telemetry")));
        let change = rx.try_recv().unwrap();
        assert_eq!(change.previous, None);
        assert_eq!(change.current, Some(Status::Active));
        assert_eq!(change.context.unwrap().source, "telemetry");

        // older entry: current value stays Active
        history.insert_at(Status::Maintenance, start() - Duration::seconds(20), None);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        // newer timestamp, same value: timestamp-only change
        history.insert_many(vec![at(-1, Status::Active)], None);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(history.current_status().unwrap().timestamp, start() - Duration::seconds(1));

        history.insert(Status::Retired, None);
        let change = rx.try_recv().unwrap();
        assert_eq!(change.previous, Some(Status::Active));
        assert_eq!(change.current, Some(Status::Retired));
    }

    #[test]
    fn test_time_passing_raises_change_on_read() {
        let (clock, history) = setup();
        history.insert_many(vec![at(-10, Status::Active), at(10, Status::Retired)], None);
        let mut rx = history.subscribe();

        assert!(!history.refresh());
        clock.advance(Duration::seconds(15));
        assert_eq!(history.current_value(), Some(Status::Retired));

        let change = rx.try_recv().unwrap();
        assert_eq!(change.previous, Some(Status::Active));
        assert!(change.context.is_none());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_seeded_constructors() {
        let clock = Arc::new(ManualClock::new(start()));
        let single = StatusHistory::with_value(clock.clone(), &HistoryConfig::default(), Status::Active);
        assert_eq!(single.current_value(), Some(Status::Active));

        let many = StatusHistory::with_values(
            clock,
            &HistoryConfig::default(),
            vec![at(-1, Status::Maintenance), at(1, Status::Active)],
        );
        assert_eq!(many.len(), 2);
        assert_eq!(many.current_value(), Some(Status::Maintenance));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_inserts_keep_log_consistent() {
        let clock = Arc::new(ManualClock::new(start()));
        let history = Arc::new(StatusHistory::new(clock, &HistoryConfig { max_size: 50 }));

        let mut handles = Vec::new();
        for worker in 0..8i64 {
            let history = Arc::clone(&history);
            handles.push(tokio::spawn(async move {
                for i in 0..20i64 {
                    let ts = start() - Duration::seconds(worker * 100 + i);
                    history.insert_many(vec![Timestamped::new(ts, worker * 100 + i)], None);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let entries = history.entries();
        assert_eq!(entries.len(), 50);
        assert!(entries.windows(2).all(|w| w[0].timestamp > w[1].timestamp));
        assert_eq!(history.current_status().unwrap().timestamp, start());
    }
}
