//! Priority-ordered worker set and its join / first-verified-answer races.

use std::future::Future;
use std::time::Duration;

use assetline_types::RaceConfig;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RaceError, WorkerFailure};

struct Ranked<W> {
    priority: i64,
    worker: W,
}

/// Ordered workers raced against each other.
///
/// Lower priority values launch first; equal priorities launch in insertion
/// order. Launch order is the only thing priority decides: every invocation
/// runs concurrently.
pub struct PriorityRace<W> {
    workers: Vec<Ranked<W>>,
    default_timeout: Duration,
}

impl<W: Clone> Default for PriorityRace<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Clone> PriorityRace<W> {
    pub fn new() -> Self {
        Self::with_config(&RaceConfig::default())
    }

    pub fn with_config(config: &RaceConfig) -> Self {
        Self {
            workers: Vec::new(),
            default_timeout: config.default_timeout(),
        }
    }

    /// Timeout from the configuration this race was built with.
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Add a worker after every existing one. Returns its priority.
    pub fn add(&mut self, worker: W) -> i64 {
        let priority = self
            .workers
            .iter()
            .map(|ranked| ranked.priority)
            .max()
            .map_or(0, |max| max.saturating_add(1));
        self.add_with_priority(priority, worker);
        priority
    }

    pub fn add_with_priority(&mut self, priority: i64, worker: W) {
        let position = self.workers.partition_point(|ranked| ranked.priority <= priority);
        self.workers.insert(position, Ranked { priority, worker });
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Workers with their priorities, in launch order.
    pub fn workers(&self) -> impl Iterator<Item = (i64, &W)> {
        self.workers.iter().map(|ranked| (ranked.priority, &ranked.worker))
    }

    /// Run `work` for every worker and wait for all of them.
    ///
    /// Results come back in launch order. The first failure, panic or
    /// external cancellation ends the join and aborts whatever is still
    /// running.
    pub async fn when_all<F, Fut, R, E>(
        &self,
        work: F,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<R>, RaceError<E>>
    where
        F: Fn(W, CancellationToken) -> Fut,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Send + 'static,
        E: Send + 'static,
    {
        let token = scoped_token(cancel);
        let mut results: Vec<Option<R>> = std::iter::repeat_with(|| None).take(self.len()).collect();
        let mut pending = self.launch(&work, &token);

        loop {
            let step = tokio::select! {
                biased;
                _ = token.cancelled() => Step::Cancelled,
                next = pending.next() => Step::from(next),
            };

            match step {
                Step::Exhausted => break,
                Step::Cancelled | Step::TimedOut => {
                    debug!(pending = pending.len(), "Join cancelled");
                    return Err(RaceError::Cancelled);
                }
                Step::Completed((index, Ok(result))) => results[index] = Some(result),
                Step::Completed((index, Err(error))) => {
                    warn!(index, priority = self.workers[index].priority, "Worker failed, aborting join");
                    token.cancel();
                    return Err(RaceError::Worker(error));
                }
                Step::Crashed(join_error) => {
                    token.cancel();
                    return Err(match panic_message(join_error) {
                        Some(message) => {
                            warn!(%message, "Worker panicked, aborting join");
                            RaceError::Panicked(message)
                        }
                        None => RaceError::Cancelled,
                    });
                }
            }
        }

        Ok(results.into_iter().flatten().collect())
    }

    /// Race every worker and return the first answer `verify` accepts.
    ///
    /// A worker answering `Ok(None)` or an answer `verify` rejects drops
    /// out of the race. Errors and panics go to `on_error` and never reach
    /// the caller. The first accepted answer cancels the tokens handed to
    /// the other workers and aborts their tasks.
    ///
    /// If every worker drops out, `timeout` elapses or `cancel` fires,
    /// the result is `default(elapsed)`.
    pub async fn when_first<F, Fut, R, E, V, H, D>(
        &self,
        work: F,
        verify: V,
        timeout: Duration,
        mut on_error: H,
        default: D,
        cancel: Option<&CancellationToken>,
    ) -> R
    where
        F: Fn(W, CancellationToken) -> Fut,
        Fut: Future<Output = Result<Option<R>, E>> + Send + 'static,
        R: Send + 'static,
        E: Send + 'static,
        V: Fn(&R) -> bool,
        H: FnMut(WorkerFailure<E>),
        D: FnOnce(Duration) -> R,
    {
        let started = Instant::now();
        let token = scoped_token(cancel);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut pending = self.launch(&work, &token);

        let winner = loop {
            let step = tokio::select! {
                biased;
                _ = token.cancelled() => Step::Cancelled,
                _ = &mut deadline => Step::TimedOut,
                next = pending.next() => Step::from(next),
            };

            match step {
                Step::Cancelled => {
                    debug!(pending = pending.len(), "Race cancelled");
                    break None;
                }
                Step::TimedOut => {
                    warn!(timeout_ms = timeout.as_millis() as u64, pending = pending.len(), "Race timed out");
                    break None;
                }
                Step::Exhausted => {
                    debug!("Every worker dropped out of the race");
                    break None;
                }
                Step::Completed((index, Ok(Some(answer)))) if verify(&answer) => {
                    info!(
                        index,
                        priority = self.workers[index].priority,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Race won"
                    );
                    break Some(answer);
                }
                Step::Completed((index, Ok(Some(_)))) => debug!(index, "Answer rejected"),
                Step::Completed((index, Ok(None))) => debug!(index, "Worker had no answer"),
                Step::Completed((index, Err(error))) => {
                    debug!(index, "Worker failed");
                    on_error(WorkerFailure::Failed { index, error });
                }
                Step::Crashed(join_error) => {
                    if let Some(message) = panic_message(join_error) {
                        debug!(%message, "Worker panicked");
                        on_error(WorkerFailure::Panicked { message });
                    }
                }
            }
        };

        token.cancel();
        drop(pending);

        match winner {
            Some(answer) => answer,
            None => default(started.elapsed()),
        }
    }

    fn launch<F, Fut, T>(&self, work: &F, token: &CancellationToken) -> Pending<(usize, T)>
    where
        F: Fn(W, CancellationToken) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let tasks = self
            .workers
            .iter()
            .enumerate()
            .map(|(index, ranked)| {
                let invocation = work(ranked.worker.clone(), token.child_token());
                tokio::spawn(async move { (index, invocation.await) })
            })
            .collect();
        Pending(tasks)
    }
}

/// Token for one run: a child of the caller's token, so cancelling it never
/// reaches the caller.
fn scoped_token(cancel: Option<&CancellationToken>) -> CancellationToken {
    cancel.map_or_else(CancellationToken::new, CancellationToken::child_token)
}

/// What one turn of a join or race loop observed.
enum Step<T> {
    Completed(T),
    Crashed(JoinError),
    Exhausted,
    TimedOut,
    Cancelled,
}

impl<T> From<Option<Result<T, JoinError>>> for Step<T> {
    fn from(next: Option<Result<T, JoinError>>) -> Self {
        match next {
            Some(Ok(output)) => Step::Completed(output),
            Some(Err(error)) => Step::Crashed(error),
            None => Step::Exhausted,
        }
    }
}

/// In-flight invocations. Dropping aborts the ones still running.
struct Pending<T>(FuturesUnordered<JoinHandle<T>>);

impl<T> Pending<T> {
    async fn next(&mut self) -> Option<Result<T, JoinError>> {
        self.0.next().await
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

impl<T> Drop for Pending<T> {
    fn drop(&mut self) {
        for handle in self.0.iter() {
            handle.abort();
        }
    }
}

/// Panic payload as text; `None` when the task was aborted rather than
/// panicking.
fn panic_message(error: JoinError) -> Option<String> {
    let payload = error.try_into_panic().ok()?;
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    Some(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;

    /// Side effects recorded by workers after their await point.
    #[derive(Clone, Default)]
    struct Log(Arc<Mutex<Vec<&'static str>>>);

    impl Log {
        fn push(&self, entry: &'static str) {
            self.0.lock().push(entry);
        }

        fn entries(&self) -> Vec<&'static str> {
            self.0.lock().clone()
        }
    }

    #[derive(Clone)]
    struct Provider {
        name: &'static str,
        latency_ms: u64,
        answer: Option<u32>,
    }

    fn provider(name: &'static str, latency_ms: u64, answer: Option<u32>) -> Provider {
        Provider {
            name,
            latency_ms,
            answer,
        }
    }

    fn providers(list: Vec<Provider>) -> PriorityRace<Provider> {
        let mut race = PriorityRace::new();
        for p in list {
            race.add(p);
        }
        race
    }

    #[test]
    fn test_add_assigns_increasing_priorities() {
        let mut race = PriorityRace::new();
        assert_eq!(race.add("a"), 0);
        assert_eq!(race.add("b"), 1);
        race.add_with_priority(10, "c");
        assert_eq!(race.add("d"), 11);
        race.add_with_priority(1, "e");
        race.add_with_priority(-5, "f");

        let order: Vec<_> = race.workers().map(|(p, w)| (p, *w)).collect();
        assert_eq!(order, vec![(-5, "f"), (0, "a"), (1, "b"), (1, "e"), (10, "c"), (11, "d")]);
        assert_eq!(race.len(), 6);
    }

    #[test]
    fn test_default_timeout_from_config() {
        let race: PriorityRace<()> = PriorityRace::with_config(&RaceConfig {
            default_timeout_ms: 250,
        });
        assert_eq!(race.default_timeout(), Duration::from_millis(250));
        assert!(race.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_verified_answer_wins_and_losers_are_cancelled() {
        let race = providers(vec![
            provider("primary", 300, Some(1)),
            provider("fast", 100, Some(2)),
            provider("slow", 500, Some(3)),
        ]);
        let log = Log::default();
        let tokens = Mutex::new(Vec::new());
        let caller = CancellationToken::new();

        let answer = race
            .when_first(
                |p: Provider, token: CancellationToken| {
                    let log = log.clone();
                    tokens.lock().push(token);
                    async move {
                        tokio::time::sleep(Duration::from_millis(p.latency_ms)).await;
                        log.push(p.name);
                        Ok::<_, String>(p.answer)
                    }
                },
                |_| true,
                Duration::from_secs(5),
                |_| panic!("no worker fails"),
                |_| 0,
                Some(&caller),
            )
            .await;
        assert_eq!(answer, 2);
        assert!(!caller.is_cancelled());

        // give the losers every chance to reach their side effects
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(log.entries(), vec!["fast"]);
        assert!(tokens.lock().iter().all(CancellationToken::is_cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_and_empty_answers_drop_out() {
        let race = providers(vec![
            provider("empty", 10, None),
            provider("rejected", 20, Some(7)),
            provider("accepted", 30, Some(42)),
        ]);

        let answer = race
            .when_first(
                |p: Provider, _| async move {
                    tokio::time::sleep(Duration::from_millis(p.latency_ms)).await;
                    Ok::<_, String>(p.answer)
                },
                |answer| *answer > 10,
                Duration::from_secs(5),
                |_| {},
                |_| 0,
                None,
            )
            .await;
        assert_eq!(answer, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_returns_default_with_elapsed() {
        let race = providers(vec![provider("a", 10_000, Some(1)), provider("b", 20_000, Some(2))]);

        let elapsed = race
            .when_first(
                |p: Provider, _| async move {
                    tokio::time::sleep(Duration::from_millis(p.latency_ms)).await;
                    Ok::<_, String>(p.answer.map(|_| Duration::ZERO))
                },
                |_| true,
                Duration::from_millis(500),
                |_| {},
                |elapsed| elapsed,
                None,
            )
            .await;

        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_and_panics_reach_handler() {
        let race = providers(vec![
            provider("broken", 10, None),
            provider("panicking", 20, None),
            provider("late", 50, Some(9)),
        ]);
        let mut failures = Vec::new();

        let answer = race
            .when_first(
                |p: Provider, _| async move {
                    tokio::time::sleep(Duration::from_millis(p.latency_ms)).await;
                    match p.name {
                        "broken" => Err(format!("{} is down", p.name)),
                        "panicking" => panic!("provider exploded"),
                        _ => Ok(p.answer),
                    }
                },
                |_| true,
                Duration::from_secs(5),
                |failure| failures.push(failure),
                |_| 0,
                None,
            )
            .await;

        assert_eq!(answer, 9);
        assert_eq!(failures.len(), 2);
        assert!(matches!(
            &failures[0],
            WorkerFailure::Failed { index: 0, error } if error == "broken is down"
        ));
        assert!(matches!(
            &failures[1],
            WorkerFailure::Panicked { message } if message == "provider exploded"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_workers_out_returns_default_early() {
        let race = providers(vec![provider("a", 10, None), provider("b", 20, None)]);

        let elapsed = race
            .when_first(
                |p: Provider, _| async move {
                    tokio::time::sleep(Duration::from_millis(p.latency_ms)).await;
                    Ok::<Option<Duration>, String>(None)
                },
                |_| true,
                Duration::from_secs(60),
                |_| {},
                |elapsed| elapsed,
                None,
            )
            .await;

        assert!(elapsed >= Duration::from_millis(20));
        assert!(elapsed < Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_cancellation_stops_race() {
        let race = providers(vec![provider("a", 10_000, Some(1))]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let elapsed = race
            .when_first(
                |p: Provider, token: CancellationToken| async move {
                    tokio::select! {
                        _ = token.cancelled() => Ok::<_, String>(None),
                        _ = tokio::time::sleep(Duration::from_millis(p.latency_ms)) => Ok(Some(Duration::ZERO)),
                    }
                },
                |_| true,
                Duration::from_secs(60),
                |_| {},
                |elapsed| elapsed,
                Some(&cancel),
            )
            .await;

        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_empty_race_returns_default() {
        let race: PriorityRace<Provider> = PriorityRace::new();
        let answer = race
            .when_first(
                |p: Provider, _| async move { Ok::<_, String>(p.answer) },
                |_| true,
                Duration::from_secs(1),
                |_| {},
                |_| 77,
                None,
            )
            .await;
        assert_eq!(answer, 77);
    }

    #[tokio::test(start_paused = true)]
    async fn test_when_all_returns_results_in_priority_order() {
        let mut race = PriorityRace::new();
        race.add_with_priority(2, provider("third", 10, Some(3)));
        race.add_with_priority(0, provider("first", 30, Some(1)));
        race.add_with_priority(1, provider("second", 20, Some(2)));

        let results = race
            .when_all(
                |p: Provider, _| async move {
                    tokio::time::sleep(Duration::from_millis(p.latency_ms)).await;
                    Ok::<_, String>(p.answer.unwrap_or_default())
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(results, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_when_all_fails_fast() {
        let race = providers(vec![
            provider("ok", 10, Some(1)),
            provider("bad", 20, None),
            provider("slow", 1_000, Some(3)),
        ]);
        let log = Log::default();

        let err = race
            .when_all(
                |p: Provider, _| {
                    let log = log.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(p.latency_ms)).await;
                        log.push(p.name);
                        p.answer.ok_or("no answer")
                    }
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RaceError::Worker("no answer")));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(log.entries(), vec!["ok", "bad"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_when_all_reports_panic() {
        let race = providers(vec![provider("a", 10, Some(1))]);
        let err = race
            .when_all(
                |_: Provider, _| async move {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    if true {
                        panic!("boom");
                    }
                    Ok::<u32, String>(0)
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RaceError::Panicked(message) if message == "boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_when_all_external_cancellation() {
        let race = providers(vec![provider("a", 10_000, Some(1))]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = race
            .when_all(
                |p: Provider, _| async move {
                    tokio::time::sleep(Duration::from_millis(p.latency_ms)).await;
                    Ok::<_, String>(p.answer)
                },
                Some(&cancel),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RaceError::Cancelled));
    }
}
