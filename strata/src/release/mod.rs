//! Per-scope finalizer registry.
//!
//! A [`ReleaseMap`] is the single piece of shared mutable state inside a
//! scope's lifetime: a table of pending cleanup actions plus an
//! open/closed state machine. Every resource acquisition registers its
//! release action here; closing the scope ([`ReleaseMap::release_all`])
//! runs whatever is still pending against the scope's final [`Outcome`].
//!
//! The state machine has exactly two states:
//!
//! 1. `Running` — finalizers accumulate under monotonically increasing
//!    keys (registration order doubles as teardown order, reversed)
//! 2. `Exited` — the scope is closed; late registrations run immediately
//!    against the stored outcome instead of being stored
//!
//! Every operation is a single lock-guarded read-modify-write; finalizers
//! themselves always execute after the lock is dropped.

mod strategy;

pub use strategy::ExecStrategy;

use crate::cause::Cause;
use crate::outcome::Outcome;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Key identifying one registered finalizer within a [`ReleaseMap`].
pub type ReleaseKey = u64;

/// A cleanup action taking the completion outcome of its scope.
///
/// Failures are surfaced (and aggregated by the registry), never
/// swallowed. Finalizers must tolerate being called with any outcome.
pub type Finalizer<E> =
    Arc<dyn Fn(Outcome<E>) -> BoxFuture<'static, Result<(), Cause<E>>> + Send + Sync>;

/// A finalizer that does nothing.
pub fn noop_finalizer<E>() -> Finalizer<E>
where
    E: Send + Sync + 'static,
{
    Arc::new(|_outcome| Box::pin(futures::future::ready(Ok(()))))
}

enum State<E> {
    Running {
        next_key: ReleaseKey,
        finalizers: BTreeMap<ReleaseKey, Finalizer<E>>,
    },
    Exited {
        next_key: ReleaseKey,
        outcome: Outcome<E>,
    },
}

/// Concurrency-guarded table of pending finalizers for one scope.
///
/// Shared via `Arc` between the scope owner and every acquisition running
/// inside it. Closing is one-way and idempotent: once exited, the map
/// never stores again and a second `release_all` is a no-op.
pub struct ReleaseMap<E> {
    state: Mutex<State<E>>,
}

impl<E> ReleaseMap<E>
where
    E: Clone + Send + Sync + 'static,
{
    /// Creates an open map with no pending finalizers.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Running {
                next_key: 0,
                finalizers: BTreeMap::new(),
            }),
        }
    }

    /// Registers `finalizer` if the map is still open.
    ///
    /// Open: stores it and returns its key. Exited: runs it immediately
    /// against the stored outcome and returns `None`.
    pub async fn add_if_open(&self, finalizer: Finalizer<E>) -> Result<Option<ReleaseKey>, Cause<E>> {
        let outcome = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Running {
                    next_key,
                    finalizers,
                } => {
                    let key = *next_key;
                    *next_key += 1;
                    finalizers.insert(key, finalizer);
                    return Ok(Some(key));
                }
                State::Exited { next_key, outcome } => {
                    *next_key += 1;
                    outcome.clone()
                }
            }
        };
        // Scope already closed: run against the stored outcome instead.
        finalizer(outcome).await?;
        Ok(None)
    }

    /// Runs and removes the finalizer at `key`, if present.
    ///
    /// Removing before running is what makes double-release
    /// unrepresentable through this path. No-op on an exited map (the
    /// entry already ran during `release_all`).
    pub async fn release(&self, key: ReleaseKey, outcome: Outcome<E>) -> Result<(), Cause<E>> {
        let finalizer = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Running { finalizers, .. } => finalizers.remove(&key),
                State::Exited { .. } => None,
            }
        };
        match finalizer {
            Some(finalizer) => finalizer(outcome).await,
            None => Ok(()),
        }
    }

    /// Registers `finalizer` and returns a handle that releases it.
    ///
    /// The returned finalizer routes through [`ReleaseMap::release`], so
    /// invoking it removes the entry first; if the map was already exited
    /// (and the finalizer therefore already ran), the handle is a no-op.
    pub async fn add(self: &Arc<Self>, finalizer: Finalizer<E>) -> Result<Finalizer<E>, Cause<E>> {
        match self.add_if_open(finalizer).await? {
            Some(key) => {
                let map = Arc::clone(self);
                Ok(Arc::new(move |outcome| {
                    let map = map.clone();
                    Box::pin(async move { map.release(key, outcome).await })
                }))
            }
            None => Ok(noop_finalizer()),
        }
    }

    /// Swaps the finalizer stored at `key`, returning the previous one.
    ///
    /// Backs resource-switching combinators. On an exited map the new
    /// finalizer runs immediately and `None` is returned.
    pub async fn replace(
        &self,
        key: ReleaseKey,
        finalizer: Finalizer<E>,
    ) -> Result<Option<Finalizer<E>>, Cause<E>> {
        let outcome = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Running { finalizers, .. } => {
                    return Ok(finalizers.insert(key, finalizer));
                }
                State::Exited { outcome, .. } => outcome.clone(),
            }
        };
        finalizer(outcome).await?;
        Ok(None)
    }

    /// Closes the map and runs every pending finalizer against `outcome`.
    ///
    /// The transition to `Exited` is atomic; concurrent registrations
    /// either land before it (and run here) or after it (and run
    /// immediately in `add_if_open`). A second call is a no-op.
    ///
    /// All finalizers run even when some fail; failures aggregate with
    /// [`Cause::then`] (sequential) or [`Cause::both`] (parallel).
    pub async fn release_all(
        &self,
        outcome: Outcome<E>,
        strategy: ExecStrategy,
    ) -> Result<(), Cause<E>> {
        let finalizers: Vec<Finalizer<E>> = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Exited { .. } => return Ok(()),
                State::Running {
                    next_key,
                    finalizers,
                } => {
                    let next_key = *next_key;
                    let drained = std::mem::take(finalizers);
                    *state = State::Exited {
                        next_key,
                        outcome: outcome.clone(),
                    };
                    // BTreeMap iterates in key (registration) order.
                    drained.into_values().collect()
                }
            }
        };

        debug!(
            pending = finalizers.len(),
            strategy = %strategy,
            "closing scope"
        );

        let failures: Vec<Cause<E>> = match strategy {
            ExecStrategy::Sequential => {
                let mut failures = Vec::new();
                for finalizer in finalizers.iter().rev() {
                    if let Err(cause) = finalizer(outcome.clone()).await {
                        debug!("finalizer failed during teardown");
                        failures.push(cause);
                    }
                }
                match Cause::then_all(failures) {
                    Some(cause) => return Err(cause),
                    None => return Ok(()),
                }
            }
            ExecStrategy::Parallel => {
                let mut pending = Vec::with_capacity(finalizers.len());
                for finalizer in &finalizers {
                    pending.push(finalizer(outcome.clone()));
                }
                let results = futures::future::join_all(pending).await;
                results.into_iter().filter_map(Result::err).collect()
            }
            ExecStrategy::ParallelN(bound) => {
                let mut pending = Vec::with_capacity(finalizers.len());
                for finalizer in &finalizers {
                    pending.push(finalizer(outcome.clone()));
                }
                let results: Vec<Result<(), Cause<E>>> = stream::iter(pending)
                    .buffer_unordered(bound.get())
                    .collect()
                    .await;
                results.into_iter().filter_map(Result::err).collect()
            }
        };

        match Cause::both_all(failures) {
            Some(cause) => Err(cause),
            None => Ok(()),
        }
    }

    /// True once the map has exited.
    pub fn is_exited(&self) -> bool {
        matches!(&*self.state.lock(), State::Exited { .. })
    }

    /// Number of finalizers currently pending.
    pub fn pending(&self) -> usize {
        match &*self.state.lock() {
            State::Running { finalizers, .. } => finalizers.len(),
            State::Exited { .. } => 0,
        }
    }
}

impl<E> Default for ReleaseMap<E>
where
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    type TestError = String;

    fn recording(log: &Arc<Mutex<Vec<u64>>>, id: u64) -> Finalizer<TestError> {
        let log = log.clone();
        Arc::new(move |_outcome| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().push(id);
                Ok(())
            })
        })
    }

    fn failing(message: &str) -> Finalizer<TestError> {
        let message = message.to_string();
        Arc::new(move |_outcome| {
            let message = message.clone();
            Box::pin(async move { Err(Cause::fail(message)) })
        })
    }

    #[tokio::test]
    async fn test_add_if_open_stores_while_running() {
        let map = ReleaseMap::<TestError>::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let key = map.add_if_open(recording(&log, 1)).await.unwrap();
        assert_eq!(key, Some(0));
        assert_eq!(map.pending(), 1);
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_add_if_open_runs_immediately_when_exited() {
        let map = ReleaseMap::<TestError>::new();
        map.release_all(Outcome::Success, ExecStrategy::Sequential)
            .await
            .unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let key = map.add_if_open(recording(&log, 7)).await.unwrap();

        assert_eq!(key, None);
        assert_eq!(*log.lock(), vec![7]);
        assert_eq!(map.pending(), 0);
    }

    #[tokio::test]
    async fn test_late_finalizer_sees_stored_outcome() {
        let map = ReleaseMap::<TestError>::new();
        map.release_all(
            Outcome::Failure(Cause::fail("scope failed".to_string())),
            ExecStrategy::Sequential,
        )
        .await
        .unwrap();

        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        let finalizer: Finalizer<TestError> = Arc::new(move |outcome| {
            let seen = seen_clone.clone();
            Box::pin(async move {
                *seen.lock() = Some(outcome);
                Ok(())
            })
        });

        map.add_if_open(finalizer).await.unwrap();
        assert_eq!(
            *seen.lock(),
            Some(Outcome::Failure(Cause::fail("scope failed".to_string())))
        );
    }

    #[tokio::test]
    async fn test_release_removes_before_running() {
        let map = Arc::new(ReleaseMap::<TestError>::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let key = map.add_if_open(recording(&log, 1)).await.unwrap().unwrap();
        map.release(key, Outcome::Success).await.unwrap();
        assert_eq!(*log.lock(), vec![1]);

        // Second release of the same key is a no-op.
        map.release(key, Outcome::Success).await.unwrap();
        assert_eq!(*log.lock(), vec![1]);
    }

    #[tokio::test]
    async fn test_add_returns_registry_backed_handle() {
        let map = Arc::new(ReleaseMap::<TestError>::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let handle = map.add(recording(&log, 3)).await.unwrap();
        assert_eq!(map.pending(), 1);

        handle(Outcome::Success).await.unwrap();
        assert_eq!(*log.lock(), vec![3]);
        assert_eq!(map.pending(), 0);

        // The handle went through release(), so re-invoking is a no-op.
        handle(Outcome::Success).await.unwrap();
        assert_eq!(*log.lock(), vec![3]);
    }

    #[tokio::test]
    async fn test_replace_returns_previous() {
        let map = Arc::new(ReleaseMap::<TestError>::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let key = map.add_if_open(recording(&log, 1)).await.unwrap().unwrap();
        let previous = map.replace(key, recording(&log, 2)).await.unwrap().unwrap();

        previous(Outcome::Success).await.unwrap();
        assert_eq!(*log.lock(), vec![1]);

        map.release_all(Outcome::Success, ExecStrategy::Sequential)
            .await
            .unwrap();
        assert_eq!(*log.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_replace_on_exited_map_runs_immediately() {
        let map = Arc::new(ReleaseMap::<TestError>::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let key = map.add_if_open(recording(&log, 1)).await.unwrap().unwrap();
        map.release_all(Outcome::Success, ExecStrategy::Sequential)
            .await
            .unwrap();
        assert_eq!(*log.lock(), vec![1]);

        // The map is exited: the replacement runs now and nothing is stored.
        let previous = map.replace(key, recording(&log, 2)).await.unwrap();
        assert!(previous.is_none());
        assert_eq!(*log.lock(), vec![1, 2]);
        assert_eq!(map.pending(), 0);
    }

    #[tokio::test]
    async fn test_release_all_runs_in_reverse_order() {
        let map = ReleaseMap::<TestError>::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for id in 1..=4 {
            map.add_if_open(recording(&log, id)).await.unwrap();
        }
        map.release_all(Outcome::Success, ExecStrategy::Sequential)
            .await
            .unwrap();

        assert_eq!(*log.lock(), vec![4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn test_release_all_is_idempotent() {
        let map = ReleaseMap::<TestError>::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        map.add_if_open(recording(&log, 1)).await.unwrap();
        map.release_all(Outcome::Success, ExecStrategy::Sequential)
            .await
            .unwrap();
        map.release_all(Outcome::Success, ExecStrategy::Sequential)
            .await
            .unwrap();

        assert_eq!(*log.lock(), vec![1]);
    }

    #[tokio::test]
    async fn test_sequential_failures_all_run_and_aggregate() {
        let map = ReleaseMap::<TestError>::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        map.add_if_open(recording(&log, 1)).await.unwrap();
        map.add_if_open(failing("middle")).await.unwrap();
        map.add_if_open(recording(&log, 3)).await.unwrap();
        map.add_if_open(failing("last")).await.unwrap();

        let cause = map
            .release_all(Outcome::Success, ExecStrategy::Sequential)
            .await
            .unwrap_err();

        // Every finalizer ran despite the failures...
        assert_eq!(*log.lock(), vec![3, 1]);
        // ...and both failures are reported, teardown order.
        let failures: Vec<String> = cause.failures().into_iter().cloned().collect();
        assert_eq!(failures, vec!["last".to_string(), "middle".to_string()]);
    }

    #[tokio::test]
    async fn test_parallel_release_overlaps() {
        let map = ReleaseMap::<TestError>::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let running = running.clone();
            let peak = peak.clone();
            let finalizer: Finalizer<TestError> = Arc::new(move |_outcome| {
                let running = running.clone();
                let peak = peak.clone();
                Box::pin(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            });
            map.add_if_open(finalizer).await.unwrap();
        }

        let start = Instant::now();
        map.release_all(Outcome::Success, ExecStrategy::Parallel)
            .await
            .unwrap();

        // Four 50ms finalizers in parallel finish in ~50ms, not ~200ms.
        assert!(start.elapsed() < Duration::from_millis(150));
        assert_eq!(peak.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_parallel_n_respects_bound() {
        let map = ReleaseMap::<TestError>::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            let finalizer: Finalizer<TestError> = Arc::new(move |_outcome| {
                let running = running.clone();
                let peak = peak.clone();
                Box::pin(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            });
            map.add_if_open(finalizer).await.unwrap();
        }

        map.release_all(Outcome::Success, ExecStrategy::parallel_n(2))
            .await
            .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    proptest! {
        #[test]
        fn prop_sequential_release_reverses_registration(count in 1usize..24) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async move {
                let map = ReleaseMap::<TestError>::new();
                let log = Arc::new(Mutex::new(Vec::new()));
                for id in 0..count as u64 {
                    map.add_if_open(recording(&log, id)).await.unwrap();
                }
                map.release_all(Outcome::Success, ExecStrategy::Sequential)
                    .await
                    .unwrap();

                let expected: Vec<u64> = (0..count as u64).rev().collect();
                assert_eq!(*log.lock(), expected);
            });
        }
    }
}
