//! Per-build construction cache.
//!
//! One [`MemoMap`] lives for the duration of a single graph build. Every
//! node in the graph is constructed through it, keyed by layer identity:
//! the first requester builds the node into a private scope, every
//! concurrent or later requester waits on the same [`Signal`] and shares
//! the result. Each sharer registers an observer-counted finalizer in its
//! own scope; the node's private scope is released only when the last
//! observer lets go.

use super::{Layer, LayerId};
use crate::cause::Cause;
use crate::env::Env;
use crate::managed::Managed;
use crate::outcome::Outcome;
use crate::release::{noop_finalizer, ExecStrategy, Finalizer, ReleaseMap};
use crate::runtime::{Ctx, Signal};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Mutable slot for a finalizer that is wired up after construction.
///
/// Sharers register an indirection through this cell before the node has
/// finished building; the builder installs the real observer-counted
/// finalizer once the node's scope exists.
pub(crate) struct FinalizerCell<E> {
    current: Mutex<Finalizer<E>>,
}

impl<E> FinalizerCell<E>
where
    E: Clone + Send + Sync + 'static,
{
    fn new() -> Self {
        Self {
            current: Mutex::new(noop_finalizer()),
        }
    }

    fn get(&self) -> Finalizer<E> {
        self.current.lock().clone()
    }

    fn set(&self, finalizer: Finalizer<E>) {
        *self.current.lock() = finalizer;
    }
}

/// A finalizer that reads the cell at invocation time, not registration
/// time.
fn indirect<E>(cell: &Arc<FinalizerCell<E>>) -> Finalizer<E>
where
    E: Clone + Send + Sync + 'static,
{
    let cell = cell.clone();
    Arc::new(move |outcome| {
        let current = cell.get();
        current(outcome)
    })
}

struct MemoEntry<E> {
    signal: Signal<Result<Env, Cause<E>>>,
    observers: Arc<AtomicUsize>,
    finalizer: Arc<FinalizerCell<E>>,
}

impl<E> Clone for MemoEntry<E> {
    fn clone(&self) -> Self {
        Self {
            signal: self.signal.clone(),
            observers: self.observers.clone(),
            finalizer: self.finalizer.clone(),
        }
    }
}

impl<E> MemoEntry<E>
where
    E: Clone + Send + Sync + 'static,
{
    fn new() -> Self {
        Self {
            signal: Signal::new(),
            observers: Arc::new(AtomicUsize::new(0)),
            finalizer: Arc::new(FinalizerCell::new()),
        }
    }
}

/// Identity-keyed cache ensuring each graph node is constructed at most
/// once per build.
pub struct MemoMap<E> {
    entries: DashMap<LayerId, MemoEntry<E>>,
}

impl<E> MemoMap<E>
where
    E: Clone + Send + Sync + 'static,
{
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Number of nodes the cache has seen so far.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no node has been requested yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the node for `layer`, constructing it on first request.
    ///
    /// The returned resource can be acquired into any number of caller
    /// scopes; all of them observe the same constructed environment, and
    /// the node's own teardown runs exactly once, when the last of those
    /// scopes releases it.
    pub fn get_or_else_memoize(self: &Arc<Self>, layer: &Layer<E>) -> Managed<Env, E> {
        let memo = Arc::clone(self);
        let layer = layer.clone();
        Managed::from_fn(move |ctx, caller| {
            let memo = memo.clone();
            let layer = layer.clone();
            async move {
                let (entry, first) = memo.lookup(layer.id());
                if first {
                    memo.construct_node(layer, entry, ctx, caller).await
                } else {
                    memo.await_shared(layer.id(), entry, ctx, caller).await
                }
            }
        })
    }

    /// Atomically claims or retrieves the entry for `id`. The boolean is
    /// true for the claimant. No suspension point touches the shard lock.
    fn lookup(&self, id: LayerId) -> (MemoEntry<E>, bool) {
        match self.entries.entry(id) {
            Entry::Occupied(occupied) => (occupied.get().clone(), false),
            Entry::Vacant(vacant) => {
                let entry = MemoEntry::new();
                vacant.insert(entry.clone());
                (entry, true)
            }
        }
    }

    /// Waits for another requester's construction and joins it as an
    /// additional observer.
    async fn await_shared(
        &self,
        id: LayerId,
        entry: MemoEntry<E>,
        ctx: Ctx,
        caller: Arc<ReleaseMap<E>>,
    ) -> Result<(Finalizer<E>, Env), Cause<E>> {
        trace!(layer = %id, "cache hit, awaiting shared node");
        let signal = entry.signal.clone();
        let env = ctx
            .interruptible(async move { Ok(signal.wait().await) })
            .await??;

        entry.observers.fetch_add(1, Ordering::SeqCst);
        let handle = caller.add(indirect(&entry.finalizer)).await?;
        Ok((handle, env))
    }

    /// Builds the node into a private scope and publishes the result.
    ///
    /// On failure the cause is broadcast to every waiter and whatever the
    /// node had acquired is released immediately. On success the node's
    /// scope stays open, guarded by the observer count.
    async fn construct_node(
        self: &Arc<Self>,
        layer: Layer<E>,
        entry: MemoEntry<E>,
        ctx: Ctx,
        caller: Arc<ReleaseMap<E>>,
    ) -> Result<(Finalizer<E>, Env), Cause<E>> {
        debug!(layer = %layer.id(), "constructing graph node");
        let node_scope = Arc::new(ReleaseMap::new());

        let built = layer
            .construct(self)
            .acquire(ctx.clone(), node_scope.clone())
            .await;

        match built {
            Err(cause) => {
                entry.signal.complete(Err(cause.clone()));
                let released = node_scope
                    .release_all(
                        Outcome::Failure(cause.clone()),
                        ExecStrategy::Sequential,
                    )
                    .await;
                match released {
                    Ok(()) => Err(cause),
                    Err(release_cause) => Err(cause.then(release_cause)),
                }
            }
            Ok((_inner, env)) => {
                let observers = entry.observers.clone();
                let scope = node_scope.clone();
                entry.finalizer.set(Arc::new(move |outcome| {
                    let observers = observers.clone();
                    let scope = scope.clone();
                    Box::pin(async move {
                        // Last observer out tears the node down.
                        if observers.fetch_sub(1, Ordering::AcqRel) == 1 {
                            scope.release_all(outcome, ExecStrategy::Sequential).await
                        } else {
                            Ok(())
                        }
                    })
                }));

                entry.observers.fetch_add(1, Ordering::SeqCst);
                // Publish before touching the caller's map: registration
                // against an exited caller can fail, and waiters must
                // still be unblocked.
                entry.signal.complete(Ok(env.clone()));
                let handle = caller.add(indirect(&entry.finalizer)).await?;
                Ok((handle, env))
            }
        }
    }
}

impl<E> Default for MemoMap<E>
where
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
