//! Combinators over scoped resources.
//!
//! Everything here preserves the registry discipline from
//! [`crate::release`]: sequential composition produces a finalizer that
//! releases child-first; parallel composition builds a fresh parallel
//! scope whose children are sequential scopes of their own, so releasing
//! the combinator releases its branches concurrently while each branch
//! unwinds LIFO internally.

use super::Managed;
use crate::cause::Cause;
use crate::release::{ExecStrategy, Finalizer, ReleaseMap};
use crate::runtime::{Ctx, Signal};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

/// Runs `first`, then `second`, against the same outcome, aggregating
/// failures from both.
pub(crate) fn sequence_finalizers<E>(first: Finalizer<E>, second: Finalizer<E>) -> Finalizer<E>
where
    E: Clone + Send + Sync + 'static,
{
    Arc::new(move |outcome| {
        let first = first.clone();
        let second = second.clone();
        Box::pin(async move {
            let earlier = first(outcome.clone()).await;
            let later = second(outcome).await;
            match (earlier, later) {
                (Ok(()), Ok(())) => Ok(()),
                (Err(cause), Ok(())) | (Ok(()), Err(cause)) => Err(cause),
                (Err(a), Err(b)) => Err(a.then(b)),
            }
        })
    })
}

/// Creates a child scope registered for release inside `parent`.
///
/// Returns the child map and the registry-backed finalizer that releases
/// it with `strategy`.
async fn nested_scope<E>(
    parent: &Arc<ReleaseMap<E>>,
    strategy: ExecStrategy,
) -> Result<(Arc<ReleaseMap<E>>, Finalizer<E>), Cause<E>>
where
    E: Clone + Send + Sync + 'static,
{
    let child = Arc::new(ReleaseMap::new());
    let scope = child.clone();
    let handle = parent
        .add(Arc::new(move |outcome| {
            let scope = scope.clone();
            Box::pin(async move { scope.release_all(outcome, strategy).await })
        }))
        .await?;
    Ok((child, handle))
}

/// Acquires a branch of a parallel combinator; a failing branch
/// interrupts its siblings through the shared branch context.
async fn acquire_branch<A, E>(
    resource: Managed<A, E>,
    ctx: Ctx,
    scope: Arc<ReleaseMap<E>>,
) -> Result<A, Cause<E>>
where
    A: Send + 'static,
    E: Clone + Send + Sync + 'static,
{
    let result = resource.acquire(ctx.clone(), scope).await;
    if result.is_err() {
        ctx.interrupt();
    }
    result.map(|(_finalizer, value)| value)
}

/// Collapses branch failures: sibling interruptions caused by a failing
/// branch are dropped in favor of the real failure; pure interruption of
/// every branch stays interruption.
fn combine_branch_causes<E>(causes: Vec<Cause<E>>) -> Cause<E>
where
    E: Clone,
{
    let real: Vec<Cause<E>> = causes
        .iter()
        .filter(|cause| !cause.is_interrupted_only())
        .cloned()
        .collect();
    if real.is_empty() {
        Cause::Interrupt
    } else {
        Cause::both_all(real).unwrap_or(Cause::Interrupt)
    }
}

impl<A, E> Managed<A, E>
where
    A: Send + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Sequential dependency: acquire `self`, feed the value to `f`, and
    /// acquire the resource it returns.
    ///
    /// The composed finalizer releases the child first and the parent
    /// second — LIFO order, regardless of chain depth. If the child
    /// acquisition fails, the parent's finalizer stays registered in the
    /// enclosing scope and runs at scope teardown.
    pub fn and_then<B, F>(&self, f: F) -> Managed<B, E>
    where
        B: Send + 'static,
        F: Fn(A) -> Managed<B, E> + Send + Sync + 'static,
    {
        let this = self.clone();
        let f = Arc::new(f);
        Managed::from_fn(move |ctx, map| {
            let this = this.clone();
            let f = f.clone();
            async move {
                let (release_parent, value) = this.acquire(ctx.clone(), map.clone()).await?;
                let next = f(value);
                let (release_child, result) = next.acquire(ctx, map).await?;
                Ok((sequence_finalizers(release_child, release_parent), result))
            }
        })
    }

    /// Acquires `self` then `that` and combines the values.
    ///
    /// Release order is the reverse of acquisition: `that` first, then
    /// `self`.
    pub fn zip_with<B, C, F>(&self, that: &Managed<B, E>, f: F) -> Managed<C, E>
    where
        B: Send + 'static,
        C: Send + 'static,
        F: Fn(A, B) -> C + Send + Sync + 'static,
    {
        let this = self.clone();
        let that = that.clone();
        let f = Arc::new(f);
        Managed::from_fn(move |ctx, map| {
            let this = this.clone();
            let that = that.clone();
            let f = f.clone();
            async move {
                let (release_left, left) = this.acquire(ctx.clone(), map.clone()).await?;
                let (release_right, right) = that.acquire(ctx, map).await?;
                Ok((
                    sequence_finalizers(release_right, release_left),
                    f(left, right),
                ))
            }
        })
    }

    /// Acquires `self` and `that` concurrently and combines the values.
    ///
    /// Both branches acquire into their own sequential scope; the two
    /// scopes belong to one parallel scope registered in the caller's
    /// map, so teardown releases the branches concurrently. A failing
    /// branch interrupts its sibling; whatever the loser had already
    /// acquired is released when the enclosing scope closes.
    pub fn zip_with_par<B, C, F>(&self, that: &Managed<B, E>, f: F) -> Managed<C, E>
    where
        B: Send + 'static,
        C: Send + 'static,
        F: Fn(A, B) -> C + Send + Sync + 'static,
    {
        let this = self.clone();
        let that = that.clone();
        let f = Arc::new(f);
        Managed::from_fn(move |ctx, map| {
            let this = this.clone();
            let that = that.clone();
            let f = f.clone();
            async move {
                let (parallel, release_parallel) =
                    nested_scope(&map, ExecStrategy::Parallel).await?;
                let (left_scope, _) = nested_scope(&parallel, ExecStrategy::Sequential).await?;
                let (right_scope, _) = nested_scope(&parallel, ExecStrategy::Sequential).await?;

                let branch_ctx = ctx.child();
                let (left, right) = futures::join!(
                    acquire_branch(this, branch_ctx.clone(), left_scope),
                    acquire_branch(that, branch_ctx.clone(), right_scope),
                );

                match (left, right) {
                    (Ok(a), Ok(b)) => Ok((release_parallel, f(a, b))),
                    (Err(cause), Ok(_)) | (Ok(_), Err(cause)) => Err(cause),
                    (Err(a), Err(b)) => Err(combine_branch_causes(vec![a, b])),
                }
            }
        })
    }

    /// Acquires every resource concurrently, preserving input order in
    /// the output. Same scope discipline as [`Managed::zip_with_par`],
    /// generalized to N branches.
    pub fn collect_all_par(items: Vec<Managed<A, E>>) -> Managed<Vec<A>, E> {
        Managed::from_fn(move |ctx, map| {
            let items = items.clone();
            async move {
                let (parallel, release_parallel) =
                    nested_scope(&map, ExecStrategy::Parallel).await?;

                let branch_ctx = ctx.child();
                let mut branches = Vec::with_capacity(items.len());
                for item in items {
                    let (scope, _) = nested_scope(&parallel, ExecStrategy::Sequential).await?;
                    branches.push(acquire_branch(item, branch_ctx.clone(), scope));
                }

                let results = futures::future::join_all(branches).await;
                let mut values = Vec::with_capacity(results.len());
                let mut causes = Vec::new();
                for result in results {
                    match result {
                        Ok(value) => values.push(value),
                        Err(cause) => causes.push(cause),
                    }
                }

                if causes.is_empty() {
                    Ok((release_parallel, values))
                } else {
                    Err(combine_branch_causes(causes))
                }
            }
        })
    }

    /// Acquires every resource one after another; the composed finalizer
    /// releases them in reverse acquisition order.
    pub fn collect_all_seq(items: Vec<Managed<A, E>>) -> Managed<Vec<A>, E> {
        Managed::from_fn(move |ctx, map| {
            let items = items.clone();
            async move {
                let mut finalizers: Vec<Finalizer<E>> = Vec::with_capacity(items.len());
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    let (finalizer, value) = item.acquire(ctx.clone(), map.clone()).await?;
                    finalizers.push(finalizer);
                    values.push(value);
                }

                let combined: Finalizer<E> = Arc::new(move |outcome| {
                    let finalizers = finalizers.clone();
                    Box::pin(async move {
                        let mut failures = Vec::new();
                        for finalizer in finalizers.iter().rev() {
                            if let Err(cause) = finalizer(outcome.clone()).await {
                                failures.push(cause);
                            }
                        }
                        match Cause::then_all(failures) {
                            Some(cause) => Err(cause),
                            None => Ok(()),
                        }
                    })
                });
                Ok((combined, values))
            }
        })
    }

    /// Moves the acquisition onto a background task.
    ///
    /// The resulting resource is available immediately as a
    /// [`ForkHandle`]; the acquisition proceeds concurrently under a
    /// child token. The registered finalizer interrupts the background
    /// task, waits for it to stop, and then releases whatever it had
    /// acquired — background work never outlives the scope.
    pub fn fork(&self) -> Managed<ForkHandle<A, E>, E>
    where
        A: Clone + Sync,
    {
        let this = self.clone();
        Managed::from_fn(move |ctx, map| {
            let this = this.clone();
            async move {
                let scope = Arc::new(ReleaseMap::new());
                let background = ctx.child();
                let token = background.token().clone();
                let signal: Signal<Result<A, Cause<E>>> = Signal::new();

                debug!("forking background acquisition");
                let task_signal = signal.clone();
                let task_scope = scope.clone();
                let join = tokio::spawn(async move {
                    let result = this
                        .acquire(background, task_scope)
                        .await
                        .map(|(_finalizer, value)| value);
                    task_signal.complete(result);
                });

                let join = Arc::new(Mutex::new(Some(join)));
                let finalizer: Finalizer<E> = Arc::new(move |outcome| {
                    let token = token.clone();
                    let join = join.clone();
                    let scope = scope.clone();
                    Box::pin(async move {
                        token.cancel();
                        let handle = join.lock().take();
                        if let Some(handle) = handle {
                            if handle.await.is_err() {
                                warn!("background acquisition panicked");
                            }
                        }
                        scope.release_all(outcome, ExecStrategy::Sequential).await
                    })
                });

                let handle = map.add(finalizer).await?;
                Ok((handle, ForkHandle { result: signal }))
            }
        })
    }
}

/// Handle to an acquisition running on a background task.
///
/// Dropping the handle does not stop the work; the scope's finalizer
/// does. [`ForkHandle::join`] waits for the acquisition result.
pub struct ForkHandle<A, E> {
    result: Signal<Result<A, Cause<E>>>,
}

impl<A, E> Clone for ForkHandle<A, E> {
    fn clone(&self) -> Self {
        Self {
            result: self.result.clone(),
        }
    }
}

impl<A, E> ForkHandle<A, E>
where
    A: Clone + Send + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Waits for the background acquisition to finish.
    pub async fn join(&self) -> Result<A, Cause<E>> {
        self.result.wait().await
    }

    /// True once the background acquisition has finished (either way).
    pub fn is_finished(&self) -> bool {
        self.result.is_complete()
    }
}
