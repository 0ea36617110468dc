//! Scoped resources: a value plus a registered release action.
//!
//! A [`Managed`] describes how to acquire a value *and* how to give it
//! back. Acquiring one always happens against a [`ReleaseMap`]: the
//! release action is registered there in the same breath as the
//! acquisition, so there is no observable state in which the resource
//! exists but nothing will clean it up.
//!
//! Composition preserves release ordering:
//!
//! 1. [`Managed::and_then`] chains acquisitions and releases them
//!    child-first (LIFO), however deep the chain goes
//! 2. [`Managed::zip_with_par`] acquires two resources concurrently and
//!    releases them concurrently, each branch LIFO within itself
//! 3. [`Managed::fork`] moves an acquisition onto a background task whose
//!    lifetime is bounded by the enclosing scope
//!
//! The only way out is [`Managed::use_with`], which runs a body with the
//! acquired value and releases everything afterwards — on success, on
//! failure, and on interruption alike.
//!
//! # Example
//!
//! ```ignore
//! use strata::{Ctx, Env, Managed};
//!
//! let file = Managed::acquire_release(
//!     |_ctx| async { open("data.log").await },
//!     |file, _outcome| async move { file.close().await },
//! );
//!
//! let lines = file.use_with(Ctx::new(Env::new()), |file| async move {
//!     file.read_lines().await
//! }).await?;
//! ```

mod compose;

pub use compose::ForkHandle;
pub(crate) use compose::sequence_finalizers;

use crate::cause::Cause;
use crate::env::Env;
use crate::outcome::Outcome;
use crate::release::{noop_finalizer, ExecStrategy, Finalizer, ReleaseMap};
use crate::runtime::Ctx;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;

type AcquireFn<A, E> = dyn Fn(Ctx, Arc<ReleaseMap<E>>) -> BoxFuture<'static, Result<(Finalizer<E>, A), Cause<E>>>
    + Send
    + Sync;

/// A computation that produces a value together with a registered
/// finalizer guaranteeing its release.
///
/// `Managed` values are descriptions: nothing runs until they are
/// acquired, and they can be acquired any number of times, each
/// acquisition producing an independent resource.
pub struct Managed<A, E> {
    pub(crate) inner: Arc<AcquireFn<A, E>>,
}

impl<A, E> Clone for Managed<A, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A, E> Managed<A, E>
where
    A: Send + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Wraps a raw acquisition function.
    ///
    /// The function receives the execution context and the release map of
    /// the enclosing scope; it must register any cleanup it needs into
    /// that map and return the registered finalizer alongside the value.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Ctx, Arc<ReleaseMap<E>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(Finalizer<E>, A), Cause<E>>> + Send + 'static,
    {
        Self {
            inner: Arc::new(move |ctx, map| Box::pin(f(ctx, map))),
        }
    }

    /// A resource that is just a value; releasing it does nothing.
    pub fn succeed(value: A) -> Self
    where
        A: Clone + Sync,
    {
        Self::from_fn(move |_ctx, _map| {
            let value = value.clone();
            async move { Ok((noop_finalizer(), value)) }
        })
    }

    /// A resource whose acquisition always fails.
    pub fn fail(error: E) -> Self {
        Self::halt(Cause::fail(error))
    }

    /// A resource whose acquisition always fails with `cause`.
    pub fn halt(cause: Cause<E>) -> Self {
        Self::from_fn(move |_ctx, _map| {
            let cause = cause.clone();
            async move { Err(cause) }
        })
    }

    /// Lifts an effect with nothing to release.
    pub fn from_effect<F, Fut>(f: F) -> Self
    where
        F: Fn(Ctx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<A, Cause<E>>> + Send + 'static,
    {
        Self::from_fn(move |ctx, _map| {
            let fut = f(ctx.clone());
            async move {
                let value = ctx.interruptible(fut).await?;
                Ok((noop_finalizer(), value))
            }
        })
    }

    /// Acquires with `acquire` and registers `release` for cleanup.
    ///
    /// The acquire step is an interruptible suspension point; once it
    /// completes, registration of the release action follows with no
    /// further suspension point in between, so a resource can never be
    /// created without its finalizer being on record. The release action
    /// receives the value and the outcome of the owning scope.
    pub fn acquire_release<Acq, AcqFut, Rel, RelFut>(acquire: Acq, release: Rel) -> Self
    where
        A: Clone + Sync,
        Acq: Fn(Ctx) -> AcqFut + Send + Sync + 'static,
        AcqFut: Future<Output = Result<A, Cause<E>>> + Send + 'static,
        Rel: Fn(A, Outcome<E>) -> RelFut + Send + Sync + 'static,
        RelFut: Future<Output = Result<(), Cause<E>>> + Send + 'static,
    {
        let release = Arc::new(release);
        Self::from_fn(move |ctx, map| {
            let fut = acquire(ctx.clone());
            let release = release.clone();
            async move {
                ctx.checkpoint()?;
                let value = ctx.interruptible(fut).await?;
                let handle = map.add(release_finalizer(release, value.clone())).await?;
                Ok((handle, value))
            }
        })
    }

    /// Like [`Managed::acquire_release`], but the acquire step itself is
    /// masked: interruption waits until acquisition and registration have
    /// both completed.
    pub fn acquire_release_uninterruptible<Acq, AcqFut, Rel, RelFut>(
        acquire: Acq,
        release: Rel,
    ) -> Self
    where
        A: Clone + Sync,
        Acq: Fn(Ctx) -> AcqFut + Send + Sync + 'static,
        AcqFut: Future<Output = Result<A, Cause<E>>> + Send + 'static,
        Rel: Fn(A, Outcome<E>) -> RelFut + Send + Sync + 'static,
        RelFut: Future<Output = Result<(), Cause<E>>> + Send + 'static,
    {
        let acquire = Arc::new(acquire);
        let release = Arc::new(release);
        Self::from_fn(move |ctx, map| {
            let acquire = acquire.clone();
            let release = release.clone();
            async move {
                let (masked, _restore) = ctx.mask();
                let value = acquire(masked).await?;
                let handle = map.add(release_finalizer(release, value.clone())).await?;
                Ok((handle, value))
            }
        })
    }

    /// Low-level acquisition against an explicit scope.
    ///
    /// Most callers want [`Managed::use_with`]; this entry point exists
    /// for code that manages scopes itself (the construction cache, and
    /// tests that need to control release timing).
    pub async fn acquire(
        &self,
        ctx: Ctx,
        release_map: Arc<ReleaseMap<E>>,
    ) -> Result<(Finalizer<E>, A), Cause<E>> {
        (self.inner)(ctx, release_map).await
    }

    /// Transforms the produced value.
    pub fn map<B, F>(&self, f: F) -> Managed<B, E>
    where
        B: Send + 'static,
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        let this = self.clone();
        let f = Arc::new(f);
        Managed::from_fn(move |ctx, map| {
            let this = this.clone();
            let f = f.clone();
            async move {
                let (finalizer, value) = this.acquire(ctx, map).await?;
                Ok((finalizer, f(value)))
            }
        })
    }

    /// Transforms every failure in the acquisition cause.
    pub fn map_error<F>(&self, f: F) -> Managed<A, E>
    where
        F: Fn(E) -> E + Send + Sync + 'static,
    {
        let this = self.clone();
        let f = Arc::new(f);
        Managed::from_fn(move |ctx, map| {
            let this = this.clone();
            let f = f.clone();
            async move {
                this.acquire(ctx, map)
                    .await
                    .map_err(|cause| cause.map_error(&*f))
            }
        })
    }

    /// Runs the acquisition with `extra` merged into the ambient
    /// environment (entries in `extra` win).
    pub fn provide_merged(&self, extra: Env) -> Managed<A, E> {
        let this = self.clone();
        Managed::from_fn(move |ctx, map| {
            let this = this.clone();
            let ctx = ctx.with_merged_env(&extra);
            async move { this.acquire(ctx, map).await }
        })
    }

    /// Acquires the resource, runs `f` with the value, and releases
    /// everything — whatever happens.
    ///
    /// This is the sole sanctioned exit from the scoping discipline. The
    /// body runs interruptibly; the release phase always runs to
    /// completion with the outcome of the body (success, failure, or
    /// interruption). Failures from the body and from release actions are
    /// aggregated, never dropped.
    pub async fn use_with<B, F, Fut>(&self, ctx: Ctx, f: F) -> Result<B, Cause<E>>
    where
        F: FnOnce(A) -> Fut,
        Fut: Future<Output = Result<B, Cause<E>>>,
    {
        let scope = Arc::new(ReleaseMap::new());

        let acquired = self.acquire(ctx.clone(), scope.clone()).await;
        let result = match acquired {
            Ok((_finalizer, value)) => ctx.interruptible(f(value)).await,
            Err(cause) => Err(cause),
        };

        let outcome = Outcome::from_result(&result);
        let released = scope.release_all(outcome, ExecStrategy::Sequential).await;

        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(release_cause)) => Err(release_cause),
            (Err(cause), Ok(())) => Err(cause),
            (Err(cause), Err(release_cause)) => Err(cause.then(release_cause)),
        }
    }

    /// Acquires, releases immediately, and returns the value.
    ///
    /// Only meaningful when the value remains valid after release (plain
    /// data, summaries, handles the caller owns independently).
    pub async fn use_now(&self, ctx: Ctx) -> Result<A, Cause<E>> {
        self.use_with(ctx, |value| async move { Ok(value) }).await
    }
}

fn release_finalizer<A, E, Rel, RelFut>(release: Arc<Rel>, value: A) -> Finalizer<E>
where
    A: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    Rel: Fn(A, Outcome<E>) -> RelFut + Send + Sync + 'static,
    RelFut: Future<Output = Result<(), Cause<E>>> + Send + 'static,
{
    Arc::new(move |outcome| {
        let fut = release(value.clone(), outcome);
        Box::pin(fut)
    })
}
