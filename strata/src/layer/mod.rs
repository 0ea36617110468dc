//! Declarative dependency graphs with shared, scoped construction.
//!
//! A [`Layer`] describes how to construct part of a service [`Env`]: an
//! acquisition, its release, and the other layers it depends on. Layers
//! are cheap immutable descriptions; nothing is constructed until
//! [`Layer::build`] turns the graph into a [`Managed`] environment.
//!
//! Two properties hold for every build:
//!
//! 1. **Sharing** — a layer reached through several paths of the graph
//!    (a clone counts as the same layer) is constructed once and its
//!    output reused; its teardown runs once, after its last dependent
//!    has released it
//! 2. **Scoping** — every construction registers its release before the
//!    build proceeds, so a failed or interrupted build releases exactly
//!    what it had acquired
//!
//! # Example
//!
//! ```ignore
//! use strata::{Ctx, Env, Layer, Managed};
//!
//! let config = Layer::from_service(Config::load()?);
//! let pool = config.then(&Layer::from_resource(connect_pool()));
//! let cache = config.then(&Layer::from_resource(open_cache()));
//!
//! // `config` is shared: built once, torn down once.
//! let app = pool.merge_par(&cache);
//! app.build().use_with(Ctx::new(Env::new()), |env| async move {
//!     serve(env).await
//! }).await?;
//! ```

mod memo;

pub use memo::MemoMap;

use crate::cause::Cause;
use crate::env::Env;
use crate::managed::{sequence_finalizers, Managed};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

// ============================================================================
// Identity
// ============================================================================

static NEXT_LAYER_ID: AtomicU64 = AtomicU64::new(0);

fn next_layer_id() -> LayerId {
    LayerId(NEXT_LAYER_ID.fetch_add(1, Ordering::Relaxed))
}

/// Identity of a layer, assigned at creation and preserved by `Clone`.
///
/// Sharing is identity-based: two clones of one layer are the same graph
/// node; two structurally identical layers built separately are not.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(u64);

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Graph description
// ============================================================================

enum LayerKind<E> {
    /// Leaf: a scoped resource producing an environment.
    FromResource(Managed<Env, E>),

    /// Deferred graph, evaluated at build time. The produced layer keeps
    /// its own identity, so recursion through `suspend` still shares.
    Suspend(Arc<dyn Fn() -> Layer<E> + Send + Sync>),

    /// Transforms a dependency's output environment.
    Map(Layer<E>, Arc<dyn Fn(Env) -> Env + Send + Sync>),

    /// Feeds a dependency's output into the construction of the next
    /// layer. The output is also merged into the ambient environment the
    /// continuation builds under.
    Chain(Layer<E>, Arc<dyn Fn(Env) -> Layer<E> + Send + Sync>),

    /// Branches on the dependency's result: recovery layer on failure,
    /// continuation on success.
    Fold(
        Layer<E>,
        Arc<dyn Fn(Env, Cause<E>) -> Layer<E> + Send + Sync>,
        Arc<dyn Fn(Env) -> Layer<E> + Send + Sync>,
    ),

    /// Constructs both dependencies concurrently and combines outputs.
    MapBothPar(Layer<E>, Layer<E>, Arc<dyn Fn(Env, Env) -> Env + Send + Sync>),

    /// Constructs both dependencies in order and combines outputs.
    MapBothSeq(Layer<E>, Layer<E>, Arc<dyn Fn(Env, Env) -> Env + Send + Sync>),

    /// Constructs every dependency concurrently, merging outputs left to
    /// right.
    AllPar(Vec<Layer<E>>),

    /// Constructs every dependency in order, merging outputs left to
    /// right.
    AllSeq(Vec<Layer<E>>),
}

/// A recipe for constructing part of a service environment.
///
/// `Clone` is cheap and preserves identity — clone freely to express that
/// several parts of the graph depend on the same thing.
pub struct Layer<E> {
    id: LayerId,
    kind: Arc<LayerKind<E>>,
}

impl<E> Clone for Layer<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            kind: self.kind.clone(),
        }
    }
}

impl<E> Layer<E>
where
    E: Clone + Send + Sync + 'static,
{
    fn with_kind(kind: LayerKind<E>) -> Self {
        Self {
            id: next_layer_id(),
            kind: Arc::new(kind),
        }
    }

    /// This layer's identity.
    pub fn id(&self) -> LayerId {
        self.id
    }

    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    /// A layer backed by a scoped resource.
    pub fn from_resource(resource: Managed<Env, E>) -> Self {
        Self::with_kind(LayerKind::FromResource(resource))
    }

    /// A layer that is just an environment, with nothing to release.
    pub fn succeed(env: Env) -> Self {
        Self::from_resource(Managed::succeed(env))
    }

    /// A layer providing a single ready-made service.
    pub fn from_service<T: Any + Send + Sync>(service: T) -> Self {
        Self::succeed(Env::new().with(service))
    }

    /// A layer whose single service is acquired as a scoped resource.
    pub fn from_managed<T: Any + Send + Sync>(resource: Managed<T, E>) -> Self {
        Self::from_resource(resource.map(|service| Env::new().with(service)))
    }

    /// A layer whose construction always fails.
    pub fn fail(error: E) -> Self {
        Self::from_resource(Managed::fail(error))
    }

    /// Defers graph assembly to build time.
    pub fn suspend<F>(f: F) -> Self
    where
        F: Fn() -> Layer<E> + Send + Sync + 'static,
    {
        Self::with_kind(LayerKind::Suspend(Arc::new(f)))
    }

    // ------------------------------------------------------------------------
    // Combinators
    // ------------------------------------------------------------------------

    /// Transforms this layer's output environment.
    pub fn map<F>(&self, f: F) -> Layer<E>
    where
        F: Fn(Env) -> Env + Send + Sync + 'static,
    {
        Self::with_kind(LayerKind::Map(self.clone(), Arc::new(f)))
    }

    /// Uses this layer's output to choose and construct the next layer.
    ///
    /// The output is merged into the environment the continuation builds
    /// under; the combined layer's output is the continuation's output.
    pub fn and_then<F>(&self, f: F) -> Layer<E>
    where
        F: Fn(Env) -> Layer<E> + Send + Sync + 'static,
    {
        Self::with_kind(LayerKind::Chain(self.clone(), Arc::new(f)))
    }

    /// Feeds this layer's output into `next`.
    ///
    /// Classic vertical composition: `next` sees this layer's services in
    /// its ambient environment, and the result's output is `next`'s
    /// output.
    pub fn then(&self, next: &Layer<E>) -> Layer<E> {
        let next = next.clone();
        self.and_then(move |_| next.clone())
    }

    /// Branches on this layer's result.
    ///
    /// On failure, `on_failure` receives the ambient environment and the
    /// cause, and its layer is built instead. On success, `on_success`
    /// receives the output and continues. Interruption is not a failure:
    /// a purely interrupted construction propagates without recovery.
    pub fn fold<FF, FS>(&self, on_failure: FF, on_success: FS) -> Layer<E>
    where
        FF: Fn(Env, Cause<E>) -> Layer<E> + Send + Sync + 'static,
        FS: Fn(Env) -> Layer<E> + Send + Sync + 'static,
    {
        Self::with_kind(LayerKind::Fold(
            self.clone(),
            Arc::new(on_failure),
            Arc::new(on_success),
        ))
    }

    /// Recovers from construction failure with a fallback layer.
    pub fn recover<F>(&self, on_failure: F) -> Layer<E>
    where
        F: Fn(Env, Cause<E>) -> Layer<E> + Send + Sync + 'static,
    {
        self.fold(on_failure, Layer::succeed)
    }

    /// Constructs this layer and `that` concurrently, combining outputs.
    pub fn zip_with_par<F>(&self, that: &Layer<E>, f: F) -> Layer<E>
    where
        F: Fn(Env, Env) -> Env + Send + Sync + 'static,
    {
        Self::with_kind(LayerKind::MapBothPar(
            self.clone(),
            that.clone(),
            Arc::new(f),
        ))
    }

    /// Constructs this layer, then `that`, combining outputs.
    pub fn zip_with<F>(&self, that: &Layer<E>, f: F) -> Layer<E>
    where
        F: Fn(Env, Env) -> Env + Send + Sync + 'static,
    {
        Self::with_kind(LayerKind::MapBothSeq(
            self.clone(),
            that.clone(),
            Arc::new(f),
        ))
    }

    /// Concurrent construction with output union (`that` wins conflicts).
    pub fn merge_par(&self, that: &Layer<E>) -> Layer<E> {
        self.zip_with_par(that, |left, right| left.union(&right))
    }

    /// Constructs every layer concurrently and unions the outputs, left
    /// to right.
    pub fn all_par(layers: Vec<Layer<E>>) -> Layer<E> {
        Self::with_kind(LayerKind::AllPar(layers))
    }

    /// Constructs every layer in order and unions the outputs, left to
    /// right.
    pub fn all_seq(layers: Vec<Layer<E>>) -> Layer<E> {
        Self::with_kind(LayerKind::AllSeq(layers))
    }

    // ------------------------------------------------------------------------
    // Building
    // ------------------------------------------------------------------------

    /// Turns the graph into a scoped environment.
    ///
    /// Each acquisition of the result is one build with its own
    /// [`MemoMap`]: sharing holds within a build, never across builds.
    pub fn build(&self) -> Managed<Env, E> {
        let root = self.clone();
        Managed::from_fn(move |ctx, map| {
            let root = root.clone();
            async move {
                let memo = Arc::new(MemoMap::new());
                debug!(root = %root.id(), "building dependency graph");
                memo.get_or_else_memoize(&root).acquire(ctx, map).await
            }
        })
    }

    /// Lowers one graph node onto resource combinators.
    ///
    /// Dependencies are never constructed directly: every edge routes
    /// through `memo`, which is what makes sharing hold regardless of
    /// how the graph was assembled.
    pub(crate) fn construct(&self, memo: &Arc<MemoMap<E>>) -> Managed<Env, E> {
        match &*self.kind {
            LayerKind::FromResource(resource) => resource.clone(),

            LayerKind::Suspend(thunk) => {
                let memo = memo.clone();
                let thunk = thunk.clone();
                Managed::from_fn(move |ctx, map| {
                    let memo = memo.clone();
                    let layer = thunk();
                    async move { memo.get_or_else_memoize(&layer).acquire(ctx, map).await }
                })
            }

            LayerKind::Map(child, f) => {
                let f = f.clone();
                memo.get_or_else_memoize(child).map(move |env| f(env))
            }

            LayerKind::Chain(producer, f) => {
                let inner = memo.clone();
                let f = f.clone();
                memo.get_or_else_memoize(producer).and_then(move |out| {
                    let next = f(out.clone());
                    inner.get_or_else_memoize(&next).provide_merged(out)
                })
            }

            LayerKind::Fold(child, on_failure, on_success) => {
                let memo = memo.clone();
                let child = child.clone();
                let on_failure = on_failure.clone();
                let on_success = on_success.clone();
                Managed::from_fn(move |ctx, map| {
                    let memo = memo.clone();
                    let child = child.clone();
                    let on_failure = on_failure.clone();
                    let on_success = on_success.clone();
                    async move {
                        let attempt = memo
                            .get_or_else_memoize(&child)
                            .acquire(ctx.clone(), map.clone())
                            .await;
                        match attempt {
                            Ok((release_child, out)) => {
                                let next = on_success(out.clone());
                                let (release_next, env) = memo
                                    .get_or_else_memoize(&next)
                                    .provide_merged(out)
                                    .acquire(ctx, map)
                                    .await?;
                                Ok((sequence_finalizers(release_next, release_child), env))
                            }
                            Err(cause) if cause.is_interrupted_only() => Err(cause),
                            Err(cause) => {
                                let recovery = on_failure(ctx.env().clone(), cause);
                                memo.get_or_else_memoize(&recovery).acquire(ctx, map).await
                            }
                        }
                    }
                })
            }

            LayerKind::MapBothPar(left, right, f) => {
                let f = f.clone();
                memo.get_or_else_memoize(left)
                    .zip_with_par(&memo.get_or_else_memoize(right), move |a, b| f(a, b))
            }

            LayerKind::MapBothSeq(left, right, f) => {
                let f = f.clone();
                memo.get_or_else_memoize(left)
                    .zip_with(&memo.get_or_else_memoize(right), move |a, b| f(a, b))
            }

            LayerKind::AllPar(children) => {
                let items = children
                    .iter()
                    .map(|child| memo.get_or_else_memoize(child))
                    .collect();
                Managed::collect_all_par(items).map(union_all)
            }

            LayerKind::AllSeq(children) => {
                let items = children
                    .iter()
                    .map(|child| memo.get_or_else_memoize(child))
                    .collect();
                Managed::collect_all_seq(items).map(union_all)
            }
        }
    }
}

fn union_all(envs: Vec<Env>) -> Env {
    envs.iter().fold(Env::new(), |acc, env| acc.union(env))
}
