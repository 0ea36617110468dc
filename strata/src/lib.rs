//! Scoped resources and shared dependency graphs for async services.
//!
//! strata is built around one guarantee: **anything acquired is
//! released, exactly once, in a defined order** — on success, on
//! failure, and on interruption alike. Three layers deliver it:
//!
//! 1. [`ReleaseMap`] — a per-scope finalizer registry with a one-way
//!    open/closed state machine. Registration order defines teardown
//!    order; late registrations against a closed scope run immediately.
//! 2. [`Managed`] — a resource paired with its registered release
//!    action. Combinators compose acquisitions sequentially
//!    ([`Managed::and_then`]), concurrently ([`Managed::zip_with_par`]),
//!    or in the background ([`Managed::fork`]) while preserving the
//!    release discipline.
//! 3. [`Layer`] — a declarative dependency graph over [`Env`], built
//!    through a per-build construction cache ([`MemoMap`]) so that a
//!    node reached through many paths is constructed once and torn down
//!    once, after its last dependent releases it.
//!
//! Interruption is cooperative and first-class: a [`Ctx`] carries a
//! cancellation token that is observed at declared suspension points,
//! and [`Ctx::mask`] protects the acquire-register window so a resource
//! can never leak between being created and being registered. Failures
//! during teardown aggregate in a [`Cause`] tree instead of overwriting
//! each other.
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
//! let app = pool.merge_par(&cache);
//! app.build()
//!     .use_with(Ctx::new(Env::new()), |env| async move { serve(env).await })
//!     .await?;
//! ```

pub mod cause;
pub mod env;
pub mod layer;
pub mod managed;
pub mod outcome;
pub mod release;
pub mod runtime;

pub use cause::Cause;
pub use env::Env;
pub use layer::{Layer, LayerId, MemoMap};
pub use managed::{ForkHandle, Managed};
pub use outcome::Outcome;
pub use release::{noop_finalizer, ExecStrategy, Finalizer, ReleaseKey, ReleaseMap};
pub use runtime::{Ctx, Restore, Signal};
