//! Adapter over the cooperative task substrate.
//!
//! The resource core does not schedule work itself; it relies on a small
//! contract from the async runtime:
//!
//! 1. An execution context ([`Ctx`]) carrying the ambient [`Env`], a
//!    cancellation token, and the current interruption mask
//! 2. A single-fulfillment completion signal ([`Signal`]) that any number
//!    of waiters can await
//! 3. The ability to spawn background work (`tokio::spawn`, used by
//!    `Managed::fork`)
//!
//! Interruption is cooperative: a fired token is observed only at declared
//! suspension points ([`Ctx::interruptible`] / [`Ctx::checkpoint`]), never
//! by dropping an in-flight future. Masked regions simply do not observe
//! the token, which is what makes "acquire then register the finalizer"
//! safe against cancellation.
//!
//! [`Env`]: crate::env::Env

mod ctx;
mod signal;

pub use ctx::{Ctx, Restore};
pub use signal::Signal;
