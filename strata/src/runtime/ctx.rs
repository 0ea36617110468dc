//! Execution context: environment, cancellation, and interruption masking.

use crate::cause::Cause;
use crate::env::Env;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// The context a scoped computation runs in.
///
/// Carries the ambient service [`Env`], the cancellation token that
/// delivers interruption, and whether interruption is currently masked.
/// Contexts are cheap to clone and are passed by value through every
/// acquisition.
#[derive(Clone)]
pub struct Ctx {
    env: Env,
    token: CancellationToken,
    masked: bool,
}

impl Ctx {
    /// Creates a root context with a fresh cancellation token.
    pub fn new(env: Env) -> Self {
        Self {
            env,
            token: CancellationToken::new(),
            masked: false,
        }
    }

    /// The ambient environment.
    pub fn env(&self) -> &Env {
        &self.env
    }

    /// Returns a context with `env` replacing the ambient environment.
    pub fn with_env(&self, env: Env) -> Ctx {
        Ctx {
            env,
            token: self.token.clone(),
            masked: self.masked,
        }
    }

    /// Returns a context whose environment is extended by `extra`
    /// (entries in `extra` win on conflicts).
    pub fn with_merged_env(&self, extra: &Env) -> Ctx {
        self.with_env(self.env.union(extra))
    }

    /// The cancellation token delivering interruption to this context.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Requests interruption of everything running under this context.
    pub fn interrupt(&self) {
        self.token.cancel();
    }

    /// True once interruption has been requested (masked or not).
    pub fn is_interrupt_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns a context with a child token: interrupting the parent
    /// interrupts the child, but not the other way around. Used for
    /// background acquisition and fail-fast parallel branches.
    pub fn child(&self) -> Ctx {
        Ctx {
            env: self.env.clone(),
            token: self.token.child_token(),
            masked: self.masked,
        }
    }

    /// Enters a masked region.
    ///
    /// Returns the masked context plus a [`Restore`] capturing the
    /// previous mask state. Interruption ownership stays lexically
    /// visible: only code holding the `Restore` can re-enable it.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let (masked, restore) = ctx.mask();
    /// let value = restore.apply(&masked).interruptible(acquire()).await?;
    /// // registration runs masked; interruption waits until we return
    /// ```
    pub fn mask(&self) -> (Ctx, Restore) {
        let restore = Restore {
            masked: self.masked,
        };
        let masked = Ctx {
            env: self.env.clone(),
            token: self.token.clone(),
            masked: true,
        };
        (masked, restore)
    }

    /// Fails with [`Cause::Interrupt`] if interruption is pending and this
    /// context is unmasked. Cheap synchronous suspension point.
    pub fn checkpoint<E>(&self) -> Result<(), Cause<E>> {
        if !self.masked && self.token.is_cancelled() {
            Err(Cause::Interrupt)
        } else {
            Ok(())
        }
    }

    /// Runs `fut` as an interruptible suspension point.
    ///
    /// Unmasked, the future races the cancellation token and loses with
    /// [`Cause::Interrupt`]; masked, it runs to completion regardless of
    /// the token.
    pub async fn interruptible<T, E, F>(&self, fut: F) -> Result<T, Cause<E>>
    where
        F: Future<Output = Result<T, Cause<E>>>,
    {
        if self.masked {
            return fut.await;
        }
        tokio::select! {
            biased;

            _ = self.token.cancelled() => Err(Cause::Interrupt),
            result = fut => result,
        }
    }
}

/// Token to restore the interruption mask that was in force before a
/// [`Ctx::mask`] call.
#[derive(Clone, Copy, Debug)]
pub struct Restore {
    masked: bool,
}

impl Restore {
    /// Applies the captured mask state to `ctx`.
    pub fn apply(&self, ctx: &Ctx) -> Ctx {
        Ctx {
            env: ctx.env.clone(),
            token: ctx.token.clone(),
            masked: self.masked,
        }
    }
}
