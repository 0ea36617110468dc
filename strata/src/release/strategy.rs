//! Execution strategies for batched finalizer runs.

use std::fmt;
use std::num::NonZeroUsize;

/// How a batch of finalizers is executed during scope teardown.
///
/// The strategy of a scope is independent of the strategies of its parent
/// and child scopes: a parallel combinator releases its branches
/// concurrently even when each branch tears itself down sequentially.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecStrategy {
    /// One after another, in reverse registration order.
    Sequential,

    /// All at once, no ordering guarantee.
    Parallel,

    /// At most `n` in flight at a time.
    ParallelN(NonZeroUsize),
}

impl ExecStrategy {
    /// Creates a bounded-parallelism strategy.
    ///
    /// # Panics
    ///
    /// Panics if `n` is zero.
    pub fn parallel_n(n: usize) -> Self {
        let n = NonZeroUsize::new(n).expect("parallelism bound must be non-zero");
        Self::ParallelN(n)
    }
}

impl fmt::Display for ExecStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential => write!(f, "Sequential"),
            Self::Parallel => write!(f, "Parallel"),
            Self::ParallelN(n) => write!(f, "ParallelN({})", n),
        }
    }
}
