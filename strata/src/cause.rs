//! Failure causes with sequential and parallel aggregation.
//!
//! Teardown must never discard a failure: when a chain of finalizers runs
//! and more than one of them fails, every failure is reported. [`Cause`]
//! is the tree that carries them — `Then` for failures that happened one
//! after another, `Both` for failures that happened concurrently.
//!
//! Interruption is a first-class cause rather than an error value, so a
//! cancelled scope is distinguishable from a failed one all the way up to
//! the caller.

use std::fmt;

/// Why a computation or a teardown did not succeed.
///
/// `Then` and `Both` keep the full failure history when several cleanup
/// actions fail during the same teardown. Use [`Cause::then`] and
/// [`Cause::both`] to combine; they normalize pure-interruption pairs so
/// that a plainly interrupted scope is not misreported as an aggregate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Cause<E> {
    /// A typed failure.
    Fail(E),

    /// The computation was interrupted.
    Interrupt,

    /// Two causes, the left strictly before the right.
    Then(Box<Cause<E>>, Box<Cause<E>>),

    /// Two causes from concurrent branches.
    Both(Box<Cause<E>>, Box<Cause<E>>),
}

// Display is written by hand: a derive would need `Cause<E>: Display` to
// prove `Cause<E>: Display` through the boxed children.
impl<E: fmt::Display> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Fail(e) => write!(f, "{e}"),
            Cause::Interrupt => write!(f, "interrupted"),
            Cause::Then(a, b) => write!(f, "{a}; then: {b}"),
            Cause::Both(a, b) => write!(f, "{a}; also: {b}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for Cause<E> {}

impl<E> Cause<E> {
    /// Wraps a typed error.
    pub fn fail(error: E) -> Self {
        Self::Fail(error)
    }

    /// Combines two causes that occurred in sequence.
    pub fn then(self, later: Cause<E>) -> Self {
        match (self, later) {
            (Cause::Interrupt, Cause::Interrupt) => Cause::Interrupt,
            (a, b) => Cause::Then(Box::new(a), Box::new(b)),
        }
    }

    /// Combines two causes from concurrent branches.
    pub fn both(self, other: Cause<E>) -> Self {
        match (self, other) {
            (Cause::Interrupt, Cause::Interrupt) => Cause::Interrupt,
            (a, b) => Cause::Both(Box::new(a), Box::new(b)),
        }
    }

    /// True if interruption appears anywhere in this cause.
    pub fn is_interrupted(&self) -> bool {
        match self {
            Cause::Fail(_) => false,
            Cause::Interrupt => true,
            Cause::Then(a, b) | Cause::Both(a, b) => a.is_interrupted() || b.is_interrupted(),
        }
    }

    /// True if this cause is interruption and nothing else.
    pub fn is_interrupted_only(&self) -> bool {
        match self {
            Cause::Interrupt => true,
            Cause::Fail(_) => false,
            Cause::Then(a, b) | Cause::Both(a, b) => {
                a.is_interrupted_only() && b.is_interrupted_only()
            }
        }
    }

    /// All typed failures in this cause, left to right.
    pub fn failures(&self) -> Vec<&E> {
        let mut out = Vec::new();
        self.collect_failures(&mut out);
        out
    }

    fn collect_failures<'a>(&'a self, out: &mut Vec<&'a E>) {
        match self {
            Cause::Fail(e) => out.push(e),
            Cause::Interrupt => {}
            Cause::Then(a, b) | Cause::Both(a, b) => {
                a.collect_failures(out);
                b.collect_failures(out);
            }
        }
    }

    /// Maps every typed failure, keeping the tree shape.
    pub fn map_error<E2>(self, f: &impl Fn(E) -> E2) -> Cause<E2> {
        match self {
            Cause::Fail(e) => Cause::Fail(f(e)),
            Cause::Interrupt => Cause::Interrupt,
            Cause::Then(a, b) => Cause::Then(Box::new(a.map_error(f)), Box::new(b.map_error(f))),
            Cause::Both(a, b) => Cause::Both(Box::new(a.map_error(f)), Box::new(b.map_error(f))),
        }
    }

    /// Folds a sequence of causes into one with [`Cause::then`].
    pub fn then_all(causes: impl IntoIterator<Item = Cause<E>>) -> Option<Cause<E>> {
        causes.into_iter().reduce(Cause::then)
    }

    /// Folds concurrent causes into one with [`Cause::both`].
    pub fn both_all(causes: impl IntoIterator<Item = Cause<E>>) -> Option<Cause<E>> {
        causes.into_iter().reduce(Cause::both)
    }
}
