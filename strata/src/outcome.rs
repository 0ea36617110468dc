//! Completion outcomes delivered to finalizers.
//!
//! Every finalizer receives the [`Outcome`] of the scope it belongs to:
//! normal completion, failure with the full [`Cause`] tree, or
//! interruption. A release action can use this to decide between commit
//! and rollback behavior (e.g. keep a temp file on success, delete it on
//! failure).

use crate::cause::Cause;

/// How the computation that owned a resource finished.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome<E> {
    /// The scope completed normally.
    Success,

    /// The scope failed; the cause may aggregate several failures.
    Failure(Cause<E>),

    /// The scope was interrupted before completing.
    Interrupted,
}

impl<E: Clone> Outcome<E> {
    /// Derives the outcome from a result, mapping interruption-only causes
    /// to [`Outcome::Interrupted`].
    pub fn from_result<T>(result: &Result<T, Cause<E>>) -> Self {
        match result {
            Ok(_) => Outcome::Success,
            Err(cause) if cause.is_interrupted_only() => Outcome::Interrupted,
            Err(cause) => Outcome::Failure(cause.clone()),
        }
    }
}

impl<E> Outcome<E> {
    /// True for [`Outcome::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    /// True for [`Outcome::Interrupted`].
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Outcome::Interrupted)
    }
}
