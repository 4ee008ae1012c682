//! The outcome of a finished computation.

use std::convert::Infallible;
use std::fmt;

use crate::cause::{Cause, Defect};
use crate::error::FiberFailure;
use crate::fiber_id::FiberId;

/// How a computation ended: a value, or the [`Cause`] of its failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Exit<A, E> {
    /// Completed with a value.
    Success(A),
    /// Failed, died or was interrupted.
    Failure(Cause<E>),
}

impl<A, E> Exit<A, E> {
    /// A successful exit.
    pub fn succeed(value: A) -> Self {
        Exit::Success(value)
    }

    /// A typed failure.
    pub fn fail(error: E) -> Self {
        Exit::Failure(Cause::fail(error))
    }

    /// A failure with an arbitrary cause.
    pub fn fail_cause(cause: Cause<E>) -> Self {
        Exit::Failure(cause)
    }

    /// A defect.
    pub fn die(defect: Defect) -> Self {
        Exit::Failure(Cause::die(defect))
    }

    /// An interruption by `fiber_id`.
    pub fn interrupt(fiber_id: FiberId) -> Self {
        Exit::Failure(Cause::interrupt(fiber_id))
    }

    /// Check whether the exit is a success.
    pub fn is_success(&self) -> bool {
        matches!(self, Exit::Success(_))
    }

    /// Check whether the exit is a failure of any kind.
    pub fn is_failure(&self) -> bool {
        matches!(self, Exit::Failure(_))
    }

    /// Check whether the exit is pure interruption.
    pub fn is_interrupted(&self) -> bool {
        match self {
            Exit::Success(_) => false,
            Exit::Failure(cause) => cause.is_interrupted(),
        }
    }

    /// The cause, if the exit is a failure.
    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Exit::Success(_) => None,
            Exit::Failure(cause) => Some(cause),
        }
    }

    /// The value, if the exit is a success.
    pub fn value(&self) -> Option<&A> {
        match self {
            Exit::Success(value) => Some(value),
            Exit::Failure(_) => None,
        }
    }

    /// Transform the success value.
    pub fn map<B, F>(self, f: F) -> Exit<B, E>
    where
        F: FnOnce(A) -> B,
    {
        match self {
            Exit::Success(value) => Exit::Success(f(value)),
            Exit::Failure(cause) => Exit::Failure(cause),
        }
    }

    /// Transform every typed failure.
    pub fn map_error<E2, F>(self, f: F) -> Exit<A, E2>
    where
        F: FnMut(E) -> E2,
    {
        match self {
            Exit::Success(value) => Exit::Success(value),
            Exit::Failure(cause) => Exit::Failure(cause.map(f)),
        }
    }

    /// Transform the cause.
    pub fn map_cause<E2, F>(self, f: F) -> Exit<A, E2>
    where
        F: FnOnce(Cause<E>) -> Cause<E2>,
    {
        match self {
            Exit::Success(value) => Exit::Success(value),
            Exit::Failure(cause) => Exit::Failure(f(cause)),
        }
    }

    /// Discard the success value.
    pub fn as_unit(self) -> Exit<(), E> {
        self.map(|_| ())
    }

    /// Convert into a `Result` keeping the whole cause.
    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Exit::Success(value) => Ok(value),
            Exit::Failure(cause) => Err(cause),
        }
    }

    /// Combine two exits that ran one after the other. Failures compose
    /// with `then`.
    pub fn zip<B>(self, that: Exit<B, E>) -> Exit<(A, B), E> {
        match (self, that) {
            (Exit::Success(a), Exit::Success(b)) => Exit::Success((a, b)),
            (Exit::Failure(left), Exit::Failure(right)) => Exit::Failure(left.then(right)),
            (Exit::Failure(cause), _) | (_, Exit::Failure(cause)) => Exit::Failure(cause),
        }
    }

    /// Combine two exits that ran concurrently. Failures compose with
    /// `both`.
    pub fn zip_par<B>(self, that: Exit<B, E>) -> Exit<(A, B), E> {
        match (self, that) {
            (Exit::Success(a), Exit::Success(b)) => Exit::Success((a, b)),
            (Exit::Failure(left), Exit::Failure(right)) => Exit::Failure(left.both(right)),
            (Exit::Failure(cause), _) | (_, Exit::Failure(cause)) => Exit::Failure(cause),
        }
    }

    /// Combine exits of concurrently running computations. Every failure is
    /// kept, composed with `both`.
    pub fn collect_all_par<I>(exits: I) -> Exit<Vec<A>, E>
    where
        I: IntoIterator<Item = Exit<A, E>>,
    {
        let mut values = Vec::new();
        let mut failure: Option<Cause<E>> = None;
        for exit in exits {
            match exit {
                Exit::Success(value) => values.push(value),
                Exit::Failure(cause) => {
                    failure = Some(match failure {
                        Some(acc) => acc.both(cause),
                        None => cause,
                    });
                }
            }
        }
        match failure {
            Some(cause) => Exit::Failure(cause),
            None => Exit::Success(values),
        }
    }
}

impl<A, E: fmt::Debug> Exit<A, E> {
    /// Convert into a `Result` whose error renders the whole cause.
    pub fn into_fiber_result(self) -> Result<A, FiberFailure<E>> {
        self.into_result().map_err(FiberFailure::new)
    }
}

impl<A> Exit<A, Infallible> {
    /// An exit without typed failures fits any error type.
    pub fn widen<E>(self) -> Exit<A, E> {
        self.map_cause(Cause::widen)
    }
}

impl<A, E> From<Result<A, E>> for Exit<A, E> {
    fn from(result: Result<A, E>) -> Self {
        match result {
            Ok(value) => Exit::Success(value),
            Err(error) => Exit::fail(error),
        }
    }
}
