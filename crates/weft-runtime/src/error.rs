//! Error types for the weft runtime.

use std::fmt;

use thiserror::Error;

use crate::cause::Cause;

/// Errors raised by the runtime itself rather than by user effects.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime has been shut down.
    #[error("runtime has been shut down")]
    Shutdown,

    /// Failed to spawn a worker or timer thread.
    #[error("failed to spawn thread: {0}")]
    SpawnFailed(String),

    /// A value crossing the erased instruction boundary had the wrong type.
    #[error("type mismatch: expected {expected}")]
    TypeMismatch {
        /// Name of the expected type.
        expected: &'static str,
    },
}

impl RuntimeError {
    pub(crate) fn type_mismatch<T>() -> Self {
        RuntimeError::TypeMismatch {
            expected: std::any::type_name::<T>(),
        }
    }
}

/// An unsuccessful fiber outcome as a standard error.
///
/// The `Display` output is the full rendering of the cause, concurrent
/// branches included.
#[derive(Debug, Error)]
#[error("fiber failed:\n{cause}")]
pub struct FiberFailure<E: fmt::Debug> {
    /// Why the fiber failed.
    pub cause: Cause<E>,
}

impl<E: fmt::Debug> FiberFailure<E> {
    /// Wrap a cause.
    pub fn new(cause: Cause<E>) -> Self {
        Self { cause }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cause::Defect;

    #[test]
    fn test_error_display() {
        let err = RuntimeError::Shutdown;
        assert_eq!(err.to_string(), "runtime has been shut down");

        let err = RuntimeError::type_mismatch::<u32>();
        assert_eq!(err.to_string(), "type mismatch: expected u32");
    }

    #[test]
    fn test_fiber_failure_display() {
        let failure = FiberFailure::new(Cause::fail("io").then(Cause::die(Defect::new("close"))));
        assert_eq!(
            failure.to_string(),
            "fiber failed:\nThen\n  Fail(\"io\")\n  Die(close)"
        );
    }
}
