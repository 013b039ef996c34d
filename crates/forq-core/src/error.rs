//! Execution errors routed to the failure handler.

use thiserror::Error;

use crate::factory::{FactoryError, PerformError};

/// Any error caught around a single job's execution.
///
/// Every variant maps to a stable exception name recorded in failure
/// records; none of them terminates the work loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkError {
    /// The factory could not produce an executable for the descriptor.
    #[error("cannot build a runnable job: {0}")]
    InvalidJob(#[from] FactoryError),

    /// The job's `perform` raised.
    #[error(transparent)]
    Perform(#[from] PerformError),

    /// A forked child terminated abnormally, or could not be forked at
    /// all on a platform that supports forking.
    #[error("{detail}")]
    DirtyExit {
        /// Human-readable account of how the child died or why the fork
        /// failed.
        detail: String,
    },
}

impl WorkError {
    /// Stable exception name for failure records.
    #[must_use]
    pub fn exception(&self) -> &str {
        match self {
            Self::InvalidJob(_) => "invalid-job",
            Self::Perform(err) => err.kind(),
            Self::DirtyExit { .. } => "dirty-exit",
        }
    }

    /// Human-readable message for failure records.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::InvalidJob(err) => err.to_string(),
            Self::Perform(err) => err.message().to_string(),
            Self::DirtyExit { detail } => detail.clone(),
        }
    }

    /// Backtrace frames, when the underlying error captured any.
    #[must_use]
    pub fn backtrace_frames(&self) -> &[String] {
        match self {
            Self::Perform(err) => err.backtrace(),
            Self::InvalidJob(_) | Self::DirtyExit { .. } => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_names_are_stable() {
        let invalid = WorkError::InvalidJob(FactoryError::UnknownClass {
            class: "X".to_string(),
        });
        assert_eq!(invalid.exception(), "invalid-job");

        let perform = WorkError::Perform(PerformError::new("RuntimeError", "boom"));
        assert_eq!(perform.exception(), "RuntimeError");
        assert_eq!(perform.message(), "boom");

        let dirty = WorkError::DirtyExit {
            detail: "child 42 exited with exit code 2".to_string(),
        };
        assert_eq!(dirty.exception(), "dirty-exit");
        assert!(dirty.message().contains("exit code 2"));
    }
}
