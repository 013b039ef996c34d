//! Job factories: turning descriptors into executable work.
//!
//! A [`JobFactory`] resolves a descriptor's class tag to something that can
//! [`Perform`]. The argument shape is the factory's concern; the worker
//! never looks inside. [`JobRegistry`] is the standard factory, a map from
//! class tag to constructor.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

use crate::job::JobDescriptor;

/// Error raised by a job's `perform`.
///
/// Carries a machine-readable `kind` (recorded as the failure's exception
/// name), a human message, and an optional backtrace of frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct PerformError {
    kind: String,
    message: String,
    backtrace: Vec<String>,
}

impl PerformError {
    /// Build an error of `kind` with a human `message`.
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            backtrace: Vec::new(),
        }
    }

    /// Attach backtrace frames, outermost first.
    #[must_use]
    pub fn with_backtrace(mut self, frames: Vec<String>) -> Self {
        self.backtrace = frames;
        self
    }

    /// Machine-readable error kind, e.g. `"RuntimeError"`.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Backtrace frames, possibly empty.
    #[must_use]
    pub fn backtrace(&self) -> &[String] {
        &self.backtrace
    }
}

/// Errors from materializing a descriptor into an executable.
///
/// All variants are recorded as `invalid-job` failures by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FactoryError {
    /// No constructor is registered for the class tag.
    #[error("unknown job class: {class}")]
    UnknownClass {
        /// The unresolvable class tag.
        class: String,
    },

    /// The class resolved to something that cannot perform.
    #[error("job class {class} cannot perform: {reason}")]
    Unperformable {
        /// The class tag.
        class: String,
        /// Why the resolved object is not executable.
        reason: String,
    },

    /// The descriptor's arguments do not fit the class.
    #[error("invalid arguments for {class}: {reason}")]
    InvalidArguments {
        /// The class tag.
        class: String,
        /// What was wrong with the arguments.
        reason: String,
    },
}

/// The perform capability: one no-argument operation whose success is the
/// absence of an error.
pub trait Perform {
    /// Execute the job.
    ///
    /// # Errors
    ///
    /// Returns a [`PerformError`] describing the failure; the worker records
    /// it and keeps looping.
    fn perform(&self) -> Result<(), PerformError>;
}

/// Materializes executables from descriptors.
pub trait JobFactory: Send {
    /// Produce an executable for `job`, injecting its arguments.
    ///
    /// # Errors
    ///
    /// Returns a [`FactoryError`] when the class tag cannot be resolved or
    /// the resolved object lacks the perform capability.
    fn create(&self, job: &JobDescriptor) -> Result<Box<dyn Perform>, FactoryError>;
}

type Constructor =
    Box<dyn Fn(&[Value]) -> Result<Box<dyn Perform>, FactoryError> + Send + Sync>;

/// Class-tag registry, the standard [`JobFactory`].
///
/// Constructors receive the descriptor's argument list and return a boxed
/// [`Perform`], or a [`FactoryError`] when the arguments do not fit.
#[derive(Default)]
pub struct JobRegistry {
    constructors: HashMap<String, Constructor>,
}

impl JobRegistry {
    /// Create an empty registry. Every descriptor fails `invalid-job` until
    /// classes are registered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `constructor` for `class`, replacing any previous entry.
    pub fn register<F>(&mut self, class: impl Into<String>, constructor: F)
    where
        F: Fn(&[Value]) -> Result<Box<dyn Perform>, FactoryError> + Send + Sync + 'static,
    {
        self.constructors.insert(class.into(), Box::new(constructor));
    }

    /// Registered class tags, in no particular order.
    #[must_use]
    pub fn classes(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("classes", &self.constructors.len())
            .finish()
    }
}

impl JobFactory for JobRegistry {
    fn create(&self, job: &JobDescriptor) -> Result<Box<dyn Perform>, FactoryError> {
        let constructor =
            self.constructors
                .get(job.class())
                .ok_or_else(|| FactoryError::UnknownClass {
                    class: job.class().to_string(),
                })?;
        constructor(job.args())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct Echo {
        msg: String,
    }

    impl Perform for Echo {
        fn perform(&self) -> Result<(), PerformError> {
            if self.msg.is_empty() {
                return Err(PerformError::new("RuntimeError", "nothing to echo"));
            }
            Ok(())
        }
    }

    fn registry() -> JobRegistry {
        let mut registry = JobRegistry::new();
        registry.register("Echo", |args| {
            let msg = args
                .first()
                .and_then(|arg| arg.get("msg"))
                .and_then(Value::as_str)
                .ok_or_else(|| FactoryError::InvalidArguments {
                    class: "Echo".to_string(),
                    reason: "expected {\"msg\": <string>}".to_string(),
                })?;
            Ok(Box::new(Echo {
                msg: msg.to_string(),
            }) as Box<dyn Perform>)
        });
        registry
    }

    #[test]
    fn test_create_injects_arguments() {
        let registry = registry();
        let job = JobDescriptor::new("Echo", vec![json!({"msg": "hi"})]);
        let runnable = registry.create(&job).unwrap();
        runnable.perform().unwrap();
    }

    #[test]
    fn test_unknown_class_is_rejected() {
        let registry = registry();
        let job = JobDescriptor::new("Missing", vec![]);
        match registry.create(&job) {
            Err(err) => assert_eq!(
                err,
                FactoryError::UnknownClass {
                    class: "Missing".to_string(),
                }
            ),
            Ok(_) => panic!("expected UnknownClass error"),
        }
    }

    #[test]
    fn test_bad_arguments_are_rejected() {
        let registry = registry();
        let job = JobDescriptor::new("Echo", vec![json!(42)]);
        assert!(matches!(
            registry.create(&job),
            Err(FactoryError::InvalidArguments { .. })
        ));
    }

    #[test]
    fn test_perform_error_carries_kind_and_message() {
        let err = PerformError::new("RuntimeError", "boom")
            .with_backtrace(vec!["frame 0".to_string()]);
        assert_eq!(err.kind(), "RuntimeError");
        assert_eq!(err.message(), "boom");
        assert_eq!(err.backtrace(), ["frame 0".to_string()]);
        assert_eq!(err.to_string(), "boom");
    }
}
