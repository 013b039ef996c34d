//! Job descriptors and their wire format.
//!
//! A [`JobDescriptor`] is the unit of work that travels through queues: a
//! class tag naming the executable, an ordered argument list, a lazily
//! assigned unique id, and bookkeeping for the queue it was popped from.
//!
//! # Wire format
//!
//! Descriptors serialize to a JSON object that is stable across restarts:
//!
//! ```text
//! { "class": "EchoJob", "args": [[{"msg": "hi"}]], "id": "…", "queue_time": 1700000000.5 }
//! ```
//!
//! `args` is an array containing a single element, which is itself the
//! argument list. The extra wrapping is part of the format and is preserved
//! by [`JobDescriptor::encode`] / [`JobDescriptor::decode`].

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Errors from descriptor state transitions and the wire codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// A state transition was requested out of order.
    #[error("invalid job state transition: {from} -> {to}")]
    InvalidTransition {
        /// State the descriptor was in.
        from: JobState,
        /// State that was requested.
        to: JobState,
    },

    /// The descriptor could not be serialized.
    #[error("failed to encode job: {detail}")]
    Encode {
        /// Detail about the failure.
        detail: String,
    },

    /// The payload was not a valid descriptor object.
    #[error("failed to decode job: {detail}")]
    Decode {
        /// Detail about the failure.
        detail: String,
    },
}

/// Lifecycle state of a descriptor.
///
/// Transitions only move forward: `waiting -> running -> complete | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    /// Enqueued, not yet reserved.
    Waiting,
    /// Reserved by a worker and executing.
    Running,
    /// Finished without error.
    Complete,
    /// Finished with a recorded failure.
    Failed,
}

impl JobState {
    /// Stable lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    /// Whether `next` is a legal successor of `self`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Waiting, Self::Running)
                | (Self::Running, Self::Complete | Self::Failed)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Boundary struct for the descriptor wire format.
///
/// The one-element tuple around the argument list produces the
/// `"args": [[…]]` wrapping the format requires.
#[derive(Serialize, Deserialize)]
struct WireJob {
    class: String,
    args: (Vec<Value>,),
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    queue_time: Option<f64>,
}

/// An opaque unit of work: class tag, arguments, identity, origin.
///
/// The id is derived lazily from a random source on first access, so
/// freshly built descriptors stay cheap until something needs to name them.
/// Equality is by id alone. `Clone` deliberately assigns a **fresh** id —
/// a clone is a new piece of work with the same shape, not the same work
/// twice; use [`JobDescriptor::snapshot`] for an identity-preserving copy.
#[derive(Debug)]
pub struct JobDescriptor {
    class: String,
    args: Vec<Value>,
    id: OnceLock<String>,
    state: JobState,
    origin_queue: Option<String>,
    queue_time: Option<f64>,
}

impl JobDescriptor {
    /// Build a descriptor in the `waiting` state with a lazily assigned id.
    #[must_use]
    pub fn new(class: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            class: class.into(),
            args,
            id: OnceLock::new(),
            state: JobState::Waiting,
            origin_queue: None,
            queue_time: None,
        }
    }

    /// Build a descriptor with a caller-supplied id.
    #[must_use]
    pub fn with_id(class: impl Into<String>, args: Vec<Value>, id: impl Into<String>) -> Self {
        let descriptor = Self::new(class, args);
        let _ = descriptor.id.set(id.into());
        descriptor
    }

    /// Class tag naming the executable to materialize.
    #[must_use]
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Ordered argument list injected by the job factory.
    #[must_use]
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Unique id, derived from a random source on first access.
    #[must_use]
    pub fn id(&self) -> &str {
        self.id.get_or_init(|| Uuid::new_v4().to_string())
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> JobState {
        self.state
    }

    /// Name of the queue this descriptor was popped from, when known.
    ///
    /// This is a weak relation: the name is enough to find the queue again,
    /// and nothing here keeps the queue alive.
    #[must_use]
    pub fn origin_queue(&self) -> Option<&str> {
        self.origin_queue.as_deref()
    }

    /// Record the queue this descriptor was popped from.
    pub fn set_origin_queue(&mut self, name: impl Into<String>) {
        self.origin_queue = Some(name.into());
    }

    /// Wall-clock enqueue time in epoch seconds, when stamped.
    #[must_use]
    pub const fn queue_time(&self) -> Option<f64> {
        self.queue_time
    }

    pub(crate) fn set_queue_time(&mut self, epoch_seconds: f64) {
        self.queue_time = Some(epoch_seconds);
    }

    /// Advance the lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::InvalidTransition`] when `next` is not a legal
    /// successor of the current state; states never move backward.
    pub fn transition(&mut self, next: JobState) -> Result<(), JobError> {
        if !self.state.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Identity-preserving copy, unlike `Clone` which assigns a fresh id.
    #[must_use]
    pub fn snapshot(&self) -> Self {
        let copy = Self {
            class: self.class.clone(),
            args: self.args.clone(),
            id: OnceLock::new(),
            state: self.state,
            origin_queue: self.origin_queue.clone(),
            queue_time: self.queue_time,
        };
        let _ = copy.id.set(self.id().to_string());
        copy
    }

    /// Descriptor as a JSON value in the wire format.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Encode`] when serialization fails.
    pub fn to_wire_value(&self) -> Result<Value, JobError> {
        let wire = WireJob {
            class: self.class.clone(),
            args: (self.args.clone(),),
            id: Some(self.id().to_string()),
            queue_time: self.queue_time,
        };
        serde_json::to_value(wire).map_err(|err| JobError::Encode {
            detail: err.to_string(),
        })
    }

    /// Encode to the JSON wire format.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Encode`] when serialization fails.
    pub fn encode(&self) -> Result<String, JobError> {
        let value = self.to_wire_value()?;
        serde_json::to_string(&value).map_err(|err| JobError::Encode {
            detail: err.to_string(),
        })
    }

    /// Decode from the JSON wire format.
    ///
    /// The decoded descriptor is in the `waiting` state with no origin
    /// queue; the popping queue fills that in.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Decode`] when the payload is not a descriptor
    /// object in the wire format.
    pub fn decode(payload: &str) -> Result<Self, JobError> {
        let wire: WireJob = serde_json::from_str(payload).map_err(|err| JobError::Decode {
            detail: err.to_string(),
        })?;
        let mut descriptor = match wire.id {
            Some(id) => Self::with_id(wire.class, wire.args.0, id),
            None => Self::new(wire.class, wire.args.0),
        };
        descriptor.queue_time = wire.queue_time;
        Ok(descriptor)
    }
}

impl Clone for JobDescriptor {
    fn clone(&self) -> Self {
        Self {
            class: self.class.clone(),
            args: self.args.clone(),
            id: OnceLock::new(),
            state: self.state,
            origin_queue: self.origin_queue.clone(),
            queue_time: self.queue_time,
        }
    }
}

impl PartialEq for JobDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for JobDescriptor {}

impl std::fmt::Display for JobDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.class, self.id())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let mut job = JobDescriptor::with_id("EchoJob", vec![json!({"msg": "hi"})], "abc");
        job.set_queue_time(1_700_000_000.5);

        let decoded = JobDescriptor::decode(&job.encode().unwrap()).unwrap();
        assert_eq!(decoded.class(), "EchoJob");
        assert_eq!(decoded.args(), &[json!({"msg": "hi"})]);
        assert_eq!(decoded.id(), "abc");
        assert_eq!(decoded.queue_time(), Some(1_700_000_000.5));
        assert_eq!(decoded, job);
    }

    #[test]
    fn test_wire_args_are_singly_wrapped() {
        let job = JobDescriptor::with_id("J", vec![json!(1), json!(2)], "id-1");
        let value = job.to_wire_value().unwrap();
        assert_eq!(value["class"], json!("J"));
        // One-element outer array whose element is the argument list.
        assert_eq!(value["args"], json!([[1, 2]]));
        assert_eq!(value["id"], json!("id-1"));
    }

    #[test]
    fn test_decode_without_id_assigns_one_lazily() {
        let job = JobDescriptor::decode(r#"{"class":"J","args":[[]]}"#).unwrap();
        assert!(!job.id().is_empty());
    }

    #[test]
    fn test_decode_rejects_malformed_payloads() {
        assert!(JobDescriptor::decode("not json").is_err());
        assert!(JobDescriptor::decode(r#"{"args":[[]]}"#).is_err());
        // The single-element wrapping is part of the format.
        assert!(JobDescriptor::decode(r#"{"class":"J","args":[]}"#).is_err());
    }

    #[test]
    fn test_clone_assigns_fresh_id() {
        let job = JobDescriptor::new("J", vec![]);
        let copy = job.clone();
        assert_ne!(job.id(), copy.id());
        assert_ne!(job, copy);
        assert_eq!(copy.class(), "J");
    }

    #[test]
    fn test_snapshot_preserves_id() {
        let job = JobDescriptor::new("J", vec![json!("a")]);
        let copy = job.snapshot();
        assert_eq!(job.id(), copy.id());
        assert_eq!(job, copy);
    }

    #[test]
    fn test_equality_is_by_id_alone() {
        let a = JobDescriptor::with_id("A", vec![], "same");
        let b = JobDescriptor::with_id("B", vec![json!(1)], "same");
        assert_eq!(a, b);
    }

    #[test]
    fn test_state_transitions_are_forward_only() {
        let mut job = JobDescriptor::new("J", vec![]);
        assert_eq!(job.state(), JobState::Waiting);

        job.transition(JobState::Running).unwrap();
        job.transition(JobState::Complete).unwrap();
        let err = job.transition(JobState::Running).unwrap_err();
        assert_eq!(
            err,
            JobError::InvalidTransition {
                from: JobState::Complete,
                to: JobState::Running,
            }
        );

        let mut job = JobDescriptor::new("J", vec![]);
        assert!(job.transition(JobState::Complete).is_err());
        job.transition(JobState::Running).unwrap();
        job.transition(JobState::Failed).unwrap();
    }
}
