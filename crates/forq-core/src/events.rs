//! Lifecycle events and their synchronous fan-out bus.
//!
//! The worker narrates its lifecycle through [`WorkerEvent`]s dispatched on
//! an [`EventBus`]. Dispatch is synchronous and single-threaded: subscribers
//! run in registration order, and a failing subscriber is logged and
//! swallowed so it can never stall the work loop.

use thiserror::Error;
use tracing::{debug, warn};

use crate::job::JobDescriptor;

/// Error returned by a subscriber. Logged and swallowed by the bus.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SubscriberError {
    message: String,
}

impl SubscriberError {
    /// Build an error with a human message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for SubscriberError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for SubscriberError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// The kinds of lifecycle events the worker emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The work loop is starting.
    WorkerStartup,
    /// The parent is about to fork for a job.
    WorkerBeforeFork,
    /// The child has been forked and is about to perform.
    WorkerAfterFork,
    /// A job is about to perform.
    JobBeforePerform,
    /// A job's perform returned without error.
    JobAfterPerform,
    /// A job finished successfully.
    JobPerformed,
    /// A job failed and was recorded.
    JobFailed,
}

impl EventKind {
    /// Stable kebab-case label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WorkerStartup => "worker-startup",
            Self::WorkerBeforeFork => "worker-before-fork",
            Self::WorkerAfterFork => "worker-after-fork",
            Self::JobBeforePerform => "job-before-perform",
            Self::JobAfterPerform => "job-after-perform",
            Self::JobPerformed => "job-performed",
            Self::JobFailed => "job-failed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle event with its payload.
///
/// Descriptors carried by events are identity-preserving snapshots of the
/// worker's current job.
#[derive(Debug)]
pub enum WorkerEvent {
    /// The work loop is starting.
    WorkerStartup {
        /// Identity of the starting worker.
        worker: String,
    },
    /// The parent is about to fork for `job`.
    WorkerBeforeFork {
        /// The reserved descriptor.
        job: JobDescriptor,
    },
    /// The freshly forked child is about to perform `job`.
    WorkerAfterFork {
        /// The reserved descriptor.
        job: JobDescriptor,
    },
    /// `job` is about to perform.
    JobBeforePerform {
        /// The executing descriptor.
        job: JobDescriptor,
    },
    /// `job`'s perform returned without error.
    JobAfterPerform {
        /// The executed descriptor.
        job: JobDescriptor,
    },
    /// `job` finished successfully.
    JobPerformed {
        /// The completed descriptor.
        job: JobDescriptor,
    },
    /// `job` failed and was recorded.
    JobFailed {
        /// The failed descriptor.
        job: JobDescriptor,
        /// Stable exception name.
        exception: String,
        /// Human-readable error message.
        error: String,
        /// Identity of the observing worker.
        worker: String,
    },
}

impl WorkerEvent {
    /// The event's kind.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::WorkerStartup { .. } => EventKind::WorkerStartup,
            Self::WorkerBeforeFork { .. } => EventKind::WorkerBeforeFork,
            Self::WorkerAfterFork { .. } => EventKind::WorkerAfterFork,
            Self::JobBeforePerform { .. } => EventKind::JobBeforePerform,
            Self::JobAfterPerform { .. } => EventKind::JobAfterPerform,
            Self::JobPerformed { .. } => EventKind::JobPerformed,
            Self::JobFailed { .. } => EventKind::JobFailed,
        }
    }
}

/// A lifecycle event consumer.
pub trait Subscriber: Send {
    /// Handle one event.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriberError`] on failure; the bus logs it and carries
    /// on with the remaining subscribers.
    fn on_event(&self, event: &WorkerEvent) -> Result<(), SubscriberError>;
}

impl<F> Subscriber for F
where
    F: Fn(&WorkerEvent) -> Result<(), SubscriberError> + Send,
{
    fn on_event(&self, event: &WorkerEvent) -> Result<(), SubscriberError> {
        self(event)
    }
}

/// A subscriber that logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSubscriber;

impl Subscriber for LogSubscriber {
    fn on_event(&self, event: &WorkerEvent) -> Result<(), SubscriberError> {
        match event {
            WorkerEvent::WorkerStartup { worker } => {
                debug!(worker = %worker, "worker starting");
            },
            WorkerEvent::WorkerBeforeFork { job } => {
                debug!(job = %job, "forking for job");
            },
            WorkerEvent::WorkerAfterFork { job } => {
                debug!(job = %job, "forked child performing job");
            },
            WorkerEvent::JobBeforePerform { job } => {
                debug!(job = %job, "performing job");
            },
            WorkerEvent::JobAfterPerform { job } => {
                debug!(job = %job, "job performed");
            },
            WorkerEvent::JobPerformed { job } => {
                debug!(job = %job, "job complete");
            },
            WorkerEvent::JobFailed {
                job,
                exception,
                error,
                ..
            } => {
                warn!(job = %job, exception = %exception, error = %error, "job failed");
            },
        }
        Ok(())
    }
}

struct Registration {
    kind: Option<EventKind>,
    subscriber: Box<dyn Subscriber>,
}

/// Synchronous fan-out of lifecycle events to registered subscribers.
#[derive(Default)]
pub struct EventBus {
    registrations: Vec<Registration>,
}

impl EventBus {
    /// Create a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `subscriber` for events of `kind`.
    pub fn subscribe(&mut self, kind: EventKind, subscriber: impl Subscriber + 'static) {
        self.registrations.push(Registration {
            kind: Some(kind),
            subscriber: Box::new(subscriber),
        });
    }

    /// Register `subscriber` for every event kind.
    pub fn subscribe_all(&mut self, subscriber: impl Subscriber + 'static) {
        self.registrations.push(Registration {
            kind: None,
            subscriber: Box::new(subscriber),
        });
    }

    /// Deliver `event` to matching subscribers in registration order.
    ///
    /// Subscriber errors are logged and swallowed; dispatch always reaches
    /// every matching subscriber.
    pub fn dispatch(&self, event: &WorkerEvent) {
        for registration in &self.registrations {
            if registration.kind.is_some_and(|kind| kind != event.kind()) {
                continue;
            }
            if let Err(err) = registration.subscriber.on_event(event) {
                warn!(event = %event.kind(), error = %err, "event subscriber failed");
            }
        }
    }

    /// Number of registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Whether the bus has no subscribers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("registrations", &self.registrations.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn startup() -> WorkerEvent {
        WorkerEvent::WorkerStartup {
            worker: "w".to_string(),
        }
    }

    fn performed() -> WorkerEvent {
        WorkerEvent::JobPerformed {
            job: JobDescriptor::with_id("J", vec![], "1"),
        }
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        for tag in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            bus.subscribe_all(move |_: &WorkerEvent| {
                seen.lock().unwrap().push(tag);
                Ok(())
            });
        }

        bus.dispatch(&startup());
        assert_eq!(*seen.lock().unwrap(), ["first", "second", "third"]);
    }

    #[test]
    fn test_kind_filter() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        let log = Arc::clone(&seen);
        bus.subscribe(EventKind::JobPerformed, move |event: &WorkerEvent| {
            log.lock().unwrap().push(event.kind().as_str());
            Ok(())
        });

        bus.dispatch(&startup());
        bus.dispatch(&performed());
        assert_eq!(*seen.lock().unwrap(), ["job-performed"]);
    }

    #[test]
    fn test_failing_subscriber_does_not_abort_dispatch() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        bus.subscribe_all(|_: &WorkerEvent| Err(SubscriberError::new("broken")));
        let log = Arc::clone(&seen);
        bus.subscribe_all(move |_: &WorkerEvent| {
            log.lock().unwrap().push("reached");
            Ok(())
        });

        bus.dispatch(&startup());
        assert_eq!(*seen.lock().unwrap(), ["reached"]);
    }

    #[test]
    fn test_event_kind_labels() {
        assert_eq!(EventKind::WorkerStartup.as_str(), "worker-startup");
        assert_eq!(EventKind::JobBeforePerform.as_str(), "job-before-perform");
        assert_eq!(EventKind::JobFailed.as_str(), "job-failed");
        assert_eq!(performed().kind(), EventKind::JobPerformed);
    }
}
