//! Queue ports: pluggable FIFO sources of job descriptors.
//!
//! The worker only ever sees the [`Queue`] trait. [`StoreQueue`] is the
//! standard implementation, a named list on a [`Store`] using `rpush` to
//! enqueue and `lpop` to reserve, which preserves FIFO order per queue.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;

use crate::job::{JobDescriptor, JobError};
use crate::store::{Store, StoreError};

/// Errors from queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A payload could not be encoded or decoded.
    #[error(transparent)]
    Job(#[from] JobError),
}

/// A FIFO source and sink of job descriptors.
///
/// `pop` may block for a bounded interval or return immediately when empty;
/// the worker treats both the same. Ordering within one queue is FIFO with
/// respect to successful `push` calls; ordering across queues is the
/// worker's iteration order.
pub trait Queue: Send {
    /// Stable queue name, used in worker identity and log context.
    fn name(&self) -> &str;

    /// Remove and return the next ready descriptor, or `None` when empty.
    ///
    /// Implementations stamp the descriptor's origin queue before returning
    /// it.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] when the backing source fails or holds a
    /// payload that is not a descriptor.
    fn pop(&self) -> Result<Option<JobDescriptor>, QueueError>;

    /// Append a descriptor to the tail of the queue.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] when the descriptor cannot be encoded or the
    /// backing sink fails.
    fn push(&self, job: &JobDescriptor) -> Result<(), QueueError>;

    /// Number of descriptors currently queued.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] when the backing source fails.
    fn size(&self) -> Result<usize, QueueError>;
}

/// A named queue stored as a list under `queue:<name>` on a [`Store`].
#[derive(Clone)]
pub struct StoreQueue {
    name: String,
    key: String,
    store: Arc<dyn Store>,
}

impl StoreQueue {
    /// Create a handle to the queue called `name` on `store`.
    #[must_use]
    pub fn new(name: impl Into<String>, store: Arc<dyn Store>) -> Self {
        let name = name.into();
        let key = format!("queue:{name}");
        Self { name, key, store }
    }
}

impl std::fmt::Debug for StoreQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreQueue").field("name", &self.name).finish()
    }
}

impl Queue for StoreQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn pop(&self) -> Result<Option<JobDescriptor>, QueueError> {
        let Some(payload) = self.store.lpop(&self.key)? else {
            return Ok(None);
        };
        let mut job = JobDescriptor::decode(&payload)?;
        job.set_origin_queue(&self.name);
        Ok(Some(job))
    }

    fn push(&self, job: &JobDescriptor) -> Result<(), QueueError> {
        self.store.rpush(&self.key, &job.encode()?)?;
        Ok(())
    }

    fn size(&self) -> Result<usize, QueueError> {
        Ok(self.store.llen(&self.key)?)
    }
}

/// Producer helper: build a descriptor for `class` with `args`, stamp its
/// enqueue time, and push it onto `queue`.
///
/// Returns the pushed descriptor so callers can keep its id.
///
/// # Errors
///
/// Returns [`QueueError`] when the push fails.
pub fn enqueue(
    queue: &dyn Queue,
    class: impl Into<String>,
    args: Vec<Value>,
) -> Result<JobDescriptor, QueueError> {
    let mut job = JobDescriptor::new(class, args);
    job.set_queue_time(epoch_seconds());
    queue.push(&job)?;
    Ok(job)
}

#[allow(clippy::cast_precision_loss)]
fn epoch_seconds() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::MemoryStore;

    fn store() -> Arc<dyn Store> {
        Arc::new(MemoryStore::new())
    }

    #[test]
    fn test_push_pop_is_fifo() {
        let queue = StoreQueue::new("default", store());
        queue
            .push(&JobDescriptor::with_id("First", vec![], "1"))
            .unwrap();
        queue
            .push(&JobDescriptor::with_id("Second", vec![], "2"))
            .unwrap();

        assert_eq!(queue.size().unwrap(), 2);
        assert_eq!(queue.pop().unwrap().unwrap().class(), "First");
        assert_eq!(queue.pop().unwrap().unwrap().class(), "Second");
        assert!(queue.pop().unwrap().is_none());
    }

    #[test]
    fn test_pop_stamps_origin_queue() {
        let queue = StoreQueue::new("critical", store());
        queue
            .push(&JobDescriptor::new("J", vec![json!(1)]))
            .unwrap();
        let job = queue.pop().unwrap().unwrap();
        assert_eq!(job.origin_queue(), Some("critical"));
    }

    #[test]
    fn test_pop_round_trips_payload() {
        let queue = StoreQueue::new("default", store());
        let pushed = JobDescriptor::with_id("EchoJob", vec![json!({"msg": "hi"})], "abc");
        queue.push(&pushed).unwrap();

        let popped = queue.pop().unwrap().unwrap();
        assert_eq!(popped, pushed);
        assert_eq!(popped.args(), pushed.args());
    }

    #[test]
    fn test_enqueue_stamps_queue_time() {
        let queue = StoreQueue::new("default", store());
        let job = enqueue(&queue, "J", vec![]).unwrap();
        assert!(job.queue_time().is_some());

        let popped = queue.pop().unwrap().unwrap();
        assert_eq!(popped.queue_time(), job.queue_time());
        assert_eq!(popped, job);
    }

    #[test]
    fn test_pop_rejects_foreign_payloads() {
        let shared = store();
        shared.rpush("queue:bad", "not a job").unwrap();
        let queue = StoreQueue::new("bad", shared);
        assert!(matches!(queue.pop(), Err(QueueError::Job(_))));
    }
}
