//! Failure sinks: append-only stores of failure records.
//!
//! Every job that errors, whatever the cause, becomes one [`FailureRecord`]
//! appended to a sink. Records are never deduplicated; repeated failures
//! append repeated records. [`StoreFailureSink`] keeps the log as a list on
//! a [`Store`] with the newest record at the head; [`NullFailureSink`]
//! discards everything and is what the worker uses when nothing better is
//! supplied.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::WorkError;
use crate::job::JobDescriptor;
use crate::store::{Store, StoreError};

/// Key of the failure log list.
const FAILURE_LIST_KEY: &str = "failed";

/// Errors from failure-sink operations.
#[derive(Debug, Error)]
pub enum FailureError {
    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A record could not be encoded or decoded.
    #[error("failure record is not valid JSON: {detail}")]
    Codec {
        /// Detail about the failure.
        detail: String,
    },

    /// No record exists at the requested index.
    #[error("no failure record at index {index}")]
    MissingRecord {
        /// Requested index.
        index: usize,
    },

    /// The record has no origin queue to requeue onto.
    #[error("failure record at index {index} has no origin queue")]
    MissingQueue {
        /// Index of the unqueueable record.
        index: usize,
    },
}

/// One recorded failure, in the wire format persisted to the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Wall-clock timestamp of the failure.
    pub failed_at: String,

    /// The failed descriptor, as a wire-format object.
    pub payload: serde_json::Value,

    /// Stable exception name, e.g. `"dirty-exit"`.
    pub exception: String,

    /// Human-readable error message.
    pub error: String,

    /// Backtrace frames, outermost first, possibly empty.
    pub backtrace: Vec<String>,

    /// Identity of the worker that observed the failure.
    pub worker: String,

    /// Origin queue name, empty when unknown.
    pub queue: String,
}

/// Append-only store of failure records.
pub trait FailureSink: Send {
    /// Persist one failure record for `job`.
    ///
    /// # Errors
    ///
    /// Returns [`FailureError`] when the record cannot be persisted. The
    /// worker logs and swallows such errors; the loop keeps running.
    fn save(
        &self,
        job: &JobDescriptor,
        error: &WorkError,
        queue: Option<&str>,
        worker: &str,
    ) -> Result<(), FailureError>;

    /// Total recorded failures.
    ///
    /// # Errors
    ///
    /// Returns [`FailureError`] when the backing store fails.
    fn count(&self) -> Result<usize, FailureError>;

    /// Remove all recorded failures.
    ///
    /// # Errors
    ///
    /// Returns [`FailureError`] when the backing store fails.
    fn clear(&self) -> Result<(), FailureError>;

    /// Decode up to `limit` records starting at `offset` (0 is the newest).
    ///
    /// # Errors
    ///
    /// Returns [`FailureError`] when a stored record cannot be decoded.
    fn all(&self, offset: usize, limit: usize) -> Result<Vec<FailureRecord>, FailureError>;

    /// Push the failed payload at `index` back onto its origin queue.
    ///
    /// The record itself stays in the log.
    ///
    /// # Errors
    ///
    /// Returns [`FailureError::MissingRecord`] when `index` is out of range
    /// and [`FailureError::MissingQueue`] when the record carries no origin
    /// queue.
    fn requeue(&self, index: usize) -> Result<(), FailureError>;
}

/// Failure log on a [`Store`] list, newest record at the head.
#[derive(Clone)]
pub struct StoreFailureSink {
    store: Arc<dyn Store>,
}

impl StoreFailureSink {
    /// Create a sink writing to the failure log on `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn record_at(&self, index: usize) -> Result<Option<FailureRecord>, FailureError> {
        let Some(payload) = self.store.lindex(FAILURE_LIST_KEY, index)? else {
            return Ok(None);
        };
        let record = serde_json::from_str(&payload).map_err(|err| FailureError::Codec {
            detail: err.to_string(),
        })?;
        Ok(Some(record))
    }
}

impl std::fmt::Debug for StoreFailureSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreFailureSink").finish_non_exhaustive()
    }
}

impl FailureSink for StoreFailureSink {
    fn save(
        &self,
        job: &JobDescriptor,
        error: &WorkError,
        queue: Option<&str>,
        worker: &str,
    ) -> Result<(), FailureError> {
        let payload = job.to_wire_value().map_err(|err| FailureError::Codec {
            detail: err.to_string(),
        })?;
        let record = FailureRecord {
            failed_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            payload,
            exception: error.exception().to_string(),
            error: error.message(),
            backtrace: error.backtrace_frames().to_vec(),
            worker: worker.to_string(),
            queue: queue.unwrap_or_default().to_string(),
        };
        let encoded = serde_json::to_string(&record).map_err(|err| FailureError::Codec {
            detail: err.to_string(),
        })?;
        self.store.lpush(FAILURE_LIST_KEY, &encoded)?;
        Ok(())
    }

    fn count(&self) -> Result<usize, FailureError> {
        Ok(self.store.llen(FAILURE_LIST_KEY)?)
    }

    fn clear(&self) -> Result<(), FailureError> {
        self.store.del(FAILURE_LIST_KEY)?;
        Ok(())
    }

    fn all(&self, offset: usize, limit: usize) -> Result<Vec<FailureRecord>, FailureError> {
        let mut records = Vec::new();
        for index in offset..offset.saturating_add(limit) {
            match self.record_at(index)? {
                Some(record) => records.push(record),
                None => break,
            }
        }
        Ok(records)
    }

    fn requeue(&self, index: usize) -> Result<(), FailureError> {
        let record = self
            .record_at(index)?
            .ok_or(FailureError::MissingRecord { index })?;
        if record.queue.is_empty() {
            return Err(FailureError::MissingQueue { index });
        }
        let payload =
            serde_json::to_string(&record.payload).map_err(|err| FailureError::Codec {
                detail: err.to_string(),
            })?;
        self.store
            .rpush(&format!("queue:{}", record.queue), &payload)?;
        Ok(())
    }
}

/// A sink that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullFailureSink;

impl FailureSink for NullFailureSink {
    fn save(
        &self,
        _job: &JobDescriptor,
        _error: &WorkError,
        _queue: Option<&str>,
        _worker: &str,
    ) -> Result<(), FailureError> {
        Ok(())
    }

    fn count(&self) -> Result<usize, FailureError> {
        Ok(0)
    }

    fn clear(&self) -> Result<(), FailureError> {
        Ok(())
    }

    fn all(&self, _offset: usize, _limit: usize) -> Result<Vec<FailureRecord>, FailureError> {
        Ok(Vec::new())
    }

    fn requeue(&self, index: usize) -> Result<(), FailureError> {
        Err(FailureError::MissingRecord { index })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::factory::PerformError;
    use crate::store::MemoryStore;

    fn failed_job(id: &str) -> JobDescriptor {
        let mut job = JobDescriptor::with_id("EchoJob", vec![json!({"msg": "hi"})], id);
        job.set_origin_queue("default");
        job
    }

    fn boom() -> WorkError {
        WorkError::Perform(PerformError::new("RuntimeError", "boom"))
    }

    #[test]
    fn test_save_appends_and_newest_is_at_head() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let sink = StoreFailureSink::new(Arc::clone(&store));

        sink.save(&failed_job("a"), &boom(), Some("default"), "w1")
            .unwrap();
        sink.save(&failed_job("b"), &boom(), Some("default"), "w1")
            .unwrap();

        assert_eq!(sink.count().unwrap(), 2);
        let head: FailureRecord =
            serde_json::from_str(&store.lindex("failed", 0).unwrap().unwrap()).unwrap();
        assert_eq!(head.payload["id"], json!("b"));
    }

    #[test]
    fn test_record_fields() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let sink = StoreFailureSink::new(store);

        sink.save(&failed_job("a"), &boom(), Some("default"), "host:1:default")
            .unwrap();

        let record = &sink.all(0, 1).unwrap()[0];
        assert_eq!(record.exception, "RuntimeError");
        assert_eq!(record.error, "boom");
        assert_eq!(record.worker, "host:1:default");
        assert_eq!(record.queue, "default");
        assert!(record.backtrace.is_empty());
        assert!(!record.failed_at.is_empty());
        assert_eq!(record.payload["class"], json!("EchoJob"));
    }

    #[test]
    fn test_missing_queue_is_recorded_as_empty() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let sink = StoreFailureSink::new(store);
        let job = JobDescriptor::with_id("J", vec![], "a");

        sink.save(&job, &boom(), None, "w1").unwrap();
        assert_eq!(sink.all(0, 1).unwrap()[0].queue, "");
    }

    #[test]
    fn test_clear_empties_the_log() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let sink = StoreFailureSink::new(store);

        sink.save(&failed_job("a"), &boom(), Some("default"), "w1")
            .unwrap();
        sink.clear().unwrap();
        assert_eq!(sink.count().unwrap(), 0);
        assert!(sink.all(0, 10).unwrap().is_empty());
    }

    #[test]
    fn test_all_paginates() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let sink = StoreFailureSink::new(store);
        for id in ["a", "b", "c"] {
            sink.save(&failed_job(id), &boom(), Some("default"), "w1")
                .unwrap();
        }

        // Newest first: c, b, a.
        let page = sink.all(1, 2).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].payload["id"], json!("b"));
        assert_eq!(page[1].payload["id"], json!("a"));
    }

    #[test]
    fn test_requeue_pushes_payload_back() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let sink = StoreFailureSink::new(Arc::clone(&store));
        sink.save(&failed_job("a"), &boom(), Some("default"), "w1")
            .unwrap();

        sink.requeue(0).unwrap();

        let queued = store.lpop("queue:default").unwrap().unwrap();
        let job = JobDescriptor::decode(&queued).unwrap();
        assert_eq!(job.id(), "a");
        // The record stays in the log.
        assert_eq!(sink.count().unwrap(), 1);
    }

    #[test]
    fn test_requeue_out_of_range() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let sink = StoreFailureSink::new(store);
        assert!(matches!(
            sink.requeue(0),
            Err(FailureError::MissingRecord { index: 0 })
        ));
    }

    #[test]
    fn test_null_sink_discards_everything() {
        let sink = NullFailureSink;
        sink.save(&failed_job("a"), &boom(), Some("default"), "w1")
            .unwrap();
        assert_eq!(sink.count().unwrap(), 0);
        assert!(sink.all(0, 10).unwrap().is_empty());
    }
}
