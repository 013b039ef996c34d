//! # forq-core
//!
//! Worker execution core for a Redis-style background job system.
//!
//! Producers enqueue JSON job descriptors onto named queues; a long-running
//! [`Worker`] reserves descriptors in queue order, executes each job inline
//! or in a forked child, and records success or failure so operators can
//! observe, retry, or discard failed work.
//!
//! ## Features
//!
//! - **Reservation loop**: ordered queue polling with pause, graceful and
//!   forced shutdown driven by OS signals
//! - **Fork-per-job isolation**: leaks and corruption in job code die with
//!   the child; non-POSIX platforms degrade to inline execution
//! - **Failure records**: append-only log of failed jobs with exception,
//!   message, backtrace, worker, and queue
//! - **Lifecycle events**: synchronous fan-out to registered subscribers
//! - **Pluggable state**: every external surface (store, queue, failure
//!   sink, stats sink, job factory) is a small capability trait
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use forq_core::factory::{JobRegistry, Perform, PerformError};
//! use forq_core::queue::{StoreQueue, enqueue};
//! use forq_core::{MemoryStore, Worker};
//!
//! struct Greet;
//!
//! impl Perform for Greet {
//!     fn perform(&self) -> Result<(), PerformError> {
//!         println!("hello");
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(MemoryStore::new());
//!     let mut registry = JobRegistry::new();
//!     registry.register("Greet", |_args| Ok(Box::new(Greet) as Box<dyn Perform>));
//!
//!     enqueue(&StoreQueue::new("default", store.clone()), "Greet", vec![])?;
//!
//!     let mut worker = Worker::builder(store)
//!         .queue("default")
//!         .factory(registry)
//!         .build();
//!     worker.work()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod events;
pub mod factory;
pub mod failure;
pub mod foreman;
pub mod job;
pub mod queue;
pub mod signals;
pub mod stats;
pub mod store;
pub mod worker;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::WorkerConfig;
    pub use crate::error::WorkError;
    pub use crate::events::{EventBus, EventKind, Subscriber, WorkerEvent};
    pub use crate::factory::{JobFactory, JobRegistry, Perform, PerformError};
    pub use crate::failure::{FailureSink, NullFailureSink, StoreFailureSink};
    pub use crate::job::{JobDescriptor, JobState};
    pub use crate::queue::{Queue, StoreQueue, enqueue};
    pub use crate::signals::SignalFlags;
    pub use crate::stats::{StatsSink, StoreStats};
    pub use crate::store::{MemoryStore, Store};
    pub use crate::worker::{Worker, WorkerBuilder};
}

/// Re-export commonly used types at the crate root.
pub use config::WorkerConfig;
pub use job::JobDescriptor;
pub use store::MemoryStore;
pub use worker::{Worker, WorkerBuilder};
