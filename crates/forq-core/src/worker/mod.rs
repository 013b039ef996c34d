//! The worker: reservation loop, fork/reap orchestration, signal-driven
//! state, and current-job bookkeeping.
//!
//! A [`Worker`] polls an ordered list of queues. When a descriptor turns
//! up it becomes the current job, is published to the store under
//! `worker:<identity>`, and is executed either inline or in a forked child.
//! The parent reaps the child and turns a non-zero exit status into a
//! `dirty-exit` failure. Signals flip flags that the loop observes at the
//! top of each iteration and while waiting on a child; see
//! [`crate::signals`] for the mapping.
//!
//! Exactly one worker may run per process: signal handlers and the fork
//! model are process-wide.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::config::WorkerConfig;
use crate::error::WorkError;
use crate::events::{EventBus, EventKind, Subscriber, WorkerEvent};
use crate::factory::{JobFactory, JobRegistry};
use crate::failure::{FailureSink, NullFailureSink};
use crate::foreman::{self, ChildOutcome, ForkError, Forked};
use crate::job::{JobDescriptor, JobError, JobState};
use crate::queue::{Queue, StoreQueue};
use crate::signals::{self, SignalError, SignalFlags};
use crate::stats::{StatsSink, StoreStats};
use crate::store::Store;

/// How often the parent polls a running child between flag checks.
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Errors that can abort the work loop before it starts.
///
/// Once the loop is running, execution errors are recorded and swallowed;
/// only startup problems surface here.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Signal handlers could not be registered.
    #[error(transparent)]
    Signal(#[from] SignalError),
}

/// The externally visible marker stating which job a worker is processing.
///
/// Stored as JSON under `worker:<identity>` for exactly as long as the
/// worker has a current job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentJobRecord {
    /// Origin queue of the running job, when known.
    pub queue: Option<String>,

    /// Wall-clock timestamp the job started running.
    pub run_at: String,

    /// The running descriptor, as a wire-format object.
    pub payload: serde_json::Value,
}

/// Shared handle onto the worker's process-title string.
///
/// Title mutation is best-effort and in-process only; the handle exists so
/// operators and tests can observe status without poking at platform argv.
#[derive(Debug, Clone, Default)]
pub struct Procline {
    title: Arc<Mutex<String>>,
}

impl Procline {
    /// The current title, e.g. `"forq-0.1.0: Paused"`.
    #[must_use]
    pub fn get(&self) -> String {
        self.title
            .lock()
            .map_or_else(|_| String::new(), |title| title.clone())
    }

    fn set(&self, title: String) {
        if let Ok(mut slot) = self.title.lock() {
            *slot = title;
        }
    }
}

/// Builder for [`Worker`].
pub struct WorkerBuilder {
    store: Arc<dyn Store>,
    queues: Vec<Box<dyn Queue>>,
    factory: Option<Box<dyn JobFactory>>,
    failures: Option<Box<dyn FailureSink>>,
    stats: Option<Box<dyn StatsSink>>,
    events: EventBus,
    flags: SignalFlags,
    fork: bool,
    interval: Duration,
}

impl WorkerBuilder {
    fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            queues: Vec::new(),
            factory: None,
            failures: None,
            stats: None,
            events: EventBus::new(),
            flags: SignalFlags::new(),
            fork: cfg!(unix),
            interval: Duration::from_secs(5),
        }
    }

    /// Apply queue names, interval, and fork flag from `config`.
    #[must_use]
    pub fn config(mut self, config: &WorkerConfig) -> Self {
        for name in &config.queues {
            self = self.queue(name.clone());
        }
        self.interval = config.interval;
        self.fork = config.fork;
        self
    }

    /// Add the store-backed queue called `name`.
    #[must_use]
    pub fn queue(self, name: impl Into<String>) -> Self {
        let store = Arc::clone(&self.store);
        self.add_queue(Box::new(StoreQueue::new(name.into(), store)))
    }

    /// Add a queue port. A queue with an already-registered name
    /// overwrites the earlier entry in place.
    #[must_use]
    pub fn add_queue(mut self, queue: Box<dyn Queue>) -> Self {
        if let Some(slot) = self
            .queues
            .iter_mut()
            .find(|existing| existing.name() == queue.name())
        {
            *slot = queue;
        } else {
            self.queues.push(queue);
        }
        self
    }

    /// Set the job factory. Defaults to an empty [`JobRegistry`], which
    /// fails every descriptor as `invalid-job`.
    #[must_use]
    pub fn factory(mut self, factory: impl JobFactory + 'static) -> Self {
        self.factory = Some(Box::new(factory));
        self
    }

    /// Set the failure sink. Defaults to [`NullFailureSink`].
    #[must_use]
    pub fn failures(mut self, failures: impl FailureSink + 'static) -> Self {
        self.failures = Some(Box::new(failures));
        self
    }

    /// Set the stats sink. Defaults to [`StoreStats`] on the worker's
    /// store.
    #[must_use]
    pub fn stats(mut self, stats: impl StatsSink + 'static) -> Self {
        self.stats = Some(Box::new(stats));
        self
    }

    /// Replace the event bus wholesale.
    #[must_use]
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Register `subscriber` for events of `kind`.
    #[must_use]
    pub fn subscribe(mut self, kind: EventKind, subscriber: impl Subscriber + 'static) -> Self {
        self.events.subscribe(kind, subscriber);
        self
    }

    /// Register `subscriber` for every event kind.
    #[must_use]
    pub fn subscribe_all(mut self, subscriber: impl Subscriber + 'static) -> Self {
        self.events.subscribe_all(subscriber);
        self
    }

    /// Share a set of signal flags with the worker, e.g. to drive pause
    /// and shutdown programmatically.
    #[must_use]
    pub fn signal_flags(mut self, flags: SignalFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Whether to fork a child per job.
    #[must_use]
    pub fn fork(mut self, fork: bool) -> Self {
        self.fork = fork;
        self
    }

    /// Sleep between empty polls. Zero makes the loop single-shot.
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Build the worker.
    #[must_use]
    pub fn build(self) -> Worker {
        Worker {
            factory: self
                .factory
                .unwrap_or_else(|| Box::new(JobRegistry::new())),
            failures: self.failures.unwrap_or_else(|| Box::new(NullFailureSink)),
            stats: self
                .stats
                .unwrap_or_else(|| Box::new(StoreStats::new(Arc::clone(&self.store)))),
            store: self.store,
            queues: self.queues,
            events: self.events,
            flags: self.flags,
            fork: self.fork,
            interval: self.interval,
            current_job: None,
            child_pid: None,
            procline: Procline::default(),
            identity: OnceLock::new(),
        }
    }
}

/// A background job worker.
///
/// Built with [`Worker::builder`]; run with [`Worker::work`].
pub struct Worker {
    store: Arc<dyn Store>,
    queues: Vec<Box<dyn Queue>>,
    factory: Box<dyn JobFactory>,
    failures: Box<dyn FailureSink>,
    stats: Box<dyn StatsSink>,
    events: EventBus,
    flags: SignalFlags,
    fork: bool,
    interval: Duration,
    current_job: Option<JobDescriptor>,
    child_pid: Option<i32>,
    procline: Procline,
    identity: OnceLock<String>,
}

impl Worker {
    /// Start building a worker on `store`.
    #[must_use]
    pub fn builder(store: Arc<dyn Store>) -> WorkerBuilder {
        WorkerBuilder::new(store)
    }

    /// Worker identity: `<hostname>:<pid>:<comma-joined queue names>`.
    ///
    /// Derived on first request and stable for the worker's lifetime.
    pub fn identity(&self) -> &str {
        self.identity.get_or_init(|| {
            format!(
                "{}:{}:{}",
                hostname(),
                std::process::id(),
                self.queue_names().join(",")
            )
        })
    }

    /// Names of the polled queues, in polling order.
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        self.queues
            .iter()
            .map(|queue| queue.name().to_string())
            .collect()
    }

    /// The descriptor currently being processed, if any.
    #[must_use]
    pub fn current_job(&self) -> Option<&JobDescriptor> {
        self.current_job.as_ref()
    }

    /// Process id of the currently forked child, if any.
    #[must_use]
    pub const fn child_pid(&self) -> Option<i32> {
        self.child_pid
    }

    /// Shared handle onto the worker's signal flags.
    #[must_use]
    pub fn signal_flags(&self) -> SignalFlags {
        self.flags.clone()
    }

    /// Shared handle onto the worker's process title.
    #[must_use]
    pub fn procline_handle(&self) -> Procline {
        self.procline.clone()
    }

    /// Run the reservation loop until shutdown.
    ///
    /// With a non-zero interval the loop runs until a shutdown is
    /// requested, sleeping between empty polls. With a zero interval the
    /// loop exits after the first poll that finds every queue empty, which
    /// makes single-shot synchronous runs possible.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Signal`] when signal handlers cannot be
    /// registered. Job execution errors never surface here; they are
    /// recorded through the failure sink and the loop continues.
    pub fn work(&mut self) -> Result<(), WorkerError> {
        self.set_procline("Starting");
        let _signal_guard = signals::install(&self.flags)?;
        self.register_started();
        self.events.dispatch(&WorkerEvent::WorkerStartup {
            worker: self.identity().to_string(),
        });
        info!(worker = self.identity(), "worker started");

        loop {
            if self.flags.shutdown_requested() {
                break;
            }
            // No child is live at the top of the loop; a kill aimed at an
            // earlier child must not carry over to the next one.
            self.flags.clear_kill_child();

            if self.flags.paused() {
                self.set_procline("Paused");
                std::thread::sleep(self.interval);
                continue;
            }

            if let Some(job) = self.reserve() {
                self.process(job);
            } else {
                if self.interval.is_zero() {
                    break;
                }
                self.set_procline(&format!("Waiting for {}", self.queue_names().join(",")));
                std::thread::sleep(self.interval);
            }
        }

        self.unregister();
        info!(worker = self.identity(), "worker stopped");
        Ok(())
    }

    /// Poll queues in order; the first non-empty pop wins.
    fn reserve(&self) -> Option<JobDescriptor> {
        for queue in &self.queues {
            match queue.pop() {
                Ok(Some(job)) => {
                    debug!(queue = queue.name(), job = %job, "reserved job");
                    return Some(job);
                },
                Ok(None) => {},
                Err(err) => {
                    warn!(queue = queue.name(), error = %err, "queue pop failed");
                },
            }
        }
        None
    }

    /// Run one reserved descriptor through execution and bookkeeping.
    fn process(&mut self, mut job: JobDescriptor) {
        advance(&mut job, JobState::Running);
        self.set_current_job(&job);
        self.set_procline(&format!(
            "Processing {} since {}",
            job.origin_queue().unwrap_or("unknown"),
            timestamp()
        ));

        match self.execute(&job) {
            Ok(()) => {
                advance(&mut job, JobState::Complete);
                self.record_success();
            },
            Err(err) => {
                advance(&mut job, JobState::Failed);
                self.handle_failure(&job, &err);
            },
        }

        self.clear_current_job();
    }

    fn execute(&mut self, job: &JobDescriptor) -> Result<(), WorkError> {
        if self.fork {
            self.execute_forked(job)
        } else {
            self.perform_job(job)
        }
    }

    /// Materialize and perform `job` in the calling process.
    fn perform_job(&self, job: &JobDescriptor) -> Result<(), WorkError> {
        let runnable = self.factory.create(job)?;
        self.events.dispatch(&WorkerEvent::JobBeforePerform {
            job: job.snapshot(),
        });
        runnable.perform()?;
        self.events.dispatch(&WorkerEvent::JobAfterPerform {
            job: job.snapshot(),
        });
        self.events.dispatch(&WorkerEvent::JobPerformed {
            job: job.snapshot(),
        });
        Ok(())
    }

    /// Fork, perform in the child, reap in the parent.
    fn execute_forked(&mut self, job: &JobDescriptor) -> Result<(), WorkError> {
        self.events.dispatch(&WorkerEvent::WorkerBeforeFork {
            job: job.snapshot(),
        });
        // The child must not inherit a connection the parent still owns;
        // both sides reconnect on their next operation.
        self.store.disconnect();

        match foreman::fork() {
            Err(ForkError::Unsupported) => {
                warn!("fork is not supported on this platform; running jobs inline");
                self.fork = false;
                self.perform_job(job)
            },
            Err(err) => {
                // A job that was promised isolation never runs inline; the
                // reservation is recorded as failed instead.
                warn!(error = %err, "fork failed");
                Err(WorkError::DirtyExit {
                    detail: err.to_string(),
                })
            },
            Ok(Forked::Child) => {
                self.events.dispatch(&WorkerEvent::WorkerAfterFork {
                    job: job.snapshot(),
                });
                let code = match self.perform_job(job) {
                    Ok(()) => 0,
                    Err(err) => {
                        error!(job = %job, error = %err, "job failed in forked child");
                        1
                    },
                };
                foreman::exit_child(code)
            },
            Ok(Forked::Parent { child_pid }) => {
                self.child_pid = Some(child_pid);
                self.set_procline(&format!("Forked {child_pid} at {}", timestamp()));
                let outcome = self.wait_for_child(child_pid);
                self.child_pid = None;
                if outcome.is_success() {
                    Ok(())
                } else {
                    Err(WorkError::DirtyExit {
                        detail: outcome.describe(child_pid),
                    })
                }
            },
        }
    }

    /// Reap `child_pid`, honouring kill-child and forced-shutdown flags
    /// while it runs.
    fn wait_for_child(&self, child_pid: i32) -> ChildOutcome {
        loop {
            if self.flags.take_kill_child() || self.flags.forced_shutdown() {
                info!(child = child_pid, "killing child");
                if let Err(err) = foreman::kill_child(child_pid) {
                    warn!(child = child_pid, error = %err, "failed to kill child");
                }
            }
            match foreman::try_wait_child(child_pid) {
                Ok(Some(outcome)) => return outcome,
                Ok(None) => std::thread::sleep(CHILD_POLL_INTERVAL),
                Err(err) => {
                    warn!(child = child_pid, error = %err, "failed to reap child");
                    return ChildOutcome::Signaled {
                        signal: "unknown (wait failed)".to_string(),
                    };
                },
            }
        }
    }

    /// Record a failed job. Never raises: sink and counter errors are
    /// logged and swallowed so the loop keeps running.
    fn handle_failure(&self, job: &JobDescriptor, err: &WorkError) {
        error!(
            job = %job,
            queue = job.origin_queue().unwrap_or_default(),
            exception = err.exception(),
            error = %err,
            "job failed"
        );
        let identity = self.identity().to_string();
        if let Err(sink_err) = self
            .failures
            .save(job, err, job.origin_queue(), &identity)
        {
            warn!(error = %sink_err, "failure sink rejected record");
        }
        for counter in ["failed".to_string(), format!("failed:{identity}")] {
            if let Err(stat_err) = self.stats.increment(&counter) {
                warn!(counter = %counter, error = %stat_err, "failed to increment counter");
            }
        }
        self.events.dispatch(&WorkerEvent::JobFailed {
            job: job.snapshot(),
            exception: err.exception().to_string(),
            error: err.message(),
            worker: identity,
        });
    }

    fn record_success(&self) {
        let identity = self.identity().to_string();
        for counter in ["processed".to_string(), format!("processed:{identity}")] {
            if let Err(err) = self.stats.increment(&counter) {
                warn!(counter = %counter, error = %err, "failed to increment counter");
            }
        }
    }

    /// Adopt `job` as the current job and publish its record.
    ///
    /// # Panics
    ///
    /// Panics when a current job is already set; the loop cannot recover
    /// from that and continuing would corrupt the bookkeeping.
    fn set_current_job(&mut self, job: &JobDescriptor) {
        assert!(
            self.current_job.is_none(),
            "programmer error: current job is already set while adopting {job}"
        );
        self.current_job = Some(job.snapshot());
        match current_job_payload(job) {
            Ok(payload) => {
                if let Err(err) = self.store.set(&self.current_job_key(), &payload) {
                    warn!(error = %err, "failed to publish current job");
                }
            },
            Err(err) => warn!(error = %err, "failed to encode current job"),
        }
    }

    /// Drop the current job and delete its record.
    fn clear_current_job(&mut self) {
        if self.current_job.take().is_some() {
            if let Err(err) = self.store.del(&self.current_job_key()) {
                warn!(error = %err, "failed to clear current job");
            }
        }
    }

    fn current_job_key(&self) -> String {
        format!("worker:{}", self.identity())
    }

    fn register_started(&self) {
        let key = format!("worker:{}:started", self.identity());
        if let Err(err) = self.store.set(&key, &timestamp()) {
            warn!(error = %err, "failed to record worker start");
        }
    }

    /// Remove this worker's marks from the store at loop exit.
    fn unregister(&mut self) {
        self.clear_current_job();
        let identity = self.identity().to_string();
        if let Err(err) = self.store.del(&format!("worker:{identity}:started")) {
            warn!(error = %err, "failed to clear worker start mark");
        }
        for counter in [format!("processed:{identity}"), format!("failed:{identity}")] {
            if let Err(err) = self.stats.clear(&counter) {
                warn!(counter = %counter, error = %err, "failed to clear counter");
            }
        }
    }

    fn set_procline(&self, status: &str) {
        let title = format!("forq-{}: {status}", env!("CARGO_PKG_VERSION"));
        trace!(procline = %title, "status");
        self.procline.set(title);
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("queues", &self.queue_names())
            .field("fork", &self.fork)
            .field("interval", &self.interval)
            .field("current_job", &self.current_job)
            .field("child_pid", &self.child_pid)
            .finish_non_exhaustive()
    }
}

/// Drive a descriptor through a statically valid transition.
fn advance(job: &mut JobDescriptor, next: JobState) {
    if let Err(err) = job.transition(next) {
        // Reserved descriptors always arrive in `waiting`; a violation
        // here is a bug in the loop, not a recoverable job failure.
        panic!("programmer error: {err}");
    }
}

fn current_job_payload(job: &JobDescriptor) -> Result<String, JobError> {
    let record = CurrentJobRecord {
        queue: job.origin_queue().map(ToString::to_string),
        run_at: timestamp(),
        payload: job.to_wire_value()?,
    };
    serde_json::to_string(&record).map_err(|err| JobError::Encode {
        detail: err.to_string(),
    })
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(unix)]
fn hostname() -> String {
    nix::unistd::gethostname().map_or_else(
        |_| "localhost".to_string(),
        |name| name.to_string_lossy().into_owned(),
    )
}

#[cfg(not(unix))]
fn hostname() -> String {
    "localhost".to_string()
}
