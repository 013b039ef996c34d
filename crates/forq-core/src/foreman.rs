//! Process forking primitive.
//!
//! Forking gives each job a throwaway address space: leaks and stateful
//! corruption in user job code die with the child. The worker calls
//! [`fork`] once per job, the child performs and [`exit_child`]s, and the
//! parent reaps through [`try_wait_child`], killing through [`kill_child`]
//! when asked.
//!
//! On non-POSIX platforms [`fork`] fails with [`ForkError::Unsupported`]
//! and the worker degrades to inline execution.

use thiserror::Error;

/// Errors from process-control operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForkError {
    /// This platform cannot fork.
    #[error("fork is not supported on this platform")]
    Unsupported,

    /// The fork call itself failed.
    #[error("fork failed: {detail}")]
    Failed {
        /// Detail about the failure.
        detail: String,
    },

    /// Waiting on the child failed.
    #[error("waiting for child {pid} failed: {detail}")]
    Wait {
        /// Child process id.
        pid: i32,
        /// Detail about the failure.
        detail: String,
    },

    /// Killing the child failed.
    #[error("killing child {pid} failed: {detail}")]
    Kill {
        /// Child process id.
        pid: i32,
        /// Detail about the failure.
        detail: String,
    },
}

/// Which side of a successful fork the caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forked {
    /// The freshly forked child.
    Child,
    /// The parent, holding the child's process id.
    Parent {
        /// Process id of the forked child.
        child_pid: i32,
    },
}

/// How a reaped child terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildOutcome {
    /// The child exited with a status code.
    Exited {
        /// Exit status code.
        code: i32,
    },
    /// The child was terminated by a signal.
    Signaled {
        /// Name of the terminating signal.
        signal: String,
    },
}

impl ChildOutcome {
    /// Whether the child terminated cleanly.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Exited { code: 0 })
    }

    /// Human-readable account of how child `pid` died.
    #[must_use]
    pub fn describe(&self, pid: i32) -> String {
        match self {
            Self::Exited { code } => format!("child {pid} exited with exit code {code}"),
            Self::Signaled { signal } => format!("child {pid} was killed by signal {signal}"),
        }
    }
}

/// Split the current process in two.
///
/// Returns [`Forked::Child`] in the child and [`Forked::Parent`] in the
/// parent. The caller must be effectively single-threaded: forking a
/// process with live threads leaves mutexes locked forever in the child.
/// The worker satisfies this by construction, being single-threaded
/// between signal deliveries.
///
/// # Errors
///
/// Returns [`ForkError::Unsupported`] on non-POSIX platforms and
/// [`ForkError::Failed`] when the underlying call fails.
#[cfg(unix)]
pub fn fork() -> Result<Forked, ForkError> {
    use nix::unistd::ForkResult;

    // SAFETY: the work loop is single-threaded between signal deliveries
    // and the child only performs one job before _exit, so the usual
    // fork-with-threads hazards (held locks, inconsistent TLS) do not
    // apply. Shared external clients are disconnected by the caller
    // before this point.
    match unsafe { nix::unistd::fork() } {
        Ok(ForkResult::Child) => Ok(Forked::Child),
        Ok(ForkResult::Parent { child }) => Ok(Forked::Parent {
            child_pid: child.as_raw(),
        }),
        Err(err) => Err(ForkError::Failed {
            detail: err.to_string(),
        }),
    }
}

/// See the unix implementation; this platform cannot fork.
///
/// # Errors
///
/// Always returns [`ForkError::Unsupported`].
#[cfg(not(unix))]
pub fn fork() -> Result<Forked, ForkError> {
    Err(ForkError::Unsupported)
}

/// Reap child `pid` without blocking.
///
/// Returns `None` while the child is still running. Stop/continue
/// notifications are ignored; only termination is reported.
///
/// # Errors
///
/// Returns [`ForkError::Wait`] when the wait call fails.
#[cfg(unix)]
pub fn try_wait_child(pid: i32) -> Result<Option<ChildOutcome>, ForkError> {
    use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
    use nix::unistd::Pid;

    match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(_, code)) => Ok(Some(ChildOutcome::Exited { code })),
        Ok(WaitStatus::Signaled(_, signal, _)) => Ok(Some(ChildOutcome::Signaled {
            signal: signal.as_str().to_string(),
        })),
        Ok(_) => Ok(None),
        Err(err) => Err(ForkError::Wait {
            pid,
            detail: err.to_string(),
        }),
    }
}

/// See the unix implementation; this platform cannot fork.
///
/// # Errors
///
/// Always returns [`ForkError::Unsupported`].
#[cfg(not(unix))]
pub fn try_wait_child(_pid: i32) -> Result<Option<ChildOutcome>, ForkError> {
    Err(ForkError::Unsupported)
}

/// Send SIGKILL to child `pid`.
///
/// # Errors
///
/// Returns [`ForkError::Kill`] when the signal cannot be delivered.
#[cfg(unix)]
pub fn kill_child(pid: i32) -> Result<(), ForkError> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid), Signal::SIGKILL).map_err(|err| ForkError::Kill {
        pid,
        detail: err.to_string(),
    })
}

/// See the unix implementation; this platform cannot fork.
///
/// # Errors
///
/// Always returns [`ForkError::Unsupported`].
#[cfg(not(unix))]
pub fn kill_child(_pid: i32) -> Result<(), ForkError> {
    Err(ForkError::Unsupported)
}

/// Terminate a forked child immediately with `code`.
///
/// Skips atexit handlers and stdio flushing: the child shares the
/// parent's buffers and must not flush them twice.
#[cfg(unix)]
pub fn exit_child(code: i32) -> ! {
    // SAFETY: _exit terminates the process without touching any shared
    // state; it is async-signal-safe and has no preconditions.
    unsafe { nix::libc::_exit(code) }
}

/// See the unix implementation.
#[cfg(not(unix))]
pub fn exit_child(code: i32) -> ! {
    std::process::exit(code)
}
