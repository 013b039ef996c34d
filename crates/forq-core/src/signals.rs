//! Signal routing: OS signals become worker state flags.
//!
//! Handlers do the absolute minimum a signal handler is allowed to do:
//! store into an atomic and return. The work loop reads the flags at its
//! documented checkpoints. The mapping:
//!
//! | Signal | Effect |
//! |---|---|
//! | `TERM`, `INT` | forced shutdown (current child is killed) |
//! | `QUIT` | graceful shutdown (current job finishes) |
//! | `USR1` | kill the current child |
//! | `USR2` | pause |
//! | `CONT` | resume |
//!
//! Non-POSIX platforms skip registration; the flags still work when driven
//! programmatically.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

/// Errors from signal handler registration.
#[derive(Debug, Error)]
pub enum SignalError {
    /// A handler could not be registered.
    #[error("failed to register {signal} handler: {source}")]
    Register {
        /// Signal name.
        signal: &'static str,
        /// Underlying registration error.
        #[source]
        source: std::io::Error,
    },
}

/// Shared, signal-safe worker state flags.
///
/// Cloning yields a handle onto the same flags, so signal handlers, the
/// work loop, and tests all observe one state. The `request_*` methods are
/// the programmatic equivalents of signal delivery.
#[derive(Debug, Clone, Default)]
pub struct SignalFlags {
    shutdown: Arc<AtomicBool>,
    forced: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    kill_child: Arc<AtomicBool>,
}

impl SignalFlags {
    /// Create a fresh set of cleared flags.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a graceful shutdown: the current job finishes, then the
    /// loop exits.
    pub fn request_graceful_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Request a forced shutdown: any child is killed and the loop exits.
    pub fn request_forced_shutdown(&self) {
        self.forced.store(true, Ordering::SeqCst);
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Pause reservation; the loop idles until resumed.
    pub fn request_pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resume reservation after a pause.
    pub fn request_resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Ask the parent to SIGKILL the currently forked child.
    pub fn request_kill_child(&self) {
        self.kill_child.store(true, Ordering::SeqCst);
    }

    /// Whether any shutdown has been requested.
    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Whether the shutdown is forced.
    #[must_use]
    pub fn forced_shutdown(&self) -> bool {
        self.forced.load(Ordering::SeqCst)
    }

    /// Whether the worker is paused.
    #[must_use]
    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Whether a child kill is pending.
    #[must_use]
    pub fn kill_child_requested(&self) -> bool {
        self.kill_child.load(Ordering::SeqCst)
    }

    /// Consume a pending child-kill request.
    pub fn take_kill_child(&self) -> bool {
        self.kill_child.swap(false, Ordering::SeqCst)
    }

    /// Drop a stale child-kill request. The loop calls this while idle so
    /// a kill aimed at a finished child cannot hit the next one.
    pub fn clear_kill_child(&self) {
        self.kill_child.store(false, Ordering::SeqCst);
    }
}

/// Keeps registered handlers alive; unregisters them on drop.
#[derive(Debug, Default)]
pub struct SignalGuard {
    #[cfg(unix)]
    ids: Vec<signal_hook::SigId>,
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

/// Register OS signal handlers that route into `flags`.
///
/// The returned guard unregisters the handlers when dropped; hold it for
/// the lifetime of the work loop. Handlers only store into atomics and are
/// async-signal-safe.
///
/// # Errors
///
/// Returns [`SignalError::Register`] when a handler cannot be installed.
#[cfg(unix)]
pub fn install(flags: &SignalFlags) -> Result<SignalGuard, SignalError> {
    use signal_hook::consts::{SIGCONT, SIGINT, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2};
    use signal_hook::flag;

    let register = |signal: i32,
                    name: &'static str,
                    target: &Arc<AtomicBool>|
     -> Result<signal_hook::SigId, SignalError> {
        flag::register(signal, Arc::clone(target))
            .map_err(|source| SignalError::Register { signal: name, source })
    };

    let mut ids = vec![
        register(SIGTERM, "TERM", &flags.shutdown)?,
        register(SIGTERM, "TERM", &flags.forced)?,
        register(SIGINT, "INT", &flags.shutdown)?,
        register(SIGINT, "INT", &flags.forced)?,
        register(SIGQUIT, "QUIT", &flags.shutdown)?,
        register(SIGUSR1, "USR1", &flags.kill_child)?,
        register(SIGUSR2, "USR2", &flags.paused)?,
    ];

    let paused = Arc::clone(&flags.paused);
    // SAFETY: the handler closure performs a single atomic store, which is
    // async-signal-safe; it does not allocate, lock, or panic.
    let cont_id = unsafe {
        signal_hook::low_level::register(SIGCONT, move || {
            paused.store(false, Ordering::SeqCst);
        })
    }
    .map_err(|source| SignalError::Register {
        signal: "CONT",
        source,
    })?;
    ids.push(cont_id);

    Ok(SignalGuard { ids })
}

/// Non-POSIX platforms skip registration; the flags remain programmatic.
///
/// # Errors
///
/// Never fails on this platform.
#[cfg(not(unix))]
pub fn install(_flags: &SignalFlags) -> Result<SignalGuard, SignalError> {
    Ok(SignalGuard::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graceful_shutdown_is_not_forced() {
        let flags = SignalFlags::new();
        flags.request_graceful_shutdown();
        assert!(flags.shutdown_requested());
        assert!(!flags.forced_shutdown());
    }

    #[test]
    fn test_forced_shutdown_implies_shutdown() {
        let flags = SignalFlags::new();
        flags.request_forced_shutdown();
        assert!(flags.shutdown_requested());
        assert!(flags.forced_shutdown());
    }

    #[test]
    fn test_pause_resume() {
        let flags = SignalFlags::new();
        assert!(!flags.paused());
        flags.request_pause();
        assert!(flags.paused());
        flags.request_resume();
        assert!(!flags.paused());
    }

    #[test]
    fn test_kill_child_is_consumed_once() {
        let flags = SignalFlags::new();
        assert!(!flags.take_kill_child());
        flags.request_kill_child();
        assert!(flags.kill_child_requested());
        assert!(flags.take_kill_child());
        assert!(!flags.take_kill_child());
    }

    #[test]
    fn test_clear_drops_stale_kill_request() {
        let flags = SignalFlags::new();
        flags.request_kill_child();
        flags.clear_kill_child();
        assert!(!flags.kill_child_requested());
    }

    #[test]
    fn test_clones_share_state() {
        let flags = SignalFlags::new();
        let handle = flags.clone();
        handle.request_pause();
        assert!(flags.paused());
    }

    #[cfg(unix)]
    #[test]
    fn test_install_and_unregister() {
        let flags = SignalFlags::new();
        let guard = install(&flags).unwrap();
        drop(guard);
    }
}
