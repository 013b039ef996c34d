//! Stats sinks: monotonic counters keyed by string.
//!
//! The worker counts processed and failed jobs, globally and per worker
//! identity. Counters live in external state so operators can read them
//! from anywhere; concurrency semantics are the backend's concern.

use std::sync::Arc;

use thiserror::Error;

use crate::store::{Store, StoreError};

/// Errors from stats operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatsError {
    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A stored counter did not parse as an integer.
    #[error("counter {key} holds a non-numeric value: {value}")]
    Corrupt {
        /// Counter key.
        key: String,
        /// Offending stored value.
        value: String,
    },
}

/// Monotonic counter store keyed by string.
pub trait StatsSink: Send {
    /// Add one to `key` and return the new value.
    ///
    /// # Errors
    ///
    /// Returns [`StatsError`] when the backend fails or holds a corrupt
    /// counter.
    fn increment(&self, key: &str) -> Result<u64, StatsError>;

    /// Subtract one from `key`, saturating at zero, and return the new
    /// value.
    ///
    /// # Errors
    ///
    /// Returns [`StatsError`] when the backend fails or holds a corrupt
    /// counter.
    fn decrement(&self, key: &str) -> Result<u64, StatsError>;

    /// Current value of `key` (0 when absent).
    ///
    /// # Errors
    ///
    /// Returns [`StatsError`] when the backend fails or holds a corrupt
    /// counter.
    fn get(&self, key: &str) -> Result<u64, StatsError>;

    /// Remove `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StatsError`] when the backend fails.
    fn clear(&self, key: &str) -> Result<(), StatsError>;
}

/// Counters stored under `stat:<key>` on a [`Store`].
#[derive(Clone)]
pub struct StoreStats {
    store: Arc<dyn Store>,
}

impl StoreStats {
    /// Create a stats sink on `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn read(&self, stat_key: &str) -> Result<u64, StatsError> {
        match self.store.get(stat_key)? {
            None => Ok(0),
            Some(value) => value.parse().map_err(|_| StatsError::Corrupt {
                key: stat_key.to_string(),
                value,
            }),
        }
    }

    fn write(&self, stat_key: &str, value: u64) -> Result<(), StatsError> {
        self.store.set(stat_key, &value.to_string())?;
        Ok(())
    }
}

impl std::fmt::Debug for StoreStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreStats").finish_non_exhaustive()
    }
}

fn stat_key(key: &str) -> String {
    format!("stat:{key}")
}

impl StatsSink for StoreStats {
    fn increment(&self, key: &str) -> Result<u64, StatsError> {
        let stat_key = stat_key(key);
        let next = self.read(&stat_key)?.saturating_add(1);
        self.write(&stat_key, next)?;
        Ok(next)
    }

    fn decrement(&self, key: &str) -> Result<u64, StatsError> {
        let stat_key = stat_key(key);
        let next = self.read(&stat_key)?.saturating_sub(1);
        self.write(&stat_key, next)?;
        Ok(next)
    }

    fn get(&self, key: &str) -> Result<u64, StatsError> {
        self.read(&stat_key(key))
    }

    fn clear(&self, key: &str) -> Result<(), StatsError> {
        self.store.del(&stat_key(key))?;
        Ok(())
    }
}
