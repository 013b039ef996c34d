//! External state store capability.
//!
//! The worker core never talks to a concrete Redis client. Everything it
//! needs from shared external state is expressed as the [`Store`] trait: a
//! handful of string-keyed operations plus the list operations the queue and
//! failure log are built on. Production deployments implement this over a
//! Redis connection; [`MemoryStore`] is the in-process implementation used
//! for tests and embedding.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

/// Errors from store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The backend failed to carry out the operation.
    #[error("store backend error: {detail}")]
    Backend {
        /// Detail about the failure.
        detail: String,
    },

    /// A string operation hit a list key, or vice versa.
    #[error("key {key} holds the wrong kind of value")]
    WrongKind {
        /// Offending key.
        key: String,
    },
}

/// Shared external state the worker publishes to and consumes from.
///
/// Keys are flat strings. List operations treat the head as the newest
/// element for `lpush` and the oldest for `lpop`, matching the Redis list
/// commands they are named after.
pub trait Store: Send + Sync {
    /// Set `key` to `value`, overwriting any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] when the backend fails.
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Fetch the value at `key`, or `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WrongKind`] when `key` holds a list.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Delete `key`. Deleting an absent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] when the backend fails.
    fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Whether `key` exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] when the backend fails.
    fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Push `value` onto the head of `list`, creating it if absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WrongKind`] when `list` holds a plain value.
    fn lpush(&self, list: &str, value: &str) -> Result<(), StoreError>;

    /// Push `value` onto the tail of `list`, creating it if absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WrongKind`] when `list` holds a plain value.
    fn rpush(&self, list: &str, value: &str) -> Result<(), StoreError>;

    /// Remove and return the head of `list`, or `None` when empty or absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WrongKind`] when `list` holds a plain value.
    fn lpop(&self, list: &str) -> Result<Option<String>, StoreError>;

    /// Return the element at `index` (0 is the head) without removing it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WrongKind`] when `list` holds a plain value.
    fn lindex(&self, list: &str, index: usize) -> Result<Option<String>, StoreError>;

    /// Number of elements in `list` (0 when absent).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WrongKind`] when `list` holds a plain value.
    fn llen(&self, list: &str) -> Result<usize, StoreError>;

    /// Drop any live connection state.
    ///
    /// The worker calls this immediately before forking so the child never
    /// inherits a socket the parent still considers its own; both sides
    /// reconnect lazily on their next operation. Stores without connection
    /// state keep the default no-op.
    fn disconnect(&self) {}
}

enum Entry {
    Value(String),
    List(VecDeque<String>),
}

/// In-process [`Store`] backed by a mutex-guarded map.
///
/// Cloning yields a handle onto the same underlying state, so a producer,
/// a worker, and a test assertion can all share one store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Backend {
            detail: "memory store mutex poisoned".to_string(),
        })
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys = self.lock().map(|map| map.len()).unwrap_or(0);
        f.debug_struct("MemoryStore").field("keys", &keys).finish()
    }
}

impl Store for MemoryStore {
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut map = self.lock()?;
        map.insert(key.to_string(), Entry::Value(value.to_string()));
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let map = self.lock()?;
        match map.get(key) {
            None => Ok(None),
            Some(Entry::Value(value)) => Ok(Some(value.clone())),
            Some(Entry::List(_)) => Err(StoreError::WrongKind {
                key: key.to_string(),
            }),
        }
    }

    fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut map = self.lock()?;
        map.remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let map = self.lock()?;
        Ok(map.contains_key(key))
    }

    fn lpush(&self, list: &str, value: &str) -> Result<(), StoreError> {
        let mut map = self.lock()?;
        match map
            .entry(list.to_string())
            .or_insert_with(|| Entry::List(VecDeque::new()))
        {
            Entry::List(items) => {
                items.push_front(value.to_string());
                Ok(())
            },
            Entry::Value(_) => Err(StoreError::WrongKind {
                key: list.to_string(),
            }),
        }
    }

    fn rpush(&self, list: &str, value: &str) -> Result<(), StoreError> {
        let mut map = self.lock()?;
        match map
            .entry(list.to_string())
            .or_insert_with(|| Entry::List(VecDeque::new()))
        {
            Entry::List(items) => {
                items.push_back(value.to_string());
                Ok(())
            },
            Entry::Value(_) => Err(StoreError::WrongKind {
                key: list.to_string(),
            }),
        }
    }

    fn lpop(&self, list: &str) -> Result<Option<String>, StoreError> {
        let mut map = self.lock()?;
        let popped = match map.get_mut(list) {
            None => return Ok(None),
            Some(Entry::List(items)) => items.pop_front(),
            Some(Entry::Value(_)) => {
                return Err(StoreError::WrongKind {
                    key: list.to_string(),
                });
            },
        };
        // Redis removes a list key once its last element is popped.
        if matches!(map.get(list), Some(Entry::List(items)) if items.is_empty()) {
            map.remove(list);
        }
        Ok(popped)
    }

    fn lindex(&self, list: &str, index: usize) -> Result<Option<String>, StoreError> {
        let map = self.lock()?;
        match map.get(list) {
            None => Ok(None),
            Some(Entry::List(items)) => Ok(items.get(index).cloned()),
            Some(Entry::Value(_)) => Err(StoreError::WrongKind {
                key: list.to_string(),
            }),
        }
    }

    fn llen(&self, list: &str) -> Result<usize, StoreError> {
        let map = self.lock()?;
        match map.get(list) {
            None => Ok(0),
            Some(Entry::List(items)) => Ok(items.len()),
            Some(Entry::Value(_)) => Err(StoreError::WrongKind {
                key: list.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_del_exists() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").unwrap(), None);
        assert!(!store.exists("k").unwrap());

        store.set("k", "v").unwrap();
        assert_eq!(store.get("k").unwrap(), Some("v".to_string()));
        assert!(store.exists("k").unwrap());

        store.set("k", "w").unwrap();
        assert_eq!(store.get("k").unwrap(), Some("w".to_string()));

        store.del("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
        // Deleting an absent key is fine.
        store.del("k").unwrap();
    }

    #[test]
    fn test_list_push_pop_fifo() {
        let store = MemoryStore::new();
        store.rpush("l", "a").unwrap();
        store.rpush("l", "b").unwrap();
        assert_eq!(store.llen("l").unwrap(), 2);
        assert_eq!(store.lpop("l").unwrap(), Some("a".to_string()));
        assert_eq!(store.lpop("l").unwrap(), Some("b".to_string()));
        assert_eq!(store.lpop("l").unwrap(), None);
    }

    #[test]
    fn test_lpush_newest_at_head() {
        let store = MemoryStore::new();
        store.lpush("l", "old").unwrap();
        store.lpush("l", "new").unwrap();
        assert_eq!(store.lindex("l", 0).unwrap(), Some("new".to_string()));
        assert_eq!(store.lindex("l", 1).unwrap(), Some("old".to_string()));
        assert_eq!(store.lindex("l", 2).unwrap(), None);
    }

    #[test]
    fn test_empty_list_key_is_removed() {
        let store = MemoryStore::new();
        store.rpush("l", "only").unwrap();
        assert!(store.exists("l").unwrap());
        store.lpop("l").unwrap();
        assert!(!store.exists("l").unwrap());
    }

    #[test]
    fn test_wrong_kind_is_rejected() {
        let store = MemoryStore::new();
        store.set("s", "v").unwrap();
        assert!(matches!(
            store.lpush("s", "x"),
            Err(StoreError::WrongKind { .. })
        ));
        store.rpush("l", "x").unwrap();
        assert!(matches!(store.get("l"), Err(StoreError::WrongKind { .. })));
    }

    #[test]
    fn test_clones_share_state() {
        let store = MemoryStore::new();
        let other = store.clone();
        store.set("k", "v").unwrap();
        assert_eq!(other.get("k").unwrap(), Some("v".to_string()));
    }
}
