//! Keyspace with TTL Support
//!
//! This module implements the in-memory keyspace for emberkv: a
//! thread-safe map from byte-string keys to values with an absolute
//! expiry instant.
//!
//! ## Design Decisions
//!
//! 1. **Single RwLock map**: all connection handlers share one map;
//!    reads take the shared lock, writes the exclusive one.
//! 2. **Lazy Expiry**: a key past its TTL is detected and removed on
//!    the next read of that key, not by a background sweeper.
//! 3. **Wall-clock expiry**: `expires_at_ms` is unix milliseconds, so
//!    a snapshot written before a restart still expires keys at the
//!    right moment afterwards.
//!
//! ## Concurrency Model
//!
//! GET observes either the pre-state or the post-state of a concurrent
//! SET on the same key, never torn state. Removing a stale entry
//! re-checks expiry under the exclusive lock, so an entry rewritten
//! with a fresh TTL between the read and the write lock is returned,
//! not deleted.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as unix milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A stored value and the instant it stops being valid.
///
/// Every item carries an expiry; callers that want "effectively never"
/// pass a far-future instant. Serialized as-is into snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreItem {
    /// The value, opaque bytes.
    pub value: Bytes,
    /// Absolute expiry, unix milliseconds.
    pub expires_at_ms: u64,
}

impl StoreItem {
    pub fn new(value: Bytes, expires_at_ms: u64) -> Self {
        Self {
            value,
            expires_at_ms,
        }
    }

    /// True once the wall clock has reached the expiry instant.
    #[inline]
    pub fn is_expired(&self) -> bool {
        unix_millis() >= self.expires_at_ms
    }
}

/// The in-memory keyspace.
///
/// Designed to be wrapped in an `Arc` and shared across all connection
/// handler tasks and the persistence engine. All operations are
/// thread-safe.
///
/// # Example
///
/// ```
/// use emberkv::storage::{unix_millis, Store, StoreItem};
/// use bytes::Bytes;
///
/// let store = Store::new();
/// store.set(
///     Bytes::from("name"),
///     StoreItem::new(Bytes::from("ember"), unix_millis() + 60_000),
/// );
/// assert_eq!(store.get(b"name"), Some(Bytes::from("ember")));
/// ```
#[derive(Debug, Default)]
pub struct Store {
    items: RwLock<HashMap<Bytes, StoreItem>>,
}

impl Store {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the value for `key` iff it exists and is unexpired.
    ///
    /// A stale entry is removed and `None` returned. The removal
    /// re-checks under the exclusive lock: if another task replaced
    /// the entry in the window between the two locks, the fresh value
    /// wins and is returned instead.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        {
            let items = self.items.read().unwrap();
            match items.get(key) {
                None => return None,
                Some(item) if !item.is_expired() => return Some(item.value.clone()),
                Some(_) => {}
            }
        }

        // Observed stale: take the exclusive lock and re-check before
        // removing, so a concurrent rewrite is not lost.
        let mut items = self.items.write().unwrap();
        match items.get(key) {
            Some(item) if item.is_expired() => {
                items.remove(key);
                None
            }
            Some(item) => Some(item.value.clone()),
            None => None,
        }
    }

    /// Inserts or replaces `key`, atomically with respect to readers.
    pub fn set(&self, key: Bytes, item: StoreItem) {
        self.set_with(key, item, || {});
    }

    /// Inserts or replaces `key`, running `hook` before the exclusive
    /// lock is released.
    ///
    /// The persistence layer uses the hook to enqueue its log entry,
    /// so entries reach the log in the same order the mutations commit
    /// to the map.
    pub fn set_with<F: FnOnce()>(&self, key: Bytes, item: StoreItem, hook: F) {
        let mut items = self.items.write().unwrap();
        items.insert(key, item);
        hook();
    }

    /// Removes `key`. Returns whether an entry was present.
    pub fn del(&self, key: &[u8]) -> bool {
        self.del_with(key, || {})
    }

    /// Removes `key`, running `hook` under the exclusive lock only
    /// when an entry was actually removed.
    pub fn del_with<F: FnOnce()>(&self, key: &[u8], hook: F) -> bool {
        let mut items = self.items.write().unwrap();
        if items.remove(key).is_some() {
            hook();
            true
        } else {
            false
        }
    }

    /// A point-in-time copy of the keyspace, taken under the shared
    /// lock. Writers are blocked only for the duration of the clone;
    /// serialization happens on the copy.
    pub fn snapshot(&self) -> HashMap<Bytes, StoreItem> {
        self.items.read().unwrap().clone()
    }

    /// Replaces the keyspace wholesale. Used by startup recovery.
    pub fn restore(&self, items: HashMap<Bytes, StoreItem>) {
        *self.items.write().unwrap() = items;
    }

    /// Number of entries, counting not-yet-collected expired ones.
    pub fn len(&self) -> usize {
        self.items.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
