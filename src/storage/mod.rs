//! Storage Module
//!
//! The in-memory keyspace for emberkv: a thread-safe map with per-key
//! TTL and lazy expiry. Expiry instants are wall-clock unix
//! milliseconds so the keyspace survives a snapshot/restore cycle with
//! its TTLs intact.
//!
//! ## Example
//!
//! ```
//! use emberkv::storage::{unix_millis, Store, StoreItem};
//! use bytes::Bytes;
//!
//! let store = Store::new();
//! store.set(
//!     Bytes::from("session"),
//!     StoreItem::new(Bytes::from("token123"), unix_millis() + 3_600_000),
//! );
//! assert!(store.get(b"session").is_some());
//! ```

pub mod store;

// Re-export commonly used types
pub use store::{unix_millis, Store, StoreItem};
