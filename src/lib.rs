//! # emberkv - An In-Memory Key-Value Server with Durable Embers
//!
//! emberkv is a small key-value server speaking a subset of the RESP
//! protocol over TCP. Every key carries a TTL enforced lazily on read,
//! and the keyspace is made durable by periodic gzip snapshots paired
//! with an append-only log of the mutations since the last snapshot.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            emberkv                               │
//! │                                                                  │
//! │  ┌────────────┐    ┌─────────────┐    ┌──────────────────┐       │
//! │  │ TCP Server │───>│ Connection  │───>│ CommandExecutor  │       │
//! │  │ (Listener) │    │  Handler    │    │ PING ECHO SET    │       │
//! │  └────────────┘    └─────────────┘    │ GET DEL          │       │
//! │                          │            └────────┬─────────┘       │
//! │                    ┌─────┴─────┐               │                 │
//! │                    │FrameParser│        ┌──────┴──────┐          │
//! │                    │  / Reply  │        ▼             ▼          │
//! │                    └───────────┘   ┌────────┐  ┌─────────────┐   │
//! │                                    │ Store  │  │  LogHandle  │   │
//! │                                    │ RwLock │  └──────┬──────┘   │
//! │                                    └────────┘         │          │
//! │                                        ▲              ▼          │
//! │                                        │    ┌───────────────────┐│
//! │                                        └────┤ PersistenceEngine ││
//! │                                   recovery  │ snapshot/ + aof/  ││
//! │                                             └───────────────────┘│
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Durability Model
//!
//! Mutating commands (SET, DEL) enqueue a log entry while the store's
//! write lock is held; a single persistence task appends entries to
//! the current AOF segment and flushes on a cadence. Every
//! `snapshot_interval` the task serializes the whole keyspace,
//! gzip-compresses it, writes it atomically, and rotates to a fresh
//! segment named after the snapshot. Recovery restores the newest
//! snapshot and replays exactly its paired segment.
//!
//! A `+OK` reply therefore precedes durability by up to the flush
//! interval; that is the deliberate trade.
//!
//! ## Module Overview
//!
//! - [`protocol`]: RESP frame parser and reply encoding
//! - [`storage`]: thread-safe keyspace with lazy TTL expiry
//! - [`commands`]: command dispatch and handlers
//! - [`persistence`]: snapshots, the append-only log, recovery
//! - [`connection`]: per-client read/execute/respond loop
//! - [`server`]: wiring, accept loop, graceful shutdown
//! - [`config`]: the four runtime knobs
//!
//! ## Quick Start
//!
//! ```ignore
//! use emberkv::{Config, Server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = Server::start(Config::from_env()).await?;
//!     server.serve(tokio::signal::ctrl_c()).await
//! }
//! ```

pub mod commands;
pub mod config;
pub mod connection;
pub mod persistence;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-export commonly used types for convenience
pub use commands::CommandExecutor;
pub use config::Config;
pub use persistence::{LogEntry, LogHandle, PersistenceEngine};
pub use protocol::{Frame, FrameError, FrameParser, Reply};
pub use server::Server;
pub use storage::{Store, StoreItem};

/// The default listen address (same port as Redis)
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:6379";

/// Version of emberkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
