//! Operation Log Entries
//!
//! Every state-mutating command (SET, DEL) produces a [`LogEntry`]
//! that the persistence engine appends to the current AOF segment.
//! Entries are bincode-encoded records written back to back; recovery
//! decodes them sequentially and replays them through the command
//! executor.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// One mutating operation, as received from the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// `"SET"` or `"DEL"`.
    pub command: String,
    /// The original argument sequence, bytes intact.
    pub arguments: Vec<Bytes>,
    /// Unix milliseconds; zero until the engine stamps it at ingestion.
    pub timestamp_ms: u64,
}

impl LogEntry {
    /// An unstamped entry; the engine assigns the timestamp when it
    /// pulls the entry off the queue.
    pub fn new(command: impl Into<String>, arguments: Vec<Bytes>) -> Self {
        Self {
            command: command.into(),
            arguments,
            timestamp_ms: 0,
        }
    }
}

/// Cheap-to-clone sending side of the engine's entry queue.
///
/// Handlers call [`LogHandle::record`] while holding the store's write
/// lock; the send never blocks and never fails the command path.
#[derive(Debug, Clone)]
pub struct LogHandle {
    tx: mpsc::UnboundedSender<LogEntry>,
}

impl LogHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<LogEntry>) -> Self {
        Self { tx }
    }

    /// Enqueues an entry for the persistence task.
    ///
    /// If the engine has shut down the entry is dropped; command
    /// execution is never coupled to persistence health.
    pub fn record(&self, entry: LogEntry) {
        if self.tx.send(entry).is_err() {
            debug!("persistence engine gone, dropping log entry");
        }
    }
}
