//! Command Execution
//!
//! This module dispatches decoded frames to their handlers and turns
//! the result into a reply. Five commands exist:
//!
//! - `PING [msg]` - liveness check, echoes `msg` when given
//! - `ECHO msg` - echoes `msg`
//! - `SET key value [PX ms | EX s]` - store a value with an expiry
//! - `GET key` - fetch a value, expiring it lazily
//! - `DEL key` - remove a key
//!
//! SET and DEL are the only commands recorded to the operation log,
//! and DEL only when a key was actually removed. The log entry is
//! enqueued while the store's write lock is held, so the log observes
//! mutations in commit order.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  FrameParser    │  (protocol module)
//! └────────┬────────┘
//!          │ Frame
//!          ▼
//! ┌─────────────────┐
//! │ CommandExecutor │  (this module)
//! │  - dispatch     │
//! │  - validate     │
//! │  - execute      │
//! └────────┬────────┘
//!          │                  ┌──────────────────┐
//!          ├─────────────────>│ LogHandle (queue) │
//!          ▼                  └──────────────────┘
//! ┌─────────────────┐
//! │     Store       │  (storage module)
//! └─────────────────┘
//! ```

use crate::persistence::{LogEntry, LogHandle};
use crate::protocol::{Frame, Reply};
use crate::storage::{unix_millis, Store, StoreItem};
use bytes::Bytes;
use std::sync::Arc;

/// Expiry applied when SET carries no PX/EX option: one hour.
const DEFAULT_TTL_MS: u64 = 60 * 60 * 1000;

/// Executes command frames against the store.
///
/// Cloned into every connection handler. Constructed without a journal
/// for recovery replay, where re-logging replayed operations would
/// duplicate the log.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    store: Arc<Store>,
    journal: Option<LogHandle>,
}

impl CommandExecutor {
    /// An executor with persistence logging disabled.
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            journal: None,
        }
    }

    /// An executor that records SET/DEL to the operation log.
    pub fn with_journal(store: Arc<Store>, journal: LogHandle) -> Self {
        Self {
            store,
            journal: Some(journal),
        }
    }

    /// Executes one frame and returns the reply to send.
    pub fn execute(&self, frame: Frame) -> Reply {
        match frame.name.as_str() {
            "PING" => self.cmd_ping(&frame.args),
            "ECHO" => self.cmd_echo(&frame.args),
            "SET" => self.cmd_set(&frame.args),
            "GET" => self.cmd_get(&frame.args),
            "DEL" => self.cmd_del(&frame.args),
            other => Reply::error(format!("unknown command '{}'", other)),
        }
    }

    /// PING [msg]
    fn cmd_ping(&self, args: &[Bytes]) -> Reply {
        match args.first() {
            Some(msg) => Reply::Simple(msg.clone()),
            None => Reply::pong(),
        }
    }

    /// ECHO msg
    fn cmd_echo(&self, args: &[Bytes]) -> Reply {
        match args.first() {
            Some(msg) => Reply::Simple(msg.clone()),
            None => Reply::error("no value provided to 'ECHO'"),
        }
    }

    /// SET key value [PX milliseconds | EX seconds]
    ///
    /// Options are walked in pairs; when PX/EX repeat, the last one
    /// wins. Without an option the key expires an hour from now.
    fn cmd_set(&self, args: &[Bytes]) -> Reply {
        if args.len() < 2 {
            return Reply::error("invalid syntax provided to 'SET'");
        }
        let key = args[0].clone();
        let value = args[1].clone();

        let mut expires_at_ms: Option<u64> = None;
        let mut position = 2;
        while position < args.len() {
            let raw = &args[position];
            // Lowercased for matching only; errors echo the original bytes.
            let option = String::from_utf8_lossy(raw).to_lowercase();
            match option.as_str() {
                "px" => {
                    if position + 1 >= args.len() {
                        return Reply::error("no time provided to 'PX'");
                    }
                    let millis = match parse_duration(&args[position + 1]) {
                        Some(ms) => ms,
                        None => return Reply::error("invalid format provided to 'PX'"),
                    };
                    expires_at_ms = Some(offset_from_now(millis));
                    position += 2;
                }
                "ex" => {
                    if position + 1 >= args.len() {
                        return Reply::error("no time provided to 'EX'");
                    }
                    let seconds = match parse_duration(&args[position + 1]) {
                        Some(s) => s,
                        None => return Reply::error("invalid format provided to 'EX'"),
                    };
                    expires_at_ms = Some(offset_from_now(seconds.saturating_mul(1000)));
                    position += 2;
                }
                _ => {
                    return Reply::error(format!(
                        "invalid argument '{}'",
                        String::from_utf8_lossy(raw)
                    ));
                }
            }
        }

        let expires_at_ms = expires_at_ms.unwrap_or_else(|| unix_millis() + DEFAULT_TTL_MS);
        let item = StoreItem::new(value, expires_at_ms);
        let entry = self
            .journal
            .as_ref()
            .map(|_| LogEntry::new("SET", args.to_vec()));

        self.store.set_with(key, item, || {
            if let (Some(journal), Some(entry)) = (&self.journal, entry) {
                journal.record(entry);
            }
        });

        Reply::ok()
    }

    /// GET key
    fn cmd_get(&self, args: &[Bytes]) -> Reply {
        let key = match args.first() {
            Some(key) => key,
            None => return Reply::error("no value provided to 'GET'"),
        };
        match self.store.get(key) {
            Some(value) => Reply::Simple(value),
            None => Reply::Nil,
        }
    }

    /// DEL key
    ///
    /// Removing an absent key answers nil, not an error and not `+OK`.
    /// Only an actual removal is journaled.
    fn cmd_del(&self, args: &[Bytes]) -> Reply {
        let key = match args.first() {
            Some(key) => key,
            None => return Reply::error("no value provided to 'DEL'"),
        };
        let entry = self
            .journal
            .as_ref()
            .map(|_| LogEntry::new("DEL", args.to_vec()));

        let removed = self.store.del_with(key, || {
            if let (Some(journal), Some(entry)) = (&self.journal, entry) {
                journal.record(entry);
            }
        });

        if removed {
            Reply::ok()
        } else {
            Reply::Nil
        }
    }
}

/// Parses a PX/EX duration argument: optional sign, decimal digits.
///
/// Negative durations parse (the original accepted them) and clamp to
/// an already-expired instant in [`offset_from_now`].
fn parse_duration(arg: &Bytes) -> Option<i64> {
    std::str::from_utf8(arg).ok()?.parse::<i64>().ok()
}

/// `now + delta_ms`, clamped to the epoch for negative results.
fn offset_from_now(delta_ms: i64) -> u64 {
    (unix_millis() as i64).saturating_add(delta_ms).max(0) as u64
}
