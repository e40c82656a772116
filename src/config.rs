//! Server Configuration
//!
//! Four knobs cover the whole server: where to listen, where to keep
//! durable state, and the two persistence cadences. Defaults match the
//! classic deployment; every knob has an environment override, and the
//! binary adds `--flag` overrides on top.

use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for a server instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the TCP listener binds. Env: `LISTEN_ADDR`.
    pub listen_addr: String,

    /// Directory holding `snapshot/` and `aof/`. Env: `DATA_ROOT`.
    pub data_root: PathBuf,

    /// Time between full keyspace snapshots. Env: `SNAPSHOT_INTERVAL`
    /// (seconds).
    pub snapshot_interval: Duration,

    /// Time between buffered-writer flushes of the operation log.
    /// Env: `FLUSH_INTERVAL` (seconds).
    pub flush_interval: Duration,

    /// Ceiling on a single buffered frame; a connection that exceeds
    /// it without completing a frame is closed.
    pub max_frame_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:6379".to_string(),
            data_root: PathBuf::from("_data"),
            snapshot_interval: Duration::from_secs(60),
            flush_interval: Duration::from_secs(5),
            max_frame_bytes: 64 * 1024,
        }
    }
}

impl Config {
    /// Defaults with environment overrides applied.
    ///
    /// Unparsable interval values fall back to the default rather than
    /// refusing to start.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Ok(addr) = std::env::var("LISTEN_ADDR") {
            config.listen_addr = addr;
        }
        if let Ok(root) = std::env::var("DATA_ROOT") {
            config.data_root = PathBuf::from(root);
        }
        if let Some(secs) = env_u64("SNAPSHOT_INTERVAL") {
            config.snapshot_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("FLUSH_INTERVAL") {
            config.flush_interval = Duration::from_secs(secs);
        }
        config
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.parse().ok()
}
