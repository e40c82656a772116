//! Snapshot + Append-Only-File Durability
//!
//! This module owns everything that touches disk. Durability combines
//! two artifacts under the data root:
//!
//! ```text
//! _data/
//!   snapshot/<unix-ms>.snap   gzip-compressed encoding of the keyspace
//!   aof/<unix-ms>             stream of log entries since that snapshot
//! ```
//!
//! An AOF segment is named by the `last_snapshot_time` at the moment it
//! was opened, which binds each segment to exactly one snapshot: any
//! entry in segment `T` post-dates snapshot `T`, so recovery is
//! restore-then-replay with no conflict resolution and no manifest.
//!
//! ## Lifecycle
//!
//! 1. **Bootstrap** (before serving): ensure directories, restore the
//!    newest snapshot if one exists, replay its paired segment through
//!    the command handlers with logging disabled.
//! 2. **Ingestion loop** (single task): pull entries off the queue,
//!    encode them into the current segment, flush on a cadence. The
//!    first iteration always takes a startup snapshot, so the restored
//!    (or empty) keyspace is immediately re-durable and a fresh bound
//!    segment exists before the first entry lands.
//! 3. **Snapshot**: encode a read-locked clone of the keyspace, gzip,
//!    write to a temp name, fsync, rename, then rotate the segment.
//! 4. **Shutdown**: drain the queue, flush, sync, close.
//!
//! A `+OK` to the client only means the entry is queued; the
//! write-behind flush may lag by up to `flush_interval`. Disk errors
//! are logged and counted, never surfaced to clients, and never stop
//! ingestion.

use crate::commands::CommandExecutor;
use crate::persistence::log::{LogEntry, LogHandle};
use crate::protocol::Frame;
use crate::storage::{unix_millis, Store, StoreItem};
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Extension for snapshot files; AOF segments have none.
const SNAPSHOT_EXT: &str = ".snap";

/// Consecutive disk failures before the log level escalates.
const FAILURE_ESCALATION: u32 = 3;

/// Errors from the durability layer. These stay inside the engine:
/// the command path never sees them.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

/// The open AOF segment and its on-disk location.
struct Segment {
    writer: BufWriter<File>,
    path: PathBuf,
}

/// Owns snapshot cadence, the AOF writer, and startup recovery.
///
/// Construction hands back a [`LogHandle`] for the command layer;
/// everything else about persistence is private to the engine task.
pub struct PersistenceEngine {
    snapshot_dir: PathBuf,
    aof_dir: PathBuf,
    snapshot_interval: Duration,
    flush_interval: Duration,
    store: Arc<Store>,
    rx: mpsc::UnboundedReceiver<LogEntry>,
    segment: Option<Segment>,
    /// Time of the last successful snapshot; names the current segment.
    last_snapshot_ms: Option<u64>,
    /// Time of the last snapshot attempt; drives scheduling so a
    /// failing disk retries on the interval instead of spinning.
    last_attempt_ms: Option<u64>,
    last_flush: Instant,
    consecutive_failures: u32,
}

impl PersistenceEngine {
    /// Creates an engine rooted at `data_root` and the handle used to
    /// feed it entries.
    pub fn new(
        store: Arc<Store>,
        data_root: &Path,
        snapshot_interval: Duration,
        flush_interval: Duration,
    ) -> (Self, LogHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Self {
            snapshot_dir: data_root.join("snapshot"),
            aof_dir: data_root.join("aof"),
            snapshot_interval,
            flush_interval,
            store,
            rx,
            segment: None,
            last_snapshot_ms: None,
            last_attempt_ms: None,
            last_flush: Instant::now(),
            consecutive_failures: 0,
        };
        (engine, LogHandle::new(tx))
    }

    /// Prepares the data directories and recovers the keyspace.
    ///
    /// Runs synchronously before the server starts accepting
    /// connections. `last_snapshot_ms` is left unset so the ingestion
    /// loop's first iteration takes a startup snapshot of whatever
    /// this restored.
    pub fn bootstrap(&mut self) -> Result<(), PersistenceError> {
        self.ensure_dirs()?;
        self.restore_latest()?;
        Ok(())
    }

    /// The ingestion loop. Runs as a dedicated task until the shutdown
    /// signal fires or every [`LogHandle`] is dropped, then drains the
    /// queue and closes the segment.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("persistence engine started");
        loop {
            if self.snapshot_due() {
                self.snapshot_and_rotate();
            }
            let wait = self.time_until_snapshot();
            tokio::select! {
                entry = self.rx.recv() => match entry {
                    Some(entry) => self.ingest(entry),
                    None => break,
                },
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => break,
            }
        }
        self.drain_and_close();
    }

    fn ensure_dirs(&self) -> Result<(), PersistenceError> {
        for dir in [&self.snapshot_dir, &self.aof_dir] {
            if dir.is_dir() {
                continue;
            }
            let mut builder = fs::DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::DirBuilderExt;
                builder.mode(0o700);
            }
            builder.create(dir)?;
        }
        Ok(())
    }

    /// Restores the newest snapshot and replays its paired segment.
    ///
    /// An empty snapshot directory is a normal first boot: the store
    /// stays empty and the startup snapshot creates the first pair.
    fn restore_latest(&mut self) -> Result<(), PersistenceError> {
        let mut names: Vec<String> = fs::read_dir(&self.snapshot_dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.ends_with(SNAPSHOT_EXT))
            .collect();
        names.sort();

        let latest = match names.pop() {
            Some(name) => name,
            None => {
                info!("no snapshot found, starting with an empty keyspace");
                return Ok(());
            }
        };

        let compressed = fs::read(self.snapshot_dir.join(&latest))?;
        let mut decoder = GzDecoder::new(&compressed[..]);
        let mut encoded = Vec::new();
        decoder.read_to_end(&mut encoded)?;
        let items: HashMap<Bytes, StoreItem> = bincode::deserialize(&encoded)?;
        info!(snapshot = %latest, keys = items.len(), "restored snapshot");
        self.store.restore(items);

        let segment_id = latest.trim_end_matches(SNAPSHOT_EXT).to_string();
        self.replay_segment(&segment_id);
        Ok(())
    }

    /// Replays one AOF segment through the command handlers with
    /// persistence logging disabled.
    ///
    /// Unknown commands are skipped; a torn tail (partial final
    /// record from a crash mid-write) terminates the replay.
    fn replay_segment(&self, segment_id: &str) {
        let path = self.aof_dir.join(segment_id);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) => {
                warn!(segment = %segment_id, error = %err, "no operation log for snapshot, skipping replay");
                return;
            }
        };

        let executor = CommandExecutor::new(Arc::clone(&self.store));
        let mut reader = BufReader::new(file);
        let mut replayed = 0u64;
        loop {
            match bincode::deserialize_from::<_, LogEntry>(&mut reader) {
                Ok(entry) => match entry.command.as_str() {
                    "SET" | "DEL" => {
                        debug!(command = %entry.command, "replaying operation");
                        executor.execute(Frame::new(entry.command.clone(), entry.arguments));
                        replayed += 1;
                    }
                    other => {
                        warn!(command = %other, "unknown command in operation log, skipping");
                    }
                },
                Err(err) => {
                    if !is_eof(&err) {
                        warn!(error = %err, "stopping replay at torn log tail");
                    }
                    break;
                }
            }
        }
        info!(segment = %segment_id, operations = replayed, "operation log replayed");
    }

    fn snapshot_due(&self) -> bool {
        match self.last_attempt_ms {
            None => true,
            Some(last) => unix_millis() >= last + self.snapshot_interval.as_millis() as u64,
        }
    }

    fn time_until_snapshot(&self) -> Duration {
        match self.last_attempt_ms {
            None => Duration::ZERO,
            Some(last) => {
                let deadline = last + self.snapshot_interval.as_millis() as u64;
                Duration::from_millis(deadline.saturating_sub(unix_millis()))
            }
        }
    }

    fn snapshot_and_rotate(&mut self) {
        self.last_attempt_ms = Some(unix_millis());
        match self.perform_snapshot() {
            Ok(id) => {
                self.consecutive_failures = 0;
                debug!(snapshot = id, "snapshot cycle complete");
            }
            Err(err) => self.note_failure("snapshot failed", &err),
        }
    }

    /// Writes a snapshot atomically and rotates the AOF segment.
    ///
    /// The file lands under a temp name first and is renamed only
    /// after `sync_all`, so a crash mid-write leaves no half snapshot
    /// that recovery could pick up.
    fn perform_snapshot(&mut self) -> Result<u64, PersistenceError> {
        let id = unix_millis();
        let items = self.store.snapshot();
        let encoded = bincode::serialize(&items)?;

        let tmp_path = self.snapshot_dir.join(format!("{id}{SNAPSHOT_EXT}.tmp"));
        let final_path = self.snapshot_dir.join(format!("{id}{SNAPSHOT_EXT}"));

        let file = File::create(&tmp_path)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(&encoded)?;
        let file = encoder.finish()?;
        file.sync_all()?;
        fs::rename(&tmp_path, &final_path)?;

        self.last_snapshot_ms = Some(id);
        self.rotate_segment(id)?;
        info!(snapshot = id, keys = items.len(), "snapshot written");
        Ok(id)
    }

    /// Closes the current segment and opens `aof/<id>`.
    fn rotate_segment(&mut self, id: u64) -> Result<(), PersistenceError> {
        self.close_segment();
        let path = self.aof_dir.join(id.to_string());
        let file = File::create(&path)?;
        self.segment = Some(Segment {
            writer: BufWriter::new(file),
            path,
        });
        Ok(())
    }

    fn close_segment(&mut self) {
        if let Some(mut segment) = self.segment.take() {
            if let Err(err) = segment.writer.flush() {
                warn!(segment = %segment.path.display(), error = %err, "failed to flush log segment");
            }
            match segment.writer.into_inner() {
                Ok(file) => {
                    if let Err(err) = file.sync_all() {
                        warn!(error = %err, "failed to sync log segment");
                    }
                }
                Err(err) => {
                    warn!(error = %err, "failed to release log segment writer");
                }
            }
        }
    }

    /// Encodes one entry into the current segment and flushes when the
    /// flush interval has elapsed.
    fn ingest(&mut self, mut entry: LogEntry) {
        if entry.timestamp_ms == 0 {
            entry.timestamp_ms = unix_millis();
        }

        let segment = match self.segment.as_mut() {
            Some(segment) => segment,
            None => {
                // Only reachable when the startup snapshot failed.
                warn!("no open log segment, dropping entry");
                return;
            }
        };

        match bincode::serialize_into(&mut segment.writer, &entry) {
            Ok(()) => {
                self.consecutive_failures = 0;
                self.flush_if_due();
            }
            Err(err) => {
                let err = PersistenceError::from(err);
                self.note_failure("failed to append log entry", &err);
            }
        }
    }

    fn flush_if_due(&mut self) {
        if self.last_flush.elapsed() < self.flush_interval {
            return;
        }
        self.last_flush = Instant::now();
        if let Some(segment) = self.segment.as_mut() {
            if let Err(err) = segment.writer.flush() {
                let err = PersistenceError::from(err);
                self.note_failure("failed to flush operation log", &err);
            }
        }
    }

    /// Drains every queued entry, then flushes and closes the segment.
    fn drain_and_close(&mut self) {
        while let Ok(entry) = self.rx.try_recv() {
            self.ingest(entry);
        }
        self.close_segment();
        info!(last_snapshot = ?self.last_snapshot_ms, "persistence engine stopped");
    }

    /// Repeated failures escalate from `warn` to `error` as a health
    /// signal; ingestion keeps running either way.
    fn note_failure(&mut self, context: &str, err: &PersistenceError) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= FAILURE_ESCALATION {
            error!(
                error = %err,
                consecutive = self.consecutive_failures,
                "{context}; durability degraded"
            );
        } else {
            warn!(error = %err, "{context}");
        }
    }
}

fn is_eof(err: &bincode::Error) -> bool {
    matches!(
        &**err,
        bincode::ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MINUTE: Duration = Duration::from_secs(60);

    fn new_engine(root: &Path, store: Arc<Store>) -> (PersistenceEngine, LogHandle) {
        PersistenceEngine::new(store, root, MINUTE, MINUTE)
    }

    fn set_entry(key: &str, value: &str) -> LogEntry {
        LogEntry::new("SET", vec![Bytes::from(key.to_string()), Bytes::from(value.to_string())])
    }

    fn seeded_store(pairs: &[(&str, &str)]) -> Arc<Store> {
        let store = Arc::new(Store::new());
        for (key, value) in pairs {
            store.set(
                Bytes::from(key.to_string()),
                StoreItem::new(Bytes::from(value.to_string()), unix_millis() + 60_000),
            );
        }
        store
    }

    #[test]
    fn bootstrap_creates_directories() {
        let root = TempDir::new().unwrap();
        let (mut engine, _handle) = new_engine(root.path(), Arc::new(Store::new()));
        engine.bootstrap().unwrap();
        assert!(root.path().join("snapshot").is_dir());
        assert!(root.path().join("aof").is_dir());
    }

    #[test]
    fn bootstrap_with_empty_snapshot_dir_leaves_store_empty() {
        let root = TempDir::new().unwrap();
        let store = Arc::new(Store::new());
        let (mut engine, _handle) = new_engine(root.path(), Arc::clone(&store));
        engine.bootstrap().unwrap();
        assert!(store.is_empty());
        assert!(engine.last_snapshot_ms.is_none());
    }

    #[test]
    fn snapshot_writes_pair_and_no_temp_file() {
        let root = TempDir::new().unwrap();
        let store = seeded_store(&[("k", "v")]);
        let (mut engine, _handle) = new_engine(root.path(), store);
        engine.bootstrap().unwrap();

        let id = engine.perform_snapshot().unwrap();
        let snapshot = root.path().join("snapshot").join(format!("{id}.snap"));
        let segment = root.path().join("aof").join(id.to_string());
        assert!(snapshot.is_file());
        assert!(segment.is_file());
        assert_eq!(fs::metadata(&segment).unwrap().len(), 0);
        assert!(!root
            .path()
            .join("snapshot")
            .join(format!("{id}.snap.tmp"))
            .exists());
    }

    #[test]
    fn snapshot_then_restore_round_trips_the_keyspace() {
        let root = TempDir::new().unwrap();
        let store = seeded_store(&[("a", "1"), ("b", "2")]);
        let (mut engine, _handle) = new_engine(root.path(), store);
        engine.bootstrap().unwrap();
        engine.perform_snapshot().unwrap();
        drop(engine);

        let restored = Arc::new(Store::new());
        let (mut engine, _handle) = new_engine(root.path(), Arc::clone(&restored));
        engine.bootstrap().unwrap();
        assert_eq!(restored.get(b"a"), Some(Bytes::from("1")));
        assert_eq!(restored.get(b"b"), Some(Bytes::from("2")));
    }

    #[test]
    fn recovery_picks_the_newest_snapshot() {
        let root = TempDir::new().unwrap();
        let store = seeded_store(&[("k", "old")]);
        let (mut engine, _handle) = new_engine(root.path(), Arc::clone(&store));
        engine.bootstrap().unwrap();
        engine.perform_snapshot().unwrap();

        std::thread::sleep(Duration::from_millis(5));
        store.set(
            Bytes::from("k"),
            StoreItem::new(Bytes::from("new"), unix_millis() + 60_000),
        );
        engine.perform_snapshot().unwrap();
        drop(engine);

        let snapshots = fs::read_dir(root.path().join("snapshot")).unwrap().count();
        assert!(snapshots >= 2);

        let restored = Arc::new(Store::new());
        let (mut engine, _handle) = new_engine(root.path(), Arc::clone(&restored));
        engine.bootstrap().unwrap();
        assert_eq!(restored.get(b"k"), Some(Bytes::from("new")));
    }

    #[test]
    fn ingested_entries_replay_on_recovery() {
        let root = TempDir::new().unwrap();
        let (mut engine, _handle) = new_engine(root.path(), Arc::new(Store::new()));
        engine.bootstrap().unwrap();
        engine.perform_snapshot().unwrap();

        engine.ingest(set_entry("k1", "v1"));
        engine.ingest(set_entry("k2", "v2"));
        engine.ingest(LogEntry::new("DEL", vec![Bytes::from("k2")]));
        engine.drain_and_close();

        let restored = Arc::new(Store::new());
        let (mut engine, _handle) = new_engine(root.path(), Arc::clone(&restored));
        engine.bootstrap().unwrap();
        assert_eq!(restored.get(b"k1"), Some(Bytes::from("v1")));
        assert_eq!(restored.get(b"k2"), None);
    }

    #[test]
    fn entries_land_only_in_the_segment_bound_to_the_latest_snapshot() {
        let root = TempDir::new().unwrap();
        let (mut engine, _handle) = new_engine(root.path(), Arc::new(Store::new()));
        engine.bootstrap().unwrap();

        let first = engine.perform_snapshot().unwrap();
        engine.ingest(set_entry("k", "v"));
        std::thread::sleep(Duration::from_millis(5));
        let second = engine.perform_snapshot().unwrap();
        engine.ingest(set_entry("k2", "v2"));
        engine.drain_and_close();

        assert_ne!(first, second);
        let first_len = fs::metadata(root.path().join("aof").join(first.to_string()))
            .unwrap()
            .len();
        let second_len = fs::metadata(root.path().join("aof").join(second.to_string()))
            .unwrap()
            .len();
        // Rotation sealed the first segment before the second entry.
        assert!(first_len > 0);
        assert!(second_len > 0);
    }

    #[test]
    fn unknown_commands_in_the_log_are_skipped() {
        let root = TempDir::new().unwrap();
        let (mut engine, _handle) = new_engine(root.path(), Arc::new(Store::new()));
        engine.bootstrap().unwrap();
        engine.perform_snapshot().unwrap();

        engine.ingest(LogEntry::new("BOGUS", vec![Bytes::from("x")]));
        engine.ingest(set_entry("k", "v"));
        engine.drain_and_close();

        let restored = Arc::new(Store::new());
        let (mut engine, _handle) = new_engine(root.path(), Arc::clone(&restored));
        engine.bootstrap().unwrap();
        assert_eq!(restored.get(b"k"), Some(Bytes::from("v")));
        assert_eq!(restored.len(), 1);
    }

    #[test]
    fn torn_log_tail_stops_replay_without_failing_bootstrap() {
        let root = TempDir::new().unwrap();
        let (mut engine, _handle) = new_engine(root.path(), Arc::new(Store::new()));
        engine.bootstrap().unwrap();
        let id = engine.perform_snapshot().unwrap();
        engine.ingest(set_entry("k", "v"));
        engine.drain_and_close();

        // Simulate a crash mid-append: garbage after the valid record.
        let path = root.path().join("aof").join(id.to_string());
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xFF, 0x01]).unwrap();
        drop(file);

        let restored = Arc::new(Store::new());
        let (mut engine, _handle) = new_engine(root.path(), Arc::clone(&restored));
        engine.bootstrap().unwrap();
        assert_eq!(restored.get(b"k"), Some(Bytes::from("v")));
    }

    #[test]
    fn snapshot_preserves_absolute_expiry() {
        let root = TempDir::new().unwrap();
        let store = Arc::new(Store::new());
        store.set(
            Bytes::from("gone"),
            StoreItem::new(Bytes::from("v"), unix_millis() + 10),
        );
        store.set(
            Bytes::from("kept"),
            StoreItem::new(Bytes::from("v"), unix_millis() + 60_000),
        );
        let (mut engine, _handle) = new_engine(root.path(), store);
        engine.bootstrap().unwrap();
        engine.perform_snapshot().unwrap();
        drop(engine);

        std::thread::sleep(Duration::from_millis(20));
        let restored = Arc::new(Store::new());
        let (mut engine, _handle) = new_engine(root.path(), Arc::clone(&restored));
        engine.bootstrap().unwrap();
        // The short-lived key expired while "the process was down".
        assert_eq!(restored.get(b"gone"), None);
        assert_eq!(restored.get(b"kept"), Some(Bytes::from("v")));
    }

    #[test]
    fn failure_counter_resets_on_a_successful_append() {
        let root = TempDir::new().unwrap();
        let (mut engine, _handle) = new_engine(root.path(), Arc::new(Store::new()));
        engine.bootstrap().unwrap();
        engine.perform_snapshot().unwrap();

        let err = PersistenceError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "disk full",
        ));
        engine.note_failure("append failed", &err);
        engine.note_failure("append failed", &err);
        engine.note_failure("append failed", &err);
        assert_eq!(engine.consecutive_failures, 3);

        engine.ingest(set_entry("k", "v"));
        assert_eq!(engine.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn run_loop_takes_startup_snapshot_and_drains_on_shutdown() {
        let root = TempDir::new().unwrap();
        let store = Arc::new(Store::new());
        let (mut engine, handle) =
            PersistenceEngine::new(Arc::clone(&store), root.path(), MINUTE, MINUTE);
        engine.bootstrap().unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(engine.run(shutdown_rx));

        // Entries sent right before shutdown must still reach disk:
        // the loop drains the queue on its way out.
        for i in 0..10 {
            handle.record(set_entry(&format!("k{i}"), "v"));
        }
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        let restored = Arc::new(Store::new());
        let (mut engine, _handle) = new_engine(root.path(), Arc::clone(&restored));
        engine.bootstrap().unwrap();
        assert_eq!(restored.len(), 10);
        assert_eq!(restored.get(b"k7"), Some(Bytes::from("v")));
    }
}
