//! Server Wiring
//!
//! Ties the components together: bind the listener, build the store,
//! bootstrap the persistence engine (recovery happens here, before any
//! client is accepted), then run the accept loop until a shutdown
//! signal arrives.
//!
//! ## Shutdown Ordering
//!
//! 1. Stop accepting new connections.
//! 2. Notify connection handlers and wait for every one to finish
//!    (each handler holds a clone of an `mpsc` guard; the receiver
//!    yields `None` once the last clone drops).
//! 3. Signal the persistence engine, which drains its queue, flushes
//!    and closes the current log segment.
//! 4. Await the engine task.
//!
//! The engine has its own shutdown channel, fired only after step 2,
//! so every entry a handler enqueued is in the queue when the engine
//! drains it.

use crate::commands::CommandExecutor;
use crate::config::Config;
use crate::connection::handle_connection;
use crate::persistence::PersistenceEngine;
use crate::storage::Store;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// A bound, recovered server ready to accept connections.
pub struct Server {
    listener: TcpListener,
    executor: CommandExecutor,
    max_frame_bytes: usize,
    conn_shutdown_tx: watch::Sender<bool>,
    conn_shutdown_rx: watch::Receiver<bool>,
    engine_shutdown_tx: watch::Sender<bool>,
    engine_task: JoinHandle<()>,
    handler_guard_tx: mpsc::Sender<()>,
    handler_guard_rx: mpsc::Receiver<()>,
}

impl Server {
    /// Binds the listener and brings the storage and persistence
    /// subsystems up, including snapshot restore and log replay.
    ///
    /// Fails on a bind error or an unusable data root; the caller maps
    /// that to exit code 1.
    pub async fn start(config: Config) -> anyhow::Result<Server> {
        let listener = TcpListener::bind(&config.listen_addr).await?;
        info!(addr = %config.listen_addr, "listening");

        let store = Arc::new(Store::new());
        let (mut engine, log_handle) = PersistenceEngine::new(
            Arc::clone(&store),
            &config.data_root,
            config.snapshot_interval,
            config.flush_interval,
        );
        engine.bootstrap()?;

        let (engine_shutdown_tx, engine_shutdown_rx) = watch::channel(false);
        let engine_task = tokio::spawn(engine.run(engine_shutdown_rx));

        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let executor = CommandExecutor::with_journal(store, log_handle);
        let (handler_guard_tx, handler_guard_rx) = mpsc::channel(1);

        Ok(Server {
            listener,
            executor,
            max_frame_bytes: config.max_frame_bytes,
            conn_shutdown_tx,
            conn_shutdown_rx,
            engine_shutdown_tx,
            engine_task,
            handler_guard_tx,
            handler_guard_rx,
        })
    }

    /// The address the listener actually bound (port 0 resolves here).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` resolves, then tears the
    /// server down gracefully.
    pub async fn serve(mut self, shutdown: impl Future) -> anyhow::Result<()> {
        let result = tokio::select! {
            result = self.accept_loop() => result,
            _ = shutdown => {
                info!("shutdown signal received");
                Ok(())
            }
        };
        self.shutdown().await;
        result
    }

    async fn accept_loop(&mut self) -> anyhow::Result<()> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            let executor = self.executor.clone();
            let shutdown = self.conn_shutdown_rx.clone();
            let guard = self.handler_guard_tx.clone();
            let max_frame_bytes = self.max_frame_bytes;

            tokio::spawn(async move {
                handle_connection(stream, addr, executor, max_frame_bytes, shutdown).await;
                drop(guard);
            });
        }
    }

    /// Graceful teardown; see the module docs for the ordering.
    pub async fn shutdown(self) {
        let Server {
            listener,
            executor,
            conn_shutdown_tx,
            conn_shutdown_rx,
            engine_shutdown_tx,
            engine_task,
            handler_guard_tx,
            mut handler_guard_rx,
            ..
        } = self;

        // 1. Stop accepting.
        drop(listener);

        // 2. Wake the handlers and wait for them to drain.
        let _ = conn_shutdown_tx.send(true);
        drop(conn_shutdown_rx);
        drop(handler_guard_tx);
        let _ = handler_guard_rx.recv().await;

        // 3. Every entry is now enqueued; release the last log handle
        // and tell the engine to drain, flush and close.
        drop(executor);
        let _ = engine_shutdown_tx.send(true);

        // 4.
        if let Err(err) = engine_task.await {
            error!(error = %err, "persistence engine task failed");
        }
        info!("server shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    fn test_config(root: &TempDir) -> Config {
        Config {
            listen_addr: "127.0.0.1:0".to_string(),
            data_root: root.path().to_path_buf(),
            snapshot_interval: Duration::from_secs(60),
            flush_interval: Duration::from_secs(60),
            ..Config::default()
        }
    }

    async fn send(client: &mut TcpStream, bytes: &[u8]) -> Vec<u8> {
        client.write_all(bytes).await.unwrap();
        let mut buf = [0u8; 256];
        let n = client.read(&mut buf).await.unwrap();
        buf[..n].to_vec()
    }

    #[tokio::test]
    async fn serves_commands_end_to_end() {
        let root = TempDir::new().unwrap();
        let server = Server::start(test_config(&root)).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.serve(async {
            let _ = stop_rx.await;
        }));

        let mut client = TcpStream::connect(addr).await.unwrap();
        assert_eq!(send(&mut client, b"*1\r\n$4\r\nPING\r\n").await, b"+PONG\r\n");
        assert_eq!(
            send(&mut client, b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n").await,
            b"+OK\r\n"
        );
        assert_eq!(
            send(&mut client, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n").await,
            b"+v\r\n"
        );

        drop(client);
        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn state_survives_a_restart() {
        let root = TempDir::new().unwrap();

        // First run: write keys, shut down cleanly. The flush interval
        // is a minute, so durability here rides on the shutdown drain.
        {
            let server = Server::start(test_config(&root)).await.unwrap();
            let addr = server.local_addr().unwrap();
            let (stop_tx, stop_rx) = oneshot::channel::<()>();
            let task = tokio::spawn(server.serve(async {
                let _ = stop_rx.await;
            }));

            let mut client = TcpStream::connect(addr).await.unwrap();
            for i in 0..20 {
                let key = format!("key{i}");
                let frame =
                    crate::protocol::encode_frame("SET", &[key.as_bytes(), b"payload".as_slice()]);
                let reply = send(&mut client, &frame).await;
                assert_eq!(reply, b"+OK\r\n");
            }
            assert_eq!(
                send(&mut client, b"*2\r\n$3\r\nDEL\r\n$4\r\nkey3\r\n").await,
                b"+OK\r\n"
            );

            drop(client);
            stop_tx.send(()).unwrap();
            task.await.unwrap().unwrap();
        }

        // Second run: recovery restores the snapshot and replays the
        // mutations.
        {
            let server = Server::start(test_config(&root)).await.unwrap();
            let addr = server.local_addr().unwrap();
            let (stop_tx, stop_rx) = oneshot::channel::<()>();
            let task = tokio::spawn(server.serve(async {
                let _ = stop_rx.await;
            }));

            let mut client = TcpStream::connect(addr).await.unwrap();
            assert_eq!(
                send(&mut client, b"*2\r\n$3\r\nGET\r\n$4\r\nkey1\r\n").await,
                b"+payload\r\n"
            );
            assert_eq!(
                send(&mut client, b"*2\r\n$3\r\nGET\r\n$4\r\nkey3\r\n").await,
                b"$-1\r\n"
            );

            drop(client);
            stop_tx.send(()).unwrap();
            task.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn snapshot_rotation_binds_a_fresh_segment() {
        let root = TempDir::new().unwrap();
        let mut config = test_config(&root);
        config.snapshot_interval = Duration::from_millis(50);

        let server = Server::start(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.serve(async {
            let _ = stop_rx.await;
        }));

        let mut client = TcpStream::connect(addr).await.unwrap();
        assert_eq!(
            send(&mut client, b"*3\r\n$3\r\nSET\r\n$2\r\nk1\r\n$2\r\nv1\r\n").await,
            b"+OK\r\n"
        );
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(
            send(&mut client, b"*3\r\n$3\r\nSET\r\n$2\r\nk2\r\n$2\r\nv2\r\n").await,
            b"+OK\r\n"
        );
        drop(client);
        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();

        // More than one snapshot happened, and every AOF segment is
        // named after a snapshot id.
        let snapshot_ids: Vec<String> = std::fs::read_dir(root.path().join("snapshot"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .map(|name| name.trim_end_matches(".snap").to_string())
            .collect();
        assert!(snapshot_ids.len() >= 2);

        let segment_ids: Vec<String> = std::fs::read_dir(root.path().join("aof"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        for id in &segment_ids {
            assert!(snapshot_ids.contains(id), "segment {id} has no snapshot");
        }

        // Both keys come back after a restart.
        let server = Server::start(test_config(&root)).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.serve(async {
            let _ = stop_rx.await;
        }));
        let mut client = TcpStream::connect(addr).await.unwrap();
        assert_eq!(
            send(&mut client, b"*2\r\n$3\r\nGET\r\n$2\r\nk1\r\n").await,
            b"+v1\r\n"
        );
        assert_eq!(
            send(&mut client, b"*2\r\n$3\r\nGET\r\n$2\r\nk2\r\n").await,
            b"+v2\r\n"
        );
        drop(client);
        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
