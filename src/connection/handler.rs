//! Connection Handling
//!
//! Each accepted client gets its own task running a read, parse,
//! execute, write loop.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Client connects (TCP handshake)
//!        │
//!        ▼
//! 2. handler task spawned
//!        │
//!        ▼
//! 3. ┌──────────────────────────────┐
//!    │  loop:                       │
//!    │    read bytes into buffer    │
//!    │    while buffer holds a      │
//!    │    complete frame:           │
//!    │      execute, write reply    │
//!    └──────────────────────────────┘
//!        │
//!        ▼
//! 4. Client disconnects / error / server shutdown
//! ```
//!
//! ## Buffer Management
//!
//! TCP is a stream: a read may deliver half a frame or several frames
//! at once. Incoming data accumulates in a `BytesMut` until the parser
//! reports a complete frame, so pipelined batches of any size work up
//! to the configured frame ceiling. A buffer that reaches the ceiling
//! without containing a complete frame ends the connection with an
//! error reply; frames are never silently truncated.
//!
//! Framing errors are answered with the error's wire text and the
//! buffer is discarded, but the connection stays open.

use crate::commands::CommandExecutor;
use crate::protocol::{FrameError, FrameParser, Reply};
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Errors that can occur while handling a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Client disconnected with no partial frame pending
    #[error("client disconnected")]
    Disconnected,

    /// Client disconnected mid-frame
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// Buffered bytes reached the ceiling without a complete frame
    #[error("frame exceeds maximum size")]
    FrameTooLarge,
}

/// Handles a single client connection.
pub struct ConnectionHandler {
    /// Buffered writer over the TCP stream
    stream: BufWriter<TcpStream>,

    /// Client's address (for logging)
    addr: SocketAddr,

    /// Accumulates incoming bytes until a full frame is present
    buffer: BytesMut,

    /// Executes decoded frames (shared store underneath)
    executor: CommandExecutor,

    /// Largest tolerated incomplete frame
    max_frame_bytes: usize,

    /// Server shutdown signal
    shutdown: watch::Receiver<bool>,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        executor: CommandExecutor,
        max_frame_bytes: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            executor,
            max_frame_bytes,
            shutdown,
        }
    }

    /// Runs the connection to completion.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(client = %self.addr, "client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => debug!(client = %self.addr, "client disconnected"),
            Err(ConnectionError::Disconnected) => {
                debug!(client = %self.addr, "client disconnected")
            }
            Err(ConnectionError::Io(err))
                if err.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                debug!(client = %self.addr, "connection reset by client")
            }
            Err(err) => warn!(client = %self.addr, error = %err, "connection error"),
        }

        result
    }

    /// The read, parse, execute, respond loop.
    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            self.process_buffered().await?;

            if self.buffer.len() >= self.max_frame_bytes {
                // The ceiling was hit without a parseable frame; no
                // way to resync, so report and hang up.
                self.write_raw(b"-ERR frame exceeds maximum size").await?;
                return Err(ConnectionError::FrameTooLarge);
            }

            if !self.read_more().await? {
                return Ok(());
            }
        }
    }

    /// Executes every complete frame currently buffered.
    async fn process_buffered(&mut self) -> Result<(), ConnectionError> {
        loop {
            match FrameParser::parse(&self.buffer) {
                Ok(Some((frame, consumed))) => {
                    self.buffer.advance(consumed);
                    trace!(
                        client = %self.addr,
                        command = %frame.name,
                        consumed = consumed,
                        "frame parsed"
                    );
                    let reply = self.executor.execute(frame);
                    self.write_reply(&reply).await?;
                }
                Ok(None) => return Ok(()),
                Err(err) => {
                    // Protocol fault: answer with its wire text and
                    // drop whatever else is buffered; the connection
                    // survives.
                    warn!(client = %self.addr, error = %err, "framing error");
                    self.write_frame_error(&err).await?;
                    self.buffer.clear();
                    return Ok(());
                }
            }
        }
    }

    /// Reads more data into the buffer. Returns `false` on clean EOF.
    async fn read_more(&mut self) -> Result<bool, ConnectionError> {
        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(INITIAL_BUFFER_SIZE);
        }

        let n = tokio::select! {
            read = self.stream.get_mut().read_buf(&mut self.buffer) => read?,
            _ = self.shutdown.changed() => {
                debug!(client = %self.addr, "closing connection for shutdown");
                return Ok(false);
            }
        };

        if n == 0 {
            if self.buffer.is_empty() {
                return Ok(false);
            }
            return Err(ConnectionError::UnexpectedEof);
        }

        trace!(client = %self.addr, bytes = n, "read data");
        Ok(true)
    }

    async fn write_reply(&mut self, reply: &Reply) -> Result<(), ConnectionError> {
        let mut bytes = Vec::new();
        reply.encode_into(&mut bytes);
        bytes.extend_from_slice(b"\r\n");
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn write_frame_error(&mut self, err: &FrameError) -> Result<(), ConnectionError> {
        self.write_raw(err.wire_message().as_bytes()).await
    }

    async fn write_raw(&mut self, body: &[u8]) -> Result<(), ConnectionError> {
        self.stream.write_all(body).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        Ok(())
    }
}

/// Runs a connection handler to completion, absorbing expected
/// disconnect errors so the accept loop never sees them.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    executor: CommandExecutor,
    max_frame_bytes: usize,
    shutdown: watch::Receiver<bool>,
) {
    let handler = ConnectionHandler::new(stream, addr, executor, max_frame_bytes, shutdown);
    if let Err(err) = handler.run().await {
        match err {
            ConnectionError::Disconnected => {}
            ConnectionError::Io(ref io_err)
                if io_err.kind() == std::io::ErrorKind::ConnectionReset => {}
            _ => {
                debug!(client = %addr, error = %err, "connection ended with error");
            }
        }
    }
}
