//! Connection Layer
//!
//! One async task per accepted client, each running a read, parse,
//! execute, respond loop over a growable buffer. Pipelined commands
//! are answered in order; framing errors are reported without closing
//! the connection.
//!
//! ```text
//! TcpListener ──accept──> handle_connection (spawned task)
//!                              │
//!                   read ─> FrameParser ─> CommandExecutor ─> reply
//! ```

pub mod handler;

// Re-export commonly used types
pub use handler::{handle_connection, ConnectionError, ConnectionHandler};
