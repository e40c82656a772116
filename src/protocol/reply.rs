//! Reply Encoding
//!
//! emberkv emits exactly three reply shapes:
//!
//! - Simple string: `+<payload>` (`+OK`, `+PONG`, `+<value>`)
//! - Error: `-ERR <message>`
//! - Nil bulk: `$-1` (lookup miss or expired key)
//!
//! The trailing CRLF is appended by the connection writer, one per
//! reply, so the encoder here produces the body only. Simple-string
//! payloads carry raw value bytes; the protocol offers no
//! length-prefixed reply type, so values are emitted as-is.

use bytes::Bytes;
use std::fmt;

/// A reply ready to be encoded onto the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `+<payload>`
    Simple(Bytes),
    /// `-ERR <message>`
    Error(String),
    /// `$-1`
    Nil,
}

impl Reply {
    /// `+OK`
    pub fn ok() -> Self {
        Reply::Simple(Bytes::from_static(b"OK"))
    }

    /// `+PONG`
    pub fn pong() -> Self {
        Reply::Simple(Bytes::from_static(b"PONG"))
    }

    pub fn simple(payload: impl Into<Bytes>) -> Self {
        Reply::Simple(payload.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Reply::Error(message.into())
    }

    /// Serializes the reply body into `buf`, without the trailing CRLF.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Reply::Simple(payload) => {
                buf.push(b'+');
                buf.extend_from_slice(payload);
            }
            Reply::Error(message) => {
                buf.extend_from_slice(b"-ERR ");
                buf.extend_from_slice(message.as_bytes());
            }
            Reply::Nil => {
                buf.extend_from_slice(b"$-1");
            }
        }
    }

    /// Convenience wrapper around [`Reply::encode_into`].
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Simple(payload) => match std::str::from_utf8(payload) {
                Ok(s) => write!(f, "\"{}\"", s),
                Err(_) => write!(f, "(binary data, {} bytes)", payload.len()),
            },
            Reply::Error(message) => write!(f, "(error) ERR {}", message),
            Reply::Nil => write!(f, "(nil)"),
        }
    }
}
