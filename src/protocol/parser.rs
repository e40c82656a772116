//! RESP Frame Parser
//!
//! This module decodes the inbound byte stream into command frames.
//! emberkv speaks a subset of RESP: every request is an array of bulk
//! strings, where the first bulk is the command name and the rest are
//! its arguments.
//!
//! ```text
//! frame := '*' N CRLF bulk{N}
//! bulk  := '$' L CRLF payload[L] CRLF
//! ```
//!
//! ## How the Parser Works
//!
//! The parser reads from a buffer and returns either:
//! - `Ok(Some((frame, consumed)))` - Successfully parsed a frame, `consumed` bytes were used
//! - `Ok(None)` - Need more data, the frame is incomplete
//! - `Err(FrameError)` - Invalid protocol data
//!
//! This design allows the caller to:
//! 1. Append incoming network data to a buffer
//! 2. Call `parse()` to attempt parsing
//! 3. If successful, advance the buffer by `consumed` bytes
//! 4. If incomplete, wait for more data
//! 5. If error, reply with the error's wire text
//!
//! Payloads are consumed by their declared length and never scanned for
//! CRLF, so arguments are binary-safe (they may contain `\r`, `\n`,
//! `$`, `*`, or NUL bytes).

use bytes::Bytes;
use thiserror::Error;

/// Errors that can occur while decoding a frame.
///
/// Each variant maps to the exact byte sequence the server puts on the
/// wire for it; see [`FrameError::wire_message`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// A payload byte showed up where the frame structure does not
    /// allow one: no array header yet, no pending bulk length, or all
    /// declared arguments already parsed.
    #[error("invalid frame syntax")]
    Syntax,

    /// An integer field (`*N` or `$L`) had no digits before CRLF.
    #[error("no value was detected")]
    EmptyInteger,

    /// An integer field contained a non-digit byte.
    #[error("failed to parse int")]
    BadInteger,
}

impl FrameError {
    /// The reply text sent to the client for this error.
    ///
    /// `Syntax` keeps the historical `+`-prefixed simple string; the
    /// integer errors go out verbatim with no type prefix. The
    /// connection writer appends the trailing CRLF.
    pub fn wire_message(&self) -> &'static str {
        match self {
            FrameError::Syntax => "+Invalid syntax",
            FrameError::EmptyInteger => "no value was detected",
            FrameError::BadInteger => "failed to parse int",
        }
    }
}

/// A decoded command frame: the uppercase-folded command name and its
/// arguments with their original bytes intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command name, folded to uppercase for dispatch.
    pub name: String,
    /// Arguments exactly as received.
    pub args: Vec<Bytes>,
}

impl Frame {
    pub fn new(name: impl Into<String>, args: Vec<Bytes>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// Decodes command frames from a byte buffer.
///
/// The parser is stateless between calls: each `parse` walks the
/// buffer from the start and reports how many bytes a complete frame
/// consumed. Partial frames leave the buffer untouched.
///
/// # Example
///
/// ```
/// use emberkv::protocol::FrameParser;
///
/// let buf = b"*2\r\n$4\r\nECHO\r\n$2\r\nhi\r\n";
/// let (frame, consumed) = FrameParser::parse(buf).unwrap().unwrap();
/// assert_eq!(frame.name, "ECHO");
/// assert_eq!(consumed, buf.len());
/// ```
#[derive(Debug, Default)]
pub struct FrameParser;

impl FrameParser {
    /// Attempts to decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete
    /// frame. Standalone CR and LF bytes before the array header are
    /// skipped, so pipelined frames can be parsed back to back.
    pub fn parse(buf: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
        let mut pos = 0;

        // Stray CR/LF between frames.
        while pos < buf.len() && (buf[pos] == b'\r' || buf[pos] == b'\n') {
            pos += 1;
        }
        if pos == buf.len() {
            return Ok(None);
        }

        let mut expected: usize = 0;
        let mut parsed: usize = 0;
        let mut name = String::new();
        let mut args: Vec<Bytes> = Vec::new();

        while pos < buf.len() {
            match buf[pos] {
                b'*' => {
                    let (n, skipped) = match read_int(&buf[pos + 1..])? {
                        Some(r) => r,
                        None => return Ok(None),
                    };
                    if n == 0 {
                        return Err(FrameError::Syntax);
                    }
                    expected = n;
                    parsed = 0;
                    args = Vec::with_capacity(n - 1);
                    pos += 1 + skipped;
                }
                b'$' => {
                    // A bulk is only legal when the array header
                    // declared room for it.
                    if expected == 0 || parsed >= expected {
                        return Err(FrameError::Syntax);
                    }
                    let (len, skipped) = match read_int(&buf[pos + 1..])? {
                        Some(r) => r,
                        None => return Ok(None),
                    };
                    pos += 1 + skipped;

                    // The payload starts right after the length line
                    // and is consumed by count, never scanned, so it
                    // may begin with or contain any byte.
                    if pos + len > buf.len() {
                        return Ok(None);
                    }
                    let payload = &buf[pos..pos + len];
                    if parsed == 0 {
                        name = String::from_utf8_lossy(payload).to_uppercase();
                    } else {
                        args.push(Bytes::copy_from_slice(payload));
                    }
                    pos += len;
                    parsed += 1;
                    if parsed == expected {
                        pos = consume_crlf(buf, pos);
                        return Ok(Some((Frame { name, args }, pos)));
                    }
                }
                b'\r' | b'\n' => {
                    pos += 1;
                }
                _ => {
                    // A payload byte with no `$L` line before it.
                    return Err(FrameError::Syntax);
                }
            }
        }

        // Ran out of bytes mid-frame.
        Ok(None)
    }
}

/// Consumes the CRLF trailing the final payload, if fully buffered.
fn consume_crlf(buf: &[u8], pos: usize) -> usize {
    if buf.len() >= pos + 2 && &buf[pos..pos + 2] == b"\r\n" {
        pos + 2
    } else {
        pos
    }
}

/// Reads a decimal digit run terminated by CRLF.
///
/// Returns `Ok(Some((value, consumed)))` where `consumed` includes the
/// CRLF, or `Ok(None)` when the terminator is not buffered yet. An
/// empty digit run and a non-digit byte are distinct errors so the
/// client sees which one it sent.
fn read_int(buf: &[u8]) -> Result<Option<(usize, usize)>, FrameError> {
    let mut end = 0;
    loop {
        if end + 1 >= buf.len() {
            // Terminator not buffered yet. Validation waits for the
            // full digit run so a read split inside "\r\n" is not
            // mistaken for a malformed integer.
            return Ok(None);
        }
        if buf[end] == b'\r' && buf[end + 1] == b'\n' {
            break;
        }
        end += 1;
    }

    let digits = &buf[..end];
    if digits.is_empty() {
        return Err(FrameError::EmptyInteger);
    }
    if digits.iter().any(|b| !b.is_ascii_digit()) {
        return Err(FrameError::BadInteger);
    }

    let mut value: usize = 0;
    for b in digits {
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as usize))
            .ok_or(FrameError::BadInteger)?;
    }
    Ok(Some((value, end + 2)))
}

/// Encodes `(cmd, args)` as a RESP array of bulk strings.
///
/// The canonical inverse of [`FrameParser::parse`]; used by tests and
/// benchmarks to build wire input.
pub fn encode_frame(cmd: &str, args: &[&[u8]]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(format!("*{}\r\n", args.len() + 1).as_bytes());
    buf.extend_from_slice(format!("${}\r\n", cmd.len()).as_bytes());
    buf.extend_from_slice(cmd.as_bytes());
    buf.extend_from_slice(b"\r\n");
    for arg in args {
        buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.extend_from_slice(arg);
        buf.extend_from_slice(b"\r\n");
    }
    buf
}
