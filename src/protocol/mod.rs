//! Wire Protocol
//!
//! emberkv speaks a subset of RESP (REdis Serialization Protocol):
//! requests are arrays of bulk strings, replies are simple strings,
//! errors, or the nil bulk marker.
//!
//! ## Modules
//!
//! - `parser`: decodes inbound bytes into `Frame { name, args }`
//! - `reply`: encodes the three outbound reply shapes
//!
//! ## Example
//!
//! ```
//! use emberkv::protocol::{FrameParser, Reply};
//!
//! let data = b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n";
//! let (frame, consumed) = FrameParser::parse(data).unwrap().unwrap();
//! assert_eq!(frame.name, "GET");
//! assert_eq!(consumed, data.len());
//!
//! let reply = Reply::ok();
//! assert_eq!(reply.encode(), b"+OK");
//! ```

pub mod parser;
pub mod reply;

// Re-export commonly used types for convenience
pub use parser::{encode_frame, Frame, FrameError, FrameParser};
pub use reply::Reply;
