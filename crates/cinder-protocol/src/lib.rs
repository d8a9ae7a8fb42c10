//! RESP2 wire codec: request decoding and reply encoding.
//!
//! The decoder turns buffered bytes into [`Command`] values - an uppercased
//! name plus verbatim argument bytes - accepting both the multibulk array
//! framing real clients use and the inline framing of interactive telnet
//! sessions. The encoder serializes [`Reply`] values straight into a
//! `BytesMut` output buffer.
//!
//! The codec is purely synchronous and does no I/O: the caller reads from
//! the socket into a buffer and retries on [`parse_command`] returning
//! `Ok(None)` once more data arrives.

pub mod command;
pub mod error;
pub mod parse;
pub mod reply;

pub use command::Command;
pub use error::ProtocolError;
pub use parse::{parse_command, MAX_ARRAY_ELEMENTS, MAX_BULK_LEN};
pub use reply::Reply;
