//! Protocol error types for RESP2 decoding.

use thiserror::Error;

/// Errors produced while decoding the RESP2 request stream.
///
/// Every variant except [`ProtocolError::Incomplete`] is fatal to the
/// connection: the session writes a single `-ERR Protocol error: <detail>`
/// reply and closes. The `Display` text is that detail.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The buffer doesn't contain a complete command yet.
    /// The caller should read more data and try again.
    #[error("incomplete command")]
    Incomplete,

    /// The `*<N>` header was not a valid count: not an integer, negative,
    /// or beyond the per-array element limit.
    #[error("invalid multibulk length")]
    InvalidMultibulkLength,

    /// A `$<L>` header was not a valid bulk length: not an integer,
    /// negative (null bulks are not valid command elements), or beyond
    /// the per-bulk size limit.
    #[error("invalid bulk length")]
    InvalidBulkLength,

    /// A command array element did not start with `$`.
    #[error("expected '$', got '{0}'")]
    ExpectedBulkString(char),

    /// Bulk payload was not followed by the mandatory `\r\n`.
    #[error("invalid bulk terminator")]
    InvalidBulkTerminator,
}
