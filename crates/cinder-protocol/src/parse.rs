//! Single-pass RESP2 request decoder.
//!
//! Operates on buffered byte slices. The caller is responsible for reading
//! data from the network into a buffer - this parser is purely synchronous.
//!
//! A `Cursor<&[u8]>` tracks the position through the input without
//! consuming it, so the caller can retry once more data arrives: an
//! incomplete command surfaces as `Ok(None)`, never as an error.
//!
//! Two request framings are accepted:
//!
//! - *Multibulk*: `*<N>\r\n` followed by N bulk strings, each
//!   `$<L>\r\n<bytes>\r\n`. This is what real clients send.
//! - *Inline*: a single line split on whitespace, for people typing into
//!   telnet. A lone `\n` terminator is tolerated.

use std::io::Cursor;

use bytes::Bytes;

use crate::command::Command;
use crate::error::ProtocolError;

/// Maximum number of elements in a command array. Prevents memory
/// amplification from a tiny header declaring a huge element count.
pub const MAX_ARRAY_ELEMENTS: usize = 1_048_576;

/// Maximum length of a single bulk string in bytes (512 MiB, matching Redis).
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Cap for `Vec::with_capacity` when parsing arrays. A declared count near
/// the element limit would otherwise pre-allocate tens of megabytes before
/// any payload has been validated.
const PREALLOC_CAP: usize = 1024;

/// Decodes one command from the front of `buf`.
///
/// Returns `Ok(Some((command, consumed)))` when a complete command was
/// decoded, `Ok(None)` when the buffer doesn't hold a complete command yet,
/// or `Err(...)` when the stream is malformed (fatal to the connection).
pub fn parse_command(buf: &[u8]) -> Result<Option<(Command, usize)>, ProtocolError> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut cursor = Cursor::new(buf);
    let result = if buf[0] == b'*' {
        parse_multibulk(&mut cursor)
    } else {
        parse_inline(&mut cursor)
    };

    match result {
        Ok(cmd) => Ok(Some((cmd, cursor.position() as usize))),
        Err(ProtocolError::Incomplete) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Parses the `*<N>` array framing: N bulk-string elements, first one the
/// command name. `N = 0` yields an empty command for the dispatcher to
/// reject; a negative or oversized N is a protocol error.
fn parse_multibulk(cursor: &mut Cursor<&[u8]>) -> Result<Command, ProtocolError> {
    let header = read_line(cursor)?;
    let count = parse_i64_bytes(&header[1..]).ok_or(ProtocolError::InvalidMultibulkLength)?;

    if count < 0 || count as usize > MAX_ARRAY_ELEMENTS {
        return Err(ProtocolError::InvalidMultibulkLength);
    }
    let count = count as usize;

    let mut parts = Vec::with_capacity(count.min(PREALLOC_CAP));
    for _ in 0..count {
        parts.push(parse_bulk(cursor)?);
    }
    Ok(Command::from_parts(parts))
}

/// Parses one `$<L>\r\n<bytes>\r\n` element. A null bulk (`$-1`) is not a
/// valid command element and fails decoding.
fn parse_bulk(cursor: &mut Cursor<&[u8]>) -> Result<Bytes, ProtocolError> {
    let line = read_line(cursor)?;
    let prefix = *line.first().ok_or(ProtocolError::InvalidBulkLength)?;
    if prefix != b'$' {
        return Err(ProtocolError::ExpectedBulkString(char::from(prefix)));
    }

    let len = parse_i64_bytes(&line[1..]).ok_or(ProtocolError::InvalidBulkLength)?;
    if len < 0 || len > MAX_BULK_LEN {
        return Err(ProtocolError::InvalidBulkLength);
    }
    let len = len as usize;

    // payload + trailing \r\n must be fully buffered
    let pos = cursor.position() as usize;
    let buf = *cursor.get_ref();
    if buf.len() - pos < len + 2 {
        return Err(ProtocolError::Incomplete);
    }
    if &buf[pos + len..pos + len + 2] != b"\r\n" {
        return Err(ProtocolError::InvalidBulkTerminator);
    }

    cursor.set_position((pos + len + 2) as u64);
    Ok(Bytes::copy_from_slice(&buf[pos..pos + len]))
}

/// Parses the inline framing: one whitespace-split line. The first token
/// is the command name; a blank line yields an empty command.
fn parse_inline(cursor: &mut Cursor<&[u8]>) -> Result<Command, ProtocolError> {
    let buf = *cursor.get_ref();
    let start = cursor.position() as usize;

    let nl = memchr::memchr(b'\n', &buf[start..]).ok_or(ProtocolError::Incomplete)?;
    let mut line = &buf[start..start + nl];
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }
    cursor.set_position((start + nl + 1) as u64);

    let parts = line
        .split(|b: &u8| b.is_ascii_whitespace())
        .filter(|token| !token.is_empty())
        .map(Bytes::copy_from_slice)
        .collect();
    Ok(Command::from_parts(parts))
}

// ---------------------------------------------------------------------------
// low-level cursor helpers
// ---------------------------------------------------------------------------

/// Returns the bytes up to (but not including) the next `\r\n` and advances
/// the cursor past it.
fn read_line<'a>(cursor: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], ProtocolError> {
    let buf = *cursor.get_ref();
    let start = cursor.position() as usize;

    // scan for \r and verify \n follows; a bare \r inside a header line is
    // skipped over rather than treated as a terminator
    let mut pos = start;
    while let Some(offset) = memchr::memchr(b'\r', &buf[pos..]) {
        let cr = pos + offset;
        if cr + 1 < buf.len() && buf[cr + 1] == b'\n' {
            cursor.set_position((cr + 2) as u64);
            return Ok(&buf[start..cr]);
        }
        pos = cr + 1;
    }

    Err(ProtocolError::Incomplete)
}

/// Parses an i64 from ASCII decimal bytes without allocating. Returns
/// `None` on empty input, a stray sign, or any non-digit character.
///
/// Negative values accumulate in the negative direction so that `i64::MIN`
/// is representable without overflow.
fn parse_i64_bytes(buf: &[u8]) -> Option<i64> {
    let (negative, digits) = match buf.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, buf),
    };

    if digits.is_empty() {
        return None;
    }

    let mut n: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return None;
        }
        let d = (b - b'0') as i64;
        n = if negative {
            n.checked_mul(10)?.checked_sub(d)?
        } else {
            n.checked_mul(10)?.checked_add(d)?
        };
    }
    Some(n)
}
