//! RESP2 reply values and their wire encoding.
//!
//! Replies serialize directly into a `BytesMut` output buffer with no
//! intermediate allocations; integer-to-string conversion uses `itoa`
//! for stack-based formatting.

use bytes::{BufMut, Bytes, BytesMut};

/// A single RESP2 reply value.
///
/// Simple strings and errors must not contain `\r` or `\n`; bulk strings
/// are binary-clean.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Simple string, e.g. `+OK\r\n`. Short, non-binary status replies.
    Simple(String),

    /// Error, e.g. `-ERR unknown command 'FOO'\r\n`.
    Error(String),

    /// 64-bit signed integer, e.g. `:42\r\n`.
    Integer(i64),

    /// Bulk (binary-safe) string, e.g. `$5\r\nhello\r\n`. An empty bulk
    /// encodes as `$0\r\n\r\n`, distinct from [`Reply::NullBulk`].
    Bulk(Bytes),

    /// Null bulk string, `$-1\r\n`. The "no such key" reply.
    NullBulk,

    /// Ordered array of replies, e.g. `*2\r\n+a\r\n+b\r\n`.
    Array(Vec<Reply>),

    /// Null array, `*-1\r\n`.
    NullArray,
}

impl Reply {
    /// Convenience constructor for the ubiquitous `+OK` reply.
    pub fn ok() -> Reply {
        Reply::Simple("OK".into())
    }

    /// Wraps an optional value as bulk-or-null, the shape GET and MGET
    /// elements use.
    pub fn bulk_or_null(value: Option<Bytes>) -> Reply {
        match value {
            Some(data) => Reply::Bulk(data),
            None => Reply::NullBulk,
        }
    }

    /// Returns `true` for error replies. Used for metrics labeling.
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Serializes this reply into the provided buffer, including the type
    /// prefix and trailing `\r\n` delimiters.
    pub fn serialize(&self, dst: &mut BytesMut) {
        match self {
            Reply::Simple(s) => {
                dst.put_u8(b'+');
                dst.put_slice(s.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Reply::Error(msg) => {
                dst.put_u8(b'-');
                dst.put_slice(msg.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Reply::Integer(n) => {
                dst.put_u8(b':');
                write_i64(*n, dst);
                dst.put_slice(b"\r\n");
            }
            Reply::Bulk(data) => {
                dst.put_u8(b'$');
                write_i64(data.len() as i64, dst);
                dst.put_slice(b"\r\n");
                dst.put_slice(data);
                dst.put_slice(b"\r\n");
            }
            Reply::NullBulk => {
                dst.put_slice(b"$-1\r\n");
            }
            Reply::Array(items) => {
                dst.put_u8(b'*');
                write_i64(items.len() as i64, dst);
                dst.put_slice(b"\r\n");
                for item in items {
                    item.serialize(dst);
                }
            }
            Reply::NullArray => {
                dst.put_slice(b"*-1\r\n");
            }
        }
    }
}

/// Writes an i64 as its decimal ASCII representation directly into the buffer.
fn write_i64(val: i64, dst: &mut BytesMut) {
    let mut buf = itoa::Buffer::new();
    dst.put_slice(buf.format(val).as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serialize(reply: &Reply) -> Vec<u8> {
        let mut buf = BytesMut::new();
        reply.serialize(&mut buf);
        buf.to_vec()
    }

    #[test]
    fn simple_string() {
        assert_eq!(serialize(&Reply::Simple("OK".into())), b"+OK\r\n");
        assert_eq!(serialize(&Reply::ok()), b"+OK\r\n");
    }

    #[test]
    fn error() {
        assert_eq!(
            serialize(&Reply::Error("ERR syntax error".into())),
            b"-ERR syntax error\r\n"
        );
    }

    #[test]
    fn integer() {
        assert_eq!(serialize(&Reply::Integer(42)), b":42\r\n");
        assert_eq!(serialize(&Reply::Integer(0)), b":0\r\n");
        assert_eq!(serialize(&Reply::Integer(-2)), b":-2\r\n");
        assert_eq!(
            serialize(&Reply::Integer(i64::MIN)),
            b":-9223372036854775808\r\n"
        );
    }

    #[test]
    fn bulk_string() {
        assert_eq!(
            serialize(&Reply::Bulk(Bytes::from_static(b"hello"))),
            b"$5\r\nhello\r\n"
        );
    }

    #[test]
    fn empty_bulk_is_not_null() {
        assert_eq!(serialize(&Reply::Bulk(Bytes::new())), b"$0\r\n\r\n");
        assert_eq!(serialize(&Reply::NullBulk), b"$-1\r\n");
    }

    #[test]
    fn bulk_is_binary_clean() {
        let payload = Bytes::from_static(b"a\r\nb\x00\xffc");
        assert_eq!(
            serialize(&Reply::Bulk(payload)),
            b"$7\r\na\r\nb\x00\xffc\r\n"
        );
    }

    #[test]
    fn array() {
        let reply = Reply::Array(vec![
            Reply::Bulk(Bytes::from_static(b"1")),
            Reply::NullBulk,
            Reply::Integer(2),
        ]);
        assert_eq!(serialize(&reply), b"*3\r\n$1\r\n1\r\n$-1\r\n:2\r\n");
    }

    #[test]
    fn empty_and_null_arrays() {
        assert_eq!(serialize(&Reply::Array(vec![])), b"*0\r\n");
        assert_eq!(serialize(&Reply::NullArray), b"*-1\r\n");
    }

    #[test]
    fn bulk_or_null() {
        assert_eq!(
            Reply::bulk_or_null(Some(Bytes::from_static(b"v"))),
            Reply::Bulk(Bytes::from_static(b"v"))
        );
        assert_eq!(Reply::bulk_or_null(None), Reply::NullBulk);
    }
}
