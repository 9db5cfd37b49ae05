//! Line-oriented numeric protocol.
//!
//! A request is a decimal integer literal terminated by whitespace or a
//! newline. The reply is the transformed value in decimal, ASCII-encoded,
//! followed by `\n`. A blank request (empty or whitespace-only) is the
//! client's way of asking for the connection to be closed.

use std::io;
use std::str;

/// Pure integer transform applied to every request.
pub type Transform = fn(i64) -> i64;

/// The reference transform.
pub fn add42(n: i64) -> i64 {
    n + 42
}

/// True if the request carries no payload after trimming whitespace.
/// An empty slice (peer EOF) counts as blank.
pub fn is_blank(request: &[u8]) -> bool {
    request.iter().all(|b| b.is_ascii_whitespace())
}

/// Parse a request, apply `transform`, and encode the reply line.
///
/// Malformed input (non-UTF-8 or not a decimal integer) is an
/// `InvalidData` error; the caller decides what that means for the
/// connection.
pub fn respond(request: &[u8], transform: Transform) -> io::Result<Vec<u8>> {
    let text = str::from_utf8(request)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("non-UTF-8 request: {e}")))?;
    let number: i64 = text.trim().parse().map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid integer {:?}: {e}", text.trim()),
        )
    })?;
    Ok(format!("{}\n", transform(number)).into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add42() {
        assert_eq!(add42(5), 47);
        assert_eq!(add42(-42), 0);
    }

    #[test]
    fn test_blank_detection() {
        assert!(is_blank(b""));
        assert!(is_blank(b"   \n"));
        assert!(is_blank(b"\r\n\t"));
        assert!(!is_blank(b"5\n"));
    }

    #[test]
    fn test_respond_encodes_reply_line() {
        assert_eq!(respond(b"5\n", add42).unwrap(), b"47\n");
        assert_eq!(respond(b"100\n", add42).unwrap(), b"142\n");
        assert_eq!(respond(b"  -7 \n", add42).unwrap(), b"35\n");
    }

    #[test]
    fn test_respond_rejects_malformed_input() {
        let err = respond(b"abc\n", add42).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let err = respond(b"12x\n", add42).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_respond_with_custom_transform() {
        fn double(n: i64) -> i64 {
            n * 2
        }
        assert_eq!(respond(b"21\n", double).unwrap(), b"42\n");
    }
}
