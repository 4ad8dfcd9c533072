//! Chunked transfer-coding.
//!
//! Bodies are accumulated raw; [`ChunkScanner`] walks the framing
//! incrementally as bytes arrive so each byte is inspected once, and
//! [`decode`] strips the framing once the terminal chunk has been seen.

use bytes::BytesMut;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidChunk;

impl fmt::Display for InvalidChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid chunked encoding")
    }
}

impl std::error::Error for InvalidChunk {}

/// Incremental scanner over a growing chunked body.
#[derive(Debug, Default, Clone)]
pub struct ChunkScanner {
    /// Start of the next chunk-size line.
    pos: usize,
    /// Payload bytes seen so far.
    decoded: u64,
}

impl ChunkScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload bytes in complete chunks scanned so far.
    pub fn decoded_len(&self) -> u64 {
        self.decoded
    }

    /// Continue scanning `buf` (which must extend what was passed before).
    ///
    /// Returns the length of the complete chunked body, terminal chunk and
    /// trailers included, once it is all present.
    pub fn advance(&mut self, buf: &[u8]) -> Result<Option<usize>, InvalidChunk> {
        loop {
            let rest = &buf[self.pos..];
            let (line_len, size) = match httparse::parse_chunk_size(rest) {
                Ok(httparse::Status::Complete(found)) => found,
                Ok(httparse::Status::Partial) => return Ok(None),
                Err(_) => return Err(InvalidChunk),
            };

            if size == 0 {
                return Ok(trailer_end(&rest[line_len..]).map(|end| self.pos + line_len + end));
            }

            let size = usize::try_from(size).map_err(|_| InvalidChunk)?;
            let data_end = line_len.checked_add(size).ok_or(InvalidChunk)?;
            if rest.len() < data_end + 2 {
                return Ok(None);
            }
            if &rest[data_end..data_end + 2] != b"\r\n" {
                return Err(InvalidChunk);
            }
            self.pos += data_end + 2;
            self.decoded += size as u64;
        }
    }
}

/// Find the end of the trailer section following the terminal chunk.
fn trailer_end(buf: &[u8]) -> Option<usize> {
    if buf.starts_with(b"\r\n") {
        return Some(2);
    }
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Strip chunk framing from a complete chunked body.
pub fn decode(raw: &[u8]) -> Result<BytesMut, InvalidChunk> {
    let mut out = BytesMut::new();
    let mut rest = raw;
    loop {
        let (line_len, size) = match httparse::parse_chunk_size(rest) {
            Ok(httparse::Status::Complete(found)) => found,
            _ => return Err(InvalidChunk),
        };
        if size == 0 {
            return Ok(out);
        }
        let size = usize::try_from(size).map_err(|_| InvalidChunk)?;
        let data = rest.get(line_len..line_len + size).ok_or(InvalidChunk)?;
        out.extend_from_slice(data);
        rest = rest.get(line_len + size + 2..).ok_or(InvalidChunk)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = b"5\r\nhello\r\n7;ext=1\r\n, world\r\n0\r\n\r\n";

    #[test]
    fn test_scan_complete_body() {
        let mut scanner = ChunkScanner::new();
        assert_eq!(scanner.advance(BODY), Ok(Some(BODY.len())));
        assert_eq!(scanner.decoded_len(), 12);
        assert_eq!(&decode(BODY).unwrap()[..], b"hello, world");
    }

    #[test]
    fn test_scan_byte_at_a_time() {
        let mut scanner = ChunkScanner::new();
        for end in 1..BODY.len() {
            assert_eq!(scanner.advance(&BODY[..end]), Ok(None), "at {end}");
        }
        assert_eq!(scanner.advance(BODY), Ok(Some(BODY.len())));
    }

    #[test]
    fn test_scan_stops_before_pipelined_bytes() {
        let mut buf = BODY.to_vec();
        buf.extend_from_slice(b"GET / HTTP/1.1\r\n\r\n");
        let mut scanner = ChunkScanner::new();
        assert_eq!(scanner.advance(&buf), Ok(Some(BODY.len())));
    }

    #[test]
    fn test_trailers() {
        let body = b"3\r\nabc\r\n0\r\nX-Checksum: 1\r\n\r\n";
        let mut scanner = ChunkScanner::new();
        assert_eq!(scanner.advance(body), Ok(Some(body.len())));
        assert_eq!(&decode(body).unwrap()[..], b"abc");
    }

    #[test]
    fn test_invalid_framing() {
        let mut scanner = ChunkScanner::new();
        assert_eq!(scanner.advance(b"zz\r\n"), Err(InvalidChunk));

        let mut scanner = ChunkScanner::new();
        assert_eq!(scanner.advance(b"3\r\nabcXY0\r\n\r\n"), Err(InvalidChunk));
    }
}
