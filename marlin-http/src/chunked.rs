//! `Transfer-Encoding: chunked` codec.
//!
//! Decoding materializes a chunked request body from a byte stream;
//! encoding produces one chunk fragment at a time for the
//! `send_as_chunk` response path.

use marlin_core::error::MarlinError;

/// Result of feeding bytes to the chunked decoder.
#[derive(Debug)]
pub enum ChunkProgress {
    /// More input is needed.
    Incomplete,
    /// The terminating zero chunk was seen after `consumed` input bytes.
    Complete { consumed: usize },
}

/// Incremental chunked-body decoder. Feed it the raw buffer repeatedly;
/// decoded payload accumulates in `body`.
pub struct ChunkedDecoder {
    pub body: Vec<u8>,
    offset: usize,
    limit: usize,
}

impl ChunkedDecoder {
    pub fn new(limit: usize) -> Self {
        Self { body: Vec::new(), offset: 0, limit }
    }

    /// Try to decode from `input` (the complete buffered input so far).
    pub fn decode(&mut self, input: &[u8]) -> Result<ChunkProgress, MarlinError> {
        loop {
            let rest = &input[self.offset..];
            let Some(line_end) = find_crlf(rest) else {
                return Ok(ChunkProgress::Incomplete);
            };
            let size_line = &rest[..line_end];
            let size_str = std::str::from_utf8(size_line)
                .map_err(|_| MarlinError::BadRequest("invalid chunk size line".into()))?;
            // Chunk extensions after ';' are ignored
            let size_str = size_str.split(';').next().unwrap_or("").trim();
            let size = usize::from_str_radix(size_str, 16)
                .map_err(|_| MarlinError::BadRequest(format!("invalid chunk size: {size_str}")))?;

            if size == 0 {
                // Zero chunk, then the final CRLF (trailers are not supported)
                let needed = line_end + 4;
                if rest.len() < needed {
                    return Ok(ChunkProgress::Incomplete);
                }
                self.offset += needed;
                return Ok(ChunkProgress::Complete { consumed: self.offset });
            }

            let needed = line_end + 2 + size + 2;
            if rest.len() < needed {
                return Ok(ChunkProgress::Incomplete);
            }
            if self.body.len() + size > self.limit {
                return Err(MarlinError::BadRequest(format!(
                    "chunked body exceeds limit of {} bytes",
                    self.limit
                )));
            }
            self.body.extend_from_slice(&rest[line_end + 2..line_end + 2 + size]);
            self.offset += needed;
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Encode one response chunk. `last` additionally appends the zero-size
/// terminator.
pub fn encode_chunk(buf: &mut Vec<u8>, data: &[u8], last: bool) {
    if !data.is_empty() {
        buf.extend_from_slice(format!("{:x}", data.len()).as_bytes());
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(data);
        buf.extend_from_slice(b"\r\n");
    }
    if last {
        buf.extend_from_slice(b"0\r\n\r\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_simple_chunked_body() {
        let input = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut decoder = ChunkedDecoder::new(1024);
        match decoder.decode(input).unwrap() {
            ChunkProgress::Complete { consumed } => assert_eq!(consumed, input.len()),
            ChunkProgress::Incomplete => panic!("expected complete"),
        }
        assert_eq!(decoder.body, b"hello world");
    }

    #[test]
    fn decodes_incrementally() {
        let input = b"5\r\nhello\r\n0\r\n\r\n";
        let mut decoder = ChunkedDecoder::new(1024);
        // Feed a partial buffer first
        assert!(matches!(decoder.decode(&input[..4]).unwrap(), ChunkProgress::Incomplete));
        assert!(matches!(decoder.decode(&input[..10]).unwrap(), ChunkProgress::Incomplete));
        assert!(matches!(
            decoder.decode(input).unwrap(),
            ChunkProgress::Complete { .. }
        ));
        assert_eq!(decoder.body, b"hello");
    }

    #[test]
    fn ignores_chunk_extensions() {
        let input = b"5;ext=1\r\nhello\r\n0\r\n\r\n";
        let mut decoder = ChunkedDecoder::new(1024);
        assert!(matches!(
            decoder.decode(input).unwrap(),
            ChunkProgress::Complete { .. }
        ));
        assert_eq!(decoder.body, b"hello");
    }

    #[test]
    fn rejects_bad_size_line() {
        let mut decoder = ChunkedDecoder::new(1024);
        assert!(decoder.decode(b"zz\r\nhello\r\n").is_err());
    }

    #[test]
    fn enforces_body_limit() {
        let mut decoder = ChunkedDecoder::new(4);
        let err = decoder.decode(b"5\r\nhello\r\n0\r\n\r\n").unwrap_err();
        assert!(matches!(err, MarlinError::BadRequest(_)));
    }

    #[test]
    fn encode_single_and_terminator() {
        let mut buf = Vec::new();
        encode_chunk(&mut buf, b"hello", false);
        assert_eq!(buf, b"5\r\nhello\r\n");

        buf.clear();
        encode_chunk(&mut buf, b" world", true);
        assert_eq!(buf, b"6\r\n world\r\n0\r\n\r\n");

        buf.clear();
        encode_chunk(&mut buf, b"", true);
        assert_eq!(buf, b"0\r\n\r\n");
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut wire = Vec::new();
        encode_chunk(&mut wire, b"part one ", false);
        encode_chunk(&mut wire, b"part two", true);
        let mut decoder = ChunkedDecoder::new(1024);
        assert!(matches!(
            decoder.decode(&wire).unwrap(),
            ChunkProgress::Complete { .. }
        ));
        assert_eq!(decoder.body, b"part one part two");
    }
}
