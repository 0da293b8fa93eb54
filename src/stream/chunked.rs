//! Chunked transfer coding (RFC 9112 §7.1).

use std::io::{self, BufRead};

use bytes::{BufMut, Bytes, BytesMut};

use crate::http::codec::ParseError;

/// Terminating zero-length chunk followed by an empty trailer section.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size,
    Data,
    DataEnd,
    Done,
}

/// Incremental decoder for a chunked body.
///
/// Reads a hex length line, yields that many payload bytes, and finishes on
/// a zero-length chunk once the trailer section's blank line is consumed.
/// A malformed length line is an [`io::ErrorKind::InvalidData`] error
/// wrapping [`ParseError::InvalidChunkSize`].
#[derive(Debug, Clone)]
pub struct ChunkDecoder {
    state: State,
    remaining: u64,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Size,
            remaining: 0,
        }
    }

    /// Returns `true` once the terminating chunk has been consumed.
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Reads up to `size` payload bytes. Returns an empty buffer when the
    /// body is complete.
    pub fn read<R: BufRead>(&mut self, reader: &mut R, size: usize) -> io::Result<Bytes> {
        loop {
            match self.state {
                State::Done => return Ok(Bytes::new()),
                State::Size => {
                    let line = read_line(reader)?;
                    if line.is_empty() {
                        return Err(eof("stream ended before chunk size"));
                    }
                    let len = parse_chunk_size(&line)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    if len == 0 {
                        skip_trailers(reader)?;
                        self.state = State::Done;
                        return Ok(Bytes::new());
                    }
                    self.remaining = len;
                    self.state = State::Data;
                }
                State::Data => {
                    let want = size.max(1).min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
                    let buf = reader.fill_buf()?;
                    if buf.is_empty() {
                        return Err(eof("stream ended inside chunk"));
                    }
                    let n = want.min(buf.len());
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    reader.consume(n);
                    self.remaining -= n as u64;
                    if self.remaining == 0 {
                        self.state = State::DataEnd;
                    }
                    return Ok(data);
                }
                State::DataEnd => {
                    let line = read_line(reader)?;
                    if line.as_slice() != b"\r\n" && line.as_slice() != b"\n" {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            ParseError::InvalidChunkSize(String::from_utf8_lossy(&line).into_owned()),
                        ));
                    }
                    self.state = State::Size;
                }
            }
        }
    }
}

fn read_line<R: BufRead>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line)?;
    Ok(line)
}

fn eof(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, msg)
}

// Trailer fields are read and dropped up to the closing blank line.
fn skip_trailers<R: BufRead>(reader: &mut R) -> io::Result<()> {
    loop {
        let line = read_line(reader)?;
        if line.is_empty() || line.as_slice() == b"\r\n" || line.as_slice() == b"\n" {
            return Ok(());
        }
    }
}

/// Parses a chunk-size line such as `1a;ext=1\r\n`.
pub fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let invalid = || ParseError::InvalidChunkSize(String::from_utf8_lossy(line).trim().to_owned());
    let text = std::str::from_utf8(line).map_err(|_| invalid())?;
    let size = text.split(';').next().unwrap_or("").trim();
    if size.is_empty() {
        return Err(invalid());
    }
    u64::from_str_radix(size, 16).map_err(|_| invalid())
}

/// Frames one chunk as `<hex-length>\r\n<bytes>\r\n`.
pub fn encode_chunk(data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(data.len() + 20);
    buf.put(format!("{:x}\r\n", data.len()).as_bytes());
    buf.put(data);
    buf.put(&b"\r\n"[..]);
    buf.freeze()
}

/// Adapts a chunk sequence into its chunked wire framing, including the
/// terminating zero-length chunk.
///
/// Empty input chunks are skipped; on the wire they would end the body.
pub struct ChunkedEncoder<I> {
    chunks: I,
    finished: bool,
}

impl<I> ChunkedEncoder<I> {
    pub fn new(chunks: I) -> Self {
        Self {
            chunks,
            finished: false,
        }
    }
}

impl<I> Iterator for ChunkedEncoder<I>
where
    I: Iterator<Item = io::Result<Bytes>>,
{
    type Item = io::Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            match self.chunks.next() {
                Some(Ok(chunk)) if chunk.is_empty() => continue,
                Some(Ok(chunk)) => return Some(Ok(encode_chunk(&chunk))),
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e));
                }
                None => {
                    self.finished = true;
                    return Some(Ok(Bytes::from_static(LAST_CHUNK)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(wire: &[u8]) -> io::Result<Vec<u8>> {
        let mut reader = io::Cursor::new(wire.to_vec());
        let mut decoder = ChunkDecoder::new();
        let mut out = Vec::new();
        loop {
            let piece = decoder.read(&mut reader, 4)?;
            if piece.is_empty() {
                assert!(decoder.is_done());
                return Ok(out);
            }
            out.extend_from_slice(&piece);
        }
    }

    #[test]
    fn chunk_size_parsing() {
        assert_eq!(parse_chunk_size(b"1a\r\n").unwrap(), 26);
        assert_eq!(parse_chunk_size(b"FF;name=value\r\n").unwrap(), 255);
        assert_eq!(parse_chunk_size(b"0\r\n").unwrap(), 0);
        assert!(parse_chunk_size(b"zz\r\n").is_err());
        assert!(parse_chunk_size(b"\r\n").is_err());
    }

    #[test]
    fn decodes_multiple_chunks() {
        let wire = b"5\r\nhello\r\n1\r\n \r\n5\r\nworld\r\n0\r\n\r\n";
        assert_eq!(decode_all(wire).unwrap(), b"hello world");
    }

    #[test]
    fn skips_trailer_fields() {
        let wire = b"3\r\nabc\r\n0\r\nX-Trailer: yes\r\n\r\n";
        assert_eq!(decode_all(wire).unwrap(), b"abc");
    }

    #[test]
    fn malformed_size_line_is_invalid_data() {
        let err = decode_all(b"nope\r\nabc\r\n0\r\n\r\n").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn missing_chunk_terminator_is_invalid_data() {
        let err = decode_all(b"3\r\nabcX\r\n0\r\n\r\n").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_body_is_eof() {
        let err = decode_all(b"a\r\nabc").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn encode_then_decode_is_identity() {
        let chunks = vec!["a", "bcd", "efghijklmnop", "q"];
        let wire: Vec<u8> = ChunkedEncoder::new(
            chunks.iter().map(|c| Ok(Bytes::copy_from_slice(c.as_bytes()))),
        )
        .map(Result::unwrap)
        .flat_map(|b| b.to_vec())
        .collect();
        assert!(wire.ends_with(LAST_CHUNK));
        assert_eq!(decode_all(&wire).unwrap(), chunks.concat().as_bytes());
    }

    #[test]
    fn encoder_skips_empty_chunks() {
        let framed: Vec<_> = ChunkedEncoder::new(
            vec![Ok(Bytes::new()), Ok(Bytes::from_static(b"x"))].into_iter(),
        )
        .map(Result::unwrap)
        .collect();
        assert_eq!(framed, vec![&b"1\r\nx\r\n"[..], LAST_CHUNK]);
    }
}
