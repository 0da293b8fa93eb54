//! Byte streams and the take/drop split used to carve message bodies out of a
//! continuous connection stream.
//!
//! A [`ByteStream`] wraps any blocking [`Source`] (a socket, a TLS session, an
//! in-memory buffer). Splitting it yields a [`Take`] view bounded by a byte
//! count or by chunked framing, plus the remainder, which is just another
//! handle onto the same stream:
//!
//! ```
//! use httpony::stream::{ByteStream, InputStream};
//!
//! let stream = ByteStream::from_bytes("helloworld");
//! let (mut take, mut rest) = stream.split(5);
//!
//! // Reading the remainder first buffers what the take still owes.
//! assert_eq!(&rest.read(16).unwrap()[..], b"world");
//! assert_eq!(&take.read(16).unwrap()[..], b"hello");
//! assert!(take.is_done());
//! ```
//!
//! Nothing is read ahead of what a consumer asks for, except when the
//! remainder is read while a take still owes bytes: those are then pulled
//! into the take's own buffer so the shared cursor lands on the split point.

use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

pub mod chunked;

pub use chunked::{ChunkDecoder, ChunkedEncoder, encode_chunk};

/// Default size of the pieces produced by [`InputStream::into_chunks`].
pub const DEFAULT_BUFSIZE: usize = 1024;

/// Line terminator used on the wire.
pub const CRLF: &[u8] = b"\r\n";

/// A blocking byte source that a [`ByteStream`] can read from.
///
/// `shutdown` stops further reads. For duplex sockets only the read half is
/// shut down, so a response can still be written after the request stream
/// has been closed.
pub trait Source: Read + Send {
    fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Source for io::Cursor<Bytes> {}

impl Source for io::Cursor<Vec<u8>> {}

impl Source for std::fs::File {}

impl Source for TcpStream {
    fn shutdown(&mut self) -> io::Result<()> {
        match TcpStream::shutdown(self, Shutdown::Read) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

/// The input half of the stream interface.
///
/// `read` returns up to `size` bytes; an empty result means end of stream.
/// `read_line` returns everything up to and including the next `\n`, or an
/// empty result at end of stream.
pub trait InputStream {
    /// Reads up to `size` bytes.
    fn read(&mut self, size: usize) -> io::Result<Bytes>;

    /// Reads one line, terminator included.
    fn read_line(&mut self) -> io::Result<Bytes>;

    /// Closes the stream. Further reads return empty results.
    fn close(&mut self) -> io::Result<()>;

    /// Iterates over the remaining lines of the stream.
    fn read_lines(&mut self) -> Lines<'_, Self>
    where
        Self: Sized,
    {
        Lines {
            stream: self,
            finished: false,
        }
    }

    /// Converts the stream into a lazy, single-pass sequence of pieces of at
    /// most `size` bytes.
    fn into_chunks(self, size: usize) -> Chunks<Self>
    where
        Self: Sized,
    {
        Chunks {
            stream: self,
            size: size.max(1),
            finished: false,
        }
    }
}

/// Iterator returned by [`InputStream::read_lines`].
pub struct Lines<'a, S> {
    stream: &'a mut S,
    finished: bool,
}

impl<S: InputStream> Iterator for Lines<'_, S> {
    type Item = io::Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.stream.read_line() {
            Ok(line) if line.is_empty() => {
                self.finished = true;
                None
            }
            Ok(line) => Some(Ok(line)),
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Iterator returned by [`InputStream::into_chunks`].
pub struct Chunks<S> {
    stream: S,
    size: usize,
    finished: bool,
}

impl<S: InputStream> Iterator for Chunks<S> {
    type Item = io::Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.stream.read(self.size) {
            Ok(chunk) if chunk.is_empty() => {
                self.finished = true;
                None
            }
            Ok(chunk) => Some(Ok(chunk)),
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Wraps a line iterator, stripping trailing `\r` and `\n` from every line.
pub fn stripped_lines<I>(lines: I) -> impl Iterator<Item = io::Result<Bytes>>
where
    I: IntoIterator<Item = io::Result<Bytes>>,
{
    lines.into_iter().map(|line| {
        line.map(|mut line| {
            let keep = line
                .iter()
                .rposition(|b| *b != b'\r' && *b != b'\n')
                .map_or(0, |pos| pos + 1);
            line.truncate(keep);
            line
        })
    })
}

/// Maps an input stream onto an output writer through a function that
/// produces chunks.
pub fn interact<S, W, F, I>(input: S, output: &mut W, f: F) -> io::Result<()>
where
    W: Write,
    F: FnOnce(S) -> I,
    I: IntoIterator<Item = io::Result<Bytes>>,
{
    for chunk in f(input) {
        output.write_all(&chunk?)?;
    }
    output.flush()
}

// How far a take view extends into the underlying stream.
#[derive(Debug)]
enum Bound {
    Length(u64),
    Chunked(ChunkDecoder),
    UntilClose { finished: bool },
}

impl Bound {
    fn is_exhausted(&self) -> bool {
        match self {
            Bound::Length(remaining) => *remaining == 0,
            Bound::Chunked(decoder) => decoder.is_done(),
            Bound::UntilClose { finished } => *finished,
        }
    }
}

// A take view that has not been read to its end yet. `spill` receives its
// bytes when the remainder is read first; a dead `Weak` means nobody will
// ever read them and they are discarded.
struct Pending {
    bound: Bound,
    spill: Weak<Mutex<BytesMut>>,
}

struct Core {
    reader: BufReader<Box<dyn Source>>,
    pending: VecDeque<Pending>,
    closed: bool,
}

impl Core {
    fn read_raw(&mut self, size: usize) -> io::Result<Bytes> {
        if self.closed || size == 0 {
            return Ok(Bytes::new());
        }
        read_buffered(&mut self.reader, size)
    }

    fn read_line_raw(&mut self, limit: usize) -> io::Result<Bytes> {
        if self.closed || limit == 0 {
            return Ok(Bytes::new());
        }
        let limit = u64::try_from(limit).unwrap_or(u64::MAX);
        let mut line = Vec::new();
        (&mut self.reader).take(limit).read_until(b'\n', &mut line)?;
        Ok(Bytes::from(line))
    }

    // Reads the next piece of the front pending take.
    fn read_front(&mut self, size: usize) -> io::Result<Bytes> {
        let Core {
            reader,
            pending,
            closed,
        } = self;
        let Some(front) = pending.front_mut() else {
            return Ok(Bytes::new());
        };
        if *closed {
            pending.pop_front();
            return Ok(Bytes::new());
        }
        let data = match &mut front.bound {
            Bound::Length(remaining) => {
                if *remaining == 0 {
                    Bytes::new()
                } else {
                    let want = size.min(usize::try_from(*remaining).unwrap_or(usize::MAX));
                    let data = read_buffered(reader, want)?;
                    if data.is_empty() {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("stream ended with {remaining} body bytes outstanding"),
                        ));
                    }
                    *remaining -= data.len() as u64;
                    data
                }
            }
            Bound::Chunked(decoder) => decoder.read(reader, size)?,
            Bound::UntilClose { finished } => {
                let data = read_buffered(reader, size)?;
                if data.is_empty() {
                    *finished = true;
                }
                data
            }
        };
        if front.bound.is_exhausted() {
            pending.pop_front();
        }
        Ok(data)
    }

    // Drains the first `count` pending takes into their spill buffers.
    fn force(&mut self, count: usize) -> io::Result<()> {
        for _ in 0..count.min(self.pending.len()) {
            let spill = match self.pending.front() {
                Some(front) => front.spill.upgrade(),
                None => break,
            };
            loop {
                let data = self.read_front(DEFAULT_BUFSIZE * 8)?;
                if data.is_empty() {
                    break;
                }
                if let Some(spill) = &spill {
                    spill.lock().extend_from_slice(&data);
                }
            }
            // read_front pops the take once its bound is exhausted; a closed
            // stream can leave it queued.
            if let Some(front) = self.pending.front() {
                if spill
                    .as_ref()
                    .is_some_and(|s| std::ptr::eq(front.spill.as_ptr(), Arc::as_ptr(s)))
                {
                    self.pending.pop_front();
                }
            }
        }
        Ok(())
    }

    fn force_all(&mut self) -> io::Result<()> {
        self.force(self.pending.len())
    }

    fn position_of(&self, spill: &Arc<Mutex<BytesMut>>) -> Option<usize> {
        self.pending
            .iter()
            .position(|p| std::ptr::eq(p.spill.as_ptr(), Arc::as_ptr(spill)))
    }
}

fn read_buffered<R: BufRead>(reader: &mut R, size: usize) -> io::Result<Bytes> {
    let available = loop {
        match reader.fill_buf() {
            Ok(buf) => break buf,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    };
    let n = size.min(available.len());
    let data = Bytes::copy_from_slice(&available[..n]);
    reader.consume(n);
    Ok(data)
}

/// A handle onto a continuous byte stream.
///
/// Handles are cheap to clone; all clones share one read cursor. Reading from
/// a handle first settles every outstanding [`Take`] so the cursor is past
/// their bytes.
#[derive(Clone)]
pub struct ByteStream {
    core: Arc<Mutex<Core>>,
}

impl ByteStream {
    /// Wraps a blocking source.
    pub fn new(source: impl Source + 'static) -> Self {
        Self::with_capacity(DEFAULT_BUFSIZE * 8, source)
    }

    /// Wraps a blocking source with a read buffer of `capacity` bytes.
    pub fn with_capacity(capacity: usize, source: impl Source + 'static) -> Self {
        let source: Box<dyn Source> = Box::new(source);
        Self {
            core: Arc::new(Mutex::new(Core {
                reader: BufReader::with_capacity(capacity, source),
                pending: VecDeque::new(),
                closed: false,
            })),
        }
    }

    /// An in-memory stream over `data`.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self::new(io::Cursor::new(data.into()))
    }

    /// Splits off the next `n` bytes.
    ///
    /// Returns the bounded take view and the remainder (drop) view.
    pub fn split(&self, n: u64) -> (Take, ByteStream) {
        self.split_with(Bound::Length(n))
    }

    /// Splits off a chunked-encoded body, decoded by `decoder`.
    pub fn split_at_chunks(&self, decoder: ChunkDecoder) -> (Take, ByteStream) {
        self.split_with(Bound::Chunked(decoder))
    }

    /// Splits off everything up to the end of the stream.
    pub fn split_until_close(&self) -> (Take, ByteStream) {
        self.split_with(Bound::UntilClose { finished: false })
    }

    fn split_with(&self, bound: Bound) -> (Take, ByteStream) {
        let spill = Arc::new(Mutex::new(BytesMut::new()));
        self.core.lock().pending.push_back(Pending {
            bound,
            spill: Arc::downgrade(&spill),
        });
        let take = Take {
            core: Arc::clone(&self.core),
            spill,
            closed: false,
        };
        (take, self.clone())
    }

    /// Reads one line of at most `limit` bytes, terminator included.
    ///
    /// A result of exactly `limit` bytes without a trailing `\n` means the
    /// line was cut short; the rest of it is still unread.
    pub fn read_line_limited(&mut self, limit: usize) -> io::Result<Bytes> {
        let mut core = self.core.lock();
        core.force_all()?;
        core.read_line_raw(limit)
    }

    /// Returns `true` once the stream has been closed.
    pub fn is_closed(&self) -> bool {
        self.core.lock().closed
    }
}

impl InputStream for ByteStream {
    fn read(&mut self, size: usize) -> io::Result<Bytes> {
        let mut core = self.core.lock();
        core.force_all()?;
        core.read_raw(size)
    }

    fn read_line(&mut self) -> io::Result<Bytes> {
        let mut core = self.core.lock();
        core.force_all()?;
        core.read_line_raw(usize::MAX)
    }

    /// Settles outstanding takes, then shuts the source down.
    fn close(&mut self) -> io::Result<()> {
        let mut core = self.core.lock();
        if core.closed {
            return Ok(());
        }
        let forced = core.force_all();
        core.closed = true;
        core.pending.clear();
        let shutdown = core.reader.get_mut().shutdown();
        forced.and(shutdown)
    }
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.core.lock();
        f.debug_struct("ByteStream")
            .field("pending", &core.pending.len())
            .field("closed", &core.closed)
            .finish()
    }
}

/// The bounded view produced by [`ByteStream::split`] and
/// [`ByteStream::split_at_chunks`].
pub struct Take {
    core: Arc<Mutex<Core>>,
    spill: Arc<Mutex<BytesMut>>,
    closed: bool,
}

impl Take {
    /// Returns `true` once every byte of this view has been read.
    pub fn is_done(&self) -> bool {
        if self.closed {
            return true;
        }
        let core = self.core.lock();
        if !self.spill.lock().is_empty() {
            return false;
        }
        match core.position_of(&self.spill) {
            Some(i) => core.pending[i].bound.is_exhausted(),
            None => true,
        }
    }

    /// Pulls the rest of this view into its buffer, leaving the shared
    /// cursor just past it, and returns how many bytes are buffered.
    pub fn peek_all(&mut self) -> io::Result<usize> {
        let mut core = self.core.lock();
        if let Some(i) = core.position_of(&self.spill) {
            core.force(i + 1)?;
        }
        Ok(self.spill.lock().len())
    }
}

impl InputStream for Take {
    fn read(&mut self, size: usize) -> io::Result<Bytes> {
        if self.closed || size == 0 {
            return Ok(Bytes::new());
        }
        let mut core = self.core.lock();
        {
            let mut spill = self.spill.lock();
            if !spill.is_empty() {
                let n = size.min(spill.len());
                return Ok(spill.split_to(n).freeze());
            }
        }
        match core.position_of(&self.spill) {
            None => Ok(Bytes::new()),
            Some(i) => {
                // Earlier takes sit between the cursor and this one.
                core.force(i)?;
                core.read_front(size)
            }
        }
    }

    fn read_line(&mut self) -> io::Result<Bytes> {
        let mut line = BytesMut::new();
        loop {
            let byte = self.read(1)?;
            if byte.is_empty() {
                break;
            }
            line.extend_from_slice(&byte);
            if byte[0] == b'\n' {
                break;
            }
        }
        Ok(line.freeze())
    }

    /// Abandons the rest of this view. Its bytes are still skipped on the
    /// shared stream, but are no longer buffered.
    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        self.spill.lock().clear();
        let mut core = self.core.lock();
        if let Some(i) = core.position_of(&self.spill) {
            core.pending[i].spill = Weak::new();
        }
        Ok(())
    }
}

impl std::fmt::Debug for Take {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Take")
            .field("buffered", &self.spill.lock().len())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain<S: InputStream>(s: &mut S) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let chunk = s.read(3).unwrap();
            if chunk.is_empty() {
                return out;
            }
            out.extend_from_slice(&chunk);
        }
    }

    #[test]
    fn read_n_and_read_all() {
        let mut s = ByteStream::from_bytes("foo bar baz");
        assert_eq!(&s.read(7).unwrap()[..], b"foo bar");
        assert_eq!(&s.read(100).unwrap()[..], b" baz");
        assert!(s.read(100).unwrap().is_empty());
    }

    #[test]
    fn read_line_keeps_terminator() {
        let mut s = ByteStream::from_bytes("foo\nbar\nbaz\n");
        assert_eq!(&s.read_line().unwrap()[..], b"foo\n");
        assert_eq!(&s.read_line().unwrap()[..], b"bar\n");
    }

    #[test]
    fn limited_line_stops_at_limit() {
        let mut s = ByteStream::from_bytes("abcdefgh\nrest\n");
        assert_eq!(&s.read_line_limited(4).unwrap()[..], b"abcd");
        assert_eq!(&s.read_line_limited(64).unwrap()[..], b"efgh\n");
        assert_eq!(&s.read_line_limited(5).unwrap()[..], b"rest\n");
        assert!(s.read_line_limited(5).unwrap().is_empty());
    }

    #[test]
    fn read_lines_iterates_all() {
        let mut s = ByteStream::from_bytes("foo\nbar\nbaz\n");
        let lines: Vec<_> = s.read_lines().map(Result::unwrap).collect();
        assert_eq!(lines, vec!["foo\n", "bar\n", "baz\n"]);
    }

    #[test]
    fn into_chunks_respects_size() {
        let s = ByteStream::from_bytes("foo\nbar\nbaz\n");
        let chunks: Vec<_> = s.into_chunks(8).map(Result::unwrap).collect();
        assert_eq!(chunks, vec!["foo\nbar\n", "baz\n"]);
    }

    #[test]
    fn stripped_lines_removes_line_endings() {
        let lines = vec![
            Ok(Bytes::from_static(b"foo\n")),
            Ok(Bytes::from_static(b"bar\r\n")),
            Ok(Bytes::from_static(b"baz")),
        ];
        let out: Vec<_> = stripped_lines(lines).map(Result::unwrap).collect();
        assert_eq!(out, vec!["foo", "bar", "baz"]);
    }

    #[test]
    fn interact_maps_input_to_output() {
        let input = ByteStream::from_bytes("foo\nbar\nbaz\n");
        let mut output = Vec::new();
        interact(input, &mut output, |mut s| {
            let lines: Vec<_> = stripped_lines(s.read_lines()).collect();
            lines.into_iter().map(|line| {
                line.map(|l| {
                    let mut up: Vec<u8> = l.to_ascii_uppercase().into_iter().rev().collect();
                    up.push(b'\n');
                    Bytes::from(up)
                })
            })
        })
        .unwrap();
        assert_eq!(output, b"OOF\nRAB\nZAB\n");
    }

    #[test]
    fn take_then_drop_reconstructs_stream() {
        let data = b"0123456789abcdef";
        for n in 0..=data.len() {
            let stream = ByteStream::from_bytes(&data[..]);
            let (mut take, mut rest) = stream.split(n as u64);
            let head = drain(&mut take);
            assert!(take.is_done());
            let tail = drain(&mut rest);
            assert_eq!(head, &data[..n], "split at {n}");
            assert_eq!(tail, &data[n..], "split at {n}");
        }
    }

    #[test]
    fn drop_then_take_reconstructs_stream() {
        let data = b"0123456789abcdef";
        for n in 0..=data.len() {
            let stream = ByteStream::from_bytes(&data[..]);
            let (mut take, mut rest) = stream.split(n as u64);
            let tail = drain(&mut rest);
            let head = drain(&mut take);
            assert_eq!(head, &data[..n], "split at {n}");
            assert_eq!(tail, &data[n..], "split at {n}");
        }
    }

    #[test]
    fn partially_read_take_is_forced_by_drop() {
        let stream = ByteStream::from_bytes("hello world");
        let (mut take, mut rest) = stream.split(5);
        assert_eq!(&take.read(2).unwrap()[..], b"he");
        assert_eq!(&rest.read(100).unwrap()[..], b" world");
        assert_eq!(&take.read(100).unwrap()[..], b"llo");
        assert!(take.is_done());
    }

    #[test]
    fn dropped_take_is_skipped() {
        let stream = ByteStream::from_bytes("skipme|rest");
        let (take, mut rest) = stream.split(7);
        drop(take);
        assert_eq!(drain(&mut rest), b"rest");
    }

    #[test]
    fn consecutive_splits_read_out_of_order() {
        let stream = ByteStream::from_bytes("aaabbbccc");
        let (mut first, rest) = stream.split(3);
        let (mut second, mut rest) = rest.split(3);
        assert_eq!(drain(&mut second), b"bbb");
        assert_eq!(drain(&mut rest), b"ccc");
        assert_eq!(drain(&mut first), b"aaa");
    }

    #[test]
    fn take_read_line_stops_at_bound() {
        let stream = ByteStream::from_bytes("ab\ncd\nef");
        let (mut take, mut rest) = stream.split(4);
        assert_eq!(&take.read_line().unwrap()[..], b"ab\n");
        assert_eq!(&take.read_line().unwrap()[..], b"c");
        assert!(take.read_line().unwrap().is_empty());
        assert_eq!(&rest.read_line().unwrap()[..], b"d\n");
    }

    #[test]
    fn split_at_chunks_then_drop() {
        let stream = ByteStream::from_bytes("3\r\nfoo\r\n4\r\nbarz\r\n0\r\n\r\nNEXT");
        let (mut take, mut rest) = stream.split_at_chunks(ChunkDecoder::new());
        assert_eq!(drain(&mut rest), b"NEXT");
        assert_eq!(drain(&mut take), b"foobarz");
        assert!(take.is_done());
    }

    #[test]
    fn truncated_body_is_an_error() {
        let stream = ByteStream::from_bytes("abc");
        let (mut take, _rest) = stream.split(10);
        assert_eq!(&take.read(3).unwrap()[..], b"abc");
        let err = take.read(3).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn peek_all_buffers_remainder() {
        let stream = ByteStream::from_bytes("abcdef");
        let (mut take, mut rest) = stream.split(4);
        assert_eq!(take.peek_all().unwrap(), 4);
        assert_eq!(drain(&mut rest), b"ef");
        assert_eq!(drain(&mut take), b"abcd");
    }

    #[test]
    fn closed_stream_reads_empty() {
        let mut s = ByteStream::from_bytes("data");
        s.close().unwrap();
        assert!(s.is_closed());
        assert!(s.read(4).unwrap().is_empty());
        assert!(s.read_line().unwrap().is_empty());
    }

    #[test]
    fn close_keeps_outstanding_take_readable() {
        let mut stream = ByteStream::from_bytes("bodyNEXT");
        let (mut take, _) = stream.split(4);
        stream.close().unwrap();
        assert_eq!(drain(&mut take), b"body");
    }
}
