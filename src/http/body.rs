//! Message bodies: buffered bytes or a lazily produced chunk sequence.
//!
//! A streaming body is consumed at most once. [`Body::force`] materialises it
//! into a single cached chunk; after that the body is buffered and can be
//! read any number of times.

use std::fmt;
use std::io::{self, Read};

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::stream::{DEFAULT_BUFSIZE, InputStream};

/// Errors produced while reading a body.
#[derive(Debug, Error)]
pub enum BodyError {
    #[error("body has already been consumed")]
    Consumed,

    #[error("I/O error while reading body: {0}")]
    Io(#[from] io::Error),

    #[error("body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Boxed, sendable chunk producer.
pub type ChunkIter = Box<dyn Iterator<Item = io::Result<Bytes>> + Send>;

enum Inner {
    Buffered(Bytes),
    Streaming { chunks: ChunkIter, len: Option<u64> },
    Consumed { len: Option<u64> },
}

/// An HTTP message body.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use httpony::http::Body;
///
/// let mut body = Body::stream(vec![Bytes::from("a"), Bytes::from("b")]);
/// assert_eq!(body.len(), None);
/// assert_eq!(&body.force().unwrap()[..], b"ab");
/// assert_eq!(body.len(), Some(2));
/// ```
pub struct Body {
    inner: Inner,
}

impl Body {
    /// An empty buffered body.
    pub fn empty() -> Self {
        Self::from_bytes(Bytes::new())
    }

    /// A buffered body.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self {
            inner: Inner::Buffered(bytes.into()),
        }
    }

    /// A streaming body of unknown length from infallible chunks.
    pub fn stream<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Bytes>,
        I::IntoIter: Send + 'static,
    {
        Self::try_stream(chunks.into_iter().map(Ok), None)
    }

    /// A streaming body from fallible chunks, with an optional known length.
    pub fn try_stream<I>(chunks: I, len: Option<u64>) -> Self
    where
        I: IntoIterator<Item = io::Result<Bytes>>,
        I::IntoIter: Send + 'static,
    {
        Self {
            inner: Inner::Streaming {
                chunks: Box::new(chunks.into_iter()),
                len,
            },
        }
    }

    /// A streaming body read from `reader` in [`DEFAULT_BUFSIZE`] pieces.
    ///
    /// This is the form a file-serving layer hands over: `len` is the size
    /// when it is known up front.
    pub fn from_reader<R>(reader: R, len: Option<u64>) -> Self
    where
        R: Read + Send + 'static,
    {
        Self::try_stream(ReaderChunks { reader, done: false }, len)
    }

    /// A streaming body read from an input stream, typically the take view
    /// of a connection.
    pub fn from_input<S>(stream: S, len: Option<u64>) -> Self
    where
        S: InputStream + Send + 'static,
    {
        Self::try_stream(stream.into_chunks(DEFAULT_BUFSIZE), len)
    }

    /// The total length, if known without reading the body.
    pub fn len(&self) -> Option<u64> {
        match &self.inner {
            Inner::Buffered(bytes) => Some(bytes.len() as u64),
            Inner::Streaming { len, .. } | Inner::Consumed { len } => *len,
        }
    }

    /// `true` for a known-empty body.
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    pub fn is_buffered(&self) -> bool {
        matches!(self.inner, Inner::Buffered(_))
    }

    pub fn is_consumed(&self) -> bool {
        matches!(self.inner, Inner::Consumed { .. })
    }

    /// Returns the buffered bytes without reading anything.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match &self.inner {
            Inner::Buffered(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Materialises the body into a single cached chunk.
    ///
    /// Idempotent: once buffered, later calls return the cached bytes
    /// without touching the original source.
    pub fn force(&mut self) -> Result<&Bytes, BodyError> {
        if let Inner::Streaming { .. } = self.inner {
            let mut buf = BytesMut::new();
            for chunk in self.take_chunks()? {
                buf.extend_from_slice(&chunk?);
            }
            self.inner = Inner::Buffered(buf.freeze());
        }
        match &self.inner {
            Inner::Buffered(bytes) => Ok(bytes),
            _ => Err(BodyError::Consumed),
        }
    }

    /// Hands out the body's chunks.
    ///
    /// A buffered body yields its bytes and stays readable; a streaming body
    /// is consumed and any later read fails with [`BodyError::Consumed`].
    pub fn take_chunks(&mut self) -> Result<BodyChunks, BodyError> {
        match &self.inner {
            Inner::Buffered(bytes) => Ok(BodyChunks::Once(Some(bytes.clone()))),
            Inner::Consumed { .. } => Err(BodyError::Consumed),
            Inner::Streaming { len, .. } => {
                let len = *len;
                match std::mem::replace(&mut self.inner, Inner::Consumed { len }) {
                    Inner::Streaming { chunks, .. } => Ok(BodyChunks::Stream(chunks)),
                    _ => Err(BodyError::Consumed),
                }
            }
        }
    }

    /// Reads and throws away the rest of a streaming body.
    pub fn discard(&mut self) -> Result<(), BodyError> {
        if let Inner::Streaming { .. } = self.inner {
            for chunk in self.take_chunks()? {
                chunk?;
            }
        }
        Ok(())
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Inner::Buffered(bytes) => f.debug_tuple("Buffered").field(bytes).finish(),
            Inner::Streaming { len, .. } => f.debug_struct("Streaming").field("len", len).finish(),
            Inner::Consumed { .. } => f.write_str("Consumed"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Self::from_bytes(s)
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Self::from_bytes(Bytes::from_static(s.as_bytes()))
    }
}

impl From<&'static [u8]> for Body {
    fn from(s: &'static [u8]) -> Self {
        Self::from_bytes(Bytes::from_static(s))
    }
}

/// Iterator returned by [`Body::take_chunks`].
pub enum BodyChunks {
    Once(Option<Bytes>),
    Stream(ChunkIter),
}

impl Iterator for BodyChunks {
    type Item = io::Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            BodyChunks::Once(bytes) => bytes.take().filter(|b| !b.is_empty()).map(Ok),
            BodyChunks::Stream(chunks) => chunks.next(),
        }
    }
}

struct ReaderChunks<R> {
    reader: R,
    done: bool,
}

impl<R: Read> Iterator for ReaderChunks<R> {
    type Item = io::Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut buf = vec![0u8; DEFAULT_BUFSIZE];
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(n) => {
                    buf.truncate(n);
                    return Some(Ok(Bytes::from(buf)));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::stream::ByteStream;

    #[test]
    fn buffered_body_is_rereadable() {
        let mut body = Body::from("hello");
        assert_eq!(body.len(), Some(5));
        let first: Vec<_> = body.take_chunks().unwrap().map(Result::unwrap).collect();
        let second: Vec<_> = body.take_chunks().unwrap().map(Result::unwrap).collect();
        assert_eq!(first, second);
        assert_eq!(first, vec!["hello"]);
    }

    #[test]
    fn empty_body_yields_no_chunks() {
        let mut body = Body::empty();
        assert!(body.is_empty());
        assert_eq!(body.take_chunks().unwrap().count(), 0);
    }

    #[test]
    fn streaming_body_is_consumed_once() {
        let mut body = Body::stream(vec![Bytes::from("a"), Bytes::from("b")]);
        let chunks: Vec<_> = body.take_chunks().unwrap().map(Result::unwrap).collect();
        assert_eq!(chunks, vec!["a", "b"]);
        assert!(body.is_consumed());
        assert!(matches!(body.take_chunks(), Err(BodyError::Consumed)));
        assert!(matches!(body.force(), Err(BodyError::Consumed)));
    }

    #[test]
    fn force_is_idempotent_and_reads_source_once() {
        let pulls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pulls);
        let chunks = ["x", "y", "z"].into_iter().map(move |s| {
            counter.fetch_add(1, Ordering::SeqCst);
            Bytes::from_static(s.as_bytes())
        });
        let mut body = Body::stream(chunks);

        let first = body.force().unwrap().clone();
        let second = body.force().unwrap().clone();
        assert_eq!(first, "xyz");
        assert_eq!(first, second);
        assert_eq!(pulls.load(Ordering::SeqCst), 3);
        assert!(body.is_buffered());
    }

    #[test]
    fn from_reader_keeps_known_length() {
        let data = vec![7u8; DEFAULT_BUFSIZE * 2 + 10];
        let mut body = Body::from_reader(io::Cursor::new(data.clone()), Some(data.len() as u64));
        assert_eq!(body.len(), Some(data.len() as u64));
        assert_eq!(&body.force().unwrap()[..], &data[..]);
    }

    #[test]
    fn from_input_reads_take_view() {
        let stream = ByteStream::from_bytes("bodyrest");
        let (take, _rest) = stream.split(4);
        let mut body = Body::from_input(take, Some(4));
        assert_eq!(&body.force().unwrap()[..], b"body");
    }

    #[test]
    fn stream_errors_surface() {
        let mut body = Body::try_stream(
            vec![Ok(Bytes::from("a")), Err(io::Error::other("boom"))],
            None,
        );
        assert!(matches!(body.force(), Err(BodyError::Io(_))));
    }
}
