//! HTTP/1.1 message framing.
//!
//! Parsing turns a [`ByteStream`] into a sequence of messages: blank lines
//! are skipped, a start line is read, then header lines up to the empty line
//! that ends the header block. The header block itself is parsed with
//! [`httparse`]. The body is whatever follows; it is carved out of the stream
//! with [`ByteStream::split`] or [`ByteStream::split_at_chunks`] so the next
//! message can be read without buffering this one.
//!
//! Serialisation writes the start line, the headers and the body, choosing
//! `Content-Length` framing when the body's length is known and chunked
//! transfer coding otherwise.

use std::io::{self, Write};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, trace, warn};

use super::{
    Body, BodyError, Headers, Method, Request, Response, StatusCode, UriError, Uri, Version,
};
use crate::stream::{ByteStream, CRLF, ChunkDecoder, ChunkedEncoder, InputStream};

/// Maximum number of header fields accepted in one message.
pub const MAX_HEADERS: usize = 64;

/// Maximum size of a message head (start line plus header block), 64 KiB.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Errors produced while parsing a message off the wire.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid start line: {0:?}")]
    InvalidStartLine(String),

    #[error("malformed header block: {0}")]
    Header(#[from] httparse::Error),

    #[error("header block is incomplete")]
    InvalidHeader,

    #[error("invalid chunk size line: {0:?}")]
    InvalidChunkSize(String),

    #[error("invalid Content-Length: {0:?}")]
    InvalidContentLength(String),

    #[error("invalid status code: {0:?}")]
    InvalidStatus(String),

    #[error("unsupported HTTP version: {0:?}")]
    InvalidVersion(String),

    #[error("message head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("invalid request target: {0}")]
    InvalidUri(#[from] UriError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A message as it comes off the wire, before it is read as a request or a
/// response. `body` is the stream positioned at the first body byte.
#[derive(Debug)]
pub struct GenericMessage {
    pub start_line: String,
    pub headers: Headers,
    pub body: ByteStream,
}

/// How the body of a message is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    /// No body at all.
    Empty,
    /// Exactly this many bytes follow.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// Everything until the peer closes the connection.
    UntilClose,
}

impl BodyLength {
    /// Works out the body framing from the headers.
    ///
    /// A chunked `Transfer-Encoding` wins over `Content-Length`. Without
    /// either, a request has no body and a response runs until close.
    pub fn from_headers(headers: &Headers, until_close: bool) -> Result<Self, ParseError> {
        if headers.has_token("transfer-encoding", "chunked") {
            return Ok(BodyLength::Chunked);
        }
        match headers.get("content-length") {
            Some(value) => {
                let len = value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| ParseError::InvalidContentLength(value.to_owned()))?;
                Ok(if len == 0 {
                    BodyLength::Empty
                } else {
                    BodyLength::Length(len)
                })
            }
            None if until_close => Ok(BodyLength::UntilClose),
            None => Ok(BodyLength::Empty),
        }
    }
}

/// Reads the next message head off `stream`.
///
/// Returns `Ok(None)` when the stream ends before a complete header block,
/// whether that is between messages or in the middle of one.
/// A head larger than [`MAX_HEAD_SIZE`] is [`ParseError::HeadTooLarge`].
pub fn read_message(stream: &mut ByteStream) -> Result<Option<GenericMessage>, ParseError> {
    let mut budget = MAX_HEAD_SIZE;
    let start_line = loop {
        let line = read_head_line(stream, &mut budget)?;
        if line.is_empty() {
            return Ok(None);
        }
        if line.as_ref() != CRLF && line.as_ref() != b"\n" {
            break line;
        }
    };
    let start_line = String::from_utf8_lossy(trim_eol(&start_line)).into_owned();

    let mut block = BytesMut::new();
    loop {
        let line = read_head_line(stream, &mut budget)?;
        if line.is_empty() {
            debug!(start_line = %start_line, "stream closed inside header block");
            return Ok(None);
        }
        let line = trim_eol(&line);
        block.extend_from_slice(line);
        block.extend_from_slice(CRLF);
        if line.is_empty() {
            break;
        }
    }

    let headers = parse_header_block(&block)?;
    trace!(start_line = %start_line, headers = headers.len(), "parsed message head");
    Ok(Some(GenericMessage {
        start_line,
        headers,
        body: stream.clone(),
    }))
}

// Reads a line of the head, charging it against what is left of the head
// budget.
fn read_head_line(stream: &mut ByteStream, budget: &mut usize) -> Result<Bytes, ParseError> {
    let line = stream.read_line_limited(*budget)?;
    if line.len() == *budget && !line.ends_with(b"\n") {
        return Err(ParseError::HeadTooLarge(MAX_HEAD_SIZE));
    }
    *budget -= line.len();
    Ok(line)
}

fn trim_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_header_block(block: &[u8]) -> Result<Headers, ParseError> {
    let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
    match httparse::parse_headers(block, &mut raw)? {
        httparse::Status::Complete((_, parsed)) => {
            let mut headers = Headers::with_capacity(parsed.len());
            for header in parsed {
                let value = String::from_utf8_lossy(header.value);
                headers.insert(header.name, value.trim());
            }
            Ok(headers)
        }
        httparse::Status::Partial => Err(ParseError::InvalidHeader),
    }
}

/// Carves the body described by `length` out of `stream`.
///
/// Returns the body and the stream positioned after it.
pub fn split_body(stream: &ByteStream, length: BodyLength) -> (Body, ByteStream) {
    match length {
        BodyLength::Empty => (Body::empty(), stream.clone()),
        BodyLength::Length(n) => {
            let (take, rest) = stream.split(n);
            (Body::from_input(take, Some(n)), rest)
        }
        BodyLength::Chunked => {
            let (take, rest) = stream.split_at_chunks(ChunkDecoder::new());
            (Body::from_input(take, None), rest)
        }
        BodyLength::UntilClose => {
            let (take, rest) = stream.split_until_close();
            (Body::from_input(take, None), rest)
        }
    }
}

/// Iterator over the raw messages of a stream.
///
/// The caller is responsible for splitting each message's body off its
/// `body` stream; otherwise the body bytes are read as the next message.
pub struct Messages {
    stream: ByteStream,
    done: bool,
}

/// Iterates over the raw messages of `stream`.
pub fn messages(stream: ByteStream) -> Messages {
    Messages {
        stream,
        done: false,
    }
}

impl Iterator for Messages {
    type Item = Result<GenericMessage, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = read_message(&mut self.stream).transpose();
        if !matches!(item, Some(Ok(_))) {
            self.done = true;
        }
        item
    }
}

/// Reads a [`GenericMessage`] as a request and splits off its body.
pub fn parse_request(msg: GenericMessage) -> Result<(Request, ByteStream), ParseError> {
    let mut parts = msg.start_line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::InvalidStartLine(msg.start_line));
    };
    if method.is_empty() || target.is_empty() {
        return Err(ParseError::InvalidStartLine(msg.start_line));
    }
    let method = Method::from(method);
    let version: Version = version.parse()?;
    let uri = Uri::parse(target)?;

    let length = BodyLength::from_headers(&msg.headers, false)?;
    let (body, rest) = split_body(&msg.body, length);
    let request = Request::from_parts(method, uri, version, msg.headers, body, Default::default());
    Ok((request, rest))
}

/// Reads a [`GenericMessage`] as the response to a `method` request and
/// splits off its body.
///
/// Responses to `HEAD` and 1xx, 204 and 304 responses never have a body.
pub fn parse_response(
    msg: GenericMessage,
    method: &Method,
) -> Result<(Response, ByteStream), ParseError> {
    let mut parts = msg.start_line.splitn(3, ' ');
    let (Some(version), Some(status)) = (parts.next(), parts.next()) else {
        return Err(ParseError::InvalidStartLine(msg.start_line));
    };
    let reason = parts.next().unwrap_or("").to_owned();
    let version: Version = version.parse()?;
    let status = status
        .parse::<u16>()
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| ParseError::InvalidStatus(status.to_owned()))?;

    let length = response_body_length(status, &msg.headers, method)?;
    let (body, rest) = split_body(&msg.body, length);
    let response = Response::from_parts(status, msg.headers)
        .with_version(version)
        .with_reason(reason)
        .with_body(body);
    Ok((response, rest))
}

/// Body framing of a response with `status` and `headers` to a `method`
/// request.
pub fn response_body_length(
    status: StatusCode,
    headers: &Headers,
    method: &Method,
) -> Result<BodyLength, ParseError> {
    if *method == Method::Head || !status.allows_body() {
        return Ok(BodyLength::Empty);
    }
    BodyLength::from_headers(headers, true)
}

/// Iterator over the requests sent on a connection.
///
/// After a request carrying `Connection: close` the stream is closed and the
/// iterator ends. A parse error is yielded once and ends the iterator.
pub struct Requests {
    stream: ByteStream,
    done: bool,
}

/// Iterates over the requests read from `stream`.
pub fn requests(stream: ByteStream) -> Requests {
    Requests {
        stream,
        done: false,
    }
}

impl Iterator for Requests {
    type Item = Result<Request, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let msg = match read_message(&mut self.stream) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                self.done = true;
                return None;
            }
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        match parse_request(msg) {
            Ok((request, rest)) => {
                self.stream = rest;
                if request.wants_close() {
                    self.done = true;
                    if let Err(e) = self.stream.close() {
                        warn!(error = %e, "failed to close request stream");
                    }
                }
                Some(Ok(request))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Iterator over the responses read back on a connection.
pub struct Responses {
    stream: ByteStream,
    done: bool,
}

/// Iterates over the responses read from `stream`.
pub fn responses(stream: ByteStream) -> Responses {
    Responses {
        stream,
        done: false,
    }
}

impl Responses {
    /// Reads the response to a `method` request.
    pub fn next_response(&mut self, method: &Method) -> Option<Result<Response, ParseError>> {
        if self.done {
            return None;
        }
        let parsed = match read_message(&mut self.stream) {
            Ok(Some(msg)) => parse_response(msg, method),
            Ok(None) => {
                self.done = true;
                return None;
            }
            Err(e) => Err(e),
        };
        match parsed {
            Ok((response, rest)) => {
                self.stream = rest;
                Some(Ok(response))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }

    /// The underlying stream, positioned after the last response read.
    pub fn stream(&self) -> &ByteStream {
        &self.stream
    }
}

/// Assumes every response answers a `GET`.
impl Iterator for Responses {
    type Item = Result<Response, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_response(&Method::Get)
    }
}

/// Writes a start line and headers, then the terminating blank line.
pub fn write_head<W: Write>(out: &mut W, start_line: &str, headers: &Headers) -> io::Result<()> {
    let mut head = Vec::with_capacity(start_line.len() + 2 + headers.len() * 32);
    head.extend_from_slice(start_line.as_bytes());
    head.extend_from_slice(CRLF);
    head.extend_from_slice(headers.to_string().as_bytes());
    head.extend_from_slice(CRLF);
    out.write_all(&head)
}

/// Serialises a message.
///
/// A body of known length is sent with `Content-Length` and copied verbatim;
/// otherwise `Transfer-Encoding: chunked` is used. With `with_body` unset
/// only the head is written, but `Content-Length` still carries the body's
/// length, counted by draining the body when it is not known up front.
pub fn write_message<W: Write>(
    out: &mut W,
    start_line: &str,
    headers: &Headers,
    body: &mut Body,
    with_body: bool,
) -> Result<(), BodyError> {
    let mut headers = headers.clone();

    if !with_body {
        let len = match body.len() {
            Some(len) => len,
            None => {
                let mut counted = 0u64;
                for chunk in body.take_chunks()? {
                    counted += chunk?.len() as u64;
                }
                counted
            }
        };
        // An empty body next to an explicit length is a HEAD answer built
        // without its representation.
        if len > 0 || !headers.contains("content-length") {
            headers.insert("Content-Length", len.to_string());
        }
        headers.remove("transfer-encoding");
        write_head(out, start_line, &headers)?;
        return Ok(());
    }

    match body.len() {
        Some(len) => {
            headers.remove("transfer-encoding");
            headers.insert("Content-Length", len.to_string());
            write_head(out, start_line, &headers)?;
            for chunk in body.take_chunks()? {
                out.write_all(&chunk?)?;
            }
        }
        None => {
            headers.remove("content-length");
            headers.insert("Transfer-Encoding", "chunked");
            write_head(out, start_line, &headers)?;
            for framed in ChunkedEncoder::new(body.take_chunks()?) {
                out.write_all(&framed?)?;
            }
        }
    }
    Ok(())
}
