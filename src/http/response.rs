//! The HTTP response value and the conversions handlers return.

use std::io::Write;

use bytes::Bytes;
use serde::Serialize;

use super::codec::{write_head, write_message};
use super::{Body, BodyError, Headers, StatusCode, Version};

/// An HTTP response.
///
/// The reason phrase defaults to the status code's canonical phrase, or to
/// an empty string for codes without one.
///
/// # Examples
///
/// ```
/// use httpony::http::{Response, StatusCode};
///
/// let mut response = Response::from_status(StatusCode::NOT_FOUND)
///     .header("Content-Type", "text/plain")
///     .body("nothing here");
///
/// let mut out = Vec::new();
/// response.unparse(&mut out, true).unwrap();
/// let text = String::from_utf8(out).unwrap();
/// assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
/// assert!(text.contains("Content-Length: 12\r\n"));
/// ```
#[derive(Debug)]
pub struct Response {
    version: Version,
    status: StatusCode,
    reason: String,
    headers: Headers,
    body: Body,
}

impl Response {
    /// An empty `200 OK`.
    pub fn new() -> Self {
        Self::from_status(StatusCode::OK)
    }

    /// An empty response with the given status.
    pub fn from_status(status: StatusCode) -> Self {
        Self::from_parts(status, Headers::new())
    }

    /// An empty response with the given status and headers.
    pub fn from_parts(status: StatusCode, headers: Headers) -> Self {
        Self {
            version: Version::Http11,
            status,
            reason: status.canonical_reason().unwrap_or("").to_owned(),
            headers,
            body: Body::empty(),
        }
    }

    /// A response with status, headers and body.
    pub fn from_triple(status: StatusCode, headers: Headers, body: impl Into<Body>) -> Self {
        Self::from_parts(status, headers).body(body)
    }

    /// A `200 OK` carrying `body`.
    pub fn from_body(body: impl Into<Body>) -> Self {
        Self::new().body(body)
    }

    /// A `200 OK` carrying `value` as JSON.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        Ok(Self::from_body(body).header("Content-Type", "application/json"))
    }

    /// Sets a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets a header in place, for code that decorates a response it did not
    /// build.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Same as [`body`](Self::body).
    #[must_use]
    pub fn with_body(self, body: impl Into<Body>) -> Self {
        self.body(body)
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body_ref(&self) -> &Body {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    /// Moves the body out, leaving an empty one behind.
    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }

    /// Reads the whole body into memory. See [`Body::force`].
    pub fn force_body(&mut self) -> Result<&Bytes, BodyError> {
        self.body.force()
    }

    /// Reads the body and deserializes it as JSON.
    pub fn json_body<T: serde::de::DeserializeOwned>(&mut self) -> Result<T, BodyError> {
        let bytes = self.body.force()?;
        Ok(serde_json::from_slice(bytes)?)
    }

    /// `true` when the response announces the connection will be closed.
    pub fn wants_close(&self) -> bool {
        self.headers.has_token("connection", "close")
    }

    /// `VERSION STATUS REASON`
    pub fn start_line(&self) -> String {
        format!("{} {} {}", self.version, self.status.as_u16(), self.reason)
    }

    /// Writes the response to `out`, consuming a streaming body.
    ///
    /// Statuses that never carry a body (1xx, 204, 304) are written as a
    /// bare head with the headers exactly as set.
    pub fn unparse<W: Write>(&mut self, out: &mut W, with_body: bool) -> Result<(), BodyError> {
        let start_line = self.start_line();
        if !self.status.allows_body() {
            write_head(out, &start_line, &self.headers)?;
            return Ok(());
        }
        write_message(out, &start_line, &self.headers, &mut self.body, with_body)
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

/// Conversion from whatever a handler returns into a [`Response`].
///
/// Implemented for a full response, a bare status, `(status, headers)` and
/// `(status, headers, body)` tuples, and plain bodies (sent as `200 OK`).
/// A streaming body is a [`Body`] built with [`Body::stream`].
pub trait IntoResponse {
    fn into_response(self) -> Response;
}

impl IntoResponse for Response {
    fn into_response(self) -> Response {
        self
    }
}

impl IntoResponse for StatusCode {
    fn into_response(self) -> Response {
        Response::from_status(self)
    }
}

impl IntoResponse for (StatusCode, Headers) {
    fn into_response(self) -> Response {
        Response::from_parts(self.0, self.1)
    }
}

impl<B: Into<Body>> IntoResponse for (StatusCode, Headers, B) {
    fn into_response(self) -> Response {
        Response::from_triple(self.0, self.1, self.2)
    }
}

impl IntoResponse for Body {
    fn into_response(self) -> Response {
        Response::from_body(self)
    }
}

impl IntoResponse for &'static str {
    fn into_response(self) -> Response {
        Response::from_body(self)
    }
}

impl IntoResponse for String {
    fn into_response(self) -> Response {
        Response::from_body(self)
    }
}

impl IntoResponse for Vec<u8> {
    fn into_response(self) -> Response {
        Response::from_body(self)
    }
}

impl IntoResponse for Bytes {
    fn into_response(self) -> Response {
        Response::from_body(self)
    }
}
