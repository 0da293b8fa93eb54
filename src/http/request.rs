//! The HTTP request value.

use std::io::Write;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::codec::write_message;
use super::{Body, BodyError, Headers, Method, Uri, Version};
use crate::context::{Env, Params};

/// An HTTP request: method, target, headers, body and the environment it
/// carries through a server and its router.
///
/// The URI is kept absolute whenever possible: a relative target picks up
/// its host from the `Host` header, and a scheme recorded in the
/// environment overrides the URI's own.
///
/// # Examples
///
/// ```
/// use httpony::http::{Headers, Method, Request, Uri};
///
/// let uri = Uri::parse("/hello?name=world").unwrap();
/// let request = Request::new(Method::Get, uri).with_header("Host", "example.com:8080");
///
/// assert_eq!(request.uri().host(), Some("example.com"));
/// assert_eq!(request.uri().port(), 8080);
/// assert_eq!(request.uri().query_params().get("name"), Some("world"));
/// ```
#[derive(Debug)]
pub struct Request {
    method: Method,
    uri: Uri,
    version: Version,
    headers: Headers,
    body: Body,
    env: Env,
}

impl Request {
    /// A bodiless HTTP/1.1 request.
    pub fn new(method: Method, uri: Uri) -> Self {
        Self::from_parts(
            method,
            uri,
            Version::Http11,
            Headers::new(),
            Body::empty(),
            Env::new(),
        )
    }

    /// Assembles a request from its parts.
    pub fn from_parts(
        method: Method,
        uri: Uri,
        version: Version,
        headers: Headers,
        body: Body,
        env: Env,
    ) -> Self {
        let mut request = Self {
            method,
            uri,
            version,
            headers,
            body,
            env,
        };
        request.normalize_uri();
        request
    }

    fn normalize_uri(&mut self) {
        if self.uri.host().is_none() {
            if let Some(host) = self.headers.get("host") {
                if let Err(e) = self.uri.set_authority(host) {
                    debug!(host, error = %e, "ignoring unusable Host header");
                }
            }
        }
        if let Some(scheme) = self.env.scheme {
            self.uri.set_scheme(scheme);
        }
    }

    /// Sets a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self.normalize_uri();
        self
    }

    /// Sets every header in `headers`, overriding existing values.
    #[must_use]
    pub fn with_headers(mut self, headers: &Headers) -> Self {
        self.headers.merge(headers);
        self.normalize_uri();
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub fn with_env(mut self, env: Env) -> Self {
        self.set_env(env);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Replaces the URI. Used by the router when a mount rewrites the path.
    pub fn set_uri(&mut self, uri: Uri) {
        self.uri = uri;
        self.normalize_uri();
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

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    /// Moves the body out, leaving an empty one behind.
    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut Env {
        &mut self.env
    }

    /// Replaces the environment and re-applies its scheme to the URI.
    pub fn set_env(&mut self, env: Env) {
        self.env = env;
        self.normalize_uri();
    }

    /// Query parameters merged with route captures; empty until routed.
    pub fn params(&self) -> &Params {
        &self.env.params
    }

    /// Shorthand for a single parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.env.params.get(name)
    }

    /// Reads the whole body into memory. See [`Body::force`].
    pub fn force_body(&mut self) -> Result<&Bytes, BodyError> {
        self.body.force()
    }

    /// Reads the body and deserializes it as JSON.
    pub fn json<T: DeserializeOwned>(&mut self) -> Result<T, BodyError> {
        let bytes = self.body.force()?;
        Ok(serde_json::from_slice(bytes)?)
    }

    /// The body length, if known without reading it.
    pub fn content_length(&self) -> Option<u64> {
        self.body.len()
    }

    /// `true` when the request asks for the connection to be closed after
    /// its response.
    pub fn wants_close(&self) -> bool {
        self.headers.has_token("connection", "close")
    }

    /// `METHOD relative-uri VERSION`
    pub fn start_line(&self) -> String {
        format!("{} {} {}", self.method, self.uri.relative_uri(), self.version)
    }

    /// Writes the request to `out`, consuming a streaming body.
    pub fn unparse<W: Write>(&mut self, out: &mut W, with_body: bool) -> Result<(), BodyError> {
        let start_line = self.start_line();
        write_message(out, &start_line, &self.headers, &mut self.body, with_body)
    }
}
