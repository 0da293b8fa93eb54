//! Blocking HTTP/1.1 client.
//!
//! A [`Client`] sends one request per call and reads back the response.
//! Three dispatch modes exist:
//!
//! - **in-process**: with a [`Router`] configured via [`Client::handler`],
//!   requests never touch a socket;
//! - **one-shot** (the default): a fresh connection per request, sent with
//!   `Connection: close` and closed once the response body has been read;
//! - **persistent**: the connection is kept and reused while requests go to
//!   the same `scheme://host:port`. When a reused connection yields no
//!   response, `GET` and `HEAD` are retried on a fresh connection up to
//!   [`ClientConfig::max_attempts`] times. Other methods fail with
//!   [`ClientError::CannotRetry`], as they may already have taken effect.
//!
//! ```no_run
//! use httpony::client::Client;
//!
//! let client = Client::new().base_uri("example.com");
//! let response = client.get("/index.html").send()?;
//! println!("{}", response.status());
//! let body = client.get("/robots.txt").bytes()?;
//! # Ok::<(), httpony::client::ClientError>(())
//! ```

use std::io::{self, BufWriter, Write};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::http::codec::{BodyLength, Responses, response_body_length, responses};
use crate::http::{
    Body, BodyError, Headers, Method, ParseError, Request, Response, Scheme, Uri, UriError,
    Version,
};
use crate::net::{self, Connection, SharedConnection, TlsError, tls};
use crate::router::Router;
use crate::stream::ByteStream;

/// `User-Agent` sent unless configured otherwise.
pub const DEFAULT_USER_AGENT: &str = concat!("httpony.client/", env!("CARGO_PKG_VERSION"));

/// Errors returned by [`Client`] requests.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no host specified in {0:?}")]
    MissingHost(String),

    #[error("max retries reached after {0} attempts")]
    MaxRetries(u32),

    /// A persistent connection went away without answering a request that
    /// may have taken effect; the method is carried alongside the message.
    #[error("cannot retry (not GET or HEAD): {0}")]
    CannotRetry(Method),

    #[error("connection closed without a response")]
    NoResponse,

    /// Socket failures, timeouts included.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The response could not be framed.
    #[error("malformed response: {0}")]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Uri(#[from] UriError),

    #[error(transparent)]
    Body(#[from] BodyError),

    #[error(transparent)]
    Tls(#[from] TlsError),
}

/// Client settings. Loadable from JSON with missing fields defaulted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Prefix for request targets that are empty or start with `/`.
    pub base_uri: Option<String>,
    /// Keep connections open between requests.
    pub persistent: bool,
    pub user_agent: String,
    /// Attempts for a `GET`/`HEAD` on a persistent connection.
    pub max_attempts: u32,
    /// Connect, read and write timeout in seconds; 0 disables it.
    pub timeout: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_uri: None,
            persistent: false,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            max_attempts: 3,
            timeout: 30,
        }
    }
}

// A live persistent connection and the response parser reading from it.
struct Persistent {
    authority: String,
    conn: SharedConnection,
    responses: Responses,
}

impl Persistent {
    // Sends `request` and reads the response head. `Ok(None)` means the
    // connection failed before a response arrived.
    fn exchange(&mut self, request: &mut Request) -> Result<Option<Response>, ClientError> {
        if let Err(e) = write_request(&self.conn, request) {
            debug!(authority = %self.authority, error = %e, "send failed on persistent connection");
            return Ok(None);
        }
        match self.responses.next_response(request.method()) {
            Some(Ok(response)) => Ok(Some(response)),
            Some(Err(ParseError::Io(e))) => {
                debug!(authority = %self.authority, error = %e, "connection failed before a response");
                Ok(None)
            }
            Some(Err(e)) => Err(transport_or_parse(e)),
            None => Ok(None),
        }
    }

    fn close(self) {
        if let Err(e) = self.conn.close() {
            debug!(authority = %self.authority, error = %e, "error closing connection");
        }
    }
}

fn write_request(conn: &SharedConnection, request: &mut Request) -> Result<(), ClientError> {
    let mut out = BufWriter::new(conn.clone());
    request.unparse(&mut out, true).map_err(transport_or_body)?;
    out.flush()?;
    Ok(())
}

// I/O failures surface as transport errors whichever layer hit them.
fn transport_or_parse(e: ParseError) -> ClientError {
    match e {
        ParseError::Io(e) => ClientError::Transport(e),
        e => ClientError::Parse(e),
    }
}

// A malformed chunked body reads as `InvalidData` and stays a body error.
fn transport_or_body(e: BodyError) -> ClientError {
    match e {
        BodyError::Io(e) if e.kind() != io::ErrorKind::InvalidData => ClientError::Transport(e),
        e => ClientError::Body(e),
    }
}

// Whether the connection can carry another request after `response`.
fn keeps_alive(response: &Response, method: &Method) -> bool {
    if response.wants_close() {
        return false;
    }
    if response.version() == Version::Http10
        && !response.headers().has_token("connection", "keep-alive")
    {
        return false;
    }
    matches!(
        response_body_length(response.status(), response.headers(), method),
        Ok(BodyLength::Empty | BodyLength::Length(_) | BodyLength::Chunked)
    )
}

/// A blocking HTTP client.
///
/// A persistent client serialises concurrent calls on its one connection;
/// use separate clients for parallel requests.
pub struct Client {
    config: ClientConfig,
    handler: Option<Arc<Router>>,
    tls: OnceLock<Arc<rustls::ClientConfig>>,
    state: Mutex<Option<Persistent>>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            config,
            handler: None,
            tls: OnceLock::new(),
            state: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn base_uri(mut self, base_uri: impl Into<String>) -> Self {
        self.config.base_uri = Some(base_uri.into());
        self
    }

    #[must_use]
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.config.persistent = persistent;
        self
    }

    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.config.max_attempts = max_attempts;
        self
    }

    /// Socket timeout in seconds; 0 disables it.
    #[must_use]
    pub fn timeout(mut self, secs: u64) -> Self {
        self.config.timeout = secs;
        self
    }

    /// Routes every request through `router` in-process instead of the
    /// network.
    #[must_use]
    pub fn handler(mut self, router: Router) -> Self {
        self.handler = Some(Arc::new(router));
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// `Accept: */*` and the configured `User-Agent`.
    pub fn default_headers(&self) -> Headers {
        [
            ("Accept", "*/*"),
            ("User-Agent", self.config.user_agent.as_str()),
        ]
        .into_iter()
        .collect()
    }

    /// Starts a request with an arbitrary method.
    pub fn request(&self, method: Method, uri: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder {
            client: self,
            method,
            uri: uri.into(),
            headers: Headers::new(),
            body: Body::empty(),
            close: false,
        }
    }

    pub fn get(&self, uri: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::Get, uri)
    }

    pub fn head(&self, uri: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::Head, uri)
    }

    pub fn post(&self, uri: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::Post, uri)
    }

    pub fn put(&self, uri: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::Put, uri)
    }

    pub fn delete(&self, uri: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::Delete, uri)
    }

    pub fn patch(&self, uri: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::Patch, uri)
    }

    pub fn options(&self, uri: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::Options, uri)
    }

    /// Closes the persistent connection, if one is open.
    pub fn close(&self) {
        if let Some(live) = self.state.lock().take() {
            live.close();
        }
    }

    fn resolve(&self, uri: &str) -> String {
        match &self.config.base_uri {
            Some(base) if uri.is_empty() || uri.starts_with('/') => format!("{base}{uri}"),
            _ => uri.to_owned(),
        }
    }

    fn socket_timeout(&self) -> Option<Duration> {
        (self.config.timeout > 0).then(|| Duration::from_secs(self.config.timeout))
    }

    fn tls_config(&self) -> &Arc<rustls::ClientConfig> {
        self.tls.get_or_init(tls::client_config)
    }

    fn connect(&self, uri: &Uri) -> Result<SharedConnection, ClientError> {
        let host = uri
            .host()
            .ok_or_else(|| ClientError::MissingHost(uri.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let tcp = net::connect_tcp(host, uri.port(), self.socket_timeout())?;
        let conn = match uri.scheme() {
            Scheme::Http => Connection::Plain(tcp),
            Scheme::Https => tls::connect(self.tls_config(), host, tcp)?,
        };
        let conn = SharedConnection::new(conn);
        debug!(peer = ?conn.peer_addr(), tls = conn.is_tls(), "connected");
        Ok(conn)
    }

    fn build_request(
        &self,
        method: Method,
        uri: &str,
        headers: &Headers,
        body: Body,
    ) -> Result<Request, ClientError> {
        let resolved = self.resolve(uri);
        let uri = Uri::parse(&resolved)?;
        let Some(host) = uri.host_and_port() else {
            return Err(ClientError::MissingHost(resolved));
        };
        let mut all = self.default_headers();
        all.merge(headers);
        all.set_default("Host", host);
        Ok(Request::new(method, uri).with_headers(&all).with_body(body))
    }

    fn execute(&self, mut request: Request, close: bool) -> Result<Response, ClientError> {
        if let Some(router) = &self.handler {
            if close {
                request.headers_mut().insert("Connection", "close");
            }
            return Ok(router.handle(request));
        }
        if self.config.persistent {
            if close {
                request.headers_mut().insert("Connection", "close");
            }
            self.send_persistent(request, close)
        } else {
            request.headers_mut().insert("Connection", "close");
            self.send_once(request)
        }
    }

    fn send_once(&self, mut request: Request) -> Result<Response, ClientError> {
        let conn = self.connect(request.uri())?;
        let result = exchange_once(&conn, &mut request);
        if let Err(e) = conn.close() {
            debug!(error = %e, "error closing connection");
        }
        result
    }

    fn send_persistent(&self, mut request: Request, close: bool) -> Result<Response, ClientError> {
        let authority = request
            .uri()
            .authority_key()
            .ok_or_else(|| ClientError::MissingHost(request.uri().to_string()))?;
        let method = request.method().clone();
        let retryable = matches!(method, Method::Get | Method::Head);
        if retryable {
            // Buffered so a retry can send it again.
            request.force_body().map_err(transport_or_body)?;
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut state = self.state.lock();
        for attempt in 1..=max_attempts {
            let mut live = match state.take() {
                Some(live) if live.authority == authority => {
                    debug!(authority = %authority, "reusing connection");
                    live
                }
                other => {
                    if let Some(stale) = other {
                        stale.close();
                    }
                    let conn = self.connect(request.uri())?;
                    Persistent {
                        authority: authority.clone(),
                        responses: responses(ByteStream::new(conn.clone())),
                        conn,
                    }
                }
            };

            match live.exchange(&mut request) {
                Ok(Some(mut response)) => {
                    if close || !keeps_alive(&response, &method) {
                        let forced = response.force_body().map(drop);
                        live.close();
                        forced.map_err(transport_or_body)?;
                    } else {
                        *state = Some(live);
                    }
                    return Ok(response);
                }
                Ok(None) => {
                    live.close();
                    if !retryable {
                        return Err(ClientError::CannotRetry(method));
                    }
                    warn!(%method, authority = %authority, attempt, "no response, retrying");
                }
                Err(e) => {
                    live.close();
                    return Err(e);
                }
            }
        }
        Err(ClientError::MaxRetries(max_attempts))
    }
}

// One request on a dedicated connection; the body is read before the
// connection goes away.
fn exchange_once(conn: &SharedConnection, request: &mut Request) -> Result<Response, ClientError> {
    write_request(conn, request)?;
    let mut parsed = responses(ByteStream::new(conn.clone()));
    match parsed.next_response(request.method()) {
        Some(Ok(mut response)) => {
            response.force_body().map_err(transport_or_body)?;
            Ok(response)
        }
        Some(Err(e)) => Err(transport_or_parse(e)),
        None => Err(ClientError::NoResponse),
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

/// A request being assembled by a [`Client`].
#[must_use]
pub struct RequestBuilder<'a> {
    client: &'a Client,
    method: Method,
    uri: String,
    headers: Headers,
    body: Body,
    close: bool,
}

impl RequestBuilder<'_> {
    /// Sets a header, overriding the client's defaults.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn headers(mut self, headers: &Headers) -> Self {
        self.headers.merge(headers);
        self
    }

    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Closes a persistent connection after this request.
    pub fn close(mut self, close: bool) -> Self {
        self.close = close;
        self
    }

    /// Sends the request and returns the response.
    pub fn send(self) -> Result<Response, ClientError> {
        let request = self
            .client
            .build_request(self.method, &self.uri, &self.headers, self.body)?;
        self.client.execute(request, self.close)
    }

    /// Sends the request and returns only the response body.
    pub fn bytes(self) -> Result<Bytes, ClientError> {
        let mut response = self.send()?;
        let body = response.force_body().map_err(transport_or_body)?;
        Ok(body.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    use crate::http::StatusCode;

    fn echo_router() -> Router {
        let mut router = Router::new();
        router
            .any("/headers", |req: Request| {
                let mut headers: Vec<_> = req
                    .headers()
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect();
                headers.sort();
                (StatusCode::NOT_FOUND, Headers::new(), headers.join(";"))
            })
            .any("/*", |req: Request| {
                (
                    StatusCode::NOT_FOUND,
                    Headers::new(),
                    format!("{} {}", req.method(), req.uri()),
                )
            });
        router
    }

    fn text(bytes: Bytes) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    // Reads one request head, returning it without the blank line.
    fn read_head(reader: &mut BufReader<TcpStream>) -> String {
        let mut head = String::new();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).unwrap() == 0 || line == "\r\n" {
                return head;
            }
            head.push_str(&line);
        }
    }

    fn reply(sock: &mut TcpStream, body: &str) {
        let response = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}", body.len());
        sock.write_all(response.as_bytes()).unwrap();
    }

    #[test]
    fn get_with_handler() {
        let client = Client::new().handler(echo_router());
        let out = client.get("example.com/foo").bytes().unwrap();
        assert_eq!(text(out), "GET http://example.com/foo");
    }

    #[test]
    fn get_with_handler_headers() {
        let client = Client::new().handler(echo_router());
        let out = client.get("example.com/headers").bytes().unwrap();
        assert_eq!(
            text(out),
            format!("Accept=*/*;Host=example.com;User-Agent={DEFAULT_USER_AGENT}")
        );
    }

    #[test]
    fn post_with_handler() {
        let client = Client::new().handler(echo_router());
        let response = client.post("example.com/foo").body("x").send().unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let out = client.post("example.com/foo").bytes().unwrap();
        assert_eq!(text(out), "POST http://example.com/foo");
    }

    #[test]
    fn get_with_handler_and_base_uri() {
        let client = Client::new().base_uri("example.com").handler(echo_router());
        assert_eq!(text(client.get("/foo").bytes().unwrap()), "GET http://example.com/foo");
        assert_eq!(text(client.get("/bar").bytes().unwrap()), "GET http://example.com/bar");
        assert_eq!(
            text(client.get("example.org/baz").bytes().unwrap()),
            "GET http://example.org/baz"
        );
    }

    #[test]
    fn caller_headers_override_defaults() {
        let client = Client::new().handler(echo_router());
        let out = client
            .get("example.com:8080/headers")
            .header("accept", "text/html")
            .header("X-Extra", "1")
            .bytes()
            .unwrap();
        assert_eq!(
            text(out),
            format!("Accept=text/html;Host=example.com:8080;User-Agent={DEFAULT_USER_AGENT};X-Extra=1")
        );
    }

    #[test]
    fn missing_host_is_an_argument_error() {
        let client = Client::new().handler(echo_router());
        assert!(matches!(
            client.get("/foo").send(),
            Err(ClientError::MissingHost(_))
        ));
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"persistent": true, "max_attempts": 5}"#).unwrap();
        assert!(config.persistent);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.user_agent, DEFAULT_USER_AGENT);
        assert_eq!(config.timeout, 30);
        assert_eq!(config.base_uri, None);
    }

    #[test]
    fn one_shot_request_closes_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(sock.try_clone().unwrap());
            let head = read_head(&mut reader);
            reply(&mut sock, "hello");
            let mut rest = Vec::new();
            reader.read_to_end(&mut rest).unwrap();
            (head, rest)
        });

        let client = Client::new().timeout(5);
        let mut response = client.get(format!("127.0.0.1:{port}/greet")).send().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.force_body().unwrap().as_ref(), b"hello");

        let (head, rest) = server.join().unwrap();
        assert!(head.starts_with("GET /greet HTTP/1.1\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert!(head.contains(&format!("Host: 127.0.0.1:{port}\r\n")));
        assert!(rest.is_empty());
    }

    #[test]
    fn persistent_connection_is_reused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            drop(listener);
            let mut reader = BufReader::new(sock.try_clone().unwrap());
            let first = read_head(&mut reader);
            reply(&mut sock, "one");
            let second = read_head(&mut reader);
            reply(&mut sock, "two");
            (first, second)
        });

        let client = Client::new()
            .persistent(true)
            .timeout(5)
            .base_uri(format!("127.0.0.1:{port}"));
        assert_eq!(text(client.get("/a").bytes().unwrap()), "one");
        assert_eq!(text(client.get("/b").bytes().unwrap()), "two");
        let (first, second) = server.join().unwrap();
        assert!(first.starts_with("GET /a "));
        assert!(second.starts_with("GET /b "));
        assert!(!first.contains("Connection: close"));
        client.close();
    }

    #[test]
    fn persistent_get_is_retried_on_fresh_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            // First connection: read the request, hang up without answering.
            let (sock, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(sock.try_clone().unwrap());
            read_head(&mut reader);
            drop(reader);
            drop(sock);
            // Second connection: answer.
            let (mut sock, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(sock.try_clone().unwrap());
            read_head(&mut reader);
            reply(&mut sock, "second time lucky");
        });

        let client = Client::new().persistent(true).timeout(5).max_attempts(3);
        let out = client
            .get(format!("127.0.0.1:{port}/flaky"))
            .close(true)
            .bytes()
            .unwrap();
        assert_eq!(text(out), "second time lucky");
        server.join().unwrap();
    }

    #[test]
    fn persistent_post_is_not_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(sock.try_clone().unwrap());
            read_head(&mut reader);
            let mut body = [0u8; 4];
            reader.read_exact(&mut body).unwrap();
            drop(sock);
            // A retry would be a second connection.
            listener.set_nonblocking(true).unwrap();
            thread::sleep(Duration::from_millis(200));
            listener.accept().is_ok()
        });

        let client = Client::new().persistent(true).timeout(5);
        let result = client.post(format!("127.0.0.1:{port}/submit")).body("data").send();
        assert!(matches!(result, Err(ClientError::CannotRetry(Method::Post))));
        assert!(!server.join().unwrap());
    }

    #[test]
    fn persistent_retries_are_bounded() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            for _ in 0..2 {
                let (sock, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(sock.try_clone().unwrap());
                read_head(&mut reader);
            }
        });

        let client = Client::new().persistent(true).timeout(5).max_attempts(2);
        let result = client.get(format!("127.0.0.1:{port}/down")).send();
        assert!(matches!(result, Err(ClientError::MaxRetries(2))));
        server.join().unwrap();
    }

    // Answers one keep-alive request on the first connection, then hangs up
    // and hands the listener back.
    fn serve_once_then_hang_up(listener: TcpListener) -> thread::JoinHandle<TcpListener> {
        thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(sock.try_clone().unwrap());
            read_head(&mut reader);
            reply(&mut sock, "one");
            drop(reader);
            sock.shutdown(std::net::Shutdown::Both).unwrap();
            listener
        })
    }

    #[test]
    fn stale_connection_get_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let first = serve_once_then_hang_up(listener);

        let client = Client::new()
            .persistent(true)
            .timeout(5)
            .base_uri(format!("127.0.0.1:{port}"));
        assert_eq!(text(client.get("/a").bytes().unwrap()), "one");

        let listener = first.join().unwrap();
        let second = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(sock.try_clone().unwrap());
            let head = read_head(&mut reader);
            reply(&mut sock, "two");
            head
        });

        assert_eq!(text(client.get("/b").bytes().unwrap()), "two");
        assert!(second.join().unwrap().starts_with("GET /b "));
        client.close();
    }

    #[test]
    fn stale_connection_post_is_not_resent() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let first = serve_once_then_hang_up(listener);

        let client = Client::new()
            .persistent(true)
            .timeout(5)
            .base_uri(format!("127.0.0.1:{port}"));
        assert_eq!(text(client.get("/a").bytes().unwrap()), "one");

        let listener = first.join().unwrap();
        let result = client.post("/b").body("data").send();
        assert!(matches!(result, Err(ClientError::CannotRetry(Method::Post))));

        // No second connection was opened.
        listener.set_nonblocking(true).unwrap();
        assert!(listener.accept().is_err());
    }

    #[test]
    fn close_delimited_response_is_not_reused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(sock.try_clone().unwrap());
            read_head(&mut reader);
            sock.write_all(b"HTTP/1.0 200 OK\r\n\r\nfirst").unwrap();
            drop(reader);
            drop(sock);

            let (mut sock, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(sock.try_clone().unwrap());
            let head = read_head(&mut reader);
            let mut body = [0u8; 4];
            reader.read_exact(&mut body).unwrap();
            reply(&mut sock, "ok");
            (head, body)
        });

        let client = Client::new()
            .persistent(true)
            .timeout(5)
            .base_uri(format!("127.0.0.1:{port}"));
        assert_eq!(text(client.get("/a").bytes().unwrap()), "first");
        let mut response = client.post("/b").body("data").send().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.force_body().unwrap().as_ref(), b"ok");

        let (head, body) = server.join().unwrap();
        assert!(head.starts_with("POST /b "));
        assert_eq!(&body, b"data");
        client.close();
    }

    #[test]
    fn reuse_depends_on_framing_and_version() {
        let sized = || Response::new().header("Content-Length", "2");
        assert!(keeps_alive(&sized(), &Method::Get));
        assert!(keeps_alive(
            &Response::new().header("Transfer-Encoding", "chunked"),
            &Method::Get
        ));
        assert!(!keeps_alive(&Response::new(), &Method::Get));
        assert!(keeps_alive(&Response::new(), &Method::Head));
        assert!(keeps_alive(&Response::from_status(StatusCode::NO_CONTENT), &Method::Get));
        assert!(!keeps_alive(&sized().header("Connection", "close"), &Method::Get));
        assert!(!keeps_alive(&sized().with_version(Version::Http10), &Method::Get));
        assert!(keeps_alive(
            &sized()
                .with_version(Version::Http10)
                .header("Connection", "keep-alive"),
            &Method::Get
        ));
    }

    #[test]
    fn read_timeout_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (release, hold) = std::sync::mpsc::channel::<()>();
        let server = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            // Never answer; keep the socket open until the client gave up.
            let _ = hold.recv();
            drop(sock);
        });

        let client = Client::new().timeout(1);
        let result = client.get(format!("127.0.0.1:{port}/slow")).send();
        assert!(matches!(result, Err(ClientError::Transport(_))), "{result:?}");
        release.send(()).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn malformed_response_is_a_parse_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(sock.try_clone().unwrap());
            read_head(&mut reader);
            sock.write_all(b"HTTP/1.1 abc Nope\r\n\r\n").unwrap();
        });

        let client = Client::new().timeout(5);
        let result = client.get(format!("127.0.0.1:{port}/")).send();
        assert!(matches!(
            result,
            Err(ClientError::Parse(ParseError::InvalidStatus(_)))
        ));
        server.join().unwrap();
    }

    #[test]
    fn error_messages() {
        assert_eq!(
            ClientError::CannotRetry(Method::Post).to_string(),
            "cannot retry (not GET or HEAD): POST"
        );
        assert_eq!(
            ClientError::MaxRetries(3).to_string(),
            "max retries reached after 3 attempts"
        );
    }
}
