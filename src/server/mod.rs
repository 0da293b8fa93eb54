//! Threaded HTTP/1.1 server.
//!
//! The accept loop runs on Tokio. Every accepted socket is handed to its own
//! blocking worker, which reads requests off the connection, dispatches them
//! to a [`Router`] and writes the responses back in order. Connections are
//! persistent unless either side sends `Connection: close`; an idle
//! connection is dropped after [`ServerConfig::keep_alive_timeout`] seconds.
//!
//! At most [`ServerConfig::max_connections`] connections are served at once;
//! further clients wait in the listen backlog until a worker frees up. Each
//! worker is a thread from Tokio's blocking pool, which is capped at 512
//! threads unless the runtime is built with a larger
//! `max_blocking_threads`, so a limit above that only queues work inside
//! the pool.

use std::io::{self, BufWriter, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::context::Env;
use crate::http::codec::requests;
use crate::http::{BodyError, Headers, Method, ParseError, Response, Scheme, StatusCode};
use crate::net::{Connection, SharedConnection, TlsCredentials, TlsError, tls};
use crate::router::Router;
use crate::stream::ByteStream;

/// Default for [`ServerConfig::max_connections`], matching the size of
/// Tokio's default blocking pool.
pub const DEFAULT_MAX_CONNECTIONS: usize = 512;

/// `Server` header sent unless configured otherwise.
pub const DEFAULT_SERVER: &str = concat!("httpony.server/", env!("CARGO_PKG_VERSION"));

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("bad request: {0}")]
    Parse(#[from] ParseError),

    #[error("failed to write response: {0}")]
    Body(#[from] BodyError),

    #[error(transparent)]
    Tls(#[from] TlsError),
}

impl ServerError {
    /// `true` for socket timeouts, which end a connection quietly.
    pub fn is_timeout(&self) -> bool {
        let io = match self {
            ServerError::Io(e) | ServerError::Parse(ParseError::Io(e)) => e,
            ServerError::Body(BodyError::Io(e)) => e,
            ServerError::Tls(TlsError::Handshake(e)) => e,
            _ => return false,
        };
        matches!(io.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
    }
}

/// Server settings. Loadable from JSON with missing fields defaulted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Value of the `Server` response header.
    pub server_name: String,
    /// Idle timeout in seconds, announced in `Keep-Alive` and used as the
    /// socket timeout.
    pub keep_alive_timeout: u64,
    /// Connections served concurrently, one worker thread each.
    pub max_connections: usize,
    /// Serve HTTPS with these credentials.
    pub tls: Option<TlsCredentials>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: DEFAULT_SERVER.to_owned(),
            keep_alive_timeout: 5,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            tls: None,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    #[must_use]
    pub fn keep_alive_timeout(mut self, secs: u64) -> Self {
        self.keep_alive_timeout = secs;
        self
    }

    #[must_use]
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    #[must_use]
    pub fn tls(mut self, credentials: TlsCredentials) -> Self {
        self.tls = Some(credentials);
        self
    }

    fn socket_timeout(&self) -> Option<Duration> {
        (self.keep_alive_timeout > 0).then(|| Duration::from_secs(self.keep_alive_timeout))
    }

    fn default_headers(&self) -> Headers {
        [
            ("Server", self.server_name.clone()),
            ("Keep-Alive", format!("timeout={}", self.keep_alive_timeout)),
        ]
        .into_iter()
        .collect()
    }
}

// Read-only state shared by every connection worker.
struct Shared {
    router: Router,
    config: ServerConfig,
    tls: Option<Arc<rustls::ServerConfig>>,
    defaults: Headers,
}

/// The httpony HTTP server.
///
/// # Examples
///
/// ```rust,no_run
/// use httpony::router::Router;
/// use httpony::server::Server;
/// use httpony::http::Request;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut router = Router::new();
///     router.get("/hello/:name", |req: Request| {
///         format!("Hello, {}!", req.param("name").unwrap_or("world"))
///     });
///
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(router).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
    tls: Option<Arc<rustls::ServerConfig>>,
}

impl Server {
    /// Binds a plain HTTP server with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        Self::bind_with_config(addr, ServerConfig::default()).await
    }

    /// Binds a server with `config`, loading TLS credentials if it has any.
    pub async fn bind_with_config(
        addr: impl AsRef<str>,
        config: ServerConfig,
    ) -> Result<Self, ServerError> {
        let tls = config
            .tls
            .as_ref()
            .map(tls::load_server_config)
            .transpose()?;
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            config,
            tls,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Accepts connections and serves each one on a dedicated blocking
    /// worker until the process ends.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the listener itself fails.
    pub async fn run(self, router: Router) -> Result<(), ServerError> {
        let permits = Arc::new(Semaphore::new(self.config.max_connections.max(1)));
        let shared = Arc::new(Shared {
            router,
            defaults: self.config.default_headers(),
            config: self.config,
            tls: self.tls,
        });
        info!(
            address = %self.local_addr,
            tls = shared.tls.is_some(),
            routes = shared.router.len(),
            max_connections = shared.config.max_connections,
            "httpony listening"
        );

        loop {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                return Ok(());
            };
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let tcp = match stream.into_std() {
                Ok(tcp) => tcp,
                Err(e) => {
                    warn!(peer = %peer_addr, error = %e, "failed to detach socket");
                    continue;
                }
            };
            let shared = Arc::clone(&shared);

            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                match serve_connection(tcp, &shared) {
                    Ok(()) => debug!(peer = %peer_addr, "connection closed"),
                    Err(e) if e.is_timeout() => {
                        debug!(peer = %peer_addr, "connection timed out");
                    }
                    Err(e) => warn!(peer = %peer_addr, error = %e, "connection closed with error"),
                }
            });
        }
    }
}

/// Runs the request loop for one connection until the peer is done, a side
/// asks to close, or an error ends it. The socket is closed either way.
fn serve_connection(tcp: std::net::TcpStream, shared: &Shared) -> Result<(), ServerError> {
    tcp.set_nonblocking(false)?;
    tcp.set_nodelay(true)?;
    let timeout = shared.config.socket_timeout();
    tcp.set_read_timeout(timeout)?;
    tcp.set_write_timeout(timeout)?;

    let (conn, scheme) = match &shared.tls {
        Some(config) => (tls::accept(config, tcp)?, Scheme::Https),
        None => (Connection::Plain(tcp), Scheme::Http),
    };
    let conn = SharedConnection::new(conn);
    let result = serve_requests(&conn, scheme, shared);
    if let Err(e) = conn.close() {
        debug!(peer = ?conn.peer_addr(), error = %e, "error closing connection");
    }
    result
}

fn serve_requests(
    conn: &SharedConnection,
    scheme: Scheme,
    shared: &Shared,
) -> Result<(), ServerError> {
    let tls_info = conn.tls_info();
    for request in requests(ByteStream::new(conn.clone())) {
        let mut request = match request {
            Ok(request) => request,
            Err(e @ ParseError::HeadTooLarge(_)) => {
                debug!(peer = ?conn.peer_addr(), "request head too large, sending 413");
                let response = Response::from_status(StatusCode::PAYLOAD_TOO_LARGE)
                    .body("Request head too large");
                write_response(conn, response, shared, true, true)?;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };
        let mut env = Env {
            remote_addr: conn.peer_addr(),
            server_addr: conn.local_addr(),
            server_name: Some(shared.config.server_name.clone()),
            scheme: Some(scheme),
            ..Env::default()
        };
        if let Some(info) = &tls_info {
            env.extensions.insert(info.clone());
        }
        request.set_env(env);

        let method = request.method().clone();
        let close = request.wants_close();
        debug!(
            peer = ?conn.peer_addr(),
            method = %method,
            uri = %request.uri(),
            "dispatching request"
        );

        let response = shared.router.handle(request);
        if write_response(conn, response, shared, close, method != Method::Head)? {
            debug!(peer = ?conn.peer_addr(), "Connection: close, shutting down");
            break;
        }
    }
    Ok(())
}

// Adds the default headers and writes `response`. Returns whether the
// connection is to be closed afterwards.
fn write_response(
    conn: &SharedConnection,
    mut response: Response,
    shared: &Shared,
    close: bool,
    with_body: bool,
) -> Result<bool, ServerError> {
    response.headers_mut().merge_defaults(&shared.defaults);
    if close {
        response.add_header("Connection", "close");
    }
    let mut out = BufWriter::new(conn.clone());
    response.unparse(&mut out, with_body)?;
    out.flush()?;
    Ok(close || response.wants_close())
}
