//! Connections: a plain or TLS-wrapped TCP socket behind one shared handle
//! that can be read through a [`ByteStream`](crate::stream::ByteStream) and
//! written to at the same time.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustls::{ClientConnection, ServerConnection, StreamOwned};

use crate::stream::Source;

pub mod tls;

pub use tls::{TlsCredentials, TlsError};

/// What a request handler can learn about the TLS session it arrived on.
///
/// The server stores one in [`Env::extensions`](crate::context::Env::extensions)
/// for every request received over HTTPS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInfo {
    /// Protocol version, e.g. `TLSv1_3`.
    pub protocol: Option<String>,
    /// SNI host name sent by the client.
    pub server_name: Option<String>,
}

/// A plain or TLS socket. Every variant implements `Read + Write`.
pub enum Connection {
    Plain(TcpStream),
    TlsServer(Box<StreamOwned<ServerConnection, TcpStream>>),
    TlsClient(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Connection {
    /// The underlying TCP socket. TLS sessions share its timeouts.
    pub fn tcp(&self) -> &TcpStream {
        match self {
            Connection::Plain(s) => s,
            Connection::TlsServer(s) => s.get_ref(),
            Connection::TlsClient(s) => s.get_ref(),
        }
    }

    pub fn is_tls(&self) -> bool {
        !matches!(self, Connection::Plain(_))
    }

    /// Negotiated session details, `None` on a plain socket.
    pub fn tls_info(&self) -> Option<TlsInfo> {
        match self {
            Connection::Plain(_) => None,
            Connection::TlsServer(s) => Some(TlsInfo {
                protocol: s.conn.protocol_version().map(|v| format!("{v:?}")),
                server_name: s.conn.server_name().map(str::to_owned),
            }),
            Connection::TlsClient(s) => Some(TlsInfo {
                protocol: s.conn.protocol_version().map(|v| format!("{v:?}")),
                server_name: None,
            }),
        }
    }

    /// Sets both the read and the write timeout.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        let tcp = self.tcp();
        tcp.set_read_timeout(timeout)?;
        tcp.set_write_timeout(timeout)
    }

    // Sends close_notify for TLS, then shuts the socket down.
    fn close(&mut self) -> io::Result<()> {
        match self {
            Connection::Plain(_) => {}
            Connection::TlsServer(s) => {
                s.conn.send_close_notify();
                s.flush()?;
            }
            Connection::TlsClient(s) => {
                s.conn.send_close_notify();
                s.flush()?;
            }
        }
        ignore_not_connected(self.tcp().shutdown(Shutdown::Both))
    }
}

fn ignore_not_connected(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Connection::Plain(s) => s.read(buf),
            Connection::TlsServer(s) => s.read(buf),
            Connection::TlsClient(s) => s.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Connection::Plain(s) => s.write(buf),
            Connection::TlsServer(s) => s.write(buf),
            Connection::TlsClient(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Connection::Plain(s) => s.flush(),
            Connection::TlsServer(s) => s.flush(),
            Connection::TlsClient(s) => s.flush(),
        }
    }
}

/// A cloneable handle onto one [`Connection`].
///
/// One clone is handed to a [`ByteStream`](crate::stream::ByteStream) for
/// reading while another writes; reads and writes on a connection alternate,
/// so the lock is never contended for long.
#[derive(Clone)]
pub struct SharedConnection {
    inner: Arc<Mutex<Connection>>,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

impl SharedConnection {
    pub fn new(conn: Connection) -> Self {
        let peer_addr = conn.tcp().peer_addr().ok();
        let local_addr = conn.tcp().local_addr().ok();
        Self {
            inner: Arc::new(Mutex::new(conn)),
            peer_addr,
            local_addr,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_tls(&self) -> bool {
        self.inner.lock().is_tls()
    }

    pub fn tls_info(&self) -> Option<TlsInfo> {
        self.inner.lock().tls_info()
    }

    /// Closes the connection in both directions.
    pub fn close(&self) -> io::Result<()> {
        self.inner.lock().close()
    }
}

impl Read for SharedConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.lock().read(buf)
    }
}

impl Write for SharedConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush()
    }
}

impl Source for SharedConnection {
    /// Shuts down the read half only; a response can still be written.
    fn shutdown(&mut self) -> io::Result<()> {
        ignore_not_connected(self.inner.lock().tcp().shutdown(Shutdown::Read))
    }
}

impl std::fmt::Debug for SharedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedConnection")
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

/// Opens a TCP connection to `host:port`, trying each resolved address in
/// turn, with `timeout` bounding the connect and every later read and write.
pub fn connect_tcp(host: &str, port: u16, timeout: Option<Duration>) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        let attempt = match timeout {
            Some(t) => TcpStream::connect_timeout(&addr, t),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(tcp) => {
                tcp.set_read_timeout(timeout)?;
                tcp.set_write_timeout(timeout)?;
                tcp.set_nodelay(true)?;
                return Ok(tcp);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{host}:{port} did not resolve to any address"),
        )
    }))
}
