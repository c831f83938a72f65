//! # Transports
//!
//! Purpose: The byte pipe under a connection. The connection driver only
//! needs connect, read, write and close; TCP and Unix sockets provide them.
//!
//! ## Design Principles
//! 1. **Static Dispatch**: The driver is generic over `Transport`; the pool
//!    picks the concrete type once per connection through `AnyTransport`.
//! 2. **Cancel-Safe Reads**: `read` appends into a caller-owned `BytesMut` so
//!    it can sit inside `tokio::select!` without losing bytes.
//! 3. **Low Latency**: TCP sockets disable Nagle.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};

use rdasync_common::{ConnectionOptions, Schema};

/// Port used when a TCP uri does not name one.
pub const DEFAULT_TCP_PORT: u16 = 6379;

/// Async byte stream used by one connection.
pub trait Transport: Send + 'static {
    /// Opens the stream to the endpoint described by `options`.
    fn connect(&mut self, options: &ConnectionOptions) -> impl Future<Output = io::Result<()>> + Send;

    /// Appends available bytes to `buf` and returns how many were read.
    /// Zero means the peer closed the stream. Must be cancel-safe.
    fn read(&mut self, buf: &mut BytesMut) -> impl Future<Output = io::Result<usize>> + Send;

    /// Writes the whole buffer.
    fn write(&mut self, data: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    fn is_connected(&self) -> bool;

    /// Drops the stream. Safe to call more than once.
    fn close(&mut self);
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport is not connected")
}

/// TCP transport.
#[derive(Debug, Default)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new() -> Self {
        TcpTransport::default()
    }
}

impl Transport for TcpTransport {
    async fn connect(&mut self, options: &ConnectionOptions) -> io::Result<()> {
        let (host, port) = split_host_port(&options.uri)?;
        let mut last_err = None;
        for addr in tokio::net::lookup_host((host, port)).await? {
            match connect_addr(addr, options.keep_alive).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no address resolved for {}", options.uri),
            )
        }))
    }

    async fn read(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        match self.stream.as_mut() {
            Some(stream) => stream.read_buf(buf).await,
            None => Err(not_connected()),
        }
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match self.stream.as_mut() {
            Some(stream) => stream.write_all(data).await,
            None => Err(not_connected()),
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn close(&mut self) {
        self.stream = None;
    }
}

async fn connect_addr(addr: SocketAddr, keep_alive: bool) -> io::Result<TcpStream> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_keepalive(keep_alive)?;
    socket.connect(addr).await
}

/// Splits `host[:port]`, `[v6]:port` or a bare v6 literal.
fn split_host_port(uri: &str) -> io::Result<(&str, u16)> {
    let invalid = || io::Error::new(io::ErrorKind::InvalidInput, format!("invalid tcp address: {}", uri));

    if let Some(rest) = uri.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        return match tail.strip_prefix(':') {
            Some(port) => Ok((host, port.parse().map_err(|_| invalid())?)),
            None if tail.is_empty() => Ok((host, DEFAULT_TCP_PORT)),
            None => Err(invalid()),
        };
    }

    match uri.rsplit_once(':') {
        // More than one colon: a bare IPv6 literal.
        Some((host, _)) if host.contains(':') => Ok((uri, DEFAULT_TCP_PORT)),
        Some((host, port)) if !host.is_empty() => Ok((host, port.parse().map_err(|_| invalid())?)),
        Some(_) => Err(invalid()),
        None => Ok((uri, DEFAULT_TCP_PORT)),
    }
}

/// Unix-domain socket transport.
#[derive(Debug, Default)]
pub struct UnixTransport {
    #[cfg(unix)]
    stream: Option<tokio::net::UnixStream>,
}

impl UnixTransport {
    pub fn new() -> Self {
        UnixTransport::default()
    }
}

#[cfg(unix)]
impl Transport for UnixTransport {
    async fn connect(&mut self, options: &ConnectionOptions) -> io::Result<()> {
        self.stream = Some(tokio::net::UnixStream::connect(&options.uri).await?);
        Ok(())
    }

    async fn read(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        match self.stream.as_mut() {
            Some(stream) => stream.read_buf(buf).await,
            None => Err(not_connected()),
        }
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match self.stream.as_mut() {
            Some(stream) => stream.write_all(data).await,
            None => Err(not_connected()),
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn close(&mut self) {
        self.stream = None;
    }
}

#[cfg(not(unix))]
impl Transport for UnixTransport {
    async fn connect(&mut self, _options: &ConnectionOptions) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unix sockets are not supported on this platform",
        ))
    }

    async fn read(&mut self, _buf: &mut BytesMut) -> io::Result<usize> {
        Err(not_connected())
    }

    async fn write(&mut self, _data: &[u8]) -> io::Result<()> {
        Err(not_connected())
    }

    fn is_connected(&self) -> bool {
        false
    }

    fn close(&mut self) {}
}

/// Transport chosen from the connection schema.
#[derive(Debug)]
pub enum AnyTransport {
    Tcp(TcpTransport),
    Unix(UnixTransport),
}

impl AnyTransport {
    pub fn for_schema(schema: Schema) -> Self {
        match schema {
            Schema::Tcp => AnyTransport::Tcp(TcpTransport::new()),
            Schema::Unix => AnyTransport::Unix(UnixTransport::new()),
        }
    }
}

impl Transport for AnyTransport {
    async fn connect(&mut self, options: &ConnectionOptions) -> io::Result<()> {
        match self {
            AnyTransport::Tcp(inner) => inner.connect(options).await,
            AnyTransport::Unix(inner) => inner.connect(options).await,
        }
    }

    async fn read(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        match self {
            AnyTransport::Tcp(inner) => inner.read(buf).await,
            AnyTransport::Unix(inner) => inner.read(buf).await,
        }
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            AnyTransport::Tcp(inner) => inner.write(data).await,
            AnyTransport::Unix(inner) => inner.write(data).await,
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            AnyTransport::Tcp(inner) => inner.is_connected(),
            AnyTransport::Unix(inner) => inner.is_connected(),
        }
    }

    fn close(&mut self) {
        match self {
            AnyTransport::Tcp(inner) => inner.close(),
            AnyTransport::Unix(inner) => inner.close(),
        }
    }
}
