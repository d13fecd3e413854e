//! TCP socket helpers
//!
//! Listener and connector setup shared by the tunnel server and client,
//! built on `socket2` so socket options are applied before bind/connect.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Result type for network operations
pub type Result<T> = std::result::Result<T, Error>;

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Cannot resolve address: {0}")]
    Resolve(String),

    #[error("Connect to {0} timed out")]
    ConnectTimeout(SocketAddr),
}

/// Listen backlog used by [`bind_listener`]
pub const LISTEN_BACKLOG: i32 = 128;

/// Resolve `addr` ("host:port") to the first socket address it yields
pub fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::Resolve(addr.to_string()))
}

/// Bind a listening socket with `SO_REUSEADDR` set
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

/// Connect to `addr`, giving up after `timeout`
pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    match socket.connect_timeout(&addr.into(), timeout) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::TimedOut => return Err(Error::ConnectTimeout(addr)),
        Err(e) => return Err(e.into()),
    }

    let stream: TcpStream = socket.into();
    stream.set_nodelay(true)?;
    Ok(stream)
}
