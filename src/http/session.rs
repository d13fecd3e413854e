//! Session operations abstraction
//!
//! HTTP I/O goes through the [`SessionOps`] trait so that the client and
//! server code does not care what carries the bytes. [`HttpSession`] adds
//! read/write timeouts on top by polling before every operation.

use super::{Error, Result};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::time::Duration;

/// Session operations trait
pub trait SessionOps {
    /// Wait until the session is ready for `events`
    ///
    /// Returns false if `timeout` elapsed first. `None` waits forever.
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool>;

    /// Read data from the session
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write data to the session
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Close the session
    fn close(&mut self) -> Result<()>;

    /// Address of the remote peer, if the transport has one
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Whether the peer has closed or reset the connection
    ///
    /// Never blocks and never consumes input. Transports that cannot tell
    /// report false.
    fn peer_closed(&self) -> bool {
        false
    }
}

/// Poll events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
}

/// HTTP session wrapping a transport with session operations
pub struct HttpSession<S: SessionOps> {
    session: S,
    timeout: Option<Duration>,
}

impl<S: SessionOps> HttpSession<S> {
    /// Create a new HTTP session with a 10 second I/O timeout
    pub fn new(session: S) -> Self {
        HttpSession {
            session,
            timeout: Some(Duration::from_secs(10)),
        }
    }

    /// Set the timeout for operations, `None` disables it
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Read data with timeout
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.session.poll(PollEvents::Read, self.timeout)? {
            return Err(Error::Timeout);
        }

        self.session.read(buf)
    }

    /// Write all of `buf`, polling before each partial write
    pub fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            if !self.session.poll(PollEvents::Write, self.timeout)? {
                return Err(Error::Timeout);
            }

            let n = self.session.write(buf)?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            buf = &buf[n..];
        }

        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.session.close()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.session.peer_addr()
    }

    pub fn peer_closed(&self) -> bool {
        self.session.peer_closed()
    }

    pub fn get_ref(&self) -> &S {
        &self.session
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.session
    }
}

/// Plain TCP session operations
pub struct FdSessionOps {
    stream: TcpStream,
}

impl FdSessionOps {
    pub fn new(stream: TcpStream) -> Self {
        FdSessionOps { stream }
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

impl SessionOps for FdSessionOps {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        use libc::{poll, pollfd, POLLIN, POLLOUT};

        let mut pfd = pollfd {
            fd: self.stream.as_raw_fd(),
            events: match events {
                PollEvents::Read => POLLIN,
                PollEvents::Write => POLLOUT,
            },
            revents: 0,
        };

        let timeout_ms = timeout
            .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(-1);

        loop {
            // SAFETY: pfd is a valid pollfd for the duration of the call and nfds is 1.
            let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };

            if result >= 0 {
                return Ok(result > 0);
            }

            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(Error::Io(err));
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.stream.read(buf).map_err(Error::from)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.stream.write(buf).map_err(Error::from)
    }

    fn close(&mut self) -> Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(Error::from(e)),
            _ => Ok(()),
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    fn peer_closed(&self) -> bool {
        use libc::{poll, pollfd, POLLERR, POLLHUP, POLLIN};

        let mut pfd = pollfd {
            fd: self.stream.as_raw_fd(),
            events: POLLIN,
            revents: 0,
        };

        // SAFETY: pfd is a valid pollfd for the duration of the call and nfds is 1.
        let result = unsafe { poll(&mut pfd as *mut pollfd, 1, 0) };
        if result <= 0 {
            return false;
        }
        if pfd.revents & (POLLHUP | POLLERR) != 0 {
            return true;
        }

        // Readable: either pipelined input or end of stream.
        let mut byte = [0u8; 1];
        match self.stream.peek(&mut byte) {
            Ok(n) => n == 0,
            Err(err) => !matches!(
                err.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }
}

/// Helper to create an HTTP session from a TCP stream
pub fn from_tcp_stream(stream: TcpStream) -> HttpSession<FdSessionOps> {
    HttpSession::new(FdSessionOps::new(stream))
}
