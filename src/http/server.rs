//! HTTP server side of a connection
//!
//! Receives requests and writes responses on one persistent connection.

use super::{Error, HttpRequest, HttpResponse, HttpSession, RequestParser, Result, SessionOps};
use std::net::SocketAddr;
use std::time::Duration;

/// HTTP server connection
pub struct HttpServer<S: SessionOps> {
    session: HttpSession<S>,
    parser: RequestParser,
}

impl<S: SessionOps> HttpServer<S> {
    pub fn new(session: S) -> Self {
        HttpServer {
            session: HttpSession::new(session),
            parser: RequestParser::new(),
        }
    }

    /// Create a server that rejects request bodies larger than `max_body`
    pub fn with_max_body(session: S, max_body: usize) -> Self {
        HttpServer {
            session: HttpSession::new(session),
            parser: RequestParser::with_max_body(max_body),
        }
    }

    /// Set the timeout for operations, `None` waits forever
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.session.set_timeout(timeout);
    }

    /// Receive the next request on the connection
    ///
    /// Returns `Error::ConnectionClosed` if the peer closes the connection
    /// between requests.
    pub fn receive_request(&mut self) -> Result<HttpRequest> {
        if let Some(request) = self.parser.parse(&[])? {
            return Ok(request);
        }

        let mut temp = [0u8; 8192];
        loop {
            let n = self.session.read(&mut temp)?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }

            if let Some(request) = self.parser.parse(&temp[..n])? {
                return Ok(request);
            }
        }
    }

    /// Send an HTTP response
    pub fn send_response(&mut self, response: &HttpResponse) -> Result<()> {
        self.session.write_all(&response.to_wire())
    }

    pub fn close(&mut self) -> Result<()> {
        self.session.close()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.session.peer_addr()
    }

    /// Whether the client has gone away; pipelined input does not count
    pub fn peer_closed(&self) -> bool {
        self.session.peer_closed()
    }

    pub fn session(&self) -> &HttpSession<S> {
        &self.session
    }
}
