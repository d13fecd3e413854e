//! HTTP client side of a connection
//!
//! Sends requests and receives responses on one persistent connection.

use super::{Error, HttpRequest, HttpResponse, HttpSession, ResponseParser, Result, SessionOps};
use std::time::Duration;

/// HTTP client connection
pub struct HttpClient<S: SessionOps> {
    session: HttpSession<S>,
    parser: ResponseParser,
}

impl<S: SessionOps> HttpClient<S> {
    pub fn new(session: S) -> Self {
        HttpClient {
            session: HttpSession::new(session),
            parser: ResponseParser::new(),
        }
    }

    /// Set the timeout for operations, `None` waits forever
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.session.set_timeout(timeout);
    }

    /// Send an HTTP request
    pub fn send_request(&mut self, request: &HttpRequest) -> Result<()> {
        self.session.write_all(&request.to_wire())
    }

    /// Receive the next HTTP response
    pub fn receive_response(&mut self) -> Result<HttpResponse> {
        if let Some(response) = self.parser.parse(&[])? {
            return Ok(response);
        }

        let mut temp = [0u8; 8192];
        loop {
            let n = self.session.read(&mut temp)?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }

            if let Some(response) = self.parser.parse(&temp[..n])? {
                return Ok(response);
            }
        }
    }

    /// Send `request` and wait for its response
    pub fn exchange(&mut self, request: &HttpRequest) -> Result<HttpResponse> {
        self.send_request(request)?;
        self.receive_response()
    }

    pub fn close(&mut self) -> Result<()> {
        self.parser.reset();
        self.session.close()
    }

    pub fn session(&self) -> &HttpSession<S> {
        &self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::session::FdSessionOps;
    use crate::http::Method;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    #[test]
    fn test_send_request() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });

        let stream = TcpStream::connect(addr).unwrap();
        let mut client = HttpClient::new(FdSessionOps::new(stream));

        let request = HttpRequest::builder()
            .method(Method::Get)
            .uri("/http-tunnel")
            .header("X-Tunnel-Id", "t1")
            .build();
        client.send_request(&request).unwrap();

        let wire = handle.join().unwrap();
        assert!(wire.starts_with("GET /http-tunnel HTTP/1.1\r\n"));
        assert!(wire.contains("X-Tunnel-Id: t1\r\n"));
    }

    #[test]
    fn test_exchange_twice_on_one_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = vec![0u8; 1024];
            for body in ["one", "two"] {
                stream.read(&mut buf).unwrap();
                let response = format!("HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\n{}", body);
                stream.write_all(response.as_bytes()).unwrap();
            }
        });

        let stream = TcpStream::connect(addr).unwrap();
        let mut client = HttpClient::new(FdSessionOps::new(stream));
        let request = HttpRequest::builder().build();

        let first = client.exchange(&request).unwrap();
        assert_eq!(first.body().as_ref(), b"one");
        let second = client.exchange(&request).unwrap();
        assert_eq!(second.body().as_ref(), b"two");

        handle.join().unwrap();
    }

    #[test]
    fn test_connection_closed_mid_response() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = vec![0u8; 1024];
            stream.read(&mut buf).unwrap();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort")
                .unwrap();
        });

        let stream = TcpStream::connect(addr).unwrap();
        let mut client = HttpClient::new(FdSessionOps::new(stream));

        let result = client.exchange(&HttpRequest::builder().build());
        handle.join().unwrap();
        assert!(matches!(result, Err(Error::ConnectionClosed)));
    }
}
