//! HTTP/1.1 layer used by the tunnel
//!
//! This module provides the request/response plumbing the tunnel protocol
//! rides on: message types, an incremental parser and blocking client and
//! server wrappers over a session.
//!
//! # Architecture
//!
//! The HTTP layer uses a session operations abstraction so that all I/O
//! code is independent of the underlying transport:
//!
//! - `SessionOps` trait defines operations (poll, read, write, close)
//! - `HttpSession` adds timeouts on top of a `SessionOps` implementation
//! - `FdSessionOps` is the plain TCP implementation
//!
//! Bodies are always framed with `Content-Length`. Connections are
//! persistent; bytes belonging to a pipelined follow-up message are kept by
//! the parser and consumed by the next receive call.
//!
//! # Examples
//!
//! ```no_run
//! use httptunnel::http::{HttpClient, HttpRequest, Method};
//! use httptunnel::http::session::FdSessionOps;
//! use std::net::TcpStream;
//!
//! let stream = TcpStream::connect("127.0.0.1:8080").unwrap();
//! let mut client = HttpClient::new(FdSessionOps::new(stream));
//!
//! let request = HttpRequest::builder()
//!     .method(Method::Get)
//!     .uri("/")
//!     .header("Host", "localhost")
//!     .build();
//! let response = client.exchange(&request).unwrap();
//! assert_eq!(response.status().code(), 200);
//! ```

pub mod client;
pub mod headers;
pub mod message;
pub mod parser;
pub mod server;
pub mod session;

pub use client::HttpClient;
pub use headers::Headers;
pub use message::{HttpRequest, HttpResponse, Method, Status, Version};
pub use parser::{RequestParser, ResponseParser};
pub use server::HttpServer;
pub use session::{HttpSession, SessionOps};

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] crate::net::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid HTTP version: {0}")]
    InvalidVersion(String),

    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("Invalid HTTP status: {0}")]
    InvalidStatus(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Body of {declared} bytes exceeds the limit of {limit} bytes")]
    BodyTooLarge { declared: usize, limit: usize },

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Maximum number of headers per message
pub const MAX_HEADERS: usize = 64;

/// Maximum size of a request/status line plus headers
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Default limit on a message body
pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;

/// CRLF line ending
pub const CRLF: &str = "\r\n";
