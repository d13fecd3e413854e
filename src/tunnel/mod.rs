//! HTTP tunnel transport
//!
//! A tunnel is a full-duplex byte stream carried over discrete HTTP
//! exchanges. The client opens it, pushes bytes with send-data requests and
//! keeps exactly one receive-data (poll) request outstanding so the server
//! has somewhere to put bytes flowing the other way.
//!
//! # Architecture
//!
//! ```text
//!  client application                               server application
//!        |  write                                          ^  read
//!        v                                                 |
//!  TunnelClientChannel --PUT-->  RequestDispatcher --> MessageSwitch --> AcceptedTunnel
//!   (WriteFragmenter)   <--GET--   (per connection)     (registry)        (WriteFragmenter)
//! ```
//!
//! - [`MessageSwitch`] owns every live tunnel and is shared by all HTTP
//!   connection threads.
//! - [`RequestDispatcher`] turns one HTTP request into one switch call and
//!   builds the response. Receive-data is the only deferred response.
//! - [`TunnelClientChannel`] runs its state machine on a dedicated event
//!   loop thread; a second thread carries the long poll.
//! - [`WriteFragmenter`] bounds the size of every outbound transfer.
//!
//! # Examples
//!
//! ```no_run
//! use httptunnel::tunnel::{TunnelClientChannel, TunnelConfig, TunnelServer};
//!
//! let config = TunnelConfig::default();
//! let (server, acceptor) = TunnelServer::bind("127.0.0.1:0".parse().unwrap(), config.clone()).unwrap();
//! let handle = server.spawn().unwrap();
//!
//! let client = TunnelClientChannel::new(config).unwrap();
//! client.connect(handle.local_addr()).wait().unwrap();
//! client.write(&b"hello"[..]).wait().unwrap();
//!
//! let tunnel = acceptor.accept().unwrap();
//! assert_eq!(tunnel.read().unwrap().as_ref(), b"hello");
//! ```

pub mod channel;
pub mod client;
pub mod completion;
pub mod config;
pub mod dispatch;
pub mod fragmenter;
pub mod message;
pub mod server;
pub mod switch;

pub use channel::{ByteStreamChannel, ConfigurableTransport};
pub use client::{ConnectState, HttpConnector, TunnelClientChannel};
pub use completion::{Completion, CompletionAggregator};
pub use config::{TunnelConfig, TunnelConfigBuilder};
pub use dispatch::{Reply, RequestDispatcher};
pub use fragmenter::WriteFragmenter;
pub use message::TunnelOperation;
pub use server::{ServerHandle, TunnelServer};
pub use switch::{AcceptedTunnel, Delivery, MessageSwitch, PendingPoll, PollReply, TunnelAcceptor};

use std::fmt;
use std::sync::Arc;

/// Result type for tunnel operations
pub type Result<T> = std::result::Result<T, Error>;

/// Tunnel errors
///
/// Cloneable so that one failure can be reported to every holder of a
/// [`Completion`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(Arc<crate::http::Error>),

    #[error("Network error: {0}")]
    Network(Arc<crate::net::Error>),

    #[error("Request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Channel not connected")]
    NotConnected,

    #[error("A poll is already pending for tunnel {0}")]
    PollPending(TunnelId),

    #[error("Tunnel {0} is closed or does not exist")]
    UnknownTunnel(TunnelId),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Timeout")]
    Timeout,
}

impl From<crate::http::Error> for Error {
    fn from(err: crate::http::Error) -> Self {
        Error::Transport(Arc::new(err))
    }
}

impl From<crate::net::Error> for Error {
    fn from(err: crate::net::Error) -> Self {
        Error::Network(Arc::new(err))
    }
}

/// Opaque tunnel identifier issued by the server on open
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelId(String);

impl TunnelId {
    /// Allocate a fresh random identifier
    pub fn generate() -> Self {
        TunnelId(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TunnelId {
    fn from(s: &str) -> Self {
        TunnelId(s.to_string())
    }
}

impl From<String> for TunnelId {
    fn from(s: String) -> Self {
        TunnelId(s)
    }
}
