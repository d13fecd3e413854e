//! httptunnel - socket-like byte streams over plain HTTP/1.1
//!
//! This crate emulates a persistent, ordered, full-duplex connection on top
//! of ordinary HTTP request/response exchanges, for clients that can only
//! reach a server through proxies or firewalls that allow nothing but HTTP.
//!
//! - [`tunnel::TunnelServer`] accepts tunnels and hands each one to the
//!   application as an [`tunnel::AcceptedTunnel`]
//! - [`tunnel::TunnelClientChannel`] is the client-side end of a tunnel
//! - [`http`] is the HTTP/1.1 layer both sides are built on

pub mod http;
pub mod logging;
pub mod net;
pub mod tunnel;
