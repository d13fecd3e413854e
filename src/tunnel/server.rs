//! Tunnel server
//!
//! Accepts HTTP connections and serves each on its own thread; every
//! request on a connection goes through a [`RequestDispatcher`]. A reaper
//! thread periodically reclaims idle tunnels.
//!
//! A parked poll is withdrawn as soon as its connection hangs up, and the
//! bytes of a poll response only count as delivered once the response has
//! been written.

use super::dispatch::{poll_response, Reply, RequestDispatcher};
use super::switch::{MessageSwitch, TunnelAcceptor};
use super::{Result, TunnelConfig};
use crate::http::session::FdSessionOps;
use crate::http::{self, HttpServer};
use crate::net;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Upper bound on the reaper's sleep between sweeps
const MAX_REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Back-off after a failed accept so a persistent error cannot spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// A bound, not yet running tunnel server
pub struct TunnelServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    switch: Arc<MessageSwitch>,
}

impl TunnelServer {
    /// Bind to `addr` and create the switch behind it
    ///
    /// The returned acceptor yields a handle for every tunnel a client opens.
    pub fn bind(addr: SocketAddr, config: TunnelConfig) -> Result<(Self, TunnelAcceptor)> {
        let listener = net::bind_listener(addr)?;
        let local_addr = listener.local_addr().map_err(net::Error::from)?;
        let (switch, acceptor) = MessageSwitch::new(config);

        info!(addr = %local_addr, "tunnel server listening");
        Ok((
            TunnelServer {
                listener,
                local_addr,
                switch,
            },
            acceptor,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn switch(&self) -> &Arc<MessageSwitch> {
        &self.switch
    }

    /// Start the accept and reaper threads
    pub fn spawn(self) -> Result<ServerHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let (stop_reaper, reaper_stopped) = mpsc::channel::<()>();

        let reaper = {
            let switch = self.switch.clone();
            let interval = (switch.config().idle_timeout() / 2).min(MAX_REAP_INTERVAL);
            thread::Builder::new()
                .name("tunnel-reaper".to_string())
                .spawn(move || loop {
                    match reaper_stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let reaped = switch.reap_idle();
                            if reaped > 0 {
                                debug!(reaped, "idle sweep");
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                })
                .map_err(net::Error::from)?
        };

        let acceptor = {
            let switch = self.switch.clone();
            let shutdown = shutdown.clone();
            let listener = self.listener;
            thread::Builder::new()
                .name("tunnel-accept".to_string())
                .spawn(move || accept_loop(listener, switch, shutdown))
                .map_err(net::Error::from)?
        };

        Ok(ServerHandle {
            local_addr: self.local_addr,
            switch: self.switch,
            shutdown,
            stop_reaper: Some(stop_reaper),
            threads: vec![acceptor, reaper],
        })
    }
}

/// Handle to a running tunnel server; dropping it shuts the server down
pub struct ServerHandle {
    local_addr: SocketAddr,
    switch: Arc<MessageSwitch>,
    shutdown: Arc<AtomicBool>,
    stop_reaper: Option<mpsc::Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn switch(&self) -> &Arc<MessageSwitch> {
        &self.switch
    }

    /// Stop accepting connections and stop the reaper
    ///
    /// Connections already being served run until their client goes away
    /// or they idle out.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_reaper.take();

        // Wake the accept thread so it observes the flag.
        if let Err(err) = TcpStream::connect(self.local_addr) {
            warn!(error = %err, "could not wake accept thread");
        }

        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                warn!("server thread panicked");
            }
        }
        info!(addr = %self.local_addr, "tunnel server stopped");
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, switch: Arc<MessageSwitch>, shutdown: Arc<AtomicBool>) {
    for stream in listener.incoming() {
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        match stream {
            Ok(stream) => {
                let switch = switch.clone();
                let spawned = thread::Builder::new()
                    .name("tunnel-conn".to_string())
                    .spawn(move || serve_connection(stream, switch));
                if let Err(err) = spawned {
                    warn!(error = %err, "failed to spawn connection thread");
                }
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                thread::sleep(ACCEPT_ERROR_BACKOFF);
            }
        }
    }
    debug!("accept loop stopped");
}

/// Serve tunnel requests on one connection until it closes
fn serve_connection(stream: TcpStream, switch: Arc<MessageSwitch>) {
    let remote_addr = stream.peer_addr().ok();
    if let Err(err) = stream.set_nodelay(true) {
        trace!(error = %err, "set_nodelay failed");
    }

    let config = switch.config();
    let mut server =
        HttpServer::with_max_body(FdSessionOps::new(stream), config.max_content_length());
    server.set_timeout(Some(config.idle_timeout()));
    let dispatcher = RequestDispatcher::new(switch.clone(), remote_addr);
    debug!(remote = ?remote_addr, "connection accepted");

    loop {
        let request = match server.receive_request() {
            Ok(request) => request,
            Err(http::Error::ConnectionClosed | http::Error::Timeout) => break,
            Err(err @ (http::Error::Io(_) | http::Error::Network(_))) => {
                debug!(remote = ?remote_addr, error = %err, "connection failed");
                break;
            }
            Err(err) => {
                let response = dispatcher.reject_malformed(&err);
                if let Err(err) = server.send_response(&response) {
                    debug!(remote = ?remote_addr, error = %err, "failed to send rejection");
                }
                break;
            }
        };

        let client_close = request.headers().connection_close();
        let (response, close, delivery) = match dispatcher.dispatch(request) {
            Reply::Immediate { response, close } => (response, close, None),
            Reply::Deferred(poll) => match poll.wait_while(|| !server.peer_closed()) {
                // A write to a hung up peer can still succeed locally.
                Some(delivery) if server.peer_closed() => {
                    debug!(remote = ?remote_addr, "poll requester went away");
                    delivery.abandon();
                    break;
                }
                Some(delivery) => (poll_response(delivery.reply().clone()), false, Some(delivery)),
                None => break,
            },
        };

        if let Err(err) = server.send_response(&response) {
            debug!(remote = ?remote_addr, error = %err, "failed to send response");
            if let Some(delivery) = delivery {
                delivery.abandon();
            }
            break;
        }
        if let Some(delivery) = delivery {
            delivery.commit();
        }
        if close || client_close {
            break;
        }
    }

    if let Err(err) = server.close() {
        trace!(error = %err, "close failed");
    }
    debug!(remote = ?remote_addr, "connection closed");
}
