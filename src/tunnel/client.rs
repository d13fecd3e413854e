//! Client tunnel channel
//!
//! [`TunnelClientChannel`] is a handle; the channel's state lives on a
//! dedicated event loop thread that receives commands from the handle and
//! is the only thread issuing open, send-data and close requests. The
//! long poll runs on a second thread with its own connection so a parked
//! receive-data request never holds up writes. Its results come back to
//! the event loop as commands, which keeps every state change on one
//! thread.
//!
//! ```text
//!   handle --Command--> event loop --PUT/POST/DELETE--> server
//!                          |   ^
//!                    tunnel id  PollComplete
//!                          v   |
//!                         poller --GET--> server
//! ```

use super::fragmenter::WriteFragmenter;
use super::message;
use super::{ByteStreamChannel, Completion, ConfigurableTransport, Error, Result, TunnelConfig, TunnelId};
use crate::http::session::FdSessionOps;
use crate::http::{self, HttpClient, HttpRequest, HttpResponse};
use crate::net;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Client channel lifecycle
///
/// `Idle -> Connecting -> Connected -> Disconnected`; `Disconnected` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

/// One lazily established HTTP connection to the tunnel server
///
/// The connection is opened on first use and dropped after any error or a
/// `Connection: close` response; the next exchange reconnects. Failed
/// exchanges are never retried.
pub struct HttpConnector {
    addr: SocketAddr,
    host: String,
    connect_timeout: Duration,
    client: Option<HttpClient<FdSessionOps>>,
}

impl HttpConnector {
    pub fn new(addr: SocketAddr, connect_timeout: Duration) -> Self {
        HttpConnector {
            addr,
            host: addr.to_string(),
            connect_timeout,
            client: None,
        }
    }

    /// Value sent in the `Host` header
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Send `request` and wait up to `timeout` for each step of the exchange
    pub fn exchange(&mut self, request: &HttpRequest, timeout: Duration) -> http::Result<HttpResponse> {
        let client = match self.client.take() {
            Some(client) => client,
            None => {
                let stream = net::connect(self.addr, self.connect_timeout)?;
                trace!(addr = %self.addr, "connected");
                HttpClient::new(FdSessionOps::new(stream))
            }
        };
        let client = self.client.insert(client);
        client.set_timeout(Some(timeout));

        match client.exchange(request) {
            Ok(response) => {
                if response.headers().connection_close() {
                    self.disconnect();
                }
                Ok(response)
            }
            Err(err) => {
                self.disconnect();
                Err(err)
            }
        }
    }

    pub fn disconnect(&mut self) {
        if let Some(mut client) = self.client.take() {
            if let Err(err) = client.close() {
                trace!(error = %err, "close failed");
            }
        }
    }
}

impl fmt::Debug for HttpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnector")
            .field("addr", &self.addr)
            .field("connected", &self.client.is_some())
            .finish()
    }
}

enum Command {
    Connect(SocketAddr, Completion),
    Write(Bytes, Completion),
    Close(Completion),
    SuspendRead,
    ResumeRead,
    PollComplete(http::Result<HttpResponse>),
}

struct Status {
    state: ConnectState,
    tunnel_id: Option<TunnelId>,
}

/// State visible to both the handle and the event loop
struct Shared {
    status: Mutex<Status>,
    pending_bytes: AtomicUsize,
    writable: AtomicBool,
    fragmenter: WriteFragmenter,
}

impl Shared {
    fn state(&self) -> ConnectState {
        self.status.lock().state
    }

    fn set_state(&self, state: ConnectState) {
        self.status.lock().state = state;
    }

    /// Account for bytes accepted by `write` but not yet settled
    fn reserve(&self, len: usize, high_water_mark: usize) {
        let pending = self.pending_bytes.fetch_add(len, Ordering::AcqRel) + len;
        if pending > high_water_mark {
            self.writable.store(false, Ordering::Release);
        }
    }

    fn release(&self, len: usize, low_water_mark: usize) {
        let pending = self.pending_bytes.fetch_sub(len, Ordering::AcqRel) - len;
        if pending <= low_water_mark {
            self.writable.store(true, Ordering::Release);
        }
    }
}

/// Client end of an HTTP tunnel
///
/// All operations return immediately; connect, write and close report
/// their outcome through a [`Completion`]. Inbound bytes are read with
/// [`read`](Self::read) or [`read_timeout`](Self::read_timeout). Dropping
/// the handle closes the channel.
pub struct TunnelClientChannel {
    config: TunnelConfig,
    shared: Arc<Shared>,
    commands: Sender<Command>,
    inbound: Mutex<Receiver<Result<Bytes>>>,
    connect_done: Mutex<Option<Completion>>,
    close_done: Mutex<Option<Completion>>,
}

impl TunnelClientChannel {
    /// Create an idle channel and start its event loop
    pub fn new(config: TunnelConfig) -> Result<Self> {
        let shared = Arc::new(Shared {
            status: Mutex::new(Status {
                state: ConnectState::Idle,
                tunnel_id: None,
            }),
            pending_bytes: AtomicUsize::new(0),
            writable: AtomicBool::new(true),
            fragmenter: WriteFragmenter::new(config.split_threshold()),
        });
        let (commands, command_receiver) = mpsc::channel();
        let (inbound_sender, inbound) = mpsc::channel();

        let event_loop = EventLoop {
            config: config.clone(),
            shared: shared.clone(),
            commands: command_receiver,
            poll_results: commands.clone(),
            inbound: Some(inbound_sender),
            connector: None,
            poller: None,
            pending_writes: VecDeque::new(),
            poll_in_flight: false,
            read_suspended: false,
            poll_failed: false,
        };
        thread::Builder::new()
            .name("tunnel-client".to_string())
            .spawn(move || event_loop.run())
            .map_err(net::Error::from)?;

        Ok(TunnelClientChannel {
            config,
            shared,
            commands,
            inbound: Mutex::new(inbound),
            connect_done: Mutex::new(None),
            close_done: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ConnectState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectState::Connected
    }

    /// Tunnel id assigned by the server, once connected
    pub fn tunnel_id(&self) -> Option<TunnelId> {
        self.shared.status.lock().tunnel_id.clone()
    }

    /// False while unacknowledged writes exceed the high water mark, until
    /// they drain to the low water mark
    pub fn is_writable(&self) -> bool {
        self.shared.writable.load(Ordering::Acquire)
    }

    /// Bytes accepted by `write` whose outcome is not yet known
    pub fn pending_write_bytes(&self) -> usize {
        self.shared.pending_bytes.load(Ordering::Acquire)
    }

    /// Hand `command` to the event loop
    ///
    /// Fails, returning the command, once the channel is disconnected. The
    /// status lock is held across the send so nothing can be queued after
    /// the event loop has stopped taking commands.
    fn submit(&self, command: Command) -> std::result::Result<(), Command> {
        let status = self.shared.status.lock();
        if status.state == ConnectState::Disconnected {
            return Err(command);
        }
        let sent = self.commands.send(command).map_err(|err| err.0);
        drop(status);
        sent
    }

    /// Open a tunnel through the server at `addr`
    ///
    /// Only the first call opens a tunnel; later calls return the same
    /// completion.
    pub fn connect(&self, addr: SocketAddr) -> Completion {
        let mut slot = self.connect_done.lock();
        if let Some(done) = slot.as_ref() {
            return done.clone();
        }

        let done = Completion::new();
        *slot = Some(done.clone());
        drop(slot);

        if self.submit(Command::Connect(addr, done.clone())).is_err() {
            done.fail(Error::ChannelClosed);
        }
        done
    }

    /// Queue bytes for the server
    ///
    /// The completion succeeds once every fragment of `data` has been
    /// acknowledged by a send-data response.
    pub fn write(&self, data: impl Into<Bytes>) -> Completion {
        let data = data.into();
        match self.state() {
            ConnectState::Connected => {}
            ConnectState::Disconnected => return Completion::failed(Error::ChannelClosed),
            ConnectState::Idle | ConnectState::Connecting => {
                return Completion::failed(Error::NotConnected)
            }
        }
        if data.is_empty() {
            return Completion::succeeded();
        }

        let len = data.len();
        self.shared
            .reserve(len, self.config.write_buffer_high_water_mark());
        // Release the reservation before the caller can observe the outcome.
        let done = Completion::new();
        let flushed = Completion::new();
        let shared = self.shared.clone();
        let low_water_mark = self.config.write_buffer_low_water_mark();
        let caller = done.clone();
        flushed.add_listener(move |outcome| {
            shared.release(len, low_water_mark);
            caller.complete(outcome.clone());
        });

        if self.submit(Command::Write(data, flushed.clone())).is_err() {
            flushed.fail(Error::ChannelClosed);
        }
        done
    }

    /// Close the tunnel
    ///
    /// The close request is best effort. Only the first call does any work;
    /// later calls return the same completion.
    pub fn close(&self) -> Completion {
        let mut slot = self.close_done.lock();
        if let Some(done) = slot.as_ref() {
            return done.clone();
        }

        let done = Completion::new();
        *slot = Some(done.clone());
        drop(slot);

        if self.submit(Command::Close(done.clone())).is_err() {
            done.succeed();
        }
        done
    }

    /// Block until inbound bytes arrive
    ///
    /// `Ok(None)` is end of stream. A failed poll is reported once as an
    /// error; polling then stays stopped until [`resume_read`](Self::resume_read).
    pub fn read(&self) -> Result<Option<Bytes>> {
        match self.inbound.lock().recv() {
            Ok(item) => item.map(Some),
            Err(_) => Ok(None),
        }
    }

    pub fn read_timeout(&self, timeout: Duration) -> Result<Option<Bytes>> {
        match self.inbound.lock().recv_timeout(timeout) {
            Ok(item) => item.map(Some),
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }

    /// Stop issuing polls; a poll already in flight still delivers its bytes
    pub fn suspend_read(&self) {
        let _ = self.submit(Command::SuspendRead);
    }

    /// Resume polling, also after a failed poll
    pub fn resume_read(&self) {
        let _ = self.submit(Command::ResumeRead);
    }
}

impl Drop for TunnelClientChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for TunnelClientChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.shared.status.lock();
        f.debug_struct("TunnelClientChannel")
            .field("state", &status.state)
            .field("tunnel_id", &status.tunnel_id)
            .finish()
    }
}

impl ByteStreamChannel for TunnelClientChannel {
    fn tunnel_id(&self) -> Option<TunnelId> {
        TunnelClientChannel::tunnel_id(self)
    }

    fn write(&self, data: Bytes) -> Completion {
        TunnelClientChannel::write(self, data)
    }

    fn read_timeout(&self, timeout: Duration) -> Result<Option<Bytes>> {
        TunnelClientChannel::read_timeout(self, timeout)
    }

    fn close(&self) -> Completion {
        TunnelClientChannel::close(self)
    }

    fn is_open(&self) -> bool {
        self.is_connected()
    }
}

impl ConfigurableTransport for TunnelClientChannel {
    fn config(&self) -> &TunnelConfig {
        &self.config
    }

    fn split_threshold(&self) -> NonZeroUsize {
        self.shared.fragmenter.split_threshold()
    }

    fn set_split_threshold(&self, threshold: NonZeroUsize) {
        self.shared.fragmenter.set_split_threshold(threshold);
    }
}

/// Owner of all mutable client state
struct EventLoop {
    config: TunnelConfig,
    shared: Arc<Shared>,
    commands: Receiver<Command>,
    poll_results: Sender<Command>,
    inbound: Option<Sender<Result<Bytes>>>,
    connector: Option<HttpConnector>,
    poller: Option<Sender<TunnelId>>,
    pending_writes: VecDeque<(Bytes, Completion)>,
    poll_in_flight: bool,
    read_suspended: bool,
    poll_failed: bool,
}

impl EventLoop {
    fn run(mut self) {
        while let Ok(command) = self.commands.recv() {
            self.handle(command);

            // Take everything already queued before touching the network.
            while !self.is_disconnected() {
                match self.commands.try_recv() {
                    Ok(command) => self.handle(command),
                    Err(_) => break,
                }
            }

            if !self.is_disconnected() {
                self.flush_writes();
            }
            if self.is_disconnected() {
                break;
            }
        }

        // Submissions stop once the state is Disconnected, so this sees
        // every command that will ever arrive from the handle.
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Connect(_, done) | Command::Write(_, done) => {
                    done.fail(Error::ChannelClosed);
                }
                Command::Close(done) => {
                    done.succeed();
                }
                Command::SuspendRead | Command::ResumeRead | Command::PollComplete(_) => {}
            }
        }
        trace!("client event loop stopped");
    }

    fn is_disconnected(&self) -> bool {
        self.shared.state() == ConnectState::Disconnected
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Connect(addr, done) => self.connect(addr, done),
            Command::Write(data, done) => {
                if self.is_disconnected() {
                    done.fail(Error::ChannelClosed);
                } else {
                    self.pending_writes.push_back((data, done));
                }
            }
            Command::Close(done) => {
                self.close();
                done.succeed();
            }
            Command::SuspendRead => {
                trace!("read suspended");
                self.read_suspended = true;
            }
            Command::ResumeRead => {
                trace!("read resumed");
                self.read_suspended = false;
                self.poll_failed = false;
                self.maybe_poll();
            }
            Command::PollComplete(result) => self.poll_complete(result),
        }
    }

    fn connect(&mut self, addr: SocketAddr, done: Completion) {
        if self.shared.state() != ConnectState::Idle {
            done.fail(Error::ChannelClosed);
            return;
        }
        self.shared.set_state(ConnectState::Connecting);
        debug!(server = %addr, "opening tunnel");

        match self.open_tunnel(addr) {
            Ok(tunnel_id) => {
                info!(server = %addr, tunnel = %tunnel_id, "tunnel connected");
                {
                    let mut status = self.shared.status.lock();
                    status.state = ConnectState::Connected;
                    status.tunnel_id = Some(tunnel_id);
                }
                done.succeed();
                self.maybe_poll();
            }
            Err(err) => {
                warn!(server = %addr, error = %err, "failed to open tunnel");
                self.disconnect();
                done.fail(err);
            }
        }
    }

    fn open_tunnel(&mut self, addr: SocketAddr) -> Result<TunnelId> {
        let mut connector = HttpConnector::new(addr, self.config.connect_timeout());
        let request = message::open_tunnel_request(connector.host());
        let response = connector.exchange(&request, self.config.io_timeout())?;
        let tunnel_id = message::extract_opened_tunnel_id(&response)?;

        let (poller, jobs) = mpsc::channel();
        let poll_connector = HttpConnector::new(addr, self.config.connect_timeout());
        let results = self.poll_results.clone();
        let timeout = self.config.poll_exchange_timeout();
        thread::Builder::new()
            .name("tunnel-poller".to_string())
            .spawn(move || poll_loop(poll_connector, jobs, results, timeout))
            .map_err(net::Error::from)?;

        self.connector = Some(connector);
        self.poller = Some(poller);
        Ok(tunnel_id)
    }

    fn tunnel_id(&self) -> Option<TunnelId> {
        self.shared.status.lock().tunnel_id.clone()
    }

    fn close(&mut self) {
        let tunnel_id = self.tunnel_id();
        if self.shared.state() == ConnectState::Connected {
            if let (Some(connector), Some(tunnel_id)) = (self.connector.as_mut(), tunnel_id) {
                let request = message::close_tunnel_request(connector.host(), &tunnel_id);
                match connector.exchange(&request, self.config.io_timeout()) {
                    Ok(response) => {
                        if let Err(err) = message::check_success(&response) {
                            debug!(tunnel = %tunnel_id, error = %err, "close request rejected");
                        }
                    }
                    Err(err) => debug!(tunnel = %tunnel_id, error = %err, "close request failed"),
                }
                info!(tunnel = %tunnel_id, "tunnel closed");
            }
        }
        self.disconnect();
    }

    /// Enter the terminal state and release everything tied to the tunnel
    fn disconnect(&mut self) {
        self.shared.set_state(ConnectState::Disconnected);
        for (_, done) in self.pending_writes.drain(..) {
            done.fail(Error::ChannelClosed);
        }
        if let Some(mut connector) = self.connector.take() {
            connector.disconnect();
        }
        // Dropping these stops the poller and ends the inbound stream.
        self.poller = None;
        self.inbound = None;
    }

    fn deliver(&self, item: Result<Bytes>) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.send(item);
        }
    }

    fn maybe_poll(&mut self) {
        if self.poll_in_flight || self.read_suspended || self.poll_failed {
            return;
        }
        if self.shared.state() != ConnectState::Connected {
            return;
        }
        let (Some(poller), Some(tunnel_id)) = (self.poller.as_ref(), self.tunnel_id()) else {
            return;
        };
        if poller.send(tunnel_id).is_ok() {
            self.poll_in_flight = true;
        }
    }

    fn poll_complete(&mut self, result: http::Result<HttpResponse>) {
        self.poll_in_flight = false;
        if self.is_disconnected() {
            return;
        }

        match result {
            Ok(mut response) => {
                match message::check_success(&response) {
                    Ok(()) => {}
                    // An abandoned earlier poll still holds the slot; the
                    // tunnel itself is fine.
                    Err(err @ Error::Rejected { status: 409, .. }) => {
                        debug!(error = %err, "poll conflicted with a stale poll");
                        self.poll_failed = true;
                        self.deliver(Err(err));
                        return;
                    }
                    Err(err) => {
                        warn!(error = %err, "poll rejected");
                        self.deliver(Err(err));
                        self.disconnect();
                        return;
                    }
                }

                let closed = message::is_tunnel_closed(&response);
                let data = response.take_body();
                trace!(bytes = data.len(), closed, "poll answered");
                if !data.is_empty() {
                    self.deliver(Ok(data));
                }

                if closed {
                    info!(tunnel = ?self.tunnel_id(), "tunnel closed by server");
                    self.disconnect();
                } else {
                    self.maybe_poll();
                }
            }
            Err(err) => {
                debug!(error = %err, "poll failed");
                self.poll_failed = true;
                self.deliver(Err(err.into()));
            }
        }
    }

    fn flush_writes(&mut self) {
        let shared = self.shared.clone();
        while let Some((mut data, done)) = self.pending_writes.pop_front() {
            let flushed = shared
                .fragmenter
                .flush(&mut data, |fragment| self.send_fragment(fragment));
            flushed.forward_to(done);
        }
    }

    fn send_fragment(&mut self, fragment: Bytes) -> Completion {
        if self.shared.state() != ConnectState::Connected {
            return Completion::failed(Error::ChannelClosed);
        }
        let tunnel_id = self.tunnel_id();
        let (Some(connector), Some(tunnel_id)) = (self.connector.as_mut(), tunnel_id) else {
            return Completion::failed(Error::ChannelClosed);
        };

        trace!(tunnel = %tunnel_id, bytes = fragment.len(), "sending fragment");
        let request = message::send_data_request(connector.host(), &tunnel_id, fragment);
        match connector.exchange(&request, self.config.io_timeout()) {
            Ok(response) => match message::check_success(&response) {
                Ok(()) => Completion::succeeded(),
                Err(err) => {
                    warn!(tunnel = %tunnel_id, error = %err, "send rejected");
                    self.disconnect();
                    Completion::failed(err)
                }
            },
            Err(err) => {
                debug!(tunnel = %tunnel_id, error = %err, "send failed");
                Completion::failed(err.into())
            }
        }
    }
}

/// Run receive-data exchanges on behalf of the event loop
fn poll_loop(
    mut connector: HttpConnector,
    jobs: Receiver<TunnelId>,
    results: Sender<Command>,
    timeout: Duration,
) {
    for tunnel_id in jobs.iter() {
        let request = message::receive_data_request(connector.host(), &tunnel_id);
        let result = connector.exchange(&request, timeout);
        if results.send(Command::PollComplete(result)).is_err() {
            break;
        }
    }
    connector.disconnect();
    trace!("poller stopped");
}
