//! Message switch
//!
//! The switch is the server-side registry of live tunnels. HTTP connection
//! threads call into it to route inbound bytes and to park receive-data
//! requests; the application talks to the same tunnels through
//! [`AcceptedTunnel`] handles obtained from the [`TunnelAcceptor`].
//!
//! Locking: the registry map lock is held only for lookups, inserts and
//! removals, and never while a tunnel's own lock is held. All state of one
//! tunnel (queues, pending poll, status) sits behind that tunnel's lock.
//!
//! A pending poll is a one-slot channel. The switch keeps the sending half
//! in the tunnel's waiter slot; the connection thread blocks on the
//! receiving half inside [`PendingPoll::wait_while`]. Replies are always
//! sent while the tunnel lock is held and the slot is cleared in the same
//! critical section, so a reply and a poll timeout can never both win.
//!
//! Bytes handed to a poll travel as a [`Delivery`]. The writes they came
//! from complete only when the delivery is committed after the response
//! went out; an abandoned delivery puts its bytes back at the head of the
//! queue.

use super::fragmenter::WriteFragmenter;
use super::{ByteStreamChannel, Completion, ConfigurableTransport, Error, Result, TunnelConfig, TunnelId};
use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError, TrySendError};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

static NEXT_POLL_TICKET: AtomicU64 = AtomicU64::new(1);

/// How often a parked poll checks whether its requester is still there
const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Answer to a receive-data request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollReply {
    /// Buffered bytes, empty when the poll timed out
    Data(Bytes),
    /// Final bytes of a tunnel that has been closed
    Closed(Bytes),
}

impl PollReply {
    /// The payload and whether the tunnel is closed
    pub fn into_parts(self) -> (Bytes, bool) {
        match self {
            PollReply::Data(data) => (data, false),
            PollReply::Closed(data) => (data, true),
        }
    }
}

/// A reply together with the queued chunks it carries
struct Parcel {
    reply: PollReply,
    chunks: Vec<OutboundChunk>,
}

impl Parcel {
    fn empty(reply: PollReply) -> Self {
        Parcel {
            reply,
            chunks: Vec::new(),
        }
    }
}

/// Sending half of a parked receive-data request
struct PollSink {
    ticket: u64,
    sender: SyncSender<Parcel>,
}

impl PollSink {
    /// Hand `parcel` to the waiting connection thread
    ///
    /// Fails only if the waiter has gone away, giving the parcel back.
    fn deliver(self, parcel: Parcel) -> std::result::Result<(), Parcel> {
        self.sender.try_send(parcel).map_err(|err| match err {
            TrySendError::Full(parcel) | TrySendError::Disconnected(parcel) => parcel,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TunnelStatus {
    Open,
    /// Closed by the application; buffered bytes await one last poll
    Draining,
    Closed,
}

struct OutboundChunk {
    data: Bytes,
    done: Completion,
}

struct Answered {
    closed: bool,
}

struct TunnelState {
    status: TunnelStatus,
    inbound: VecDeque<Bytes>,
    outbound: VecDeque<OutboundChunk>,
    poll: Option<PollSink>,
    last_activity: Instant,
}

impl TunnelState {
    /// Whether a poll arriving now would be answered immediately
    fn has_reply(&self) -> bool {
        !self.outbound.is_empty() || self.status == TunnelStatus::Draining
    }

    /// Answer `sink` with up to `limit` bytes of queued outbound data
    ///
    /// At least one chunk is taken even if it exceeds `limit`. If the waiter
    /// has gone away the queue is restored and `None` is returned.
    fn answer(&mut self, sink: PollSink, limit: usize) -> Option<Answered> {
        let mut chunks = Vec::new();
        let mut size = 0;
        while let Some(chunk) = self.outbound.front() {
            if !chunks.is_empty() && size + chunk.data.len() > limit {
                break;
            }
            size += chunk.data.len();
            chunks.extend(self.outbound.pop_front());
        }

        let payload = match chunks.as_slice() {
            [] => Bytes::new(),
            [single] => single.data.clone(),
            many => {
                let mut joined = BytesMut::with_capacity(size);
                for chunk in many {
                    joined.extend_from_slice(&chunk.data);
                }
                joined.freeze()
            }
        };

        let closing = self.status == TunnelStatus::Draining && self.outbound.is_empty();
        let reply = if closing {
            PollReply::Closed(payload)
        } else {
            PollReply::Data(payload)
        };

        if let Err(parcel) = sink.deliver(Parcel { reply, chunks }) {
            self.requeue(parcel.chunks);
            return None;
        }

        self.last_activity = Instant::now();
        if closing {
            self.status = TunnelStatus::Closed;
        }
        Some(Answered { closed: closing })
    }

    /// Put chunks back at the head of the outbound queue, keeping their order
    fn requeue(&mut self, chunks: Vec<OutboundChunk>) {
        for chunk in chunks.into_iter().rev() {
            self.outbound.push_front(chunk);
        }
    }
}

struct Tunnel {
    id: TunnelId,
    remote_addr: Option<SocketAddr>,
    state: Mutex<TunnelState>,
    readable: Condvar,
    fragmenter: WriteFragmenter,
}

impl Tunnel {
    fn new(id: TunnelId, remote_addr: Option<SocketAddr>, split_threshold: NonZeroUsize) -> Self {
        Tunnel {
            id,
            remote_addr,
            state: Mutex::new(TunnelState {
                status: TunnelStatus::Open,
                inbound: VecDeque::new(),
                outbound: VecDeque::new(),
                poll: None,
                last_activity: Instant::now(),
            }),
            readable: Condvar::new(),
            fragmenter: WriteFragmenter::new(split_threshold),
        }
    }

    fn reply_limit(&self) -> usize {
        self.fragmenter.split_threshold().get()
    }

    /// Mark the tunnel closed if `should_close` agrees
    ///
    /// Releases a pending poll with a final empty reply, discards queued
    /// outbound chunks and wakes blocked readers. Returns the completions of
    /// the discarded chunks, which the caller fails once the lock is gone.
    fn shut<F>(&self, should_close: F) -> Option<Vec<Completion>>
    where
        F: FnOnce(&TunnelState) -> bool,
    {
        let mut state = self.state.lock();
        if state.status == TunnelStatus::Closed || !should_close(&state) {
            return None;
        }

        state.status = TunnelStatus::Closed;
        if let Some(sink) = state.poll.take() {
            let _ = sink.deliver(Parcel::empty(PollReply::Closed(Bytes::new())));
        }
        self.readable.notify_all();
        Some(state.outbound.drain(..).map(|chunk| chunk.done).collect())
    }
}

fn fail_closed(completions: Vec<Completion>) {
    for completion in completions {
        completion.fail(Error::ChannelClosed);
    }
}

/// Registry and router for every live tunnel
pub struct MessageSwitch {
    config: TunnelConfig,
    tunnels: Mutex<HashMap<TunnelId, Arc<Tunnel>>>,
    accepted: mpsc::Sender<AcceptedTunnel>,
    me: Weak<MessageSwitch>,
}

impl MessageSwitch {
    /// Create a switch and the acceptor through which the application
    /// receives newly opened tunnels
    pub fn new(config: TunnelConfig) -> (Arc<Self>, TunnelAcceptor) {
        let (accepted, receiver) = mpsc::channel();
        let switch = Arc::new_cyclic(|me| MessageSwitch {
            config,
            tunnels: Mutex::new(HashMap::new()),
            accepted,
            me: me.clone(),
        });
        (switch, TunnelAcceptor { receiver })
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Number of tunnels currently registered
    pub fn tunnel_count(&self) -> usize {
        self.tunnels.lock().len()
    }

    fn lookup(&self, tunnel_id: &TunnelId) -> Option<Arc<Tunnel>> {
        self.tunnels.lock().get(tunnel_id).cloned()
    }

    fn remove(&self, tunnel_id: &TunnelId) {
        if self.tunnels.lock().remove(tunnel_id).is_some() {
            info!(tunnel = %tunnel_id, "tunnel closed");
        }
    }

    /// Allocate a new open tunnel and hand it to the acceptor
    ///
    /// Fails with `Error::ChannelClosed`, leaving nothing registered, once
    /// the acceptor has been dropped.
    pub fn create_tunnel(&self, remote_addr: Option<SocketAddr>) -> Result<TunnelId> {
        let tunnel = Arc::new(Tunnel::new(
            TunnelId::generate(),
            remote_addr,
            self.config.split_threshold(),
        ));
        let tunnel_id = tunnel.id.clone();
        self.tunnels.lock().insert(tunnel_id.clone(), tunnel.clone());

        let accepted = AcceptedTunnel {
            tunnel: tunnel.clone(),
            switch: self.me.clone(),
            config: self.config.clone(),
        };
        if let Err(mpsc::SendError(unwanted)) = self.accepted.send(accepted) {
            warn!(tunnel = %tunnel_id, "no acceptor for new tunnel");
            tunnel.shut(|_| true);
            self.tunnels.lock().remove(&tunnel_id);
            drop(unwanted);
            return Err(Error::ChannelClosed);
        }

        info!(tunnel = %tunnel_id, remote = ?remote_addr, "tunnel opened");
        Ok(tunnel_id)
    }

    /// Whether `tunnel_id` names a tunnel that still accepts send-data
    pub fn is_open_tunnel(&self, tunnel_id: &TunnelId) -> bool {
        self.lookup(tunnel_id)
            .is_some_and(|tunnel| tunnel.state.lock().status == TunnelStatus::Open)
    }

    /// Whether `tunnel_id` names a tunnel that still answers polls and close
    ///
    /// Unlike [`is_open_tunnel`](Self::is_open_tunnel) this includes tunnels
    /// the application has closed whose final bytes are not yet collected.
    pub fn is_live_tunnel(&self, tunnel_id: &TunnelId) -> bool {
        self.lookup(tunnel_id)
            .is_some_and(|tunnel| tunnel.state.lock().status != TunnelStatus::Closed)
    }

    /// Append bytes received from the client to the application's side
    ///
    /// Unknown or closed tunnels drop the bytes silently.
    pub fn route_inbound_data(&self, tunnel_id: &TunnelId, data: Bytes) {
        let Some(tunnel) = self.lookup(tunnel_id) else {
            trace!(tunnel = %tunnel_id, "dropping bytes for unknown tunnel");
            return;
        };

        let mut state = tunnel.state.lock();
        if state.status != TunnelStatus::Open {
            trace!(tunnel = %tunnel_id, "dropping bytes for closed tunnel");
            return;
        }
        trace!(tunnel = %tunnel_id, bytes = data.len(), "routing inbound bytes");
        state.last_activity = Instant::now();
        state.inbound.push_back(data);
        tunnel.readable.notify_all();
    }

    /// Register a receive-data request for `tunnel_id`
    ///
    /// If outbound bytes are already queued the returned poll is answered
    /// at once; otherwise it stays parked until the application writes, the
    /// tunnel closes or the poll timeout elapses. A second registration
    /// while one is parked fails with `Error::PollPending` and leaves the
    /// first one untouched.
    pub fn poll_outbound_data(&self, tunnel_id: &TunnelId) -> Result<PendingPoll> {
        let tunnel = self
            .lookup(tunnel_id)
            .ok_or_else(|| Error::UnknownTunnel(tunnel_id.clone()))?;

        let ticket = NEXT_POLL_TICKET.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::sync_channel(1);
        let sink = PollSink { ticket, sender };

        let answered = {
            let mut state = tunnel.state.lock();
            if state.status == TunnelStatus::Closed {
                return Err(Error::UnknownTunnel(tunnel_id.clone()));
            }
            if state.poll.is_some() {
                return Err(Error::PollPending(tunnel_id.clone()));
            }

            state.last_activity = Instant::now();
            if state.has_reply() {
                state.answer(sink, tunnel.reply_limit())
            } else {
                trace!(tunnel = %tunnel_id, ticket, "poll parked");
                state.poll = Some(sink);
                None
            }
        };

        if answered.is_some_and(|answered| answered.closed) {
            self.remove(tunnel_id);
        }

        Ok(PendingPoll {
            tunnel_id: tunnel_id.clone(),
            ticket,
            receiver,
            switch: self.me.clone(),
            timeout: self.config.poll_timeout(),
            settled: false,
        })
    }

    /// Withdraw the parked poll `ticket` after its timeout
    ///
    /// Returns true if the poll was still parked, in which case the caller
    /// answers it with no data. False means a reply was already sent.
    pub(crate) fn expire_poll(&self, tunnel_id: &TunnelId, ticket: u64) -> bool {
        let Some(tunnel) = self.lookup(tunnel_id) else {
            return false;
        };

        let mut state = tunnel.state.lock();
        match &state.poll {
            Some(sink) if sink.ticket == ticket => {
                trace!(tunnel = %tunnel_id, ticket, "poll expired");
                state.poll = None;
                true
            }
            _ => false,
        }
    }

    /// Return the chunks of an unsent delivery to their tunnel
    ///
    /// They go back to the head of the queue, ahead of anything written
    /// since, and a poll parked in the meantime is answered with them. If
    /// the tunnel has closed the writes they came from fail instead.
    fn restore(&self, tunnel_id: &TunnelId, chunks: Vec<OutboundChunk>) {
        if chunks.is_empty() {
            return;
        }
        let Some(tunnel) = self.lookup(tunnel_id) else {
            fail_closed(chunks.into_iter().map(|chunk| chunk.done).collect());
            return;
        };

        let restored = {
            let mut state = tunnel.state.lock();
            if state.status == TunnelStatus::Closed {
                Err(chunks)
            } else {
                trace!(tunnel = %tunnel_id, chunks = chunks.len(), "requeueing unsent chunks");
                state.requeue(chunks);
                Ok(match state.poll.take() {
                    Some(sink) => state.answer(sink, tunnel.reply_limit()),
                    None => None,
                })
            }
        };

        match restored {
            Ok(answered) => {
                if answered.is_some_and(|answered| answered.closed) {
                    self.remove(tunnel_id);
                }
            }
            Err(chunks) => fail_closed(chunks.into_iter().map(|chunk| chunk.done).collect()),
        }
    }

    /// Close a tunnel at the client's request
    ///
    /// Any parked poll is released immediately with a final empty reply and
    /// queued outbound bytes are discarded, failing their writes. Bytes the
    /// client already sent remain readable by the application, after which
    /// it sees end of stream. Returns false if the tunnel was already gone.
    pub fn client_close_tunnel(&self, tunnel_id: &TunnelId) -> bool {
        let Some(tunnel) = self.lookup(tunnel_id) else {
            return false;
        };

        let Some(discarded) = tunnel.shut(|_| true) else {
            return false;
        };
        self.remove(tunnel_id);

        debug!(
            tunnel = %tunnel_id,
            discarded = discarded.len(),
            "tunnel closed by client"
        );
        fail_closed(discarded);
        true
    }

    /// Close every tunnel idle for at least the idle timeout
    ///
    /// Tunnels with a parked poll are never idle. Returns the number of
    /// tunnels reclaimed.
    pub fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout();
        let tunnels: Vec<Arc<Tunnel>> = self.tunnels.lock().values().cloned().collect();

        let mut reaped = 0;
        for tunnel in tunnels {
            let discarded = tunnel.shut(|state| {
                state.poll.is_none()
                    && now.saturating_duration_since(state.last_activity) >= idle_timeout
            });

            if let Some(discarded) = discarded {
                info!(tunnel = %tunnel.id, "reclaiming idle tunnel");
                self.remove(&tunnel.id);
                fail_closed(discarded);
                reaped += 1;
            }
        }
        reaped
    }
}

impl fmt::Debug for MessageSwitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSwitch")
            .field("tunnels", &self.tunnel_count())
            .finish()
    }
}

/// A receive-data request parked in the switch
///
/// Dropping it without waiting withdraws it.
pub struct PendingPoll {
    tunnel_id: TunnelId,
    ticket: u64,
    receiver: Receiver<Parcel>,
    switch: Weak<MessageSwitch>,
    timeout: Duration,
    settled: bool,
}

impl PendingPoll {
    pub fn tunnel_id(&self) -> &TunnelId {
        &self.tunnel_id
    }

    /// Block until bytes arrive, the tunnel closes or the poll times out
    ///
    /// The reply is committed at once, completing the writes it carries.
    pub fn wait(self) -> PollReply {
        self.wait_while(|| true)
            .map_or(PollReply::Data(Bytes::new()), Delivery::commit)
    }

    /// Like [`wait`](Self::wait), but leaves committing to the caller and
    /// gives up early once `requester_alive` returns false
    ///
    /// `requester_alive` is checked periodically while the poll is parked.
    /// Returns `None` if the poll was withdrawn because the requester went
    /// away.
    pub fn wait_while<F>(mut self, mut requester_alive: F) -> Option<Delivery>
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + self.timeout;
        let parcel = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.receiver.recv_timeout(remaining.min(LIVENESS_CHECK_INTERVAL)) {
                Ok(parcel) => break parcel,
                Err(RecvTimeoutError::Disconnected) => {
                    break Parcel::empty(PollReply::Closed(Bytes::new()))
                }
                Err(RecvTimeoutError::Timeout) if remaining <= LIVENESS_CHECK_INTERVAL => {
                    break self.expire()
                }
                Err(RecvTimeoutError::Timeout) => {
                    if requester_alive() {
                        continue;
                    }
                    debug!(tunnel = %self.tunnel_id, ticket = self.ticket, "poll requester went away");
                    match self.withdraw() {
                        Some(parcel) => break parcel,
                        None => {
                            self.settled = true;
                            return None;
                        }
                    }
                }
            }
        };

        self.settled = true;
        Some(Delivery {
            tunnel_id: self.tunnel_id.clone(),
            reply: parcel.reply,
            chunks: parcel.chunks,
            switch: self.switch.clone(),
            committed: false,
        })
    }

    fn expire(&self) -> Parcel {
        self.withdraw()
            .unwrap_or_else(|| Parcel::empty(PollReply::Data(Bytes::new())))
    }

    /// Take the poll out of its tunnel's waiter slot
    ///
    /// Returns `None` if it was still parked. Otherwise a reply was already
    /// sent and is returned.
    fn withdraw(&self) -> Option<Parcel> {
        let withdrawn = self
            .switch
            .upgrade()
            .is_some_and(|switch| switch.expire_poll(&self.tunnel_id, self.ticket));
        if withdrawn {
            return None;
        }

        // A reply raced the withdrawal and is already in the channel.
        match self.receiver.try_recv() {
            Ok(parcel) => Some(parcel),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => {
                Some(Parcel::empty(PollReply::Closed(Bytes::new())))
            }
        }
    }
}

impl Drop for PendingPoll {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(parcel) = self.withdraw() {
            if let Some(switch) = self.switch.upgrade() {
                switch.restore(&self.tunnel_id, parcel.chunks);
            }
        }
    }
}

impl fmt::Debug for PendingPoll {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingPoll")
            .field("tunnel_id", &self.tunnel_id)
            .field("ticket", &self.ticket)
            .finish()
    }
}

/// Outbound bytes taken by a poll but not yet known to have been sent
///
/// [`commit`](Self::commit) once the response is on the wire. Dropping an
/// uncommitted delivery returns its bytes to the tunnel.
pub struct Delivery {
    tunnel_id: TunnelId,
    reply: PollReply,
    chunks: Vec<OutboundChunk>,
    switch: Weak<MessageSwitch>,
    committed: bool,
}

impl Delivery {
    pub fn reply(&self) -> &PollReply {
        &self.reply
    }

    /// Complete the writes behind this delivery and return the reply
    pub fn commit(mut self) -> PollReply {
        self.committed = true;
        for chunk in self.chunks.drain(..) {
            chunk.done.succeed();
        }
        std::mem::replace(&mut self.reply, PollReply::Data(Bytes::new()))
    }

    /// Give the bytes back to the tunnel for the next poll
    pub fn abandon(self) {
        drop(self);
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if self.committed || self.chunks.is_empty() {
            return;
        }
        let chunks = std::mem::take(&mut self.chunks);
        match self.switch.upgrade() {
            Some(switch) => switch.restore(&self.tunnel_id, chunks),
            None => fail_closed(chunks.into_iter().map(|chunk| chunk.done).collect()),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("tunnel_id", &self.tunnel_id)
            .field("reply", &self.reply)
            .field("chunks", &self.chunks.len())
            .finish()
    }
}

/// Source of tunnels opened by clients
pub struct TunnelAcceptor {
    receiver: Receiver<AcceptedTunnel>,
}

impl TunnelAcceptor {
    /// Block until a client opens a tunnel
    ///
    /// Returns `None` once the switch has been dropped.
    pub fn accept(&self) -> Option<AcceptedTunnel> {
        self.receiver.recv().ok()
    }

    pub fn accept_timeout(&self, timeout: Duration) -> Result<AcceptedTunnel> {
        self.receiver.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => Error::Timeout,
            RecvTimeoutError::Disconnected => Error::ChannelClosed,
        })
    }

    pub fn try_accept(&self) -> Option<AcceptedTunnel> {
        self.receiver.try_recv().ok()
    }

    /// Iterate over tunnels as they are opened
    pub fn incoming(&self) -> impl Iterator<Item = AcceptedTunnel> + '_ {
        self.receiver.iter()
    }
}

/// Application-side end of a tunnel
///
/// Reads yield the bytes the client sent, in order. Writes are fragmented
/// and queued until the client polls for them; a write completes once all
/// of its bytes have gone out in poll responses. Dropping the handle
/// closes the tunnel.
pub struct AcceptedTunnel {
    tunnel: Arc<Tunnel>,
    switch: Weak<MessageSwitch>,
    config: TunnelConfig,
}

impl AcceptedTunnel {
    pub fn id(&self) -> &TunnelId {
        &self.tunnel.id
    }

    /// Address of the client when it opened the tunnel
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.tunnel.remote_addr
    }

    pub fn is_open(&self) -> bool {
        self.tunnel.state.lock().status == TunnelStatus::Open
    }

    /// Block until bytes arrive; `None` once the tunnel is closed and drained
    pub fn read(&self) -> Option<Bytes> {
        let mut state = self.tunnel.state.lock();
        loop {
            if let Some(data) = state.inbound.pop_front() {
                return Some(data);
            }
            if state.status != TunnelStatus::Open {
                return None;
            }
            self.tunnel.readable.wait(&mut state);
        }
    }

    /// Like [`read`](Self::read) but gives up with `Error::Timeout`
    pub fn read_timeout(&self, timeout: Duration) -> Result<Option<Bytes>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.tunnel.state.lock();
        loop {
            if let Some(data) = state.inbound.pop_front() {
                return Ok(Some(data));
            }
            if state.status != TunnelStatus::Open {
                return Ok(None);
            }
            if self
                .tunnel
                .readable
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return match state.inbound.pop_front() {
                    Some(data) => Ok(Some(data)),
                    None => Err(Error::Timeout),
                };
            }
        }
    }

    /// Queue bytes for the client
    pub fn write(&self, data: impl Into<Bytes>) -> Completion {
        let mut data = data.into();
        let tunnel = &self.tunnel;

        let mut state = tunnel.state.lock();
        if state.status != TunnelStatus::Open {
            return Completion::failed(Error::ChannelClosed);
        }

        let done = tunnel.fragmenter.flush(&mut data, |fragment| {
            let completion = Completion::new();
            state.outbound.push_back(OutboundChunk {
                data: fragment,
                done: completion.clone(),
            });
            completion
        });

        if let Some(sink) = state.poll.take() {
            trace!(tunnel = %tunnel.id, ticket = sink.ticket, "answering parked poll");
            state.answer(sink, tunnel.reply_limit());
        }
        done
    }

    /// Close the tunnel from the application side
    ///
    /// Bytes already written are still delivered to the client by its next
    /// poll, which also tells it the tunnel is closed. Further writes fail.
    pub fn close(&self) -> Completion {
        let tunnel = &self.tunnel;

        let answered = {
            let mut state = tunnel.state.lock();
            if state.status != TunnelStatus::Open {
                return Completion::succeeded();
            }

            state.status = TunnelStatus::Draining;
            tunnel.readable.notify_all();
            match state.poll.take() {
                Some(sink) => state.answer(sink, tunnel.reply_limit()),
                None => None,
            }
        };

        debug!(tunnel = %tunnel.id, "tunnel closed by application");
        if answered.is_some_and(|answered| answered.closed) {
            if let Some(switch) = self.switch.upgrade() {
                switch.remove(&tunnel.id);
            }
        }
        Completion::succeeded()
    }
}

impl Drop for AcceptedTunnel {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for AcceptedTunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptedTunnel")
            .field("id", &self.tunnel.id)
            .field("remote_addr", &self.tunnel.remote_addr)
            .finish()
    }
}

impl ByteStreamChannel for AcceptedTunnel {
    fn tunnel_id(&self) -> Option<TunnelId> {
        Some(self.tunnel.id.clone())
    }

    fn write(&self, data: Bytes) -> Completion {
        AcceptedTunnel::write(self, data)
    }

    fn read_timeout(&self, timeout: Duration) -> Result<Option<Bytes>> {
        AcceptedTunnel::read_timeout(self, timeout)
    }

    fn close(&self) -> Completion {
        AcceptedTunnel::close(self)
    }

    fn is_open(&self) -> bool {
        AcceptedTunnel::is_open(self)
    }
}

impl ConfigurableTransport for AcceptedTunnel {
    fn config(&self) -> &TunnelConfig {
        &self.config
    }

    fn split_threshold(&self) -> NonZeroUsize {
        self.tunnel.fragmenter.split_threshold()
    }

    fn set_split_threshold(&self, threshold: NonZeroUsize) {
        self.tunnel.fragmenter.set_split_threshold(threshold);
    }
}
