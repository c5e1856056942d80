//! # Connection
//!
//! One reliable, ordered byte stream to a single remote endpoint.
//!
//! ```text
//!   tick (send side)                      inbound datagram (receive side)
//!   ────────────────                      ───────────────────────────────
//!   keepalive / linger check              touch liveness
//!   expire in-flight segments             handshake → establish
//!   AIMD window step                      PayloadSyn → reorder → deliver → ack
//!   release segments into ARQ queue       PayloadAck → release ARQ, sample RTT
//!   transmit everything due               KeepAliveSyn → KeepAliveAck
//! ```
//!
//! ## Locking
//!
//! - `recv` guards handshake numbers and the reorder buffer.
//! - `send` guards segmentation, retransmission, RTT, window and liveness.
//! - `state` and `stats` are leaves: nothing is locked while holding them.
//!
//! The only nesting is `recv` → `send`. Datagrams are collected under the
//! locks and handed to the transport after they are released; application
//! events go through the scheduler's queue.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use quanta::{Clock, Instant};
use rand::RngExt as _;
use tracing::{debug, info, trace};

use crate::arq::{timeout_threshold, RetransmitQueue};
use crate::config::TransportConfig;
use crate::congestion::{WindowChange, WindowController};
use crate::endpoint::EndpointShared;
use crate::error::TransportError;
use crate::event::{ConnectionEvent, EventBus, EventKind, SubscriptionId};
use crate::net::DatagramTransport;
use crate::receiver::{Accepted, ReorderBuffer};
use crate::rtt::RttSampler;
use crate::scheduler::{Scheduler, TickId};
use crate::sender::SendBuffer;
use crate::session::{ConnectionState, HandshakeTimer, Liveness, LivenessCheck};
use crate::stats::ConnectionStats;
use crate::wire::{seq_lt, Message, Segment};

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Active,
    Passive,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn random_isn() -> u32 {
    rand::rng().random::<u32>()
}

struct SendPath {
    buffer: SendBuffer,
    retransmit: RetransmitQueue,
    rtt: RttSampler,
    window: WindowController,
    liveness: Liveness,
    /// Set on entering Closing.
    closing: bool,
    /// The peer's end segment has been delivered.
    peer_ended: bool,
}

impl SendPath {
    /// Local end acknowledged and the peer's end delivered.
    fn finished(&self) -> bool {
        self.peer_ended && self.buffer.end_seq().is_some() && self.retransmit.is_empty()
    }
}

struct RecvPath {
    local_isn: u32,
    peer_isn: Option<u32>,
    handshake: Option<HandshakeTimer>,
    /// Handshake message repeated until the peer answers.
    handshake_msg: Option<Message>,
    reorder: ReorderBuffer,
}

pub struct Connection {
    remote: SocketAddr,
    role: Role,
    config: Arc<TransportConfig>,
    transport: Arc<dyn DatagramTransport>,
    scheduler: Scheduler,
    clock: Clock,
    endpoint: Weak<EndpointShared>,
    events: EventBus,
    state: Mutex<ConnectionState>,
    send: Mutex<SendPath>,
    recv: Mutex<RecvPath>,
    stats: Mutex<ConnectionStats>,
    tick_id: Mutex<Option<TickId>>,
    closed: AtomicBool,
    end_fired: AtomicBool,
}

impl Connection {
    pub(crate) fn new(remote: SocketAddr, role: Role, endpoint: &Arc<EndpointShared>) -> Arc<Self> {
        let config = endpoint.config.clone();
        let clock = endpoint.clock.clone();
        let now = clock.now();

        Arc::new(Connection {
            remote,
            role,
            transport: endpoint.transport.clone(),
            scheduler: endpoint.scheduler.clone(),
            endpoint: Arc::downgrade(endpoint),
            events: EventBus::new(),
            state: Mutex::new(ConnectionState::Null),
            send: Mutex::new(SendPath {
                buffer: SendBuffer::new(0, config.packet_size),
                retransmit: RetransmitQueue::new(),
                rtt: RttSampler::new(config.rtt_sampler_size),
                window: WindowController::new(config.default_window_size),
                liveness: Liveness::new(now, config.keepalive_timeout, config.keepalive_miss_limit),
                closing: false,
                peer_ended: false,
            }),
            recv: Mutex::new(RecvPath {
                local_isn: random_isn(),
                peer_isn: None,
                handshake: None,
                handshake_msg: None,
                reorder: ReorderBuffer::new(0, config.default_window_size, config.reorder_capacity),
            }),
            stats: Mutex::new(ConnectionStats::new()),
            tick_id: Mutex::new(None),
            closed: AtomicBool::new(false),
            end_fired: AtomicBool::new(false),
            config,
            clock,
        })
    }

    fn register_tick(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let id = self.scheduler.register_tick(move || {
            if let Some(conn) = weak.upgrade() {
                conn.tick();
            }
        });
        *lock(&self.tick_id) = Some(id);
    }

    /// Active open: send `HandshakeSyn` and start the handshake timer.
    pub(crate) fn open(self: &Arc<Self>) {
        let now = self.clock.now();
        let syn = {
            let mut recv = lock(&self.recv);
            let syn = Message::HandshakeSyn {
                seq: recv.local_isn,
            };
            recv.handshake = Some(self.handshake_timer(now));
            recv.handshake_msg = Some(syn.clone());
            syn
        };
        *lock(&self.state) = ConnectionState::Connecting;
        self.register_tick();
        debug!(remote = %self.remote, "handshake started");
        self.transmit(vec![syn.encode()]);
    }

    /// Passive open on an inbound `HandshakeSyn{seq}`.
    pub(crate) fn accept(self: &Arc<Self>, peer_seq: u32) {
        let now = self.clock.now();
        let syn_ack = {
            let mut recv = lock(&self.recv);
            let syn_ack = Message::HandshakeSynAck {
                seq: recv.local_isn,
                ack: peer_seq.wrapping_add(1),
            };
            recv.peer_isn = Some(peer_seq);
            recv.handshake = Some(self.handshake_timer(now));
            recv.handshake_msg = Some(syn_ack.clone());
            syn_ack
        };
        *lock(&self.state) = ConnectionState::Connecting;
        self.register_tick();
        debug!(remote = %self.remote, peer_seq, "handshake accepted");
        self.transmit(vec![syn_ack.encode()]);
    }

    fn handshake_timer(&self, now: Instant) -> HandshakeTimer {
        HandshakeTimer::start(
            now,
            self.config.handshake_timeout,
            self.config.keepalive_timeout,
        )
    }

    // ─── Application API ────────────────────────────────────────────────────

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Queue bytes for delivery. Accepted only while Established and before
    /// [`Connection::end`].
    pub fn send(&self, data: impl AsRef<[u8]>) -> bool {
        if !self.state().accepts_writes() {
            return false;
        }
        let data = data.as_ref();
        let accepted = lock(&self.send).buffer.write(data);
        if accepted {
            lock(&self.stats).bytes_queued += data.len() as u64;
        }
        accepted
    }

    /// Finish the outbound stream. The last segment carries the end flag;
    /// once the peer acknowledges it the connection starts closing.
    pub fn end(&self) {
        if !self.state().accepts_writes() {
            return;
        }
        let mut send = lock(&self.send);
        if !send.buffer.is_finishing() {
            send.buffer.finish();
            debug!(remote = %self.remote, "stream end queued");
        }
    }

    /// Abortive close: no error is reported, only the close notification.
    pub fn close(&self) {
        self.shutdown(None, true);
    }

    /// Current congestion window in segments.
    pub fn window(&self) -> u16 {
        lock(&self.send).window.sender_window()
    }

    pub fn stats(&self) -> ConnectionStats {
        let (last, mean, sender_window, receiver_window) = {
            let send = lock(&self.send);
            (
                send.rtt.last(),
                send.rtt.average(),
                send.window.sender_window(),
                send.window.receiver_window(),
            )
        };
        let mut stats = lock(&self.stats).clone();
        stats.last_rtt_us = last.map_or(0, |d| d.as_micros() as u64);
        stats.mean_rtt_us = mean.map_or(0, |d| d.as_micros() as u64);
        stats.sender_window = sender_window;
        stats.receiver_window = receiver_window;
        stats
    }

    // ─── Subscriptions ──────────────────────────────────────────────────────

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn on_connect<F>(&self, mut f: F) -> SubscriptionId
    where
        F: FnMut() + Send + 'static,
    {
        self.events.subscribe(EventKind::Connect, move |_| f())
    }

    pub fn on_data<F>(&self, mut f: F) -> SubscriptionId
    where
        F: FnMut(&Bytes) + Send + 'static,
    {
        self.events.subscribe(EventKind::Data, move |event| {
            if let ConnectionEvent::Data(bytes) = event {
                f(bytes);
            }
        })
    }

    pub fn on_error<F>(&self, mut f: F) -> SubscriptionId
    where
        F: FnMut(&TransportError) + Send + 'static,
    {
        self.events.subscribe(EventKind::Error, move |event| {
            if let ConnectionEvent::Error(err) = event {
                f(err);
            }
        })
    }

    pub fn on_end<F>(&self, mut f: F) -> SubscriptionId
    where
        F: FnMut() + Send + 'static,
    {
        self.events.subscribe(EventKind::End, move |_| f())
    }

    pub fn on_close<F>(&self, mut f: F) -> SubscriptionId
    where
        F: FnMut() + Send + 'static,
    {
        self.events.subscribe(EventKind::Close, move |_| f())
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    fn post_event(&self, event: ConnectionEvent) {
        let bus = self.events.clone();
        self.scheduler.post(move || bus.emit(&event));
    }

    fn transmit(&self, datagrams: Vec<Bytes>) {
        for datagram in datagrams {
            self.transport.send_to(self.remote, datagram);
        }
    }

    // ─── Tick ───────────────────────────────────────────────────────────────

    pub(crate) fn tick(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let now = self.clock.now();
        match self.state() {
            ConnectionState::Connecting => self.tick_handshake(now),
            ConnectionState::Established | ConnectionState::Closing => self.tick_transfer(now),
            ConnectionState::Null | ConnectionState::Closed => {}
        }
    }

    fn tick_handshake(&self, now: Instant) {
        let (expired, resend) = {
            let mut recv = lock(&self.recv);
            let RecvPath {
                handshake,
                handshake_msg,
                ..
            } = &mut *recv;
            let Some(timer) = handshake.as_mut() else {
                return;
            };
            if timer.expired(now) {
                // Claimed while `recv` is held, so no handshake reply can
                // establish in between.
                if !self.mark_closed() {
                    return;
                }
                (true, None)
            } else if timer.poll_resend(now) {
                (false, handshake_msg.clone())
            } else {
                (false, None)
            }
        };

        if expired {
            match self.role {
                Role::Active => {
                    info!(remote = %self.remote, "handshake timed out");
                    self.teardown(Some(TransportError::HandshakeTimeout), true);
                }
                Role::Passive => {
                    debug!(remote = %self.remote, "half-open connection discarded");
                    self.teardown(None, false);
                }
            }
            return;
        }

        if let Some(msg) = resend {
            debug!(remote = %self.remote, kind = ?msg.message_type(), "handshake resend");
            self.transmit(vec![msg.encode()]);
        }
    }

    fn tick_transfer(&self, now: Instant) {
        enum Outcome {
            Continue,
            Dead,
            Drained,
        }

        let mut out = Vec::new();
        let mut sent = 0u64;
        let mut retransmitted = 0u64;
        let mut probes = 0u64;

        let (outcome, timeouts) = {
            let mut send = lock(&self.send);
            let closing = self.state() == ConnectionState::Closing;

            let mut outcome = Outcome::Continue;
            if closing && send.finished() {
                // Linger so a retransmitted peer end still gets its ack.
                if send.liveness.silent_for(now) >= self.config.liveness_deadline() {
                    outcome = Outcome::Drained;
                }
            } else {
                match send.liveness.poll(now) {
                    LivenessCheck::Alive => {}
                    LivenessCheck::Probe => {
                        debug!(
                            remote = %self.remote,
                            misses = send.liveness.misses(),
                            "keepalive probe"
                        );
                        out.push(Message::KeepAliveSyn.encode());
                        probes += 1;
                    }
                    LivenessCheck::Dead => {
                        out.push(Message::KeepAliveSyn.encode());
                        probes += 1;
                        outcome = Outcome::Dead;
                    }
                }
            }

            let mut timeouts = 0;
            if matches!(outcome, Outcome::Continue) {
                let threshold = timeout_threshold(send.rtt.average(), self.config.initial_rto);
                timeouts = send.retransmit.expire(now, threshold);

                match send.window.on_tick(timeouts) {
                    WindowChange::Shrank => debug!(
                        remote = %self.remote,
                        window = send.window.sender_window(),
                        timeouts,
                        "window shrank"
                    ),
                    WindowChange::Grew => trace!(
                        remote = %self.remote,
                        window = send.window.sender_window(),
                        "window grew"
                    ),
                    WindowChange::Unchanged => {}
                }

                let budget = send.window.release_budget(send.retransmit.len());
                for _ in 0..budget {
                    match send.buffer.next_segment() {
                        Some(segment) => send.retransmit.push(segment),
                        None => break,
                    }
                }

                for tx in send.retransmit.take_due(now) {
                    send.rtt.open(tx.segment.seq, now);
                    if tx.is_retransmit {
                        trace!(remote = %self.remote, seq = tx.segment.seq, "retransmit");
                        retransmitted += 1;
                    }
                    sent += 1;
                    out.push(Message::PayloadSyn(tx.segment).encode());
                }
            }
            (outcome, timeouts)
        };

        {
            let mut stats = lock(&self.stats);
            stats.segments_sent += sent;
            stats.retransmissions += retransmitted;
            stats.timeouts += timeouts as u64;
            stats.keepalives_sent += probes;
        }

        match outcome {
            Outcome::Continue => self.transmit(out),
            Outcome::Dead => {
                info!(remote = %self.remote, "peer unresponsive");
                self.transmit(out);
                self.shutdown(Some(TransportError::KeepAliveTimeout), true);
            }
            Outcome::Drained => {
                info!(remote = %self.remote, "connection closed");
                self.shutdown(None, true);
            }
        }
    }

    // ─── Inbound ────────────────────────────────────────────────────────────

    pub(crate) fn record_invalid(&self) {
        lock(&self.stats).invalid_datagrams += 1;
    }

    pub(crate) fn handle_message(self: &Arc<Self>, msg: Message) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let now = self.clock.now();
        lock(&self.send).liveness.touch(now);

        match msg {
            Message::HandshakeSyn { seq } => self.on_handshake_syn(seq),
            Message::HandshakeSynAck { seq, ack } => self.on_handshake_syn_ack(seq, ack, now),
            Message::HandshakeAck { seq, ack } => self.on_handshake_ack(seq, ack, now),
            Message::PayloadSyn(segment) => self.on_payload(segment),
            Message::PayloadAck { ack, window, end } => self.on_payload_ack(ack, window, end, now),
            Message::KeepAliveSyn => {
                if matches!(
                    self.state(),
                    ConnectionState::Established | ConnectionState::Closing
                ) {
                    self.transmit(vec![Message::KeepAliveAck.encode()]);
                }
            }
            Message::KeepAliveAck => {}
        }
    }

    fn on_handshake_syn(&self, seq: u32) {
        if self.role != Role::Passive || self.state() != ConnectionState::Connecting {
            trace!(remote = %self.remote, seq, "stray HandshakeSyn ignored");
            return;
        }
        let syn_ack = {
            let mut recv = lock(&self.recv);
            let syn_ack = Message::HandshakeSynAck {
                seq: recv.local_isn,
                ack: seq.wrapping_add(1),
            };
            if recv.peer_isn != Some(seq) {
                debug!(remote = %self.remote, seq, "peer restarted handshake");
                recv.peer_isn = Some(seq);
                recv.handshake_msg = Some(syn_ack.clone());
            }
            syn_ack
        };
        self.transmit(vec![syn_ack.encode()]);
    }

    fn on_handshake_syn_ack(&self, seq: u32, ack: u32, now: Instant) {
        if self.role != Role::Active {
            return;
        }
        let reply = {
            let mut recv = lock(&self.recv);
            if ack != recv.local_isn.wrapping_add(1) {
                debug!(remote = %self.remote, ack, "HandshakeSynAck with wrong ack dropped");
                return;
            }
            let reply = Message::HandshakeAck {
                seq: ack,
                ack: seq.wrapping_add(1),
            };
            match self.state() {
                ConnectionState::Connecting => {
                    let mut send = lock(&self.send);
                    if !self.establish() {
                        return;
                    }
                    recv.peer_isn = Some(seq);
                    recv.handshake = None;
                    recv.handshake_msg = None;
                    recv.reorder = ReorderBuffer::new(
                        seq.wrapping_add(1),
                        self.config.default_window_size,
                        self.config.reorder_capacity,
                    );
                    self.reset_send_path(&mut send, ack, now);
                }
                ConnectionState::Established | ConnectionState::Closing
                    if recv.peer_isn == Some(seq) =>
                {
                    trace!(remote = %self.remote, "duplicate HandshakeSynAck answered");
                    drop(recv);
                    self.transmit(vec![reply.encode()]);
                    return;
                }
                _ => return,
            }
            reply
        };

        info!(remote = %self.remote, send_seq = ack, recv_seq = seq.wrapping_add(1), "connection established");
        self.transmit(vec![reply.encode()]);
        self.post_event(ConnectionEvent::Connect);
    }

    fn on_handshake_ack(self: &Arc<Self>, seq: u32, ack: u32, now: Instant) {
        if self.role != Role::Passive {
            return;
        }
        {
            let mut recv = lock(&self.recv);
            if self.state() != ConnectionState::Connecting {
                return;
            }
            let expected_seq = recv.peer_isn.map(|p| p.wrapping_add(1));
            if ack != recv.local_isn.wrapping_add(1) || expected_seq != Some(seq) {
                debug!(remote = %self.remote, seq, ack, "HandshakeAck with wrong numbers dropped");
                return;
            }
            let mut send = lock(&self.send);
            if !self.establish() {
                return;
            }
            recv.handshake = None;
            recv.handshake_msg = None;
            recv.reorder = ReorderBuffer::new(
                seq,
                self.config.default_window_size,
                self.config.reorder_capacity,
            );
            self.reset_send_path(&mut send, ack, now);
        }

        info!(remote = %self.remote, send_seq = ack, recv_seq = seq, "connection established");
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.announce_accepted(self.clone());
        }
        self.post_event(ConnectionEvent::Connect);
    }

    /// Connecting → Established, unless the connection closed meanwhile.
    fn establish(&self) -> bool {
        let mut state = lock(&self.state);
        if *state != ConnectionState::Connecting {
            return false;
        }
        *state = ConnectionState::Established;
        true
    }

    fn reset_send_path(&self, send: &mut SendPath, send_next: u32, now: Instant) {
        send.buffer = SendBuffer::new(send_next, self.config.packet_size);
        send.retransmit = RetransmitQueue::new();
        send.window = WindowController::new(self.config.default_window_size);
        send.liveness = Liveness::new(
            now,
            self.config.keepalive_timeout,
            self.config.keepalive_miss_limit,
        );
        send.closing = false;
        send.peer_ended = false;
    }

    fn on_payload(&self, segment: Segment) {
        if !matches!(
            self.state(),
            ConnectionState::Established | ConnectionState::Closing
        ) {
            trace!(remote = %self.remote, seq = segment.seq, "payload before establishment dropped");
            return;
        }

        let seq = segment.seq;
        let (accepted, delivered, ack) = {
            let mut recv = lock(&self.recv);
            let accepted = recv.reorder.insert(segment);
            let delivered = recv.reorder.dequeue();
            (accepted, delivered, recv.reorder.ack())
        };

        match accepted {
            Accepted::New => {}
            Accepted::Duplicate => trace!(remote = %self.remote, seq, "duplicate segment"),
            Accepted::OutOfRange => debug!(remote = %self.remote, seq, "segment beyond reorder capacity"),
        }

        let mut bytes = 0u64;
        let mut end = false;
        for segment in delivered {
            end |= segment.end;
            if !segment.data.is_empty() {
                bytes += segment.data.len() as u64;
                self.post_event(ConnectionEvent::Data(segment.data));
            }
        }

        {
            let mut stats = lock(&self.stats);
            stats.payloads_received += 1;
            if accepted == Accepted::Duplicate {
                stats.duplicates += 1;
            }
            stats.bytes_delivered += bytes;
        }

        self.transmit(vec![ack.encode()]);

        if end {
            debug!(remote = %self.remote, "peer ended stream");
            let mut send = lock(&self.send);
            send.peer_ended = true;
            // Our stream ends after whatever is already queued.
            send.buffer.finish();
            self.begin_closing(&mut send);
        }
    }

    fn on_payload_ack(&self, ack: u32, window: u16, peer_end: bool, now: Instant) {
        if !matches!(
            self.state(),
            ConnectionState::Established | ConnectionState::Closing
        ) {
            return;
        }

        let mut send = lock(&self.send);
        let acked = send.retransmit.acknowledge(ack);
        if !acked.is_empty() {
            if let Some(rtt) = send.rtt.retire(ack.wrapping_sub(1), now) {
                trace!(remote = %self.remote, rtt_us = rtt.as_micros() as u64, "rtt sample");
            }
            lock(&self.stats).segments_acked += acked.len() as u64;
        }
        send.rtt.discard_below(ack);
        send.window.set_receiver_window(window);

        let local_end_acked = send
            .buffer
            .end_seq()
            .is_some_and(|end_seq| seq_lt(end_seq, ack));
        if local_end_acked && !send.closing {
            debug!(remote = %self.remote, peer_end, "stream end acknowledged");
            self.begin_closing(&mut send);
        }
    }

    fn begin_closing(&self, send: &mut SendPath) {
        send.closing = true;
        {
            let mut state = lock(&self.state);
            if *state == ConnectionState::Established {
                *state = ConnectionState::Closing;
            }
        }
        if !self.end_fired.swap(true, Ordering::AcqRel) {
            self.post_event(ConnectionEvent::End);
        }
    }

    // ─── Teardown ───────────────────────────────────────────────────────────

    /// Idempotent. With `notify`, posts the error (if any) then close.
    fn shutdown(&self, error: Option<TransportError>, notify: bool) {
        if self.mark_closed() {
            self.teardown(error, notify);
        }
    }

    /// Move to Closed. Only the first caller gets `true`.
    fn mark_closed(&self) -> bool {
        let mut state = lock(&self.state);
        if *state == ConnectionState::Closed {
            return false;
        }
        *state = ConnectionState::Closed;
        self.closed.store(true, Ordering::Release);
        true
    }

    fn teardown(&self, error: Option<TransportError>, notify: bool) {
        if let Some(id) = lock(&self.tick_id).take() {
            self.scheduler.unregister_tick(id);
        }
        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.remove(self.remote, self);
        }

        if notify {
            if let Some(err) = error {
                self.post_event(ConnectionEvent::Error(err));
            }
            self.post_event(ConnectionEvent::Close);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.remote)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use crate::net::sim::SimNetwork;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    use quanta::Mock;

    struct Pair {
        net: SimNetwork,
        sched: Scheduler,
        mock: Arc<Mock>,
        a: Endpoint,
        b: Endpoint,
        b_addr: SocketAddr,
    }

    fn pair() -> Pair {
        let net = SimNetwork::new(42);
        let sched = Scheduler::new();
        let (clock, mock) = Clock::mock();
        let (a_addr, b_addr) = (
            SocketAddr::from(([10, 0, 0, 1], 1)),
            SocketAddr::from(([10, 0, 0, 2], 2)),
        );
        let config = TransportConfig::default();
        let a = Endpoint::with_clock(net.transport(a_addr), sched.clone(), config.clone(), clock.clone()).unwrap();
        let b = Endpoint::with_clock(net.transport(b_addr), sched.clone(), config, clock).unwrap();
        net.attach(a_addr, a.clone());
        net.attach(b_addr, b.clone());
        Pair {
            net,
            sched,
            mock,
            a,
            b,
            b_addr,
        }
    }

    fn count_connects(conn: &Connection) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        conn.on_connect(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        calls
    }

    fn unreachable_peer() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 9], 9))
    }

    #[test]
    fn roles_follow_who_opened() {
        let Pair { net, a, b, b_addr, .. } = pair();
        let conn = a.connect(b_addr);
        net.deliver_all();
        assert_eq!(conn.role(), Role::Active);
        let passive = b.connection(SocketAddr::from(([10, 0, 0, 1], 1))).unwrap();
        assert_eq!(passive.role(), Role::Passive);
    }

    #[test]
    fn unsubscribed_connect_handler_is_not_called() {
        let Pair {
            net, sched, a, b_addr, ..
        } = pair();
        let conn = a.connect(b_addr);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let id = conn.on_connect(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(conn.unsubscribe(id));

        net.deliver_all();
        sched.run_pending();
        assert_eq!(conn.state(), ConnectionState::Established);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn fresh_connection_reports_default_window() {
        let Pair { net, a, b_addr, .. } = pair();
        let conn = a.connect(b_addr);
        net.deliver_all();
        let stats = conn.stats();
        assert_eq!(conn.window(), 8);
        assert_eq!(stats.sender_window, 8);
        assert_eq!(stats.receiver_window, 8);
        assert_eq!(stats.segments_sent, 0);
        assert!(format!("{conn:?}").contains("Established"));
    }

    #[test]
    fn synack_after_handshake_expiry_does_not_establish() {
        let p = pair();
        let conn = p.a.connect(unreachable_peer());
        let connects = count_connects(&conn);
        let isn = lock(&conn.recv).local_isn;

        p.mock.increment(Duration::from_millis(2001));
        conn.tick();
        assert_eq!(conn.state(), ConnectionState::Closed);

        p.net.drain();
        conn.on_handshake_syn_ack(500, isn.wrapping_add(1), conn.clock.now());
        p.sched.run_pending();

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(connects.load(Ordering::SeqCst), 0);
        assert!(p.net.drain().is_empty());
    }

    #[test]
    fn synack_racing_close_does_not_establish() {
        let p = pair();
        let conn = p.a.connect(unreachable_peer());
        let connects = count_connects(&conn);
        let isn = lock(&conn.recv).local_isn;
        p.net.drain();

        // The reply is in flight on another thread while the connection closes.
        let held = lock(&conn.recv);
        let racer = {
            let conn = conn.clone();
            let now = conn.clock.now();
            thread::spawn(move || conn.on_handshake_syn_ack(500, isn.wrapping_add(1), now))
        };
        thread::sleep(Duration::from_millis(20));
        conn.close();
        drop(held);
        racer.join().unwrap();
        p.sched.run_pending();

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(connects.load(Ordering::SeqCst), 0);
        assert!(p.net.drain().is_empty());
    }

    #[test]
    fn handshake_ack_racing_close_is_not_announced() {
        let p = pair();
        let accepted = Arc::new(AtomicUsize::new(0));
        let acc = accepted.clone();
        p.b.on_accept(move |_| {
            acc.fetch_add(1, Ordering::SeqCst);
        });

        let peer = unreachable_peer();
        p.net.inject(peer, p.b_addr, Message::HandshakeSyn { seq: 100 }.encode());
        p.net.deliver_round();
        p.net.drain();
        let conn = p.b.connection(peer).unwrap();
        let isn = lock(&conn.recv).local_isn;

        let held = lock(&conn.recv);
        let racer = {
            let conn = conn.clone();
            let now = conn.clock.now();
            thread::spawn(move || conn.on_handshake_ack(101, isn.wrapping_add(1), now))
        };
        thread::sleep(Duration::from_millis(20));
        conn.close();
        drop(held);
        racer.join().unwrap();
        p.sched.run_pending();

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(accepted.load(Ordering::SeqCst), 0);
    }
}
