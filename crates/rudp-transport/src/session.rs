//! # Session Lifecycle
//!
//! Connection states, the handshake timer, and keepalive liveness tracking.
//!
//! ```text
//!   Null ──Syn──▶ Connecting ──SynAck/Ack──▶ Established ──end──▶ Closing ──▶ Closed
//!                     │                           │
//!                  Timeout                  Keepalive failure
//!                     └──────────▶ Closed ◀───────┘
//! ```

use std::fmt;
use std::time::Duration;

use quanta::Instant;

// ─── Connection State ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, nothing sent yet.
    Null,
    /// Handshake in progress.
    Connecting,
    /// Data transfer.
    Established,
    /// A stream end was exchanged; both directions drain before teardown.
    Closing,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    /// States in which the application may still queue data.
    pub fn accepts_writes(self) -> bool {
        self == ConnectionState::Established
    }

    pub fn is_closed(self) -> bool {
        self == ConnectionState::Closed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

// ─── Handshake Timer ────────────────────────────────────────────────────────

/// Deadline for the handshake plus the cadence at which the pending
/// handshake message is repeated.
#[derive(Debug, Clone)]
pub struct HandshakeTimer {
    started: Instant,
    last_sent: Instant,
    timeout: Duration,
    resend_interval: Duration,
}

impl HandshakeTimer {
    pub fn start(now: Instant, timeout: Duration, resend_interval: Duration) -> Self {
        HandshakeTimer {
            started: now,
            last_sent: now,
            timeout,
            resend_interval,
        }
    }

    pub fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) > self.timeout
    }

    /// Whether the handshake message should be repeated; resets the cadence if so.
    pub fn poll_resend(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_sent) >= self.resend_interval {
            self.last_sent = now;
            true
        } else {
            false
        }
    }
}

// ─── Liveness ───────────────────────────────────────────────────────────────

/// What the keepalive check asks the connection to do this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessCheck {
    /// Heard from the peer recently enough.
    Alive,
    /// Another interval elapsed in silence: send `KeepAliveSyn`.
    Probe,
    /// Another silent interval reached the miss limit: send the last
    /// `KeepAliveSyn` and declare the peer dead.
    Dead,
}

/// Keepalive bookkeeping. Any inbound message counts as a signal.
#[derive(Debug, Clone)]
pub struct Liveness {
    last_signal: Instant,
    misses: u32,
    interval: Duration,
    miss_limit: u32,
}

impl Liveness {
    pub fn new(now: Instant, interval: Duration, miss_limit: u32) -> Self {
        Liveness {
            last_signal: now,
            misses: 0,
            interval,
            miss_limit: miss_limit.max(1),
        }
    }

    /// Record an inbound signal.
    pub fn touch(&mut self, now: Instant) {
        self.last_signal = now;
        self.misses = 0;
    }

    /// Count at most one miss per elapsed interval of silence.
    pub fn poll(&mut self, now: Instant) -> LivenessCheck {
        let silent = self.silent_for(now);
        if silent <= self.interval * (self.misses + 1) {
            return LivenessCheck::Alive;
        }
        self.misses += 1;
        if self.misses >= self.miss_limit {
            LivenessCheck::Dead
        } else {
            LivenessCheck::Probe
        }
    }

    pub fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_signal)
    }

    pub fn misses(&self) -> u32 {
        self.misses
    }

    pub fn last_signal(&self) -> Instant {
        self.last_signal
    }
}
