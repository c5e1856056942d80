//! # Transport Configuration
//!
//! Process-wide defaults, overridable per deployment through TOML:
//!
//! ```toml
//! packet_size = 1200
//! default_window_size = 16
//! handshake_timeout_ms = 3000
//! keepalive_timeout_ms = 250
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::TransportError;

/// Size of the header preceding the data in a `PayloadSyn`.
pub const PAYLOAD_HEADER_LEN: usize = 6;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_LEN: usize = 65_507;

/// Resolved, validated transport parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Maximum application bytes per segment.
    pub packet_size: usize,
    /// Number of RTT samples folded into the moving average.
    pub rtt_sampler_size: usize,
    /// Window size seeded at establishment and advertised to the peer.
    pub default_window_size: u16,
    /// Active open gives up after this long without a valid reply.
    pub handshake_timeout: Duration,
    /// Silence interval before a keepalive probe is sent.
    pub keepalive_timeout: Duration,
    /// Consecutive missed intervals before the peer is declared dead.
    pub keepalive_miss_limit: u32,
    /// Retransmission threshold used before any RTT sample exists.
    pub initial_rto: Duration,
    /// Period of the scheduler's tick driver.
    pub tick_interval: Duration,
    /// How far ahead of the next expected sequence the reorder buffer accepts segments.
    pub reorder_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            packet_size: 1400,
            rtt_sampler_size: 32,
            default_window_size: 8,
            handshake_timeout: Duration::from_millis(2000),
            keepalive_timeout: Duration::from_millis(200),
            keepalive_miss_limit: 4,
            initial_rto: Duration::from_millis(1000),
            tick_interval: Duration::from_millis(10),
            reorder_capacity: 1024,
        }
    }
}

/// Raw TOML shape. Every field is optional; missing fields take the default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransportConfigInput {
    pub packet_size: Option<usize>,
    pub rtt_sampler_size: Option<usize>,
    pub default_window_size: Option<u32>,
    pub handshake_timeout_ms: Option<u64>,
    pub keepalive_timeout_ms: Option<u64>,
    pub keepalive_miss_limit: Option<u32>,
    pub initial_rto_ms: Option<u64>,
    pub tick_interval_ms: Option<u64>,
    pub reorder_capacity: Option<usize>,
}

impl TransportConfigInput {
    pub fn resolve(self) -> Result<TransportConfig, TransportError> {
        let defaults = TransportConfig::default();
        let ms = |v: Option<u64>, d: Duration| v.map(Duration::from_millis).unwrap_or(d);

        let window = self
            .default_window_size
            .unwrap_or(defaults.default_window_size as u32);
        if window == 0 || window > u16::MAX as u32 {
            return Err(TransportError::InvalidConfig(format!(
                "default_window_size must be in 1..={}, got {}",
                u16::MAX,
                window
            )));
        }

        let config = TransportConfig {
            packet_size: self.packet_size.unwrap_or(defaults.packet_size),
            rtt_sampler_size: self.rtt_sampler_size.unwrap_or(defaults.rtt_sampler_size),
            default_window_size: window as u16,
            handshake_timeout: ms(self.handshake_timeout_ms, defaults.handshake_timeout),
            keepalive_timeout: ms(self.keepalive_timeout_ms, defaults.keepalive_timeout),
            keepalive_miss_limit: self
                .keepalive_miss_limit
                .unwrap_or(defaults.keepalive_miss_limit),
            initial_rto: ms(self.initial_rto_ms, defaults.initial_rto),
            tick_interval: ms(self.tick_interval_ms, defaults.tick_interval),
            reorder_capacity: self.reorder_capacity.unwrap_or(defaults.reorder_capacity),
        };
        config.validate()?;
        Ok(config)
    }
}

impl TransportConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, TransportError> {
        if input.trim().is_empty() {
            return Ok(TransportConfig::default());
        }
        let parsed: TransportConfigInput = toml::from_str(input)
            .map_err(|e| TransportError::InvalidConfig(format!("invalid config TOML: {e}")))?;
        parsed.resolve()
    }

    /// Reject values the protocol cannot operate with.
    pub fn validate(&self) -> Result<(), TransportError> {
        let invalid = |msg: &str| Err(TransportError::InvalidConfig(msg.to_string()));
        if self.packet_size == 0 {
            return invalid("packet_size must be non-zero");
        }
        if self.packet_size > MAX_DATAGRAM_LEN - PAYLOAD_HEADER_LEN {
            return invalid("packet_size does not fit in a datagram");
        }
        if self.rtt_sampler_size == 0 {
            return invalid("rtt_sampler_size must be non-zero");
        }
        if self.default_window_size == 0 {
            return invalid("default_window_size must be non-zero");
        }
        if self.keepalive_miss_limit == 0 {
            return invalid("keepalive_miss_limit must be non-zero");
        }
        if self.keepalive_timeout.is_zero() || self.handshake_timeout.is_zero() {
            return invalid("timeouts must be non-zero");
        }
        if self.tick_interval.is_zero() {
            return invalid("tick_interval must be non-zero");
        }
        if self.reorder_capacity < self.default_window_size as usize {
            return invalid("reorder_capacity must be at least default_window_size");
        }
        Ok(())
    }

    pub fn with_packet_size(mut self, packet_size: usize) -> Self {
        self.packet_size = packet_size;
        self
    }

    pub fn with_window_size(mut self, window: u16) -> Self {
        self.default_window_size = window;
        self
    }

    /// Silence after which the liveness check gives up.
    pub fn liveness_deadline(&self) -> Duration {
        self.keepalive_timeout * self.keepalive_miss_limit
    }
}
