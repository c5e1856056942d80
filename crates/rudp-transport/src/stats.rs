//! # Connection Statistics
//!
//! Per-connection counters, serializable for logging or export.

use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStats {
    /// `PayloadSyn` datagrams sent, retransmissions included.
    pub segments_sent: u64,
    /// Subset of `segments_sent` that were retransmissions.
    pub retransmissions: u64,
    /// Segments released by cumulative acks.
    pub segments_acked: u64,
    /// Segments found timed out (summed over ticks).
    pub timeouts: u64,
    /// `PayloadSyn` datagrams received, duplicates included.
    pub payloads_received: u64,
    /// Received segments that were already delivered or buffered.
    pub duplicates: u64,
    /// Application bytes delivered in order.
    pub bytes_delivered: u64,
    /// Application bytes accepted by `send`.
    pub bytes_queued: u64,
    /// Keepalive probes sent.
    pub keepalives_sent: u64,
    /// Datagrams from this peer that failed to decode.
    pub invalid_datagrams: u64,
    /// Most recent RTT sample in µs.
    pub last_rtt_us: u64,
    /// Mean of the retained RTT samples in µs.
    pub mean_rtt_us: u64,
    /// Current congestion window in segments.
    pub sender_window: u16,
    /// Window last advertised by the peer.
    pub receiver_window: u16,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retransmission overhead ratio.
    pub fn retransmit_ratio(&self) -> f64 {
        if self.segments_sent == 0 {
            0.0
        } else {
            self.retransmissions as f64 / self.segments_sent as f64
        }
    }

    /// Fraction of received payloads that were new.
    pub fn goodput_ratio(&self) -> f64 {
        if self.payloads_received == 0 {
            0.0
        } else {
            let unique = self.payloads_received.saturating_sub(self.duplicates);
            unique as f64 / self.payloads_received as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retransmit_ratio() {
        let mut stats = ConnectionStats::new();
        assert_eq!(stats.retransmit_ratio(), 0.0);
        stats.segments_sent = 100;
        stats.retransmissions = 5;
        assert!((stats.retransmit_ratio() - 0.05).abs() < 0.001);
    }

    #[test]
    fn goodput_ratio() {
        let mut stats = ConnectionStats::new();
        assert_eq!(stats.goodput_ratio(), 0.0);
        stats.payloads_received = 110;
        stats.duplicates = 10;
        assert!((stats.goodput_ratio() - 100.0 / 110.0).abs() < 0.001);
    }

    #[test]
    fn serializes_to_json() {
        let stats = ConnectionStats {
            segments_sent: 3,
            sender_window: 8,
            ..Default::default()
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"segments_sent\":3"));
        assert!(json.contains("\"sender_window\":8"));
    }
}
