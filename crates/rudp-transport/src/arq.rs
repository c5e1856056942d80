//! # ARQ — Timeout / Retransmission Buffer
//!
//! Holds every segment that has been handed to the datagram transport but not
//! yet covered by a cumulative acknowledgement.
//!
//! ## Key design decisions
//!
//! - **Cumulative ACK only**: `ack = k` releases everything strictly before `k`
//! - **Timeout = 4 × mean RTT**: falls back to a fixed initial RTO with no samples
//! - **Re-queue, never drop**: a timed-out segment is marked due and resent
//!   with identical content on the same tick

use std::collections::VecDeque;
use std::time::Duration;

use quanta::Instant;

use crate::wire::{seq_lt, Segment};

/// Multiplier applied to the mean RTT to obtain the retransmission threshold.
pub const RTO_RTT_FACTOR: u32 = 4;

/// Retransmission threshold for the current RTT estimate.
pub fn timeout_threshold(mean_rtt: Option<Duration>, initial_rto: Duration) -> Duration {
    match mean_rtt {
        Some(rtt) => rtt * RTO_RTT_FACTOR,
        None => initial_rto,
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    segment: Segment,
    /// Last time the segment went out, `None` until the first transmission.
    sent_at: Option<Instant>,
    /// Waiting to be (re)transmitted.
    due: bool,
    transmissions: u32,
}

/// A segment selected for transmission this tick.
#[derive(Debug, Clone)]
pub struct Transmission {
    pub segment: Segment,
    pub is_retransmit: bool,
}

/// In-flight segments ordered by sequence number (oldest first).
#[derive(Default)]
pub struct RetransmitQueue {
    entries: VecDeque<InFlight>,
}

impl RetransmitQueue {
    pub fn new() -> Self {
        RetransmitQueue {
            entries: VecDeque::new(),
        }
    }

    /// Take ownership of a freshly released segment; it is due immediately.
    pub fn push(&mut self, segment: Segment) {
        self.entries.push_back(InFlight {
            segment,
            sent_at: None,
            due: true,
            transmissions: 0,
        });
    }

    /// Mark segments whose time in flight exceeds `threshold` for retransmission.
    /// Returns the number that timed out.
    pub fn expire(&mut self, now: Instant, threshold: Duration) -> usize {
        let mut timed_out = 0;
        for entry in self.entries.iter_mut().filter(|e| !e.due) {
            let Some(sent_at) = entry.sent_at else {
                continue;
            };
            if now.saturating_duration_since(sent_at) > threshold {
                entry.due = true;
                timed_out += 1;
            }
        }
        timed_out
    }

    /// Collect everything due, stamping each with `now` as its send time.
    pub fn take_due(&mut self, now: Instant) -> Vec<Transmission> {
        self.entries
            .iter_mut()
            .filter(|e| e.due)
            .map(|entry| {
                entry.due = false;
                entry.sent_at = Some(now);
                entry.transmissions += 1;
                Transmission {
                    segment: entry.segment.clone(),
                    is_retransmit: entry.transmissions > 1,
                }
            })
            .collect()
    }

    /// Cumulative acknowledgement: drop every segment with `seq < ack`.
    /// Returns the acknowledged segments' sequence numbers, oldest first.
    pub fn acknowledge(&mut self, ack: u32) -> Vec<u32> {
        let mut acked = Vec::new();
        self.entries.retain(|entry| {
            if seq_lt(entry.segment.seq, ack) {
                acked.push(entry.segment.seq);
                false
            } else {
                true
            }
        });
        acked
    }

    pub fn contains(&self, seq: u32) -> bool {
        self.entries.iter().any(|e| e.segment.seq == seq)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Oldest unacknowledged sequence number.
    pub fn oldest(&self) -> Option<u32> {
        self.entries.front().map(|e| e.segment.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use quanta::Clock;

    fn seg(seq: u32) -> Segment {
        Segment::new(seq, Bytes::from(vec![seq as u8; 4]), false)
    }

    fn queue_with(seqs: &[u32]) -> RetransmitQueue {
        let mut q = RetransmitQueue::new();
        for &s in seqs {
            q.push(seg(s));
        }
        q
    }

    #[test]
    fn threshold_falls_back_without_samples() {
        let initial = Duration::from_millis(1000);
        assert_eq!(timeout_threshold(None, initial), initial);
        assert_eq!(
            timeout_threshold(Some(Duration::from_millis(25)), initial),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn new_segments_are_due_once() {
        let (clock, _mock) = Clock::mock();
        let mut q = queue_with(&[1, 2, 3]);
        let out = q.take_due(clock.now());
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|t| !t.is_retransmit));
        assert!(q.take_due(clock.now()).is_empty());
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn expired_segments_are_requeued() {
        let (clock, mock) = Clock::mock();
        let mut q = queue_with(&[1, 2]);
        q.take_due(clock.now());

        mock.increment(Duration::from_millis(50));
        q.push(seg(3));
        q.take_due(clock.now());

        mock.increment(Duration::from_millis(60));
        // 1 and 2 are 110ms old, 3 is 60ms old.
        let timed_out = q.expire(clock.now(), Duration::from_millis(100));
        assert_eq!(timed_out, 2);

        let out = q.take_due(clock.now());
        assert_eq!(
            out.iter().map(|t| t.segment.seq).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(out.iter().all(|t| t.is_retransmit));
    }

    #[test]
    fn expire_is_not_counted_twice_before_resend() {
        let (clock, mock) = Clock::mock();
        let mut q = queue_with(&[1]);
        q.take_due(clock.now());
        mock.increment(Duration::from_millis(200));
        assert_eq!(q.expire(clock.now(), Duration::from_millis(100)), 1);
        assert_eq!(q.expire(clock.now(), Duration::from_millis(100)), 0);
    }

    #[test]
    fn cumulative_ack_removes_strictly_below() {
        let mut q = queue_with(&[10, 11, 12, 13]);
        let acked = q.acknowledge(12);
        assert_eq!(acked, vec![10, 11]);
        assert!(!q.contains(11));
        assert!(q.contains(12));
        assert!(q.contains(13));
        assert_eq!(q.oldest(), Some(12));
    }

    #[test]
    fn cumulative_ack_across_wrap() {
        let mut q = queue_with(&[u32::MAX - 1, u32::MAX, 0, 1]);
        let acked = q.acknowledge(0);
        assert_eq!(acked, vec![u32::MAX - 1, u32::MAX]);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn stale_ack_is_noop() {
        let mut q = queue_with(&[5, 6]);
        assert!(q.acknowledge(5).is_empty());
        assert!(q.acknowledge(3).is_empty());
        assert_eq!(q.len(), 2);
    }
}
