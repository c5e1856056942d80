//! # RTT Sampler
//!
//! A slot is opened per sequence number each time a segment is handed to the
//! transport; acknowledging the segment retires the slot and folds the
//! measured latency into a fixed-size ring. The timeout threshold is derived
//! from the ring's arithmetic mean.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use quanta::Instant;

use crate::wire::seq_lt;

pub struct RttSampler {
    /// Outstanding measurements: sequence → time the segment was last sent.
    pending: HashMap<u32, Instant>,
    /// Most recent `capacity` latencies, oldest first.
    samples: VecDeque<Duration>,
    capacity: usize,
    sum: Duration,
    last: Option<Duration>,
}

impl RttSampler {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        RttSampler {
            pending: HashMap::new(),
            samples: VecDeque::with_capacity(capacity),
            capacity,
            sum: Duration::ZERO,
            last: None,
        }
    }

    /// Start (or restart) the measurement for `seq`.
    pub fn open(&mut self, seq: u32, now: Instant) {
        self.pending.insert(seq, now);
    }

    /// Close the measurement for `seq`, returning the latency if a slot was open.
    pub fn retire(&mut self, seq: u32, now: Instant) -> Option<Duration> {
        let sent_at = self.pending.remove(&seq)?;
        let rtt = now.saturating_duration_since(sent_at);
        self.record(rtt);
        Some(rtt)
    }

    /// Drop open slots for sequences before `ack` without sampling them.
    pub fn discard_below(&mut self, ack: u32) {
        self.pending.retain(|&seq, _| !seq_lt(seq, ack));
    }

    fn record(&mut self, rtt: Duration) {
        if self.samples.len() == self.capacity {
            if let Some(oldest) = self.samples.pop_front() {
                self.sum -= oldest;
            }
        }
        self.samples.push_back(rtt);
        self.sum += rtt;
        self.last = Some(rtt);
    }

    /// Mean of the retained samples, `None` before the first sample.
    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.sum / self.samples.len() as u32)
    }

    pub fn last(&self) -> Option<Duration> {
        self.last
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
