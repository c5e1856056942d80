//! # Receive Reorder Buffer
//!
//! Pure logic, no I/O. Segments are held by sequence number until the gap in
//! front of them is filled; [`ReorderBuffer::dequeue`] releases the longest
//! contiguous run starting at the next expected sequence number.
//!
//! The buffer also owns the numbers that go into every `PayloadAck`: the
//! next expected sequence, the advertised window, and whether the peer's end
//! segment has been delivered.

use std::collections::HashMap;

use crate::wire::{seq_lt, Message, Segment};

/// Classification of an inbound segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    /// Stored for delivery.
    New,
    /// Already delivered or already buffered.
    Duplicate,
    /// Too far ahead of the expectation pointer; dropped.
    OutOfRange,
}

pub struct ReorderBuffer {
    held: HashMap<u32, Segment>,
    next_expected: u32,
    window: u16,
    capacity: usize,
    end_delivered: bool,
}

impl ReorderBuffer {
    pub fn new(next_expected: u32, window: u16, capacity: usize) -> Self {
        ReorderBuffer {
            held: HashMap::new(),
            next_expected,
            window: window.max(1),
            capacity: capacity.max(1),
            end_delivered: false,
        }
    }

    pub fn insert(&mut self, segment: Segment) -> Accepted {
        if self.end_delivered || seq_lt(segment.seq, self.next_expected) {
            return Accepted::Duplicate;
        }
        let offset = segment.seq.wrapping_sub(self.next_expected) as usize;
        if offset >= self.capacity {
            return Accepted::OutOfRange;
        }
        if self.held.contains_key(&segment.seq) {
            return Accepted::Duplicate;
        }
        self.held.insert(segment.seq, segment);
        Accepted::New
    }

    /// Release the contiguous prefix starting at the next expected sequence.
    /// Stops after an end segment; nothing past it is ever delivered.
    pub fn dequeue(&mut self) -> Vec<Segment> {
        let mut out = Vec::new();
        while let Some(segment) = self.held.remove(&self.next_expected) {
            self.next_expected = self.next_expected.wrapping_add(1);
            let end = segment.end;
            out.push(segment);
            if end {
                self.end_delivered = true;
                self.held.clear();
                break;
            }
        }
        out
    }

    /// Window advertised to the peer: configured size minus segments parked
    /// out of order, never below 1.
    pub fn advertised_window(&self) -> u16 {
        let free = (self.window as usize).saturating_sub(self.held.len()).max(1);
        free.min(u16::MAX as usize) as u16
    }

    /// The acknowledgement describing the current receive state.
    pub fn ack(&self) -> Message {
        Message::PayloadAck {
            ack: self.next_expected,
            window: self.advertised_window(),
            end: self.end_delivered,
        }
    }

    pub fn next_expected(&self) -> u32 {
        self.next_expected
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    pub fn end_delivered(&self) -> bool {
        self.end_delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn seg(seq: u32, end: bool) -> Segment {
        Segment::new(seq, Bytes::from(format!("s{seq}")), end)
    }

    fn seqs(segs: &[Segment]) -> Vec<u32> {
        segs.iter().map(|s| s.seq).collect()
    }

    #[test]
    fn in_order_delivery() {
        let mut rb = ReorderBuffer::new(100, 8, 64);
        assert_eq!(rb.insert(seg(100, false)), Accepted::New);
        assert_eq!(seqs(&rb.dequeue()), vec![100]);
        assert_eq!(rb.next_expected(), 101);
    }

    #[test]
    fn gap_holds_later_segments() {
        let mut rb = ReorderBuffer::new(0, 8, 64);
        rb.insert(seg(1, false));
        rb.insert(seg(2, false));
        assert!(rb.dequeue().is_empty());
        assert_eq!(rb.held_count(), 2);
        assert_eq!(rb.advertised_window(), 6);

        rb.insert(seg(0, false));
        assert_eq!(seqs(&rb.dequeue()), vec![0, 1, 2]);
        assert_eq!(rb.next_expected(), 3);
        assert_eq!(rb.advertised_window(), 8);
    }

    #[test]
    fn duplicates_are_not_redelivered() {
        let mut rb = ReorderBuffer::new(0, 8, 64);
        rb.insert(seg(0, false));
        rb.dequeue();
        assert_eq!(rb.insert(seg(0, false)), Accepted::Duplicate);
        rb.insert(seg(2, false));
        assert_eq!(rb.insert(seg(2, false)), Accepted::Duplicate);
        assert!(rb.dequeue().is_empty());
    }

    #[test]
    fn far_ahead_segments_are_rejected() {
        let mut rb = ReorderBuffer::new(0, 8, 16);
        assert_eq!(rb.insert(seg(16, false)), Accepted::OutOfRange);
        assert_eq!(rb.insert(seg(15, false)), Accepted::New);
    }

    #[test]
    fn end_segment_stops_delivery() {
        let mut rb = ReorderBuffer::new(0, 8, 64);
        rb.insert(seg(1, true));
        rb.insert(seg(0, false));
        let out = rb.dequeue();
        assert_eq!(seqs(&out), vec![0, 1]);
        assert!(rb.end_delivered());
        assert_eq!(rb.insert(seg(2, false)), Accepted::Duplicate);
        assert_eq!(
            rb.ack(),
            Message::PayloadAck {
                ack: 2,
                window: 8,
                end: true
            }
        );
    }

    #[test]
    fn window_never_below_one() {
        let mut rb = ReorderBuffer::new(0, 2, 64);
        for s in 1..6 {
            rb.insert(seg(s, false));
        }
        assert_eq!(rb.advertised_window(), 1);
    }

    #[test]
    fn delivery_across_wrap() {
        let mut rb = ReorderBuffer::new(u32::MAX, 8, 64);
        rb.insert(seg(0, false));
        rb.insert(seg(u32::MAX, false));
        assert_eq!(seqs(&rb.dequeue()), vec![u32::MAX, 0]);
        assert_eq!(rb.next_expected(), 1);
    }
}
