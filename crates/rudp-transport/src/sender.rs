//! # Send Segmentation Buffer
//!
//! Pure logic, no I/O. Application bytes accumulate in a byte queue and are
//! cut into `packet_size` segments on demand, each taking the next sequence
//! number of the local send space. Sequence numbers are assigned at cut time
//! so a segment keeps its number through every retransmission.

use bytes::{Bytes, BytesMut};

use crate::wire::Segment;

pub struct SendBuffer {
    queue: BytesMut,
    packet_size: usize,
    next_seq: u32,
    /// `end()` was called; the segment carrying the last byte gets `end = true`.
    finishing: bool,
    /// The end segment has been cut.
    finished: bool,
    end_seq: Option<u32>,
}

impl SendBuffer {
    pub fn new(initial_seq: u32, packet_size: usize) -> Self {
        SendBuffer {
            queue: BytesMut::new(),
            packet_size: packet_size.max(1),
            next_seq: initial_seq,
            finishing: false,
            finished: false,
            end_seq: None,
        }
    }

    /// Append application bytes. Returns `false` once the stream is finished.
    pub fn write(&mut self, data: &[u8]) -> bool {
        if self.finishing {
            return false;
        }
        self.queue.extend_from_slice(data);
        true
    }

    /// Mark the stream finished. Idempotent.
    pub fn finish(&mut self) {
        self.finishing = true;
    }

    /// Cut the next segment, if any bytes (or a pending end marker) remain.
    ///
    /// An `end()` with nothing queued yields an empty segment with `end = true`.
    pub fn next_segment(&mut self) -> Option<Segment> {
        if self.finished {
            return None;
        }
        if self.queue.is_empty() && !self.finishing {
            return None;
        }

        let take = self.queue.len().min(self.packet_size);
        let data: Bytes = self.queue.split_to(take).freeze();
        let end = self.finishing && self.queue.is_empty();

        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        if end {
            self.finished = true;
            self.end_seq = Some(seq);
        }
        Some(Segment::new(seq, data, end))
    }

    /// Bytes written but not yet cut into segments.
    pub fn queued_bytes(&self) -> usize {
        self.queue.len()
    }

    /// Whether `next_segment` would yield something.
    pub fn has_pending(&self) -> bool {
        !self.finished && (!self.queue.is_empty() || self.finishing)
    }

    pub fn is_finishing(&self) -> bool {
        self.finishing
    }

    /// Sequence number of the end segment once it has been cut.
    pub fn end_seq(&self) -> Option<u32> {
        self.end_seq
    }

    /// Sequence number the next cut segment will carry.
    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(buf: &mut SendBuffer) -> Vec<Segment> {
        std::iter::from_fn(|| buf.next_segment()).collect()
    }

    #[test]
    fn empty_buffer_yields_nothing() {
        let mut buf = SendBuffer::new(0, 1400);
        assert!(buf.next_segment().is_none());
        assert!(!buf.has_pending());
    }

    #[test]
    fn three_thousand_bytes_make_three_segments() {
        let mut buf = SendBuffer::new(101, 1400);
        buf.write(&vec![0xAB; 3000]);
        buf.finish();

        let segs = drain(&mut buf);
        let sizes: Vec<usize> = segs.iter().map(|s| s.data.len()).collect();
        assert_eq!(sizes, vec![1400, 1400, 200]);
        assert_eq!(
            segs.iter().map(|s| s.seq).collect::<Vec<_>>(),
            vec![101, 102, 103]
        );
        assert_eq!(
            segs.iter().map(|s| s.end).collect::<Vec<_>>(),
            vec![false, false, true]
        );
        assert_eq!(buf.end_seq(), Some(103));
    }

    #[test]
    fn no_end_flag_without_finish() {
        let mut buf = SendBuffer::new(0, 1400);
        buf.write(&[1; 3000]);
        assert!(drain(&mut buf).iter().all(|s| !s.end));
    }

    #[test]
    fn finish_after_drain_emits_empty_end_segment() {
        let mut buf = SendBuffer::new(5, 10);
        buf.write(b"hello");
        let first = buf.next_segment().unwrap();
        assert!(!first.end);

        buf.finish();
        let last = buf.next_segment().unwrap();
        assert_eq!(last.seq, 6);
        assert!(last.end);
        assert!(last.data.is_empty());
        assert!(buf.next_segment().is_none());
    }

    #[test]
    fn writes_after_finish_are_rejected() {
        let mut buf = SendBuffer::new(0, 10);
        buf.finish();
        assert!(!buf.write(b"late"));
        assert_eq!(buf.queued_bytes(), 0);
    }

    #[test]
    fn sequence_numbers_wrap() {
        let mut buf = SendBuffer::new(u32::MAX, 1);
        buf.write(b"ab");
        let segs = drain(&mut buf);
        assert_eq!(segs[0].seq, u32::MAX);
        assert_eq!(segs[1].seq, 0);
    }
}
