//! The per-direction transfer ring.
//!
//! A `TransferQueue` holds the buffers currently available to the stream
//! side of one direction: free buffers waiting to be filled from the input
//! stream (host→device), or completed buffers waiting to be written to the
//! output stream (device→host). The transport's completion handling always
//! produces; the stream adapter always consumes.
//!
//! Peeking (`head`) and advancing (`release`) are separate operations
//! because an output buffer must stay addressable across multiple partial
//! writes. The ring reports readiness from occupancy alone, independent of
//! drain progress on the head buffer.

use crate::transfer::{TransferBuffer, TransferStatus};

/// Ring of transfer buffers for one direction, with the direction's
/// shutdown/error state and the partial-write cursor for the buffer at
/// `head`.
///
/// A ring of `depth` slots holds at most `depth - 1` buffers, so that one
/// transfer can be in flight while another is already queued. Producing
/// into a full ring is a contract violation and panics; the readiness
/// gating in the bridge makes that unreachable, since each direction owns
/// exactly `depth - 1` buffers in total.
pub struct TransferQueue {
    slots: Box<[Option<TransferBuffer>]>,
    head: usize,
    tail: usize,

    /// Bytes of the head buffer already delivered to the stream consumer.
    written: usize,
    /// Payload length of the head buffer.
    length: usize,

    /// The producer side will supply no more data.
    pub shutdown: bool,
    /// Terminal fault observed on this direction.
    pub error: Option<TransferStatus>,
}

impl TransferQueue {
    /// Create a ring with `depth` slots.
    ///
    /// Panics if `depth < 2`: one slot is always kept empty to
    /// distinguish full from empty, and a usable queue needs at least one
    /// buffer in circulation.
    pub fn new(depth: usize) -> TransferQueue {
        assert!(depth >= 2, "transfer queue needs at least two slots");
        TransferQueue {
            slots: (0..depth).map(|_| None).collect(),
            head: 0,
            tail: 0,
            written: 0,
            length: 0,
            shutdown: false,
            error: None,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// True when every buffer of this direction is queued and one more
    /// `produce` would collide with `head`.
    #[inline]
    pub fn is_full(&self) -> bool {
        (self.tail + 1) % self.slots.len() == self.head
    }

    /// Number of queued buffers.
    pub fn occupied(&self) -> usize {
        (self.tail + self.slots.len() - self.head) % self.slots.len()
    }

    /// Place a buffer at `tail`.
    ///
    /// If the ring was empty, the partial-write cursor is initialized for
    /// the new head buffer. Panics if the ring is full.
    pub fn produce(&mut self, buffer: TransferBuffer) {
        assert!(!self.is_full(), "produced into a full transfer queue");
        if self.is_empty() {
            self.written = 0;
            self.length = buffer.len();
        }
        self.slots[self.tail] = Some(buffer);
        self.tail = (self.tail + 1) % self.slots.len();
    }

    /// The buffer at `head`, without advancing.
    ///
    /// Panics if the ring is empty; callers are gated by readiness.
    pub fn head(&self) -> &TransferBuffer {
        self.slots[self.head]
            .as_ref()
            .expect("queue should have a buffer ready")
    }

    /// Mutable access to the buffer at `head`, for filling in place.
    pub fn head_mut(&mut self) -> &mut TransferBuffer {
        self.slots[self.head]
            .as_mut()
            .expect("queue should have a buffer ready")
    }

    /// Take the buffer at `head` and advance.
    ///
    /// If a successor buffer is already queued, the partial-write cursor
    /// is re-initialized for it.
    pub fn release(&mut self) -> TransferBuffer {
        let buffer = self.slots[self.head]
            .take()
            .expect("queue should have a buffer ready");
        self.head = (self.head + 1) % self.slots.len();
        if !self.is_empty() {
            self.written = 0;
            self.length = self.head().len();
        }
        buffer
    }

    /// The not-yet-delivered span of the head buffer.
    pub fn unwritten(&self) -> &[u8] {
        &self.head().payload()[self.written..self.length]
    }

    /// Record `n` more bytes delivered from the head buffer. Returns true
    /// once the whole payload has been delivered.
    pub fn advance_written(&mut self, n: usize) -> bool {
        self.written += n;
        debug_assert!(self.written <= self.length);
        self.written == self.length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(payload: &[u8]) -> TransferBuffer {
        let mut b = TransferBuffer::new(16);
        b.space_mut()[..payload.len()].copy_from_slice(payload);
        b.set_len(payload.len());
        b
    }

    #[test]
    fn occupancy_never_exceeds_depth_minus_one() {
        let mut q = TransferQueue::new(3);
        assert!(q.is_empty());
        q.produce(buf(b"a"));
        assert!(!q.is_empty());
        assert!(!q.is_full());
        q.produce(buf(b"b"));
        assert!(q.is_full());
        assert_eq!(q.occupied(), 2);
    }

    #[test]
    #[should_panic(expected = "full transfer queue")]
    fn produce_into_full_queue_panics() {
        let mut q = TransferQueue::new(2);
        q.produce(buf(b"a"));
        q.produce(buf(b"b"));
    }

    #[test]
    fn buffers_drain_in_fifo_order() {
        let mut q = TransferQueue::new(4);
        q.produce(buf(b"first"));
        q.produce(buf(b"second"));
        q.produce(buf(b"third"));
        assert_eq!(q.release().payload(), b"first");
        assert_eq!(q.release().payload(), b"second");
        assert_eq!(q.release().payload(), b"third");
        assert!(q.is_empty());
    }

    #[test]
    fn ring_wraps_around() {
        let mut q = TransferQueue::new(2);
        for i in 0..5u8 {
            q.produce(buf(&[i]));
            assert!(q.is_full());
            assert_eq!(q.release().payload(), &[i]);
            assert!(q.is_empty());
        }
    }

    #[test]
    fn cursor_tracks_partial_drain() {
        let mut q = TransferQueue::new(2);
        q.produce(buf(b"0123456789"));
        assert_eq!(q.unwritten(), b"0123456789");
        assert!(!q.advance_written(4));
        assert_eq!(q.unwritten(), b"456789");
        assert!(!q.advance_written(5));
        assert_eq!(q.unwritten(), b"9");
        assert!(q.advance_written(1));
        q.release();
        assert!(q.is_empty());
    }

    #[test]
    fn cursor_resets_for_queued_successor() {
        let mut q = TransferQueue::new(3);
        q.produce(buf(b"abcde"));
        q.produce(buf(b"xyz"));
        assert!(!q.advance_written(2));
        q.advance_written(3);
        q.release();
        // The successor's payload must be exposed from offset zero.
        assert_eq!(q.unwritten(), b"xyz");
    }

    #[test]
    fn zero_length_payload_is_immediately_drained() {
        let mut q = TransferQueue::new(2);
        q.produce(buf(b""));
        assert_eq!(q.unwritten(), b"");
        assert!(q.advance_written(0));
    }
}
