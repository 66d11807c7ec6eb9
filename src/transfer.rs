//! Transfer-level vocabulary shared by the queue engine, the event loop,
//! and the transport binding.

use std::collections::VecDeque;

use rustix::event::PollFlags;
use rustix::fd::BorrowedFd;

use crate::Error;

/// Endpoint direction, encoded in bit 7 of the endpoint address.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    /// Host to device
    Out = 0,

    /// Device to host
    In = 1,
}

impl Direction {
    pub(crate) const MASK: u8 = 0x80;

    /// Get the direction from the endpoint address.
    pub fn from_address(addr: u8) -> Direction {
        match addr & Self::MASK {
            0 => Direction::Out,
            _ => Direction::In,
        }
    }
}

/// Transfer status.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    /// Transfer completed successfully.
    Complete,

    /// Transfer timed out. The bridge resubmits these to keep the
    /// transport's internal event timing alive; a timeout is never a
    /// stream condition.
    TimedOut,

    /// Transfer was cancelled.
    Cancelled,

    /// Endpoint in a STALL condition.
    Stall,

    /// Device disconnected.
    Disconnected,

    /// Device sent more data than requested.
    Overflow,

    /// Hardware issue or protocol violation.
    Fault,

    /// Unknown or OS-specific error.
    UnknownError,
}

impl TransferStatus {
    /// True for every status the bridge treats as terminal.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransferStatus::Complete | TransferStatus::TimedOut)
    }

    pub(crate) fn describe(&self) -> &'static str {
        match self {
            TransferStatus::Complete => "completed",
            TransferStatus::TimedOut => "timed out",
            TransferStatus::Cancelled => "cancelled",
            TransferStatus::Stall => "endpoint stalled",
            TransferStatus::Disconnected => "device disconnected",
            TransferStatus::Overflow => "overflow",
            TransferStatus::Fault => "transfer fault",
            TransferStatus::UnknownError => "unknown error",
        }
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.describe())
    }
}

/// A fixed-capacity transfer buffer.
///
/// The backing allocation is made once at startup and then travels by
/// ownership between the queue, the stream adapter, and the transport;
/// no buffer is ever aliased. `len` is the payload length: the number of
/// bytes to send for an OUT transfer, or the number of bytes a completed
/// IN transfer actually carried.
#[derive(Debug)]
pub struct TransferBuffer {
    data: Vec<u8>,
    len: usize,
}

impl TransferBuffer {
    pub fn new(capacity: usize) -> TransferBuffer {
        TransferBuffer {
            data: vec![0; capacity],
            len: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the payload length.
    ///
    /// Panics if `len` exceeds the buffer capacity.
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.data.len());
        self.len = len;
    }

    /// The payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The whole backing region, for filling.
    #[inline]
    pub fn space_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[inline]
    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }
}

/// A finished transfer handed back from the transport, carrying its
/// buffer's ownership with it.
#[derive(Debug)]
pub struct Completion {
    pub endpoint: u8,
    pub status: TransferStatus,
    pub buffer: TransferBuffer,
}

/// The transport capability consumed by the bridge.
///
/// Implementations drive bulk transfers on a device and surface their
/// completions as messages rather than callbacks: the bridge polls the
/// descriptors from [`poll_fds`](Transport::poll_fds) alongside its own,
/// and calls [`handle_events`](Transport::handle_events) when any of them
/// is ready. That call must not block, and the completions it pushes are
/// routed by the bridge before the next poll.
pub trait Transport {
    /// Submit a bulk transfer, taking ownership of the buffer until it
    /// comes back in a [`Completion`].
    ///
    /// For an IN endpoint the full buffer capacity is requested; for an
    /// OUT endpoint the payload length is sent. Resubmitting a returned
    /// buffer is the same call.
    fn submit(&mut self, endpoint: u8, buffer: TransferBuffer) -> Result<(), Error>;

    /// Descriptors (and interest masks) the caller must include in its
    /// poll set.
    fn poll_fds(&self) -> Vec<(BorrowedFd<'_>, PollFlags)>;

    /// Process any ready transport events without blocking, pushing a
    /// [`Completion`] for every finished transfer.
    fn handle_events(&mut self, completions: &mut VecDeque<Completion>) -> Result<(), Error>;
}
