//! Pipe raw bytes between standard streams and a USB device's bulk
//! endpoints.
//!
//! Data read from standard input is submitted to an OUT endpoint; data
//! completed on an IN endpoint is written to standard output. Each
//! direction owns a small ring of reusable transfer buffers
//! ([`TransferQueue`]), and a single-threaded poll loop ([`Bridge`]) joins
//! stream readiness with transfer completions: a stream descriptor is only
//! polled while its ring can make progress, so backpressure falls out of
//! the poll set itself.
//!
//! The USB side is reached through the [`Transport`] capability trait; the
//! Linux usbfs implementation lives in [`usbfs`]. Linux is the only
//! supported platform.

mod bridge;
mod error;
mod queue;
mod stream;
mod transfer;

pub mod usbfs;

pub use bridge::{Bridge, BridgeConfig, DEFAULT_QUEUE_DEPTH, DEFAULT_TRANSFER_SIZE};
pub use error::{Error, ErrorKind};
pub use queue::TransferQueue;
pub use transfer::{Completion, Direction, TransferBuffer, TransferStatus, Transport};
