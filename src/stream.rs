//! Glue between POSIX stream readiness and the transfer rings.
//!
//! Both standard-stream descriptors are switched to non-blocking mode at
//! startup; every read and write here is a single non-blocking call whose
//! outcome is folded into queue state. Would-block and interrupt are
//! silently retried on the next readiness event.

use log::debug;
use rustix::event::PollFlags;
use rustix::fd::BorrowedFd;
use rustix::fs::{fcntl_getfl, fcntl_setfl, OFlags};
use rustix::io::{self, Errno};

use crate::error::{Error, ErrorKind};
use crate::queue::TransferQueue;
use crate::transfer::Transport;

pub(crate) fn set_nonblocking(fd: BorrowedFd<'_>) -> Result<(), Error> {
    let flags = fcntl_getfl(fd).map_err(|e| Error::os("getting stream flags", e))?;
    fcntl_setfl(fd, flags | OFlags::NONBLOCK).map_err(|e| Error::os("setting stream non-blocking", e))
}

/// Handle readiness on the input stream: read into the free buffer at the
/// queue head and submit the result toward the OUT endpoint.
///
/// Reads are capped at half the buffer capacity, trading batch size for
/// headroom and transfer latency. A zero-length read, or `POLLHUP`/
/// `POLLERR` with nothing left to read, marks the direction shut down;
/// buffers already handed to the transport still drain.
pub(crate) fn forward_input<T: Transport>(
    fd: BorrowedFd<'_>,
    queue: &mut TransferQueue,
    transport: &mut T,
    endpoint: u8,
    revents: PollFlags,
) -> Result<(), Error> {
    if revents.contains(PollFlags::IN) {
        let capacity = queue.head().capacity();
        let buffer = queue.head_mut();
        match io::read(fd, &mut buffer.space_mut()[..capacity / 2]) {
            Ok(0) => {
                debug!("end of input");
                queue.shutdown = true;
            }
            Ok(n) => {
                buffer.set_len(n);
                let buffer = queue.release();
                transport.submit(endpoint, buffer)?;
            }
            Err(Errno::INTR) | Err(Errno::AGAIN) => {}
            Err(errno) => return Err(Error::os("reading input", errno)),
        }
    } else {
        // POLLHUP or POLLERR and the stream is already drained.
        debug!("input stream closed");
        queue.shutdown = true;
    }
    Ok(())
}

/// Handle readiness on the output stream: write the unwritten span of the
/// buffer at the queue head.
///
/// A partial write only advances the cursor; the buffer is released and
/// resubmitted as a fresh IN transfer once its whole payload has been
/// delivered, however many calls that takes.
pub(crate) fn forward_output<T: Transport>(
    fd: BorrowedFd<'_>,
    queue: &mut TransferQueue,
    transport: &mut T,
    endpoint: u8,
    revents: PollFlags,
) -> Result<(), Error> {
    if revents.contains(PollFlags::OUT) {
        match io::write(fd, queue.unwritten()) {
            Ok(n) => {
                if queue.advance_written(n) {
                    let buffer = queue.release();
                    transport.submit(endpoint, buffer)?;
                }
            }
            Err(Errno::INTR) | Err(Errno::AGAIN) => {}
            Err(errno) => return Err(Error::os("writing output", errno)),
        }
    } else {
        return Err(Error::new(ErrorKind::Other, "output stream closed").with_endpoint(endpoint));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use rustix::fd::AsFd;
    use rustix::pipe::pipe;

    use super::*;
    use crate::transfer::{Completion, TransferBuffer};

    /// Records submissions and never completes them.
    #[derive(Default)]
    struct Recorder {
        submissions: Vec<(u8, Vec<u8>)>,
    }

    impl Transport for Recorder {
        fn submit(&mut self, endpoint: u8, buffer: TransferBuffer) -> Result<(), Error> {
            self.submissions.push((endpoint, buffer.payload().to_vec()));
            Ok(())
        }

        fn poll_fds(&self) -> Vec<(BorrowedFd<'_>, PollFlags)> {
            Vec::new()
        }

        fn handle_events(&mut self, _completions: &mut VecDeque<Completion>) -> Result<(), Error> {
            Ok(())
        }
    }

    fn queue_with_free_buffer(capacity: usize) -> TransferQueue {
        let mut q = TransferQueue::new(2);
        q.produce(TransferBuffer::new(capacity));
        q
    }

    #[test]
    fn short_read_submits_exactly_what_arrived() {
        let (r, w) = pipe().unwrap();
        set_nonblocking(r.as_fd()).unwrap();
        rustix::io::write(w.as_fd(), &[7u8; 100]).unwrap();

        let mut queue = queue_with_free_buffer(512);
        let mut transport = Recorder::default();
        forward_input(r.as_fd(), &mut queue, &mut transport, 0x02, PollFlags::IN).unwrap();

        assert_eq!(transport.submissions.len(), 1);
        assert_eq!(transport.submissions[0].0, 0x02);
        assert_eq!(transport.submissions[0].1, vec![7u8; 100]);
        assert!(queue.is_empty());
        assert!(!queue.shutdown);
    }

    #[test]
    fn reads_are_capped_at_half_capacity() {
        let (r, w) = pipe().unwrap();
        set_nonblocking(r.as_fd()).unwrap();
        rustix::io::write(w.as_fd(), &[1u8; 600]).unwrap();

        let mut queue = queue_with_free_buffer(512);
        let mut transport = Recorder::default();
        forward_input(r.as_fd(), &mut queue, &mut transport, 0x02, PollFlags::IN).unwrap();

        assert_eq!(transport.submissions[0].1.len(), 256);
    }

    #[test]
    fn zero_read_marks_shutdown_without_submitting() {
        let (r, w) = pipe().unwrap();
        set_nonblocking(r.as_fd()).unwrap();
        drop(w);

        let mut queue = queue_with_free_buffer(512);
        let mut transport = Recorder::default();
        forward_input(
            r.as_fd(),
            &mut queue,
            &mut transport,
            0x02,
            PollFlags::IN | PollFlags::HUP,
        )
        .unwrap();

        assert!(queue.shutdown);
        assert!(transport.submissions.is_empty());
        assert!(!queue.is_empty());
    }

    #[test]
    fn hangup_without_readable_data_marks_shutdown() {
        let (r, _w) = pipe().unwrap();
        let mut queue = queue_with_free_buffer(512);
        let mut transport = Recorder::default();
        forward_input(r.as_fd(), &mut queue, &mut transport, 0x02, PollFlags::HUP).unwrap();
        assert!(queue.shutdown);
    }

    #[test]
    fn spurious_read_readiness_is_retried() {
        let (r, _w) = pipe().unwrap();
        set_nonblocking(r.as_fd()).unwrap();

        let mut queue = queue_with_free_buffer(512);
        let mut transport = Recorder::default();
        forward_input(r.as_fd(), &mut queue, &mut transport, 0x02, PollFlags::IN).unwrap();

        assert!(!queue.shutdown);
        assert!(transport.submissions.is_empty());
        assert!(!queue.is_empty());
    }

    #[test]
    fn drained_output_buffer_is_recycled_to_the_endpoint() {
        let (r, w) = pipe().unwrap();
        set_nonblocking(w.as_fd()).unwrap();

        let mut queue = TransferQueue::new(2);
        let mut buffer = TransferBuffer::new(512);
        buffer.space_mut()[..11].copy_from_slice(b"hello world");
        buffer.set_len(11);
        queue.produce(buffer);

        let mut transport = Recorder::default();
        forward_output(w.as_fd(), &mut queue, &mut transport, 0x81, PollFlags::OUT).unwrap();

        let mut delivered = [0u8; 32];
        let n = rustix::io::read(r.as_fd(), &mut delivered[..]).unwrap();
        assert_eq!(&delivered[..n], b"hello world");

        // The buffer went back to the transport as a fresh IN request.
        assert_eq!(transport.submissions.len(), 1);
        assert_eq!(transport.submissions[0].0, 0x81);
        assert!(queue.is_empty());
    }

    #[test]
    fn closed_output_stream_is_fatal() {
        let (r, w) = pipe().unwrap();
        set_nonblocking(w.as_fd()).unwrap();
        drop(r);

        let mut queue = TransferQueue::new(2);
        let mut buffer = TransferBuffer::new(512);
        buffer.set_len(4);
        queue.produce(buffer);

        let mut transport = Recorder::default();
        let err = forward_output(w.as_fd(), &mut queue, &mut transport, 0x81, PollFlags::OUT)
            .unwrap_err();
        assert_eq!(err.os_error(), Some(Errno::PIPE.raw_os_error() as u32));
    }

    #[test]
    fn output_hangup_without_writability_is_fatal() {
        let (_r, w) = pipe().unwrap();
        let mut queue = TransferQueue::new(2);
        queue.produce(TransferBuffer::new(8));
        let mut transport = Recorder::default();
        assert!(
            forward_output(w.as_fd(), &mut queue, &mut transport, 0x81, PollFlags::ERR).is_err()
        );
    }
}
