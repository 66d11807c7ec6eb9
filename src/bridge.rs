//! The single-threaded event loop joining stream readiness to transfer
//! completions.
//!
//! One `poll(2)` set carries the standard-stream descriptors (gated by
//! ring occupancy) together with every descriptor the transport exposes.
//! Completion handling runs synchronously inside
//! [`Transport::handle_events`] and only ever enqueues buffers and flips
//! direction state; all submission and stream I/O happens on this thread,
//! so the rings need no locking.

use std::collections::VecDeque;

use log::{debug, warn};
use rustix::event::{poll, PollFd, PollFlags};
use rustix::fd::{AsFd, OwnedFd};
use rustix::io::retry_on_intr;

use crate::error::Error;
use crate::queue::TransferQueue;
use crate::stream;
use crate::transfer::{Completion, TransferBuffer, TransferStatus, Transport};

/// Transfer buffer capacity in bytes.
pub const DEFAULT_TRANSFER_SIZE: usize = 512;

/// Ring slots per direction. Two slots keep one transfer in flight while
/// another buffer is already queued.
pub const DEFAULT_QUEUE_DEPTH: usize = 2;

/// Which streams and endpoints a [`Bridge`] connects.
pub struct BridgeConfig {
    /// Local byte source feeding this OUT endpoint.
    pub source: Option<(OwnedFd, u8)>,

    /// IN endpoint feeding this local byte sink.
    pub sink: Option<(u8, OwnedFd)>,

    pub transfer_size: usize,
    pub queue_depth: usize,
}

struct StreamEnd {
    fd: OwnedFd,
    endpoint: u8,
    queue: TransferQueue,
}

impl StreamEnd {
    /// Read-interest: a free buffer is waiting and the source has not
    /// shut down.
    fn want_read(&self) -> bool {
        !self.queue.shutdown && !self.queue.is_empty()
    }

    /// Write-interest: at least one completed buffer is fully or
    /// partially undelivered.
    fn want_write(&self) -> bool {
        !self.queue.is_empty()
    }
}

/// Copies bytes between a pair of local streams and a pair of bulk
/// endpoints until the source shuts down and drains, or either direction
/// faults.
pub struct Bridge<T: Transport> {
    transport: T,
    /// source stream → OUT endpoint
    outbound: Option<StreamEnd>,
    /// IN endpoint → sink stream
    inbound: Option<StreamEnd>,
}

impl<T: Transport> Bridge<T> {
    /// Set up both directions: switch the stream descriptors to
    /// non-blocking mode, stock the outbound ring with free buffers, and
    /// start the initial IN transfers.
    ///
    /// Panics if no direction is enabled or the configuration is not
    /// usable (`queue_depth < 2`, `transfer_size < 2`).
    pub fn new(mut transport: T, config: BridgeConfig) -> Result<Bridge<T>, Error> {
        assert!(
            config.source.is_some() || config.sink.is_some(),
            "at least one direction must be enabled"
        );
        assert!(config.transfer_size >= 2);

        let outbound = match config.source {
            Some((fd, endpoint)) => {
                stream::set_nonblocking(fd.as_fd())?;
                let mut queue = TransferQueue::new(config.queue_depth);
                for _ in 0..config.queue_depth - 1 {
                    queue.produce(TransferBuffer::new(config.transfer_size));
                }
                Some(StreamEnd { fd, endpoint, queue })
            }
            None => None,
        };

        let inbound = match config.sink {
            Some((endpoint, fd)) => {
                stream::set_nonblocking(fd.as_fd())?;
                let queue = TransferQueue::new(config.queue_depth);
                for _ in 0..config.queue_depth - 1 {
                    transport.submit(endpoint, TransferBuffer::new(config.transfer_size))?;
                }
                Some(StreamEnd { fd, endpoint, queue })
            }
            None => None,
        };

        Ok(Bridge {
            transport,
            outbound,
            inbound,
        })
    }

    /// The transport, for inspection after the loop has finished.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run the loop to completion.
    ///
    /// Returns `Ok(())` when the source has shut down and every accepted
    /// byte has been handed to the device. Inbound transfers still in
    /// flight at that point are abandoned.
    pub fn run(&mut self) -> Result<(), Error> {
        let mut completions = VecDeque::new();

        while !self.finished() {
            let (input_revents, output_revents, transport_ready) = self.wait()?;

            if !input_revents.is_empty() {
                let end = self.outbound.as_mut().expect("input readiness without a source");
                stream::forward_input(
                    end.fd.as_fd(),
                    &mut end.queue,
                    &mut self.transport,
                    end.endpoint,
                    input_revents,
                )?;
            }

            if !output_revents.is_empty() {
                let end = self.inbound.as_mut().expect("output readiness without a sink");
                stream::forward_output(
                    end.fd.as_fd(),
                    &mut end.queue,
                    &mut self.transport,
                    end.endpoint,
                    output_revents,
                )?;
            }

            if transport_ready {
                self.transport.handle_events(&mut completions)?;
                while let Some(completion) = completions.pop_front() {
                    self.route_completion(completion)?;
                }
            }
        }

        for end in [&self.outbound, &self.inbound] {
            if let Some(end) = end {
                if let Some(status) = end.queue.error {
                    return Err(Error::transfer(end.endpoint, status));
                }
            }
        }
        debug!("outbound data drained, exiting");
        Ok(())
    }

    /// Terminal when either direction faulted, or the source has shut
    /// down and all of its buffers have come home (nothing left in
    /// flight toward the device).
    fn finished(&self) -> bool {
        let faulted = [&self.outbound, &self.inbound]
            .iter()
            .any(|end| end.as_ref().is_some_and(|e| e.queue.error.is_some()));
        let drained = self
            .outbound
            .as_ref()
            .is_some_and(|e| e.queue.shutdown && e.queue.is_full());
        faulted || drained
    }

    /// Block until something is ready. Stream descriptors join the set
    /// only while their ring can make progress: the source while a free
    /// buffer awaits filling, the sink while a completed buffer awaits
    /// writing. Completions re-arm them.
    fn wait(&self) -> Result<(PollFlags, PollFlags, bool), Error> {
        let mut fds = Vec::new();
        let mut input_at = None;
        let mut output_at = None;

        if let Some(end) = &self.outbound {
            if end.want_read() {
                input_at = Some(fds.len());
                fds.push(PollFd::from_borrowed_fd(
                    end.fd.as_fd(),
                    PollFlags::IN | PollFlags::HUP | PollFlags::ERR,
                ));
            }
        }
        if let Some(end) = &self.inbound {
            if end.want_write() {
                output_at = Some(fds.len());
                fds.push(PollFd::from_borrowed_fd(
                    end.fd.as_fd(),
                    PollFlags::OUT | PollFlags::HUP | PollFlags::ERR,
                ));
            }
        }
        let transport_at = fds.len();
        for (fd, events) in self.transport.poll_fds() {
            fds.push(PollFd::from_borrowed_fd(fd, events));
        }

        retry_on_intr(|| poll(&mut fds, None))
            .map_err(|e| Error::os("waiting for stream and transport events", e))?;

        let input_revents = input_at.map_or(PollFlags::empty(), |i| fds[i].revents());
        let output_revents = output_at.map_or(PollFlags::empty(), |i| fds[i].revents());
        let transport_ready = fds[transport_at..].iter().any(|fd| !fd.revents().is_empty());
        Ok((input_revents, output_revents, transport_ready))
    }

    fn route_completion(&mut self, completion: Completion) -> Result<(), Error> {
        let Completion {
            endpoint,
            status,
            buffer,
        } = completion;
        match status {
            TransferStatus::Complete => match self.direction_mut(endpoint) {
                Some(end) => end.queue.produce(buffer),
                None => warn!("completion for unknown endpoint {endpoint:#04x}"),
            },
            TransferStatus::TimedOut => {
                // Keep-alive expiry feeds straight back into the transport
                // and never reaches the streams.
                debug!("resubmitting timed-out transfer on endpoint {endpoint:#04x}");
                self.transport.submit(endpoint, buffer)?;
            }
            status => match self.direction_mut(endpoint) {
                Some(end) => {
                    debug!("terminal status on endpoint {endpoint:#04x}: {status}");
                    end.queue.error = Some(status);
                }
                None => return Err(Error::transfer(endpoint, status)),
            },
        }
        Ok(())
    }

    fn direction_mut(&mut self, endpoint: u8) -> Option<&mut StreamEnd> {
        match (&mut self.outbound, &mut self.inbound) {
            (Some(end), _) if end.endpoint == endpoint => Some(end),
            (_, Some(end)) if end.endpoint == endpoint => Some(end),
            _ => None,
        }
    }
}
