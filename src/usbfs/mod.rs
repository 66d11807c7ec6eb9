//! The Linux usbfs transport binding.
//!
//! Bulk URBs are submitted with `USBDEVFS_SUBMITURB` and collected,
//! without blocking, with `USBDEVFS_REAPURBNDELAY` once the device
//! descriptor polls writable — that readiness is the one descriptor this
//! transport contributes to the bridge's poll set. Each in-flight
//! transfer's URB allocation is kept on a free list and reused, so
//! steady-state streaming does not allocate.

mod enumeration;
mod ioctls;

pub use enumeration::find_device;

use std::collections::VecDeque;
use std::ffi::c_void;
use std::mem;
use std::path::PathBuf;

use log::{debug, error, warn};
use rustix::event::PollFlags;
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::fs::{open, Mode, OFlags};
use rustix::io::Errno;
use slab::Slab;

use crate::error::Error;
use crate::transfer::{Completion, Direction, TransferBuffer, TransferStatus, Transport};

use ioctls::Urb;

/// An open usbfs device node with at most one claimed interface.
pub struct Device {
    fd: OwnedFd,
    claimed: Option<u8>,
}

impl Device {
    /// Open `/dev/bus/usb/BBB/DDD` read-write.
    pub fn open(busnum: u8, devnum: u8) -> Result<Device, Error> {
        let path = PathBuf::from(format!("/dev/bus/usb/{busnum:03}/{devnum:03}"));
        debug!("opening usbfs device {}", path.display());
        let fd = open(&path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())
            .map_err(|e| Error::os("opening USB device node", e))?;
        Ok(Device { fd, claimed: None })
    }

    pub fn claim_interface(&mut self, interface: u8) -> Result<(), Error> {
        ioctls::claim_interface(&self.fd, interface)
            .map_err(|e| Error::os("claiming interface", e))?;
        debug!("claimed interface {interface}");
        self.claimed = Some(interface);
        Ok(())
    }

    /// Detach whatever kernel driver holds the interface and claim it.
    pub fn detach_and_claim_interface(&mut self, interface: u8) -> Result<(), Error> {
        ioctls::detach_and_claim_interface(&self.fd, interface)
            .map_err(|e| Error::os("detaching kernel driver from interface", e))?;
        debug!("detached kernel driver and claimed interface {interface}");
        self.claimed = Some(interface);
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Some(interface) = self.claimed {
            if let Err(e) = ioctls::release_interface(&self.fd, interface) {
                warn!("failed to release interface {interface}: {e}");
            }
        }
    }
}

struct PendingTransfer {
    urb: Box<Urb>,
    buffer: TransferBuffer,
}

/// [`Transport`] implementation over an open [`Device`].
pub struct UsbfsTransport {
    device: Device,
    /// In-flight transfers; the slab key is the URB's usercontext cookie.
    pending: Slab<PendingTransfer>,
    idle_urbs: Vec<Box<Urb>>,
}

impl UsbfsTransport {
    pub fn new(device: Device) -> UsbfsTransport {
        UsbfsTransport {
            device,
            pending: Slab::new(),
            idle_urbs: Vec::new(),
        }
    }
}

impl Transport for UsbfsTransport {
    fn submit(&mut self, endpoint: u8, mut buffer: TransferBuffer) -> Result<(), Error> {
        let request_len: i32 = match Direction::from_address(endpoint) {
            Direction::In => buffer.capacity(),
            Direction::Out => buffer.len(),
        }
        .try_into()
        .unwrap();

        let entry = self.pending.vacant_entry();
        let id = entry.key();

        let mut urb = self.idle_urbs.pop().unwrap_or_else(new_bulk_urb);
        *urb = Urb {
            ep_type: ioctls::USBDEVFS_URB_TYPE_BULK,
            endpoint,
            status: 0,
            flags: 0,
            buffer: buffer.as_mut_ptr(),
            buffer_length: request_len,
            actual_length: 0,
            start_frame: 0,
            number_of_packets_or_stream_id: 0,
            error_count: 0,
            signr: 0,
            usercontext: id as *mut c_void,
        };
        let urb_ptr: *mut Urb = &mut *urb;
        entry.insert(PendingTransfer { urb, buffer });

        debug!("submitting {request_len} byte urb on endpoint {endpoint:#04x}");
        // SAFETY: urb and buffer live in `pending` until the kernel hands
        // the pointer back through a reap; boxed and heap-backed, so
        // neither moves.
        if let Err(errno) = unsafe { ioctls::submit_urb(&self.device.fd, urb_ptr) } {
            let PendingTransfer { urb, .. } = self.pending.remove(id);
            self.idle_urbs.push(urb);
            return Err(Error::os("submitting USB transfer", errno).with_endpoint(endpoint));
        }
        Ok(())
    }

    fn poll_fds(&self) -> Vec<(BorrowedFd<'_>, PollFlags)> {
        // usbfs marks the device descriptor writable while completed URBs
        // are waiting to be reaped.
        vec![(self.device.fd.as_fd(), PollFlags::OUT)]
    }

    fn handle_events(&mut self, completions: &mut VecDeque<Completion>) -> Result<(), Error> {
        loop {
            match ioctls::reap_urb_ndelay(&self.device.fd) {
                Ok(urb_ptr) => {
                    // SAFETY: the pointer is one we submitted, and the
                    // kernel is done with it.
                    let id = unsafe { (*urb_ptr).usercontext } as usize;
                    let PendingTransfer { urb, mut buffer } = self.pending.remove(id);
                    debug_assert!(std::ptr::eq(&*urb, urb_ptr));

                    let endpoint = urb.endpoint;
                    let status = urb_status(&urb);
                    if Direction::from_address(endpoint) == Direction::In {
                        buffer.set_len(urb.actual_length as usize);
                    }
                    debug!(
                        "urb on endpoint {endpoint:#04x} finished: {status}, {} bytes",
                        urb.actual_length
                    );
                    self.idle_urbs.push(urb);
                    completions.push_back(Completion {
                        endpoint,
                        status,
                        buffer,
                    });
                }
                Err(Errno::AGAIN) => return Ok(()),
                Err(errno) => {
                    error!("unexpected error {errno} from REAPURBNDELAY");
                    return Err(Error::os("reaping USB transfers", errno));
                }
            }
        }
    }
}

impl Drop for UsbfsTransport {
    fn drop(&mut self) {
        for (_, pending) in self.pending.iter_mut() {
            let urb_ptr: *mut Urb = &mut *pending.urb;
            // SAFETY: still submitted; best effort, the kernel may have
            // completed it already.
            if let Err(errno) = unsafe { ioctls::discard_urb(&self.device.fd, urb_ptr) } {
                debug!("failed to discard urb: {errno}");
            }
        }
        // Discarded URBs only come back through a reap nobody will
        // perform. Leak them rather than free memory the kernel can
        // still write; the process is on its way out.
        for pending in self.pending.drain() {
            mem::forget(pending);
        }
    }
}

fn new_bulk_urb() -> Box<Urb> {
    Box::new(Urb {
        ep_type: ioctls::USBDEVFS_URB_TYPE_BULK,
        endpoint: 0,
        status: 0,
        flags: 0,
        buffer: std::ptr::null_mut(),
        buffer_length: 0,
        actual_length: 0,
        start_frame: 0,
        number_of_packets_or_stream_id: 0,
        error_count: 0,
        signr: 0,
        usercontext: std::ptr::null_mut(),
    })
}

fn urb_status(urb: &Urb) -> TransferStatus {
    if urb.status == 0 {
        return TransferStatus::Complete;
    }

    // The kernel reports these sometimes positive, sometimes negative.
    match Errno::from_raw_os_error(urb.status.abs()) {
        Errno::TIMEDOUT => TransferStatus::TimedOut,
        Errno::NOENT => TransferStatus::Cancelled,
        Errno::NODEV | Errno::SHUTDOWN => TransferStatus::Disconnected,
        Errno::PIPE => TransferStatus::Stall,
        Errno::OVERFLOW => TransferStatus::Overflow,
        Errno::PROTO | Errno::ILSEQ | Errno::TIME => TransferStatus::Fault,
        _ => TransferStatus::UnknownError,
    }
}
