use std::{fmt::Display, io, num::NonZeroU32};

use rustix::io::Errno;

use crate::transfer::TransferStatus;

/// Error returned from setup operations and fatal runtime faults.
///
/// Carries a static message naming the operation, plus whatever context
/// was available at the point of detection: the OS `errno`, the endpoint
/// address, or the terminal transfer status.
#[derive(Debug, Clone)]
pub struct Error {
    pub(crate) kind: ErrorKind,
    pub(crate) message: &'static str,
    pub(crate) code: Option<NonZeroU32>,
    pub(crate) endpoint: Option<u8>,
    pub(crate) status: Option<TransferStatus>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, message: &'static str) -> Self {
        Self {
            kind,
            message,
            code: None,
            endpoint: None,
            status: None,
        }
    }

    /// An OS call failed. The kind is derived from the errno.
    pub(crate) fn os(message: &'static str, errno: Errno) -> Self {
        Self {
            kind: ErrorKind::from_errno(errno),
            message,
            code: NonZeroU32::new(errno.raw_os_error() as u32),
            endpoint: None,
            status: None,
        }
    }

    pub(crate) fn io(message: &'static str, err: &io::Error) -> Self {
        Self {
            kind: ErrorKind::Other,
            message,
            code: err.raw_os_error().and_then(|c| NonZeroU32::new(c as u32)),
            endpoint: None,
            status: None,
        }
    }

    /// A transfer finished with a terminal status.
    pub(crate) fn transfer(endpoint: u8, status: TransferStatus) -> Self {
        let kind = match status {
            TransferStatus::Disconnected => ErrorKind::Disconnected,
            _ => ErrorKind::Other,
        };
        Self {
            kind,
            message: "USB transfer failed",
            code: None,
            endpoint: Some(endpoint),
            status: Some(status),
        }
    }

    pub(crate) fn with_endpoint(mut self, endpoint: u8) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the `errno` value from the OS, if applicable.
    pub fn os_error(&self) -> Option<u32> {
        self.code.map(|c| c.get())
    }

    /// Get the terminal transfer status, if this error reports one.
    pub fn transfer_status(&self) -> Option<TransferStatus> {
        self.status
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(endpoint) = self.endpoint {
            write!(f, " on endpoint {endpoint:#04x}")?;
        }
        if let Some(status) = self.status {
            write!(f, ": {status}")?;
        }
        if let Some(code) = self.code {
            write!(f, " (errno {})", code.get())?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match err.kind {
            ErrorKind::Disconnected => io::ErrorKind::NotConnected,
            ErrorKind::Busy => io::ErrorKind::Other,
            ErrorKind::PermissionDenied => io::ErrorKind::PermissionDenied,
            ErrorKind::NotFound => io::ErrorKind::NotFound,
            ErrorKind::Other => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// General category of error as part of an [`Error`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Device is disconnected.
    Disconnected,

    /// Device or interface is in use by another application or kernel driver.
    Busy,

    /// This user does not have permission to perform the requested operation.
    PermissionDenied,

    /// Requested device not found.
    NotFound,

    /// Uncategorized error.
    Other,
}

impl ErrorKind {
    fn from_errno(errno: Errno) -> ErrorKind {
        match errno {
            Errno::NODEV | Errno::SHUTDOWN => ErrorKind::Disconnected,
            Errno::BUSY => ErrorKind::Busy,
            Errno::ACCESS | Errno::PERM => ErrorKind::PermissionDenied,
            Errno::NOENT => ErrorKind::NotFound,
            _ => ErrorKind::Other,
        }
    }
}
