// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Error types for engine operations

use crate::regs::Channel;

/// Engine result type
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errno values handed back to scheme clients. Redox shares these numbers with Linux.
pub mod errno {
    pub const EINTR: i32 = 4;
    pub const EIO: i32 = 5;
    pub const ENOMEM: i32 = 12;
    pub const EFAULT: i32 = 14;
    pub const EINVAL: i32 = 22;
    pub const ERESTART: i32 = 85;
}

/// Engine error type
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Bad flags, out-of-range offset or length, unknown handle, or a
    /// scatter-gather accounting mismatch
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Allocation failed while pinning or building segment lists
    #[error("out of memory")]
    OutOfMemory,
    /// Caller memory could not be read, written or pinned
    #[error("bad address")]
    Fault,
    /// The channel reported an error status on completion
    #[error("DMA {channel} failed (status 0x{status:08x})")]
    Hardware { channel: Channel, status: u32 },
    /// Engine acquisition was cancelled before any hardware access
    #[error("interrupted while waiting for the DMA engine")]
    Interrupted,
    /// The completion wait was cancelled; the transfer was aborted
    #[error("DMA {0} interrupted")]
    Cancelled(Channel),
}

impl Error {
    /// Errno equivalent of this error
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => errno::EINVAL,
            Error::OutOfMemory => errno::ENOMEM,
            Error::Fault => errno::EFAULT,
            Error::Hardware { .. } => errno::EIO,
            Error::Interrupted => errno::ERESTART,
            Error::Cancelled(_) => errno::EINTR,
        }
    }

    /// Whether the caller may simply reissue the request
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Interrupted)
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Error::OutOfMemory
    }
}
