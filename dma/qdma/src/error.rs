// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Error types for the DMA engine

use thiserror::Error;

/// Engine result type
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Resource that ran out while building a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// No free context block in the channel's pool
    ContextPool,
    /// The channel already has `nb_desc` operations in flight
    Descriptors,
    /// The completion index ring cannot take more entries
    IndexRing,
}

impl core::fmt::Display for Resource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Resource::ContextPool => write!(f, "context pool"),
            Resource::Descriptors => write!(f, "descriptor budget"),
            Resource::IndexRing => write!(f, "index ring"),
        }
    }
}

/// Malformed frame found on the receive path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unrecognized frame format tag {0}")]
    UnknownFormat(u8),
    #[error("frame routed to unknown virtual channel {0}")]
    UnknownChannel(u16),
    #[error("frame names context slot {slot} outside the pool of vchan {vchan}")]
    BadContext { vchan: u16, slot: u16 },
}

/// Lifecycle state of a device, reported by state errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Unconfigured,
    Configured,
    Started,
    Stopped,
    Closed,
}

/// Engine error type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Malformed request rejected before touching hardware or pool state
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Request shape the hardware cannot express
    #[error("not supported: {0}")]
    NotSupported(&'static str),
    /// Retry after harvesting completions
    #[error("{0} exhausted")]
    ResourceExhausted(Resource),
    /// Hardware kept refusing descriptors; `pending` are still queued
    #[error("hardware queue busy, {pending} descriptors still pending")]
    HardwareBusy { pending: usize },
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("device is {actual:?}, operation requires {expected}")]
    InvalidState {
        expected: &'static str,
        actual: DeviceState,
    },
    #[error("no such virtual channel {0}")]
    NoSuchChannel(u16),
    /// Teardown refused while work is outstanding
    #[error("vchan {vchan} still has {in_flight} operations in flight")]
    InFlight { vchan: u16, in_flight: u64 },
}

const EIO: i32 = 5;
const ENODEV: i32 = 19;
const EINVAL: i32 = 22;
const EBUSY: i32 = 16;
const ENOSPC: i32 = 28;
const ENOTSUP: i32 = 95;

impl Error {
    /// Negative errno equivalent, for callers speaking the C DMA device ABI
    pub fn errno(&self) -> i32 {
        -match self {
            Error::InvalidArgument(_) => EINVAL,
            Error::NotSupported(_) => ENOTSUP,
            Error::ResourceExhausted(_) => ENOSPC,
            Error::HardwareBusy { .. } | Error::InFlight { .. } => EBUSY,
            Error::Protocol(_) => EIO,
            Error::InvalidState { .. } => EBUSY,
            Error::NoSuchChannel(_) => ENODEV,
        }
    }

    /// True for errors a caller clears by harvesting or resubmitting
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ResourceExhausted(_) | Error::HardwareBusy { .. }
        )
    }
}
