// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Userspace core-connection library layered on the kernel IPC syscalls
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: unit tests (message, queue), tests_prop.rs, tests/connection.rs
//!
//! PUBLIC API:
//!   - CoreMessage: signal/request/reply with inline or blob payload
//!   - Connection: open, signal, request, reply, receive, status, close
//!   - ConnectionFlags / MessageFlags: receive filters and send options
//!   - IpcError: library error type
//!
//! DEPENDENCIES:
//!   - neuron-ipc: kernel syscall surface (Thread)
//!   - parking_lot: receive queue lock
//!   - bitflags: flag words
//!   - log: dropped and malformed message reporting

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

use core::fmt;
use core::time::Duration;

use neuron_ipc::Status;

mod connection;
mod message;
mod queue;

#[cfg(test)]
mod tests_prop;

pub use connection::{Connection, ConnectionFlags};
pub use message::{AttachedHandle, CoreMessage, MessageFlags, INLINE_CAPACITY};
pub use queue::{ReceiveQueue, DEFAULT_QUEUE_CAPACITY};

pub use neuron_ipc::{HandleId, MessageClass, Wait};

/// Timeout applied to sends unless the connection overrides it.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Result type returned by connection operations.
pub type Result<T> = core::result::Result<T, IpcError>;

/// Errors produced by the connection library.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpcError {
    /// The kernel rejected the call.
    Kernel(Status),
    /// A message violated the payload encoding.
    Malformed,
    /// The peer answered with a message that does not fit the exchange.
    Unexpected,
}

impl IpcError {
    /// Status to report to a peer for this error.
    pub const fn status(self) -> Status {
        match self {
            Self::Kernel(status) => status,
            Self::Malformed | Self::Unexpected => Status::InvalidArg,
        }
    }
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kernel(status) => write!(f, "kernel rejected ipc request: {status}"),
            Self::Malformed => write!(f, "malformed message"),
            Self::Unexpected => write!(f, "unexpected message from peer"),
        }
    }
}

impl std::error::Error for IpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Kernel(status) => Some(status),
            Self::Malformed | Self::Unexpected => None,
        }
    }
}

impl From<Status> for IpcError {
    fn from(status: Status) -> Self {
        Self::Kernel(status)
    }
}
