// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Status codes returned across the IPC syscall surface
//! OWNERS: @kernel-team
//! PUBLIC API: Status, ErrorClass, Result, result_code()
//! INVARIANTS: Numeric codes are ABI; SUCCESS (0) is represented by `Ok`

/// Result type returned by every IPC core operation.
pub type Result<T> = core::result::Result<T, Status>;

/// Failure status codes. Values match the kernel status header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
#[repr(i32)]
pub enum Status {
    /// Operation not implemented.
    #[error("operation not implemented")]
    NotImplemented = 1,
    /// Operation not supported for this object.
    #[error("operation not supported")]
    NotSupported = 2,
    /// Operation would block.
    #[error("operation would block")]
    WouldBlock = 3,
    /// Blocking call interrupted.
    #[error("interrupted")]
    Interrupted = 4,
    /// Deadline expired.
    #[error("timed out")]
    TimedOut = 5,
    /// Invalid argument.
    #[error("invalid argument")]
    InvalidArg = 7,
    /// Handle does not exist or has the wrong type.
    #[error("invalid handle")]
    InvalidHandle = 8,
    /// Event is not supported by the object.
    #[error("invalid event")]
    InvalidEvent = 11,
    /// Kernel memory (or the sender's message quota) is exhausted.
    #[error("out of memory")]
    NoMemory = 13,
    /// Handle table is full.
    #[error("no free handles")]
    NoHandles = 14,
    /// Caller lacks a required privilege.
    #[error("permission denied")]
    PermDenied = 18,
    /// Caller is not allowed to use this object in this way.
    #[error("access denied")]
    AccessDenied = 19,
    /// Requested item does not exist.
    #[error("not found")]
    NotFound = 24,
    /// Item already exists.
    #[error("already exists")]
    AlreadyExists = 26,
    /// Payload exceeds the configured limit.
    #[error("too large")]
    TooLarge = 28,
    /// Resource temporarily unavailable.
    #[error("try again")]
    TryAgain = 42,
    /// Remote end of the connection hung up.
    #[error("connection hung up")]
    ConnHungup = 45,
    /// Operation cancelled.
    #[error("cancelled")]
    Cancelled = 46,
    /// Object has an unexpected type.
    #[error("incorrect object type")]
    IncorrectType = 47,
}

/// Coarse taxonomy used by callers deciding whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Safe to retry; no state changed.
    Transient,
    /// The connection is gone for good; close the handle.
    PeerGone,
    /// Caller misused the interface.
    Misuse,
    /// A bounded resource ran out.
    Exhaustion,
    /// Refused by policy.
    Policy,
    /// Anything else.
    Other,
}

const ALL: [Status; 19] = [
    Status::NotImplemented,
    Status::NotSupported,
    Status::WouldBlock,
    Status::Interrupted,
    Status::TimedOut,
    Status::InvalidArg,
    Status::InvalidHandle,
    Status::InvalidEvent,
    Status::NoMemory,
    Status::NoHandles,
    Status::PermDenied,
    Status::AccessDenied,
    Status::NotFound,
    Status::AlreadyExists,
    Status::TooLarge,
    Status::TryAgain,
    Status::ConnHungup,
    Status::Cancelled,
    Status::IncorrectType,
];

impl Status {
    /// Numeric wire value.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Decodes a numeric status. `Some(Ok(()))` for SUCCESS, `None` for unknown codes.
    pub fn from_code(code: i32) -> Option<Result<()>> {
        if code == 0 {
            return Some(Ok(()));
        }
        ALL.iter().copied().find(|status| status.code() == code).map(Err)
    }

    /// Classifies the status.
    pub const fn class(self) -> ErrorClass {
        match self {
            Self::WouldBlock | Self::TimedOut | Self::Interrupted | Self::TryAgain => {
                ErrorClass::Transient
            }
            Self::ConnHungup => ErrorClass::PeerGone,
            Self::InvalidHandle
            | Self::InvalidArg
            | Self::InvalidEvent
            | Self::NotFound
            | Self::IncorrectType => ErrorClass::Misuse,
            Self::NoHandles | Self::NoMemory | Self::TooLarge => ErrorClass::Exhaustion,
            Self::AccessDenied | Self::PermDenied => ErrorClass::Policy,
            _ => ErrorClass::Other,
        }
    }

    /// Returns `true` for errors that are safe to retry unchanged.
    pub const fn is_transient(self) -> bool {
        matches!(self.class(), ErrorClass::Transient)
    }
}

/// Flattens a result into its numeric status code.
pub fn result_code<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(status) => status.code(),
    }
}
