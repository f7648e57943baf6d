// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Service-manager protocol, registry and event loop built on the IPC core
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: unit tests (protocol, registry), tests_prop.rs, tests/manager.rs
//!
//! PUBLIC API:
//!   - connect_to_service / connect: reach a service through the root port
//!   - open_control / register_port: publish a service port
//!   - Registry: catalog of services, their ports and generations
//!   - Manager / Launcher / StopHandle: the listen-and-forward loop
//!
//! DEPENDENCIES:
//!   - neuron-ipc: syscall surface
//!   - nexus-ipc: control-client connections
//!   - parking_lot: shared registry state
//!   - thiserror: Error

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

use neuron_ipc::Status;
use nexus_ipc::IpcError;

mod manager;
mod protocol;
mod registry;

#[cfg(test)]
mod tests_prop;

pub use manager::{Launcher, Manager, StopHandle, MAX_CONTROL_CLIENTS};
pub use protocol::{
    connect, connect_to_service, open_control, register_port, validate_name, CONNECT, NAME_MAX, REGISTER_PORT,
};
pub use registry::{Generation, Registry, Resolution, ServiceInfo, ServiceSpec};

/// Result alias for service manager operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors produced by the service manager and its clients.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// Service name is empty, too long or not UTF-8.
    #[error("invalid service name")]
    InvalidName,
    /// The requested service does not exist.
    #[error("service not found")]
    NotFound,
    /// A live port is already registered for the service.
    #[error("service already registered")]
    AlreadyExists,
    /// The caller may not register this service.
    #[error("registration denied")]
    AccessDenied,
    /// Starting an on-demand service failed.
    #[error("failed to launch service: {0}")]
    Launch(Status),
    /// The peer answered with something the protocol does not allow.
    #[error("protocol violation")]
    Protocol,
    /// IPC failure.
    #[error(transparent)]
    Ipc(#[from] IpcError),
}

impl Error {
    /// Status code reported to peers for this error.
    pub fn status(&self) -> Status {
        match self {
            Self::InvalidName | Self::Protocol => Status::InvalidArg,
            Self::NotFound => Status::NotFound,
            Self::AlreadyExists => Status::AlreadyExists,
            Self::AccessDenied => Status::AccessDenied,
            Self::Launch(status) => *status,
            Self::Ipc(err) => err.status(),
        }
    }

    /// Inverse of [`Error::status`] for codes received from a manager.
    pub fn from_status(status: Status) -> Self {
        match status {
            Status::InvalidArg => Self::InvalidName,
            Status::NotFound => Self::NotFound,
            Status::AlreadyExists => Self::AlreadyExists,
            Status::AccessDenied => Self::AccessDenied,
            other => Self::Ipc(IpcError::Kernel(other)),
        }
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Self::Ipc(IpcError::Kernel(status))
    }
}
