// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Capability-based IPC core of the NEURON kernel, hosted on std threads
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//!
//! PUBLIC API:
//!   - Kernel / Process / Thread: explicit execution contexts
//!   - Thread::{port_*, connection_*, object_wait, handle_*}: syscall surface
//!   - HandleTable, KMessage, Connection, Port: kernel objects
//!   - Message: 72-byte user envelope
//!   - Status: kernel status codes
//!
//! DEPENDENCIES:
//!   - parking_lot: object locks and condition variables
//!   - bitflags: flag words
//!   - thiserror: Status / ConfigError
//!   - serde + toml: IpcConfig
//!
//! LOCK ORDER: handle table -> port -> connection -> notifier -> wait set
//!
//! TEST_COVERAGE: unit tests per module, tests_prop.rs, tests/

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

mod config;
mod connection;
mod endpoint;
mod event;
mod handle;
mod kmessage;
mod object;
mod port;
mod process;
mod security;
mod status;
mod syscall;
mod wait;
mod wire;

#[cfg(test)]
mod tests_prop;

pub use config::{ConfigError, IpcConfig, MIN_MESSAGE_SIZE_LIMIT};
pub use connection::{ClientInfo, Connection, ConnectionState, EndpointHandle, Role};
pub use endpoint::{EndpointFlags, EndpointOps, KernelEndpoint, Received};
pub use event::{EventFlags, EventKind, ObjectEvent, ObjectWaitFlags, MAX_WAIT_EVENTS};
pub use handle::{HandleFlags, HandleId, HandleTable, InheritPolicy};
pub use kmessage::{KMessage, MessageQuota};
pub use object::{KernelObject, ObjectType, Resource};
pub use port::{ConnectRequest, Port, PortHandler};
pub use process::{Kernel, Process, ProcessId, ProcessSpec, Thread};
pub use security::{GroupId, Privileges, SecurityContext, UserId, MAX_GROUPS};
pub use status::{result_code, ErrorClass, Result, Status};
pub use syscall::{Listened, Outgoing};
pub use wait::{Interrupter, IpcFlags, Wait};
pub use wire::{Message, MessageClass, MessageFlags, ARGS_COUNT, ENVELOPE_SIZE, USER_ID_MASK};
