// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Endpoint queues: blocking send/receive and the pending-attachment slot
//! OWNERS: @kernel-team
//! PUBLIC API: EndpointOps, KernelEndpoint, EndpointFlags, Received
//! DEPENDS_ON: connection::Connection (lock, condvars, state)
//! INVARIANTS:
//!   - FIFO per direction; serials stamped at enqueue so they follow queue order
//!   - A non-FORCE send never pushes a queue past queue_max; FORCE may overshoot
//!   - At most one pending attachment per endpoint; send/receive drop it first
//!   - Queued messages stay receivable after the connection closes
//!   - A failed wait leaves both queues untouched

use std::sync::Arc;

use bitflags::bitflags;
use log::trace;

use crate::connection::{ClientInfo, Connection, ConnectionState, Role};
use crate::kmessage::KMessage;
use crate::object::KernelObject;
use crate::security::SecurityContext;
use crate::status::{Result, Status};
use crate::wait::{Interrupter, IpcFlags, Sleeper, Wait};
use crate::wire::{Message, MessageClass, MessageFlags};

bitflags! {
    /// Endpoint behaviour flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct EndpointFlags: u32 {
        /// Discard every message sent to this endpoint, reporting success to the sender.
        const DROP = 1 << 0;
    }
}

/// Kernel-side endpoint behaviour. Installed by a [`crate::port::PortHandler`].
pub trait EndpointOps: Send + Sync {
    /// Handles a message sent to this endpoint, in the sender's context, without the
    /// connection lock held.
    fn receive(&self, endpoint: &KernelEndpoint, message: Arc<KMessage>, flags: IpcFlags) -> Result<()>;

    /// Called once when the remote end hangs up.
    fn hangup(&self, _endpoint: &KernelEndpoint) {}
}

/// Envelope and metadata returned by a receive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Received {
    /// Header copy with VALID set.
    pub message: Message,
    /// Sender snapshot, present when SECURITY_ATTACHED is set.
    pub security: Option<SecurityContext>,
    /// Monotonic send time.
    pub timestamp_ns: u64,
}

pub(crate) struct Pending {
    message: Arc<KMessage>,
    data: bool,
    handle: Option<KernelObject>,
}

impl Pending {
    fn is_consumed(&self) -> bool {
        !self.data && self.handle.is_none()
    }

    pub(crate) fn into_message(self) -> Arc<KMessage> {
        self.message
    }
}

#[derive(Default)]
pub(crate) struct EndpointState {
    pub(crate) queue: std::collections::VecDeque<Arc<KMessage>>,
    pub(crate) pending: Option<Pending>,
    pub(crate) flags: EndpointFlags,
    pub(crate) ops: Option<Arc<dyn EndpointOps>>,
    last_serial: u64,
}

impl EndpointState {
    /// Builds the header handed to a receiver and the attachment slot contents.
    pub(crate) fn deliver(message: Arc<KMessage>, can_take_handle: bool) -> (Message, Option<Pending>) {
        let mut header = *message.header();
        header.flags.insert(MessageFlags::VALID);
        let handle = message.handle().filter(|_| can_take_handle).cloned();
        if handle.is_none() {
            header.flags.remove(MessageFlags::HANDLE_ATTACHED);
        }
        let data = message.data().is_some();
        let pending = (data || handle.is_some()).then_some(Pending { message, data, handle });
        (header, pending)
    }

    fn stamp(&mut self, message: &mut KMessage) -> u64 {
        if message.header().class() == MessageClass::Reply {
            return message.header().serial;
        }
        self.last_serial += 1;
        message.set_serial(self.last_serial);
        self.last_serial
    }
}

impl Connection {
    fn take_pending(&self, role: Role) -> Option<Pending> {
        self.inner.lock().endpoints[role.index()].pending.take()
    }

    /// Queues `message` on the endpoint opposite `from`. Returns the serial it carries.
    pub(crate) fn send(
        self: &Arc<Self>,
        from: Role,
        mut message: KMessage,
        flags: IpcFlags,
        sleeper: &Sleeper<'_>,
    ) -> Result<u64> {
        let to = from.other();
        let _stale = self.take_pending(from);
        let mut inner = self.inner.lock();
        match inner.state {
            ConnectionState::Setup => return Err(Status::InvalidArg),
            ConnectionState::Closed => return Err(Status::ConnHungup),
            ConnectionState::Active => {}
        }

        if let Some(ops) = inner.endpoints[to.index()].ops.clone() {
            let serial = inner.endpoints[from.index()].stamp(&mut message);
            drop(inner);
            message.set_timestamp(self.limits.now_ns());
            ops.receive(&KernelEndpoint::new(Arc::clone(self), to), Arc::new(message), flags)?;
            return Ok(serial);
        }

        if inner.endpoints[to.index()].flags.contains(EndpointFlags::DROP) {
            return Ok(inner.endpoints[from.index()].stamp(&mut message));
        }

        if !flags.contains(IpcFlags::FORCE) {
            while inner.state == ConnectionState::Active
                && inner.endpoints[to.index()].queue.len() >= self.limits.queue_max
            {
                sleeper.sleep(&self.space[to.index()], &mut inner)?;
            }
            if inner.state == ConnectionState::Closed {
                return Err(Status::ConnHungup);
            }
        }

        let serial = inner.endpoints[from.index()].stamp(&mut message);
        message.set_timestamp(self.limits.now_ns());
        let queue = &mut inner.endpoints[to.index()].queue;
        queue.push_back(Arc::new(message));
        trace!("ipc: {from:?} -> {to:?} serial={serial} depth={}", queue.len());
        self.data[to.index()].notify_all();
        self.signal_message(to);
        Ok(serial)
    }

    /// Pops the head of `role`'s queue into its pending slot.
    pub(crate) fn receive(&self, role: Role, can_take_handle: bool, sleeper: &Sleeper<'_>) -> Result<Received> {
        let _stale = self.take_pending(role);
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Setup {
            return Err(Status::InvalidArg);
        }
        loop {
            let endpoint = &mut inner.endpoints[role.index()];
            if let Some(message) = endpoint.queue.pop_front() {
                if endpoint.queue.len() < self.limits.queue_max {
                    self.space[role.index()].notify_all();
                }
                let security = message.security().cloned();
                let timestamp_ns = message.timestamp_ns();
                let (header, pending) = EndpointState::deliver(message, can_take_handle);
                endpoint.pending = pending;
                return Ok(Received { message: header, security, timestamp_ns });
            }
            if inner.state == ConnectionState::Closed {
                return Err(Status::ConnHungup);
            }
            sleeper.sleep(&self.data[role.index()], &mut inner)?;
        }
    }

    /// Copies out and consumes the pending data blob.
    pub(crate) fn receive_data(&self, role: Role) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        let slot = &mut inner.endpoints[role.index()].pending;
        let pending = slot.as_mut().filter(|p| p.data).ok_or(Status::NotFound)?;
        let data = pending.message.data().map(<[u8]>::to_vec).unwrap_or_default();
        pending.data = false;
        let _finished = if pending.is_consumed() { slot.take() } else { None };
        Ok(data)
    }

    /// Takes the pending handle. Pair with [`Connection::restore_handle`] if installing it fails.
    pub(crate) fn take_handle(&self, role: Role) -> Result<(Arc<KMessage>, KernelObject)> {
        let mut inner = self.inner.lock();
        let slot = &mut inner.endpoints[role.index()].pending;
        let pending = slot.as_mut().ok_or(Status::NotFound)?;
        let object = pending.handle.take().ok_or(Status::NotFound)?;
        let message = Arc::clone(&pending.message);
        if pending.is_consumed() {
            *slot = None;
        }
        if self.is_payload(&message) {
            inner.payload_handle_taken = true;
        }
        Ok((message, object))
    }

    pub(crate) fn restore_handle(&self, role: Role, message: Arc<KMessage>, object: KernelObject) {
        let mut inner = self.inner.lock();
        if self.is_payload(&message) {
            inner.payload_handle_taken = false;
        }
        let slot = &mut inner.endpoints[role.index()].pending;
        match slot {
            Some(pending) if Arc::ptr_eq(&pending.message, &message) => pending.handle = Some(object),
            Some(_) => {}
            None => *slot = Some(Pending { message, data: false, handle: Some(object) }),
        }
    }

    /// Queued message count for `role`.
    pub fn queued(&self, role: Role) -> usize {
        self.inner.lock().endpoints[role.index()].queue.len()
    }
}

/// Kernel-side view of an endpoint, passed to [`EndpointOps`] callbacks.
pub struct KernelEndpoint {
    conn: Arc<Connection>,
    role: Role,
}

impl KernelEndpoint {
    pub(crate) fn new(conn: Arc<Connection>, role: Role) -> Self {
        Self { conn, role }
    }

    /// Identity of the process that opened the connection.
    pub fn client(&self) -> &ClientInfo {
        self.conn.client()
    }

    /// Connection state.
    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    /// Sends `message` to the user side. Kernel senders are never interrupted.
    pub fn send(&self, message: KMessage, flags: IpcFlags, wait: Wait) -> Result<u64> {
        let interrupter = Interrupter::default();
        let sleeper = Sleeper::new(wait, flags - IpcFlags::INTERRUPTIBLE, &interrupter, self.conn.limits.tick);
        self.conn.send(self.role, message, flags, &sleeper)
    }

    /// Hangs up the kernel side.
    pub fn close(&self) {
        self.conn.close(self.role);
    }
}
