// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Connection wrapper: request/reply correlation, receive filters, out-of-order stash
//! OWNERS: @runtime
//! PUBLIC API: Connection, ConnectionFlags
//! DEPENDS_ON: neuron-ipc syscalls, message, queue
//! INVARIANTS:
//!   - Stashed messages are returned by receive() before new kernel messages
//!   - A reply matches a request only by serial and user ID
//!   - Dropping a connection closes its handle
//! TEST_COVERAGE: tests/connection.rs

use std::time::{Duration, Instant};

use bitflags::bitflags;
use log::{debug, trace, warn};
use neuron_ipc::{
    HandleId, IpcFlags, MessageClass, MessageFlags as WireFlags, ProcessId, Received, Status, Thread, Wait,
};
use parking_lot::Mutex;

use crate::message::{AttachedHandle, CoreMessage};
use crate::queue::ReceiveQueue;
use crate::{IpcError, Result, DEFAULT_SEND_TIMEOUT};

bitflags! {
    /// Classes of incoming messages a connection is willing to see.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ConnectionFlags: u32 {
        /// Deliver requests.
        const RECEIVE_REQUESTS = 1 << 0;
        /// Deliver signals.
        const RECEIVE_SIGNALS = 1 << 1;
        /// Keep sender security snapshots on delivered messages.
        const RECEIVE_SECURITY = 1 << 2;
    }
}

/// Absolute form of a [`Wait`], so a loop of kernel calls shares one budget.
#[derive(Clone, Copy, Debug)]
enum Deadline {
    Never,
    Poll,
    At(Instant),
}

impl Deadline {
    fn new(wait: Wait) -> Self {
        match wait {
            Wait::Blocking => Self::Never,
            Wait::NonBlocking => Self::Poll,
            Wait::Timeout(d) => Instant::now().checked_add(d).map_or(Self::Never, Self::At),
        }
    }

    fn remaining(self) -> Result<Wait> {
        match self {
            Self::Never => Ok(Wait::Blocking),
            Self::Poll => Ok(Wait::NonBlocking),
            Self::At(at) => {
                let left = at.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    Err(Status::TimedOut.into())
                } else {
                    Ok(Wait::Timeout(left))
                }
            }
        }
    }
}

/// One endpoint of a kernel connection, bound to the thread that drives it.
pub struct Connection<'t> {
    thread: &'t Thread,
    handle: Option<HandleId>,
    flags: ConnectionFlags,
    send_timeout: Duration,
    queue: Mutex<ReceiveQueue>,
}

impl<'t> Connection<'t> {
    /// Opens a connection on `port` without a payload.
    pub fn open(thread: &'t Thread, port: HandleId, flags: ConnectionFlags, wait: Wait) -> Result<Self> {
        Self::connect(thread, port, None, flags, wait)
    }

    /// Opens a connection on `port`, handing `payload` to whoever listens.
    pub fn connect(
        thread: &'t Thread,
        port: HandleId,
        payload: Option<CoreMessage>,
        flags: ConnectionFlags,
        wait: Wait,
    ) -> Result<Self> {
        let encoded = payload.as_ref().map(CoreMessage::encode);
        let ipc_flags = encoded.as_ref().map_or(IpcFlags::empty(), |(_, flags)| *flags);
        let handle = thread.connection_open(port, encoded.as_ref().map(|(out, _)| out), ipc_flags, wait)?;
        debug!("ipc: opened connection {:?} on port {:?}", handle, port);
        Ok(Self::from_handle(thread, handle, flags))
    }

    /// Wraps an existing connection handle, e.g. an accepted server endpoint.
    pub fn from_handle(thread: &'t Thread, handle: HandleId, flags: ConnectionFlags) -> Self {
        Self {
            thread,
            handle: Some(handle),
            flags,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            queue: Mutex::new(ReceiveQueue::default()),
        }
    }

    /// Overrides the send timeout.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Underlying kernel handle.
    pub fn handle(&self) -> Result<HandleId> {
        self.handle.ok_or(IpcError::Kernel(Status::InvalidHandle))
    }

    /// Receive filters.
    pub fn flags(&self) -> ConnectionFlags {
        self.flags
    }

    /// Number of stashed messages waiting for receive().
    pub fn stashed(&self) -> usize {
        self.queue.lock().len()
    }

    /// Sends a signal. Returns its serial.
    pub fn signal(&self, message: CoreMessage) -> Result<u64> {
        self.send(message, MessageClass::Signal)
    }

    /// Sends a reply built with [`CoreMessage::new_reply`].
    pub fn reply(&self, message: CoreMessage) -> Result<()> {
        self.send(message, MessageClass::Reply).map(|_| ())
    }

    /// Sends a request and waits up to `wait` for the matching reply.
    ///
    /// Anything else that arrives in the meantime is stashed for later receive() calls.
    pub fn request(&self, message: CoreMessage, wait: Wait) -> Result<CoreMessage> {
        let id = message.id();
        let serial = self.send(message, MessageClass::Request)?;
        let is_reply = |m: &CoreMessage| m.class() == MessageClass::Reply && m.serial() == serial;

        if let Some(reply) = self.queue.lock().take_where(is_reply) {
            return check_reply(reply, id);
        }
        let deadline = Deadline::new(wait);
        loop {
            let message = self.receive_kernel(deadline)?;
            if is_reply(&message) {
                return check_reply(message, id);
            }
            trace!("ipc: stashing {:?} serial {} while awaiting {}", message.class(), message.serial(), serial);
            self.stash(message);
        }
    }

    /// Next message: stashed ones first, then from the kernel.
    pub fn receive(&self, wait: Wait) -> Result<CoreMessage> {
        if let Some(message) = self.queue.lock().pop() {
            return Ok(message);
        }
        self.receive_kernel(Deadline::new(wait))
    }

    /// Current connection status; `ConnHungup` once the peer is gone.
    pub fn status(&self) -> Result<()> {
        Ok(self.thread.connection_status(self.handle()?)?)
    }

    /// Process at the other end.
    pub fn remote(&self) -> Result<ProcessId> {
        Ok(self.thread.connection_open_remote(self.handle()?)?)
    }

    /// Closes the connection and releases stashed handles.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    /// Gives up ownership of the kernel handle without closing it.
    pub fn into_handle(mut self) -> Result<HandleId> {
        let handle = self.handle.take().ok_or(IpcError::Kernel(Status::InvalidHandle))?;
        self.discard_stash();
        Ok(handle)
    }

    fn send(&self, mut message: CoreMessage, class: MessageClass) -> Result<u64> {
        if message.class() != class {
            return Err(Status::InvalidArg.into());
        }
        let handle = self.handle()?;
        let (out, flags) = message.encode();
        let serial = self.thread.connection_send(handle, &out, flags, Wait::Timeout(self.send_timeout))?;
        message.set_serial(serial);
        trace!("ipc: sent {:?} id {} serial {}", class, message.id(), serial);
        Ok(serial)
    }

    fn accepts(&self, class: MessageClass) -> bool {
        match class {
            MessageClass::Request => self.flags.contains(ConnectionFlags::RECEIVE_REQUESTS),
            MessageClass::Signal => self.flags.contains(ConnectionFlags::RECEIVE_SIGNALS),
            MessageClass::Reply => true,
            MessageClass::Reserved => false,
        }
    }

    fn receive_kernel(&self, deadline: Deadline) -> Result<CoreMessage> {
        let handle = self.handle()?;
        loop {
            let received = self.thread.connection_receive(handle, IpcFlags::empty(), deadline.remaining()?)?;
            if let Some(message) = self.collect(handle, received)? {
                return Ok(message);
            }
        }
    }

    /// Pulls the attachments of a received envelope. `None` means the message was dropped.
    fn collect(&self, handle: HandleId, received: Received) -> Result<Option<CoreMessage>> {
        let header = received.message;
        if !self.accepts(header.class()) {
            debug!("ipc: dropping unrequested {:?} id {}", header.class(), header.user_id());
            return Ok(None);
        }
        let blob = if header.flags.contains(WireFlags::DATA_ATTACHED) {
            Some(self.thread.connection_receive_data(handle)?)
        } else {
            None
        };
        let mut message = match CoreMessage::decode(&header, blob) {
            Ok(message) => message,
            Err(_) => {
                warn!(
                    "ipc: dropping malformed message id {} serial {} (size word {})",
                    header.user_id(),
                    header.serial,
                    header.args[0]
                );
                return Ok(None);
            }
        };
        if header.flags.contains(WireFlags::HANDLE_ATTACHED) {
            match self.thread.connection_receive_handle(handle) {
                Ok(attached) => message.handle = Some(AttachedHandle { handle: attached, own: true }),
                Err(Status::NotFound) => {}
                Err(status) => warn!(
                    "ipc: message id {} serial {} delivered without its handle: {status}",
                    header.user_id(),
                    header.serial
                ),
            }
        }
        if self.flags.contains(ConnectionFlags::RECEIVE_SECURITY) {
            message.security = received.security;
        }
        message.timestamp_ns = received.timestamp_ns;
        Ok(Some(message))
    }

    fn stash(&self, message: CoreMessage) {
        let evicted = self.queue.lock().push(message);
        if let Some(evicted) = evicted {
            warn!("ipc: receive queue full, dropping {:?} serial {}", evicted.class(), evicted.serial());
            self.discard(evicted);
        }
    }

    fn discard(&self, message: CoreMessage) {
        if let Some(AttachedHandle { handle, own: true }) = message.handle {
            let _ = self.thread.handle_close(handle);
        }
    }

    fn discard_stash(&self) {
        let stashed: Vec<CoreMessage> = self.queue.lock().drain().collect();
        for message in stashed {
            self.discard(message);
        }
    }

    fn release(&mut self) -> Result<()> {
        self.discard_stash();
        match self.handle.take() {
            Some(handle) => {
                debug!("ipc: closing connection {:?}", handle);
                Ok(self.thread.handle_close(handle)?)
            }
            None => Ok(()),
        }
    }
}

impl Drop for Connection<'_> {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn check_reply(reply: CoreMessage, id: u32) -> Result<CoreMessage> {
    if reply.id() != id {
        warn!("ipc: reply serial {} carries id {} instead of {}", reply.serial(), reply.id(), id);
        return Err(IpcError::Unexpected);
    }
    Ok(reply)
}
