// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall surface of the IPC core, expressed as methods on Thread
//! OWNERS: @kernel-team
//! PUBLIC API: Thread::{port_*, connection_*, object_wait, handle_*}, Outgoing, Listened
//! DEPENDS_ON: handle, port, connection, endpoint, event
//! INVARIANTS:
//!   - Handle lookups resolve to owned references before any object lock is taken
//!   - Handles leave the sender's table only after the message was queued (detach-then-insert)
//!   - Oversized payloads fail TOO_LARGE before a buffer is allocated
//! TEST_COVERAGE: tests/connection.rs, tests/port.rs, tests/object_wait.rs

use std::sync::Arc;

use log::debug;

use crate::connection::{ClientInfo, Connection, ConnectionState, EndpointHandle, Role};
use crate::endpoint::Received;
use crate::event::{start_wait, EventFlags, ObjectEvent, ObjectWaitFlags, WaitEntry, WaitSet, MAX_WAIT_EVENTS};
use crate::handle::{HandleFlags, HandleId};
use crate::kmessage::KMessage;
use crate::object::{KernelObject, ObjectType};
use crate::port::Port;
use crate::process::{ProcessId, Thread};
use crate::status::{Result, Status};
use crate::wait::{IpcFlags, Wait};
use crate::wire::{Message, MessageClass, ARGS_COUNT};

/// Message as supplied by a sender: envelope, data and an optional handle to transfer.
#[derive(Clone, Copy, Debug)]
pub struct Outgoing<'a> {
    header: Message,
    data: &'a [u8],
    handle: Option<HandleId>,
    security: bool,
}

impl<'a> Outgoing<'a> {
    /// Wraps an envelope. Its flags and size are recomputed from the attachments.
    pub fn new(header: Message) -> Self {
        Self { header, data: &[], handle: None, security: false }
    }

    /// Signal with user ID `id`.
    pub fn signal(id: u32) -> Self {
        Self::new(Message::new(MessageClass::Signal, id))
    }

    /// Request with user ID `id`.
    pub fn request(id: u32) -> Self {
        Self::new(Message::new(MessageClass::Request, id))
    }

    /// Reply to `request`, carrying its user ID and serial.
    pub fn reply(request: &Message) -> Self {
        let mut header = Message::new(MessageClass::Reply, request.user_id());
        header.serial = request.serial;
        Self::new(header)
    }

    /// Inline argument words.
    pub fn args(mut self, args: [u64; ARGS_COUNT]) -> Self {
        self.header.args = args;
        self
    }

    /// Data blob.
    pub fn data(mut self, data: &'a [u8]) -> Self {
        self.data = data;
        self
    }

    /// Handle to transfer.
    pub fn handle(mut self, handle: HandleId) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Attach the caller's security snapshot.
    pub fn security(mut self) -> Self {
        self.security = true;
        self
    }

    /// Envelope as supplied.
    pub fn header(&self) -> &Message {
        &self.header
    }
}

/// Result of [`Thread::port_listen`].
#[derive(Clone, Debug)]
pub struct Listened {
    /// Server endpoint of the half-open connection.
    pub handle: HandleId,
    /// Connect payload header; its data and handle sit in the endpoint's pending slot.
    pub payload: Option<Message>,
    /// Opening process and its security snapshot.
    pub client: ClientInfo,
}

type Transfer = Option<(HandleId, KernelObject)>;

impl Thread {
    fn lookup_port(&self, id: HandleId) -> Result<Arc<Port>> {
        if id == HandleId::ROOT_PORT {
            return self.process.root_port().ok_or(Status::NotFound);
        }
        match self.process.handles().lookup(id, Some(ObjectType::Port))? {
            KernelObject::Port(port) => Ok(port),
            _ => Err(Status::InvalidHandle),
        }
    }

    fn lookup_endpoint(&self, id: HandleId) -> Result<Arc<EndpointHandle>> {
        match self.process.handles().lookup(id, Some(ObjectType::Connection))? {
            KernelObject::Connection(endpoint) => Ok(endpoint),
            _ => Err(Status::InvalidHandle),
        }
    }

    fn lookup_server(&self, id: HandleId) -> Result<Arc<EndpointHandle>> {
        let endpoint = self.lookup_endpoint(id)?;
        if endpoint.role() != Role::Server {
            return Err(Status::InvalidHandle);
        }
        Ok(endpoint)
    }

    fn build(&self, out: &Outgoing<'_>) -> Result<(KMessage, Transfer)> {
        if out.data.len() > self.process.kernel().config().max_message_size {
            return Err(Status::TooLarge);
        }
        if out.header.class() == MessageClass::Reserved {
            return Err(Status::InvalidArg);
        }
        let mut message = KMessage::from_user(out.header);
        message.set_data(out.data);
        message.charge_to(self.process.quota_handle())?;
        if out.security {
            message.set_security(self.process.security());
        }
        let transfer = match out.handle {
            Some(id) => {
                let (object, flags) = self.process.handles().lookup_with_flags(id)?;
                if !flags.contains(HandleFlags::TRANSFERABLE) {
                    return Err(Status::NotSupported);
                }
                message.set_handle(Some(object.clone()));
                Some((id, object))
            }
            None => None,
        };
        Ok((message, transfer))
    }

    fn finish_transfer(&self, transfer: Transfer, flags: IpcFlags) {
        if let Some((id, object)) = transfer {
            if !flags.contains(IpcFlags::COPY_HANDLE) {
                let detached = self.process.handles().detach_if_same(id, &object);
                drop(detached);
            }
        }
    }

    /// Creates a port owned by the calling process.
    pub fn port_create(&self) -> Result<HandleId> {
        let port = Port::new(self.process.id(), None);
        self.process.handles().attach(KernelObject::Port(port))
    }

    /// Takes the oldest waiting connection attempt. The connection stays in Setup until
    /// the caller accepts, rejects or forwards it.
    pub fn port_listen(&self, port: HandleId, flags: IpcFlags, wait: Wait) -> Result<Listened> {
        let port = self.lookup_port(port)?;
        let conn = port.take_waiting(self.process.id(), &self.sleeper(wait, flags))?;
        let handles = self.process.handles();
        let endpoint = EndpointHandle::new(Arc::clone(&conn), Role::Server);
        let handle = match handles.attach(KernelObject::Connection(Arc::clone(&endpoint))) {
            Ok(handle) => handle,
            Err(err) => {
                endpoint.disarm();
                drop(endpoint);
                port.requeue_front(conn);
                return Err(err);
            }
        };
        let payload = conn.present_to_listener(handles.has_free_slot());
        Ok(Listened { handle, payload, client: conn.client().clone() })
    }

    /// Opens a connection on `port`, blocking until the owner resolves it.
    pub fn connection_open(
        &self,
        port: HandleId,
        payload: Option<&Outgoing<'_>>,
        flags: IpcFlags,
        wait: Wait,
    ) -> Result<HandleId> {
        let port = self.lookup_port(port)?;
        let handles = self.process.handles();
        if !handles.has_free_slot() {
            return Err(Status::NoHandles);
        }
        let (message, transfer) = match payload {
            Some(out) => {
                let (message, transfer) = self.build(out)?;
                (Some(message), transfer)
            }
            None => (None, None),
        };
        let client = ClientInfo { pid: self.process.id(), security: self.process.security() };
        let conn = Connection::new(client, message, self.process.kernel().limits());
        if let Err(err) = port.deliver(&conn) {
            let _ = conn.reject(err);
            return Err(err);
        }
        conn.wait_open(&self.sleeper(wait, flags))?;
        self.finish_transfer(transfer, flags);
        handles.attach(KernelObject::Connection(EndpointHandle::new(conn, Role::Client)))
    }

    /// Setup -> Active on a connection returned by listen.
    pub fn connection_accept(&self, handle: HandleId) -> Result<()> {
        let endpoint = self.lookup_server(handle)?;
        endpoint.connection().accept(self.process.id())
    }

    /// Fails the opener's connect with `status` and closes the handle. An attempt the opener
    /// already abandoned reports CONN_HUNGUP and its handle is closed all the same.
    pub fn connection_reject(&self, handle: HandleId, status: Status) -> Result<()> {
        let endpoint = self.lookup_server(handle)?;
        let result = endpoint.connection().reject(status);
        if matches!(result, Ok(()) | Err(Status::ConnHungup)) {
            let detached = self.process.handles().detach_if_same(handle, &KernelObject::Connection(endpoint));
            drop(detached);
        }
        result
    }

    /// Moves a half-open connection to `target` without waking the opener. The handle is
    /// consumed; if the target refuses, the opener is rejected with the same status. An
    /// abandoned attempt reports CONN_HUNGUP and its handle is closed; an accepted
    /// connection reports INVALID_ARG and stays bound.
    pub fn connection_forward(&self, handle: HandleId, target: HandleId) -> Result<()> {
        let endpoint = self.lookup_server(handle)?;
        let target = self.lookup_port(target)?;
        let conn = Arc::clone(endpoint.connection());
        match conn.state() {
            ConnectionState::Setup => {}
            ConnectionState::Active => return Err(Status::InvalidArg),
            ConnectionState::Closed => {
                let detached = self.process.handles().detach_if_same(handle, &KernelObject::Connection(endpoint));
                drop(detached);
                return Err(Status::ConnHungup);
            }
        }
        let detached = self
            .process
            .handles()
            .detach_if_same(handle, &KernelObject::Connection(Arc::clone(&endpoint)))
            .ok_or(Status::InvalidHandle)?;
        endpoint.disarm();
        drop(detached);
        drop(endpoint);

        let result = conn.prepare_forward().and_then(|()| target.deliver(&conn));
        if let Err(err) = result {
            debug!("ipc: forward to port {} failed: {err}", target.id());
            let _ = conn.reject(err);
            return Err(err);
        }
        Ok(())
    }

    /// Queues a message for the peer. Returns the serial it carries.
    pub fn connection_send(&self, handle: HandleId, out: &Outgoing<'_>, flags: IpcFlags, wait: Wait) -> Result<u64> {
        let endpoint = self.lookup_endpoint(handle)?;
        let (message, transfer) = self.build(out)?;
        let serial = endpoint.connection().send(endpoint.role(), message, flags, &self.sleeper(wait, flags))?;
        self.finish_transfer(transfer, flags);
        Ok(serial)
    }

    /// Pops the next message. Its data and handle move into the pending slot.
    pub fn connection_receive(&self, handle: HandleId, flags: IpcFlags, wait: Wait) -> Result<Received> {
        let endpoint = self.lookup_endpoint(handle)?;
        let can_take_handle = self.process.handles().has_free_slot();
        endpoint.connection().receive(endpoint.role(), can_take_handle, &self.sleeper(wait, flags))
    }

    /// Consumes the pending data blob.
    pub fn connection_receive_data(&self, handle: HandleId) -> Result<Vec<u8>> {
        let endpoint = self.lookup_endpoint(handle)?;
        endpoint.connection().receive_data(endpoint.role())
    }

    /// Installs the pending handle into the caller's table. On NO_HANDLES it stays pending.
    pub fn connection_receive_handle(&self, handle: HandleId) -> Result<HandleId> {
        let endpoint = self.lookup_endpoint(handle)?;
        let conn = endpoint.connection();
        let (message, object) = conn.take_handle(endpoint.role())?;
        match self.process.handles().attach(object.clone()) {
            Ok(id) => Ok(id),
            Err(err) => {
                conn.restore_handle(endpoint.role(), message, object);
                Err(err)
            }
        }
    }

    /// `Ok` until the connection is Closed, then CONN_HUNGUP.
    pub fn connection_status(&self, handle: HandleId) -> Result<()> {
        let endpoint = self.lookup_endpoint(handle)?;
        match endpoint.connection().state() {
            ConnectionState::Closed => Err(Status::ConnHungup),
            ConnectionState::Setup | ConnectionState::Active => Ok(()),
        }
    }

    /// Process on the other side of the connection.
    pub fn connection_open_remote(&self, handle: HandleId) -> Result<ProcessId> {
        let endpoint = self.lookup_endpoint(handle)?;
        endpoint.connection().remote_pid(endpoint.role()).ok_or(Status::InvalidArg)
    }

    /// Waits for any (or with WAIT_ALL, every) event. SIGNALLED/ERROR are written back.
    /// The wait is always interruptible.
    pub fn object_wait(&self, events: &mut [ObjectEvent], flags: ObjectWaitFlags, wait: Wait) -> Result<()> {
        if events.is_empty() || events.len() > MAX_WAIT_EVENTS {
            return Err(Status::InvalidArg);
        }
        let required = if flags.contains(ObjectWaitFlags::WAIT_ALL) { events.len() } else { 1 };
        let set = WaitSet::new(events.len(), required);
        let mut registrations = Vec::with_capacity(events.len());
        let mut failure = None;
        for (index, event) in events.iter_mut().enumerate() {
            event.flags.remove(EventFlags::SIGNALLED | EventFlags::ERROR);
            let edge = event.flags.contains(EventFlags::EDGE);
            let armed = self.process.handles().lookup(event.handle, None).and_then(|object| {
                start_wait(&object, event.event, edge, WaitEntry::new(&set, index), self.process.id())
            });
            match armed {
                Ok(registration) => registrations.push(registration),
                Err(err) => {
                    event.flags.insert(EventFlags::ERROR);
                    failure = Some(err);
                    break;
                }
            }
        }

        let result = match failure {
            Some(err) => Err(err),
            None => set.wait(&self.sleeper(wait, IpcFlags::INTERRUPTIBLE)),
        };
        for registration in registrations {
            registration.cancel();
        }
        for (event, fired) in events.iter_mut().zip(set.signalled()) {
            if fired {
                event.flags.insert(EventFlags::SIGNALLED);
            }
        }
        result
    }

    /// Closes a handle.
    pub fn handle_close(&self, handle: HandleId) -> Result<()> {
        let object = self.process.handles().detach(handle)?;
        drop(object);
        Ok(())
    }

    /// Duplicates a handle to `dest` or the smallest free ID.
    pub fn handle_duplicate(&self, handle: HandleId, dest: Option<HandleId>) -> Result<HandleId> {
        self.process.handles().duplicate(handle, dest)
    }

    /// Entry flags of a handle.
    pub fn handle_flags(&self, handle: HandleId) -> Result<HandleFlags> {
        self.process.handles().flags(handle)
    }

    /// Replaces the entry flags of a handle.
    pub fn handle_set_flags(&self, handle: HandleId, flags: HandleFlags) -> Result<()> {
        self.process.handles().set_flags(handle, flags)
    }
}
