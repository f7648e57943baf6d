// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Connection object owning both endpoints and the Setup/Active/Closed state machine
//! OWNERS: @kernel-team
//! PUBLIC API: Connection, ConnectionState, Role, ClientInfo, EndpointHandle
//! DEPENDS_ON: endpoint (queues, send/receive), port (waiting lists), event (notifiers)
//! INVARIANTS:
//!   - Transitions: Setup -> {Active, Closed}, Active -> Closed; Closed is terminal
//!   - One mutex guards both endpoints and the state; every condvar pairs with it
//!   - Lock order: port -> connection -> notifier; callbacks into EndpointOps run unlocked
//! TEST_COVERAGE: unit tests below, tests/connection.rs

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};

use crate::endpoint::{EndpointFlags, EndpointOps, EndpointState, KernelEndpoint};
use crate::event::{EventKind, Notifier, WaitEntry};
use crate::kmessage::KMessage;
use crate::port::Port;
use crate::process::ProcessId;
use crate::security::SecurityContext;
use crate::status::{Result, Status};
use crate::wait::Sleeper;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Endpoint index within a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Port owner's side.
    Server = 0,
    /// Connection opener's side.
    Client = 1,
}

impl Role {
    /// The opposite role.
    pub const fn other(self) -> Self {
        match self {
            Self::Server => Self::Client,
            Self::Client => Self::Server,
        }
    }

    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

/// Lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Waiting for the port owner to accept, reject or forward.
    Setup,
    /// Both endpoints may exchange messages.
    Active,
    /// Terminal.
    Closed,
}

/// Identity of the process that opened a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientInfo {
    /// Opening process.
    pub pid: ProcessId,
    /// Security snapshot taken when the connection was opened.
    pub security: SecurityContext,
}

/// Per-kernel parameters copied into every connection.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Limits {
    pub(crate) queue_max: usize,
    pub(crate) tick: Duration,
    pub(crate) epoch: Instant,
}

impl Limits {
    pub(crate) fn now_ns(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

pub(crate) struct ConnInner {
    pub(crate) state: ConnectionState,
    pub(crate) endpoints: [EndpointState; 2],
    reject: Option<Status>,
    port: Option<Weak<Port>>,
    server_pid: Option<ProcessId>,
    /// The connect payload's handle has been installed by some listener.
    pub(crate) payload_handle_taken: bool,
}

/// Pair of endpoints plus lifecycle state.
pub struct Connection {
    id: u64,
    pub(crate) limits: Limits,
    pub(crate) inner: Mutex<ConnInner>,
    pub(crate) space: [Condvar; 2],
    pub(crate) data: [Condvar; 2],
    open: Condvar,
    hangup: [Notifier; 2],
    message: [Notifier; 2],
    client: ClientInfo,
    payload: Option<Arc<KMessage>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("id", &self.id).field("client", &self.client.pid).finish()
    }
}

impl Connection {
    pub(crate) fn new(client: ClientInfo, payload: Option<KMessage>, limits: Limits) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            limits,
            inner: Mutex::new(ConnInner {
                state: ConnectionState::Setup,
                endpoints: [EndpointState::default(), EndpointState::default()],
                reject: None,
                port: None,
                server_pid: None,
                payload_handle_taken: false,
            }),
            space: [Condvar::new(), Condvar::new()],
            data: [Condvar::new(), Condvar::new()],
            open: Condvar::new(),
            hangup: [Notifier::default(), Notifier::default()],
            message: [Notifier::default(), Notifier::default()],
            client,
            payload: payload.map(Arc::new),
        })
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Opening process identity.
    pub fn client(&self) -> &ClientInfo {
        &self.client
    }

    /// Connect payload, if one was supplied.
    pub fn payload(&self) -> Option<&KMessage> {
        self.payload.as_deref()
    }

    pub(crate) fn is_payload(&self, message: &Arc<KMessage>) -> bool {
        self.payload.as_ref().is_some_and(|payload| Arc::ptr_eq(payload, message))
    }

    pub(crate) fn is_setup(&self) -> bool {
        self.state() == ConnectionState::Setup
    }

    pub(crate) fn notifier(&self, role: Role, kind: EventKind) -> &Notifier {
        match kind {
            EventKind::Hangup => &self.hangup[role.index()],
            _ => &self.message[role.index()],
        }
    }

    /// Records `port` as the holder of this Setup connection. Fails once the attempt is over.
    pub(crate) fn attach_port(&self, port: &Arc<Port>) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != ConnectionState::Setup {
            return false;
        }
        inner.port = Some(Arc::downgrade(port));
        true
    }

    /// Installs the connect payload as the server endpoint's pending attachment. A payload
    /// handle already installed by an earlier listener is not presented again.
    pub(crate) fn present_to_listener(&self, can_take_handle: bool) -> Option<crate::wire::Message> {
        let mut inner = self.inner.lock();
        inner.port = None;
        let can_take_handle = can_take_handle && !inner.payload_handle_taken;
        let server = &mut inner.endpoints[Role::Server.index()];
        server.flags.remove(EndpointFlags::DROP);
        let payload = self.payload.as_ref()?;
        let (header, pending) = EndpointState::deliver(Arc::clone(payload), can_take_handle);
        server.pending = pending;
        Some(header)
    }

    /// Parks the server side while the attempt travels to another port.
    pub(crate) fn prepare_forward(&self) -> Result<()> {
        let stale = {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::Setup {
                return Err(Status::ConnHungup);
            }
            let server = &mut inner.endpoints[Role::Server.index()];
            server.flags.insert(EndpointFlags::DROP);
            server.pending.take()
        };
        drop(stale);
        debug!("ipc: connection {} forwarded", self.id);
        Ok(())
    }

    /// Setup -> Active.
    pub(crate) fn accept(&self, server_pid: ProcessId) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = inner.state;
        match state {
            ConnectionState::Setup => {
                inner.state = ConnectionState::Active;
                inner.server_pid = Some(server_pid);
                self.open.notify_all();
                debug!("ipc: connection {} accepted", self.id);
                Ok(())
            }
            ConnectionState::Closed => Err(Status::ConnHungup),
            ConnectionState::Active => Err(Status::InvalidArg),
        }
    }

    /// Setup -> Active with a kernel-side server endpoint.
    pub(crate) fn activate_kernel(&self, ops: Arc<dyn EndpointOps>) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::Setup {
                return Err(Status::ConnHungup);
            }
            inner.endpoints[Role::Server.index()].ops = Some(ops);
            inner.server_pid = Some(ProcessId::KERNEL);
        }
        self.accept(ProcessId::KERNEL)
    }

    /// Setup -> Closed, waking the connecting thread with `status`.
    pub(crate) fn reject(&self, status: Status) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = inner.state;
        match state {
            ConnectionState::Setup => {
                inner.state = ConnectionState::Closed;
                inner.reject = Some(status);
                inner.port = None;
                self.open.notify_all();
                self.hangup[Role::Server.index()].signal();
                debug!("ipc: connection {} rejected: {status}", self.id);
                Ok(())
            }
            ConnectionState::Closed => Err(Status::ConnHungup),
            ConnectionState::Active => Err(Status::InvalidArg),
        }
    }

    /// Blocks the connecting thread until the attempt is resolved.
    pub(crate) fn wait_open(self: &Arc<Self>, sleeper: &Sleeper<'_>) -> Result<()> {
        let failure = {
            let mut inner = self.inner.lock();
            loop {
                match inner.state {
                    ConnectionState::Active => return Ok(()),
                    ConnectionState::Closed => return Err(inner.reject.unwrap_or(Status::ConnHungup)),
                    ConnectionState::Setup => {}
                }
                if let Err(err) = sleeper.sleep(&self.open, &mut inner) {
                    break err;
                }
            }
        };
        self.cancel(failure)
    }

    /// Withdraws a Setup attempt from whichever port holds it. An accept that won the race
    /// still counts as success.
    fn cancel(self: &Arc<Self>, status: Status) -> Result<()> {
        let holder = self.inner.lock().port.as_ref().and_then(Weak::upgrade);
        if let Some(port) = holder {
            port.withdraw(self);
        }
        match self.reject(status) {
            Ok(()) => Err(status),
            Err(Status::InvalidArg) => Ok(()),
            Err(_) => {
                let inner = self.inner.lock();
                match inner.state {
                    ConnectionState::Active => Ok(()),
                    _ => Err(inner.reject.unwrap_or(status)),
                }
            }
        }
    }

    /// Hangs up `role`'s side. Queued messages of that side are discarded outside the lock.
    pub(crate) fn close(self: &Arc<Self>, role: Role) {
        let remote = role.other();
        let (garbage, hangup_ops) = {
            let mut inner = self.inner.lock();
            let own = &mut inner.endpoints[role.index()];
            let mut garbage: Vec<Arc<KMessage>> = own.queue.drain(..).collect();
            garbage.extend(own.pending.take().map(|pending| pending.into_message()));
            let state = inner.state;
            let hangup_ops = match state {
                ConnectionState::Setup => {
                    inner.state = ConnectionState::Closed;
                    inner.reject = Some(Status::ConnHungup);
                    inner.port = None;
                    self.open.notify_all();
                    None
                }
                ConnectionState::Active => {
                    inner.state = ConnectionState::Closed;
                    self.hangup[remote.index()].signal();
                    inner.endpoints[remote.index()].ops.clone()
                }
                ConnectionState::Closed => None,
            };
            for cv in self.space.iter().chain(self.data.iter()) {
                cv.notify_all();
            }
            (garbage, hangup_ops)
        };
        trace!("ipc: connection {} closed by {role:?}, discarded {}", self.id, garbage.len());
        drop(garbage);
        if let Some(ops) = hangup_ops {
            ops.hangup(&KernelEndpoint::new(Arc::clone(self), remote));
        }
    }

    /// Process on the far side of `role`.
    pub(crate) fn remote_pid(&self, role: Role) -> Option<ProcessId> {
        match role {
            Role::Server => Some(self.client.pid),
            Role::Client => self.inner.lock().server_pid,
        }
    }

    pub(crate) fn start_wait(&self, role: Role, kind: EventKind, edge: bool, entry: &Arc<WaitEntry>) {
        let inner = self.inner.lock();
        let ready = match kind {
            EventKind::Hangup => inner.state == ConnectionState::Closed,
            _ => !inner.endpoints[role.index()].queue.is_empty(),
        };
        if ready && !edge {
            entry.signal();
        } else {
            self.notifier(role, kind).register(Arc::clone(entry));
        }
    }

    pub(crate) fn signal_message(&self, role: Role) {
        self.message[role.index()].signal();
    }
}

/// User-visible reference to one endpoint. Dropping the last reference closes that side.
pub struct EndpointHandle {
    conn: Arc<Connection>,
    role: Role,
    armed: AtomicBool,
}

impl EndpointHandle {
    pub(crate) fn new(conn: Arc<Connection>, role: Role) -> Arc<Self> {
        Arc::new(Self { conn, role, armed: AtomicBool::new(true) })
    }

    /// Side of the connection this handle refers to.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Underlying connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Detaches the handle from the connection's lifetime (forwarding, failed listen).
    pub(crate) fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }
}

impl Drop for EndpointHandle {
    fn drop(&mut self) {
        if self.armed.load(Ordering::Acquire) {
            self.conn.close(self.role);
        }
    }
}
