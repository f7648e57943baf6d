// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Readiness sources and the multi-object wait facility
//! OWNERS: @kernel-team
//! PUBLIC API: ObjectEvent, EventKind, EventFlags, ObjectWaitFlags, MAX_WAIT_EVENTS
//! DEPENDS_ON: connection (HANGUP/MESSAGE), port (CONNECTION)
//! INVARIANTS:
//!   - Signalling only takes the notifier lock and then the wait-set lock, never an object lock
//!   - Start-wait signals immediately when a level condition already holds (unless EDGE)
//!   - Stop-wait tolerates a concurrent signal
//!   - Each registration fires at most once

use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};

use crate::connection::{Connection, Role};
use crate::object::KernelObject;
use crate::port::Port;
use crate::process::ProcessId;
use crate::status::{Result, Status};
use crate::wait::Sleeper;
use crate::handle::HandleId;

/// Upper bound on events per wait call.
pub const MAX_WAIT_EVENTS: usize = 1024;

/// Event identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Connection: the remote end hung up.
    Hangup,
    /// Connection: at least one message is queued.
    Message,
    /// Port: at least one connection attempt is waiting.
    Connection,
}

bitflags! {
    /// Per-event flags. EDGE is an input; SIGNALLED and ERROR are written back.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct EventFlags: u32 {
        /// Only report transitions that happen after the wait starts.
        const EDGE = 1 << 0;
        /// The event fired.
        const SIGNALLED = 1 << 1;
        /// Setting up the wait on this event failed.
        const ERROR = 1 << 2;
    }
}

bitflags! {
    /// Flags for a whole wait call.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ObjectWaitFlags: u32 {
        /// Wait for every event instead of any.
        const WAIT_ALL = 1 << 0;
    }
}

/// One entry of an object wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectEvent {
    /// Handle to wait on.
    pub handle: HandleId,
    /// Event on that handle.
    pub event: EventKind,
    /// Input/output flags.
    pub flags: EventFlags,
    /// Caller data, returned untouched.
    pub udata: u64,
}

impl ObjectEvent {
    /// Level-triggered event with no caller data.
    pub const fn new(handle: HandleId, event: EventKind) -> Self {
        Self { handle, event, flags: EventFlags::empty(), udata: 0 }
    }

    /// Whether the last wait reported this event.
    pub fn is_signalled(&self) -> bool {
        self.flags.contains(EventFlags::SIGNALLED)
    }
}

struct WaitState {
    signalled: Vec<bool>,
    remaining: usize,
}

/// Shared state of one object-wait call.
pub(crate) struct WaitSet {
    state: Mutex<WaitState>,
    cv: Condvar,
}

impl WaitSet {
    pub(crate) fn new(count: usize, required: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(WaitState { signalled: vec![false; count], remaining: required }),
            cv: Condvar::new(),
        })
    }

    fn signal(&self, index: usize) {
        let mut state = self.state.lock();
        if state.signalled.get(index).copied().unwrap_or(true) {
            return;
        }
        state.signalled[index] = true;
        state.remaining = state.remaining.saturating_sub(1);
        if state.remaining == 0 {
            self.cv.notify_all();
        }
    }

    pub(crate) fn wait(&self, sleeper: &Sleeper<'_>) -> Result<()> {
        let mut state = self.state.lock();
        while state.remaining > 0 {
            sleeper.sleep(&self.cv, &mut state)?;
        }
        Ok(())
    }

    pub(crate) fn signalled(&self) -> Vec<bool> {
        self.state.lock().signalled.clone()
    }
}

/// A waiter registered with a [`Notifier`].
pub(crate) struct WaitEntry {
    set: Arc<WaitSet>,
    index: usize,
}

impl WaitEntry {
    pub(crate) fn new(set: &Arc<WaitSet>, index: usize) -> Arc<Self> {
        Arc::new(Self { set: Arc::clone(set), index })
    }

    pub(crate) fn signal(&self) {
        self.set.signal(self.index);
    }
}

/// Readiness source. Registered waiters fire once and are removed.
#[derive(Default)]
pub(crate) struct Notifier {
    waiters: Mutex<Vec<Arc<WaitEntry>>>,
}

impl Notifier {
    pub(crate) fn register(&self, entry: Arc<WaitEntry>) {
        self.waiters.lock().push(entry);
    }

    pub(crate) fn unregister(&self, entry: &Arc<WaitEntry>) {
        self.waiters.lock().retain(|w| !Arc::ptr_eq(w, entry));
    }

    pub(crate) fn signal(&self) {
        let fired: Vec<_> = self.waiters.lock().drain(..).collect();
        for entry in fired {
            entry.signal();
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.waiters.lock().len()
    }
}

enum Source {
    Endpoint { conn: Arc<Connection>, role: Role, kind: EventKind },
    Port(Arc<Port>),
}

/// An armed wait that must be cancelled when the wait call returns.
pub(crate) struct Registration {
    source: Source,
    entry: Arc<WaitEntry>,
}

impl Registration {
    pub(crate) fn cancel(self) {
        match &self.source {
            Source::Endpoint { conn, role, kind } => conn.notifier(*role, *kind).unregister(&self.entry),
            Source::Port(port) => port.connection_notifier().unregister(&self.entry),
        }
    }
}

/// Arms `entry` on `object` for `kind`.
pub(crate) fn start_wait(
    object: &KernelObject,
    kind: EventKind,
    edge: bool,
    entry: Arc<WaitEntry>,
    caller: ProcessId,
) -> Result<Registration> {
    match (object, kind) {
        (KernelObject::Connection(ep), EventKind::Hangup | EventKind::Message) => {
            let conn = Arc::clone(ep.connection());
            conn.start_wait(ep.role(), kind, edge, &entry);
            Ok(Registration { source: Source::Endpoint { conn, role: ep.role(), kind }, entry })
        }
        (KernelObject::Port(port), EventKind::Connection) => {
            port.start_wait(caller, edge, &entry)?;
            Ok(Registration { source: Source::Port(Arc::clone(port)), entry })
        }
        _ => Err(Status::InvalidEvent),
    }
}
