// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Explicit kernel, process and thread contexts the IPC core runs under
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel, Process, ProcessSpec, ProcessId, Thread
//! DEPENDS_ON: config::IpcConfig, handle::HandleTable, kmessage::MessageQuota, port::Port
//! INVARIANTS:
//!   - No global state: every process hangs off the Kernel that created it
//!   - Process exit detaches every handle; objects drop after the table lock is released

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::debug;
use parking_lot::RwLock;

use crate::config::{ConfigError, IpcConfig};
use crate::connection::Limits;
use crate::handle::{HandleTable, InheritPolicy};
use crate::kmessage::MessageQuota;
use crate::port::{Port, PortHandler};
use crate::security::SecurityContext;
use crate::status::Result;
use crate::wait::{Interrupter, IpcFlags, Sleeper, Wait};

/// Process identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(u32);

impl ProcessId {
    /// The kernel itself, owner of kernel-handler ports.
    pub const KERNEL: Self = Self(0);

    /// Wraps a raw ID.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw numeric ID.
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

/// Kernel context: configuration, process IDs and the monotonic clock origin.
pub struct Kernel {
    config: IpcConfig,
    epoch: Instant,
    next_pid: AtomicU32,
}

impl Kernel {
    /// Validates `config` and creates a kernel context.
    pub fn new(config: IpcConfig) -> core::result::Result<Arc<Self>, ConfigError> {
        config.validate()?;
        Ok(Arc::new(Self { config, epoch: Instant::now(), next_pid: AtomicU32::new(1) }))
    }

    /// Active configuration.
    pub fn config(&self) -> &IpcConfig {
        &self.config
    }

    /// Nanoseconds since the kernel context was created.
    pub fn now_ns(&self) -> u64 {
        self.limits().now_ns()
    }

    pub(crate) fn limits(&self) -> Limits {
        Limits { queue_max: self.config.queue_max, tick: self.config.wait_tick(), epoch: self.epoch }
    }

    /// Creates a process according to `spec`.
    pub fn create_process(self: &Arc<Self>, spec: ProcessSpec<'_>) -> Result<Arc<Process>> {
        let id = ProcessId(self.next_pid.fetch_add(1, Ordering::Relaxed));
        let root_port = spec.root_port.or_else(|| spec.parent.and_then(|(parent, _)| parent.root_port()));
        let process = Arc::new(Process {
            kernel: Arc::clone(self),
            id,
            handles: HandleTable::new(id, self.config.handle_table_size),
            security: RwLock::new(spec.security),
            root_port: RwLock::new(root_port),
            quota: MessageQuota::new(self.config.process_message_quota),
        });
        if let Some((parent, policy)) = spec.parent {
            if let Err(err) = parent.handles.inherit_into(&process.handles, policy) {
                process.exit();
                return Err(err);
            }
        }
        debug!("ipc: created {id}");
        Ok(process)
    }

    /// Creates a port whose connection attempts are resolved by `handler` in the
    /// connecting thread. The kernel owns it, so it is never disowned.
    pub fn create_kernel_port(&self, handler: Arc<dyn PortHandler>) -> Arc<Port> {
        Port::new(ProcessId::KERNEL, Some(handler))
    }
}

/// Parameters for [`Kernel::create_process`].
pub struct ProcessSpec<'a> {
    security: SecurityContext,
    parent: Option<(&'a Process, InheritPolicy<'a>)>,
    root_port: Option<Arc<Port>>,
}

impl<'a> ProcessSpec<'a> {
    /// Process running with `security`, no parent and no root port.
    pub fn new(security: SecurityContext) -> Self {
        Self { security, parent: None, root_port: None }
    }

    /// Copies handles from `parent` per `policy`; the root port is inherited unless set.
    pub fn inherit_from(mut self, parent: &'a Process, policy: InheritPolicy<'a>) -> Self {
        self.parent = Some((parent, policy));
        self
    }

    /// Root port resolved by [`crate::HandleId::ROOT_PORT`].
    pub fn root_port(mut self, port: Arc<Port>) -> Self {
        self.root_port = Some(port);
        self
    }
}

/// A process: handle table, security context, root port and message quota.
pub struct Process {
    kernel: Arc<Kernel>,
    id: ProcessId,
    handles: HandleTable,
    security: RwLock<SecurityContext>,
    root_port: RwLock<Option<Arc<Port>>>,
    quota: Arc<MessageQuota>,
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process").field("id", &self.id).field("handles", &self.handles.len()).finish()
    }
}

impl Process {
    /// Process ID.
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Handle table.
    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    /// Snapshot of the current security context.
    pub fn security(&self) -> SecurityContext {
        self.security.read().clone()
    }

    /// Replaces the security context. Messages already sent keep their snapshot.
    pub fn set_security(&self, security: SecurityContext) {
        *self.security.write() = security;
    }

    /// Port named by [`crate::HandleId::ROOT_PORT`].
    pub fn root_port(&self) -> Option<Arc<Port>> {
        self.root_port.read().clone()
    }

    /// Replaces the root port.
    pub fn set_root_port(&self, port: Option<Arc<Port>>) {
        *self.root_port.write() = port;
    }

    /// Message buffer budget charged for this process' sends.
    pub fn quota(&self) -> &MessageQuota {
        &self.quota
    }

    pub(crate) fn quota_handle(&self) -> &Arc<MessageQuota> {
        &self.quota
    }

    pub(crate) fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Creates a thread running in this process.
    pub fn spawn_thread(self: &Arc<Self>) -> Thread {
        Thread { process: Arc::clone(self), interrupter: Interrupter::default() }
    }

    /// Process-exit cleanup: closes every handle.
    pub fn exit(&self) {
        let objects = self.handles.drain();
        let root = self.root_port.write().take();
        debug!("ipc: {} exited, released {} handles", self.id, objects.len());
        drop(objects);
        drop(root);
    }
}

/// A thread. Syscall-surface operations are methods on this type.
pub struct Thread {
    pub(crate) process: Arc<Process>,
    interrupter: Interrupter,
}

impl Thread {
    /// Owning process.
    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    /// Delivers interrupts to this thread's INTERRUPTIBLE blocking calls.
    pub fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }

    pub(crate) fn sleeper(&self, wait: Wait, flags: IpcFlags) -> Sleeper<'_> {
        Sleeper::new(wait, flags, &self.interrupter, self.process.kernel.config.wait_tick())
    }
}
