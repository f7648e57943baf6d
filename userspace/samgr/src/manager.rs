// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Service-manager event loop: listen, route by name, forward, serve control clients
//! OWNERS: @runtime
//! PUBLIC API: Manager, Launcher, StopHandle, MAX_CONTROL_CLIENTS
//! DEPENDS_ON: registry, protocol, neuron-ipc (object_wait, listen, forward, reject), nexus-ipc
//! INVARIANTS:
//!   - Connections never get accepted by the manager unless they are control clients
//!   - A connection for a known service without a port is held, never dropped
//!   - A forward that fails with CONN_HUNGUP on an ownerless port clears the stale registration
//!   - Every listened handle is forwarded, held, accepted or closed; none stays bound after a failure
//! TEST_COVERAGE: tests/manager.rs, unit tests for abandoned attempts below

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use neuron_ipc::{
    EventFlags, EventKind, HandleId, Interrupter, IpcFlags, KernelObject, Listened, MessageClass, ObjectEvent,
    ObjectType, ObjectWaitFlags, ProcessId, Status, Thread, Wait, MAX_WAIT_EVENTS,
};
use nexus_ipc::{Connection, ConnectionFlags, CoreMessage, IpcError};

use crate::protocol::{encode_status, validate_name, CONNECT, REGISTER_PORT};
use crate::registry::{Registry, Resolution, ServiceSpec};
use crate::{Error, Result};

/// Control clients served at once; each one takes two wait slots.
pub const MAX_CONTROL_CLIENTS: usize = 256;

const PORT_TOKEN: u64 = u64::MAX;
const HELD_TAG: u64 = 1 << 32;

/// Starts service processes on behalf of the manager.
pub trait Launcher: Send + Sync {
    /// Starts `service`. The new process must reach this manager through its root port.
    fn launch(&self, service: &ServiceSpec) -> core::result::Result<ProcessId, Status>;
}

/// Stops a running [`Manager::run`] from another thread.
#[derive(Clone, Debug)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
    interrupter: Interrupter,
}

impl StopHandle {
    /// Requests the loop to exit and wakes it.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.interrupter.interrupt();
    }

    /// Whether stop was requested.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

struct ControlClient<'t> {
    conn: Connection<'t>,
    pid: ProcessId,
}

/// One service manager instance, driven by the thread it borrows.
pub struct Manager<'t> {
    thread: &'t Thread,
    port: HandleId,
    registry: Arc<Registry>,
    upstream: Option<HandleId>,
    launcher: Option<Box<dyn Launcher + 't>>,
    clients: BTreeMap<HandleId, ControlClient<'t>>,
    stopped: Arc<AtomicBool>,
}

impl<'t> Manager<'t> {
    /// Manager listening on `port`, a port owned by `thread`'s process.
    pub fn new(thread: &'t Thread, port: HandleId, registry: Arc<Registry>) -> Self {
        Self {
            thread,
            port,
            registry,
            upstream: None,
            launcher: None,
            clients: BTreeMap::new(),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Unknown names are forwarded to `port` (the system manager) instead of rejected.
    pub fn with_upstream(mut self, port: HandleId) -> Self {
        self.upstream = Some(port);
        self
    }

    /// Starts on-demand and boot-time services through `launcher`.
    pub fn with_launcher(mut self, launcher: Box<dyn Launcher + 't>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Shared registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Handle that ends [`Manager::run`].
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle { stopped: Arc::clone(&self.stopped), interrupter: self.thread.interrupter() }
    }

    /// Number of connected control clients.
    pub fn clients(&self) -> usize {
        self.clients.len()
    }

    /// Launches every service that is not on-demand.
    pub fn start(&self) {
        if self.launcher.is_none() {
            debug!("samgr: no launcher, boot-time services are expected to start on their own");
            return;
        }
        for spec in self.registry.specs().into_iter().filter(|spec| spec.ipc && !spec.on_demand) {
            if let Err(err) = self.launch(&spec) {
                error!("samgr: failed to start {}: {err}", spec.name);
            }
        }
    }

    /// Runs until stopped. Transient wait failures are absorbed.
    pub fn run(&mut self) -> Result<()> {
        info!(
            "samgr: manager started on port {:?} ({} services{})",
            self.port,
            self.registry.specs().len(),
            if self.upstream.is_some() { ", session scope" } else { "" }
        );
        self.start();
        while !self.stopped.load(Ordering::SeqCst) {
            match self.poll(Wait::Blocking) {
                Ok(()) => {}
                Err(Error::Ipc(IpcError::Kernel(status))) if status.is_transient() => {}
                Err(err) => {
                    error!("samgr: manager loop failed: {err}");
                    return Err(err);
                }
            }
        }
        info!("samgr: manager on port {:?} stopped", self.port);
        Ok(())
    }

    /// Waits once for port, control-client and held-connection events and handles them.
    pub fn poll(&mut self, wait: Wait) -> Result<()> {
        let mut events = vec![ObjectEvent { udata: PORT_TOKEN, ..ObjectEvent::new(self.port, EventKind::Connection) }];
        for handle in self.clients.keys() {
            let token = u64::from(handle.raw());
            events.push(ObjectEvent { udata: token, ..ObjectEvent::new(*handle, EventKind::Message) });
            events.push(ObjectEvent { udata: token, ..ObjectEvent::new(*handle, EventKind::Hangup) });
        }
        for handle in self.registry.held().into_iter().take(MAX_WAIT_EVENTS - events.len()) {
            let token = HELD_TAG | u64::from(handle.raw());
            events.push(ObjectEvent { udata: token, ..ObjectEvent::new(handle, EventKind::Hangup) });
        }

        if let Err(status) = self.thread.object_wait(&mut events, ObjectWaitFlags::empty(), wait) {
            return match events.iter().find(|event| event.flags.contains(EventFlags::ERROR)) {
                Some(event) if event.udata != PORT_TOKEN => {
                    self.forget(event.udata);
                    Ok(())
                }
                _ => Err(status.into()),
            };
        }

        for event in events.iter().filter(|event| event.is_signalled()) {
            match (event.udata, event.event) {
                (PORT_TOKEN, _) => self.accept_connection()?,
                (token, EventKind::Message) => self.serve_client(HandleId::new(token as u32)),
                (token, EventKind::Hangup) => self.forget(token),
                (_, EventKind::Connection) => {}
            }
        }
        Ok(())
    }

    fn forget(&mut self, token: u64) {
        let handle = HandleId::new(token as u32);
        if token & HELD_TAG != 0 {
            if self.registry.release_pending(handle) {
                debug!("samgr: held connection {:?} abandoned by its client", handle);
                let _ = self.thread.handle_close(handle);
            }
        } else if self.clients.remove(&handle).is_some() {
            debug!("samgr: control client {:?} hung up", handle);
        }
    }

    fn accept_connection(&mut self) -> Result<()> {
        let listened = match self.thread.port_listen(self.port, IpcFlags::empty(), Wait::NonBlocking) {
            Ok(listened) => listened,
            // The attempt was withdrawn between the event and the listen.
            Err(Status::WouldBlock) => return Ok(()),
            Err(status) => return Err(status.into()),
        };
        match listened.payload {
            Some(payload) if payload.class() == MessageClass::Request && payload.user_id() == CONNECT => {
                self.route(listened.handle);
            }
            _ => self.add_client(listened),
        }
        Ok(())
    }

    fn route(&self, handle: HandleId) {
        let data = match self.thread.connection_receive_data(handle) {
            Ok(data) => data,
            Err(_) => return self.reject(handle, Status::InvalidArg),
        };
        let name = match validate_name(&data) {
            Ok(name) => name,
            Err(err) => return self.reject(handle, err.status()),
        };

        match self.registry.resolve(name) {
            Resolution::Ready(port) => self.forward(name, handle, port),
            Resolution::NotReady { launch } => {
                if launch {
                    let launched = self
                        .registry
                        .service(name)
                        .ok_or(Error::NotFound)
                        .and_then(|info| self.launch(&info.spec));
                    if let Err(err) = launched {
                        warn!("samgr: cannot start {name}: {err}");
                        return self.reject(handle, err.status());
                    }
                }
                match self.registry.hold(name, handle) {
                    Ok(()) => debug!("samgr: holding connection for {name} until its port registers"),
                    Err(err) => self.reject(handle, err.status()),
                }
            }
            Resolution::Unknown => match self.upstream {
                Some(upstream) => match self.thread.connection_forward(handle, upstream) {
                    Ok(()) => debug!("samgr: forwarded {name} upstream"),
                    Err(Status::ConnHungup) => debug!("samgr: upstream forward for {name} ended early"),
                    Err(status) => {
                        warn!("samgr: upstream forward for {name} failed: {status}");
                        self.reject(handle, status);
                    }
                },
                None => {
                    debug!("samgr: no service named {name}");
                    self.reject(handle, Status::NotFound);
                }
            },
        }
    }

    fn forward(&self, name: &str, handle: HandleId, port: HandleId) {
        match self.thread.connection_forward(handle, port) {
            Ok(()) => debug!("samgr: forwarded connection for {name}"),
            Err(Status::ConnHungup) if !self.port_is_live(port) => {
                warn!("samgr: port of {name} has no owner, clearing registration");
                if let Some(stale) = self.registry.clear_port(name) {
                    let _ = self.thread.handle_close(stale);
                }
            }
            Err(Status::ConnHungup) => debug!("samgr: client for {name} gave up before forward"),
            Err(status) => {
                warn!("samgr: forward for {name} failed: {status}");
                self.reject(handle, status);
            }
        }
    }

    /// Rejects the attempt behind `handle`. The handle is gone afterwards whatever the outcome.
    fn reject(&self, handle: HandleId, status: Status) {
        match self.thread.connection_reject(handle, status) {
            Ok(()) => {}
            Err(Status::ConnHungup) => debug!("samgr: client of {:?} gave up before reject", handle),
            Err(Status::InvalidHandle) => warn!("samgr: reject of unbound {:?}", handle),
            Err(err) => {
                warn!("samgr: reject of {:?} failed: {err}", handle);
                let _ = self.thread.handle_close(handle);
            }
        }
    }

    fn launch(&self, spec: &ServiceSpec) -> Result<()> {
        let launcher = self.launcher.as_ref().ok_or(Error::Launch(Status::NotSupported))?;
        let pid = launcher.launch(spec).map_err(Error::Launch)?;
        info!("samgr: started {} as {pid}", spec.name);
        self.registry.mark_started(&spec.name, pid)
    }

    fn add_client(&mut self, listened: Listened) {
        let handle = listened.handle;
        if self.clients.len() >= MAX_CONTROL_CLIENTS {
            return self.reject(handle, Status::TryAgain);
        }
        if let Err(status) = self.thread.connection_accept(handle) {
            warn!("samgr: accepting control client failed: {status}");
            let _ = self.thread.handle_close(handle);
            return;
        }
        debug!("samgr: control client {:?} from {}", handle, listened.client.pid);
        let conn = Connection::from_handle(self.thread, handle, ConnectionFlags::RECEIVE_REQUESTS);
        self.clients.insert(handle, ControlClient { conn, pid: listened.client.pid });
    }

    fn serve_client(&mut self, handle: HandleId) {
        let Some(client) = self.clients.get(&handle) else {
            return;
        };
        let pid = client.pid;
        let request = match client.conn.receive(Wait::NonBlocking) {
            Ok(request) => request,
            Err(IpcError::Kernel(Status::WouldBlock)) => return,
            Err(err) => {
                warn!("samgr: receive from control client {:?} failed: {err}", handle);
                return;
            }
        };
        let result = match request.id() {
            REGISTER_PORT => self.register(pid, &request),
            other => {
                debug!("samgr: unsupported control request {other} from {pid}");
                Err(Status::NotSupported)
            }
        };
        if let Some(client) = self.clients.get(&handle) {
            if let Err(err) = client.conn.reply(CoreMessage::new_reply(&request, encode_status(result))) {
                warn!("samgr: reply to {pid} failed: {err}");
            }
        }
    }

    fn register(&self, pid: ProcessId, request: &CoreMessage) -> core::result::Result<(), Status> {
        let port = request.handle.ok_or(Status::InvalidArg)?.handle;
        let outcome = validate_name(&request.data).and_then(|name| {
            if !self.is_port(port) {
                return Err(Error::from(Status::IncorrectType));
            }
            let (_, replaced) = self.registry.register(name, port, pid, |old| self.port_is_live(old))?;
            Ok((name, replaced))
        });
        match outcome {
            Ok((name, replaced)) => {
                if let Some(old) = replaced {
                    let _ = self.thread.handle_close(old);
                }
                for held in self.registry.take_pending(name) {
                    self.forward(name, held, port);
                }
                Ok(())
            }
            Err(err) => {
                let _ = self.thread.handle_close(port);
                Err(err.status())
            }
        }
    }

    fn is_port(&self, handle: HandleId) -> bool {
        self.thread.process().handles().lookup(handle, Some(ObjectType::Port)).is_ok()
    }

    fn port_is_live(&self, handle: HandleId) -> bool {
        match self.thread.process().handles().lookup(handle, Some(ObjectType::Port)) {
            Ok(KernelObject::Port(port)) => port.owner().is_some(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use neuron_ipc::{IpcConfig, Kernel, Port, ProcessSpec, SecurityContext};

    use super::*;

    /// Lets a client give up on its connect while the manager already holds the attempt,
    /// then routes it.
    fn route_abandoned(kernel: &Arc<Kernel>, manager: &Manager<'_>, port: &Arc<Port>, name: &'static str) {
        let client = kernel
            .create_process(ProcessSpec::new(SecurityContext::new(1000, 100)).root_port(Arc::clone(port)))
            .expect("client process")
            .spawn_thread();
        let opener = std::thread::spawn(move || {
            crate::connect_to_service(&client, name, Wait::Timeout(Duration::from_millis(50)))
        });
        let listened = manager.thread.port_listen(manager.port, IpcFlags::empty(), Wait::Blocking).expect("listen");
        assert_eq!(
            opener.join().expect("opener thread"),
            Err(Error::Ipc(IpcError::Kernel(Status::TimedOut)))
        );
        manager.route(listened.handle);
    }

    #[test]
    fn abandoned_attempts_leave_no_handles_behind() {
        let kernel = Kernel::new(IpcConfig::default()).expect("kernel");
        let process = kernel.create_process(ProcessSpec::new(SecurityContext::default())).expect("manager process");
        let thread = process.spawn_thread();
        let port = thread.port_create().expect("manager port");
        let port_ref = match process.handles().lookup(port, Some(ObjectType::Port)).expect("port") {
            KernelObject::Port(port) => port,
            other => panic!("unexpected {other:?}"),
        };
        let registry = Arc::new(Registry::with_services([ServiceSpec::new("svc.echo", false)]).expect("catalog"));
        let service_port = thread.port_create().expect("service port");
        registry.register("svc.echo", service_port, process.id(), |_| false).expect("register");
        let manager = Manager::new(&thread, port, Arc::clone(&registry));
        let baseline = process.handles().len();

        // Known name: the forward finds the attempt closed while the service port is live.
        route_abandoned(&kernel, &manager, &port_ref, "svc.echo");
        assert_eq!(process.handles().len(), baseline);
        assert_eq!(registry.service("svc.echo").and_then(|info| info.port), Some(service_port));

        // Unknown name: the reject finds the attempt closed.
        route_abandoned(&kernel, &manager, &port_ref, "svc.nowhere");
        assert_eq!(process.handles().len(), baseline);
    }
}
