// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Cross-crate end-to-end harness
//! INTENT: Run samgrd daemons, service processes and clients on one hosted kernel
//! DEPS: neuron-ipc (kernel core), nexus-ipc (core connections), samgr/samgrd (service manager)
//! READINESS: Host threads; every daemon is stopped and joined on drop
//! TESTS: seed scenarios, session forwarding, on-demand launch

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::debug;
use neuron_ipc::{
    HandleId, IpcConfig, IpcFlags, Kernel, Listened, Port, Process, ProcessId, ProcessSpec, SecurityContext, Status,
    Thread, Wait,
};
use nexus_ipc::{Connection, ConnectionFlags, CoreMessage};
use parking_lot::Mutex;
use samgr::{Launcher, Registry, ServiceSpec, StopHandle};
use samgrd::{Daemon, DaemonError, ReadyNotifier, ServiceCatalog};

/// Timeout used for every blocking call in the harness.
pub const LONG: Duration = Duration::from_secs(5);

/// Identity given to launched service processes.
pub const SERVICE_UID: u32 = 50;

/// Entry point of a launched service, run on its own thread.
pub type ServiceMain = Arc<dyn Fn(&Thread) + Send + Sync>;

/// A samgrd daemon running on its own thread.
pub struct RunningDaemon {
    kernel: Arc<Kernel>,
    port: Arc<Port>,
    registry: Arc<Registry>,
    stop: StopHandle,
    join: Option<JoinHandle<Result<(), DaemonError>>>,
}

impl RunningDaemon {
    /// Starts a daemon for `catalog`. `root` becomes the daemon process' root port (the upstream
    /// manager for session scope). `services` are started through a [`ProcessLauncher`].
    pub fn start(
        kernel: &Arc<Kernel>,
        catalog: ServiceCatalog,
        root: Option<Arc<Port>>,
        services: HashMap<String, ServiceMain>,
    ) -> Result<Self, DaemonError> {
        let process = kernel.create_process(ProcessSpec::new(SecurityContext::default()))?;
        process.set_root_port(root);
        let thread = process.spawn_thread();
        let launcher = ProcessLauncher::new(kernel, services);
        let (tx, rx) = mpsc::channel();
        let join = thread::spawn(move || {
            let setup = Daemon::new(&thread, &catalog).and_then(|daemon| {
                let port = daemon.port_object()?;
                launcher.root.get_or_init(|| Arc::clone(&port));
                Ok((daemon.with_launcher(Box::new(launcher)), port))
            });
            let daemon = match setup {
                Ok((daemon, port)) => {
                    let _ = tx.send(Ok((port, Arc::clone(daemon.registry()), daemon.stop_handle())));
                    daemon
                }
                Err(err) => {
                    let _ = tx.send(Err(err));
                    return Ok(());
                }
            };
            daemon.run(ReadyNotifier::new(|| debug!("e2e: daemon ready")))
        });
        let (port, registry, stop) = match rx.recv() {
            Ok(setup) => setup?,
            Err(_) => return Err(DaemonError::Kernel(Status::Cancelled)),
        };
        Ok(Self { kernel: Arc::clone(kernel), port, registry, stop, join: Some(join) })
    }

    /// Manager port, to install as a root port.
    pub fn port(&self) -> &Arc<Port> {
        &self.port
    }

    /// The daemon's registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Creates a process whose root port is this daemon.
    pub fn process(&self, uid: u32, gid: u32) -> Arc<Process> {
        process_under(&self.kernel, &self.port, uid, gid)
    }

    /// Polls until `name` has a registered port.
    pub fn wait_registered(&self, name: &str) -> bool {
        wait_until(|| self.registry.service(name).is_some_and(|info| info.port.is_some()))
    }

    /// Stops the loop and returns its result.
    pub fn shutdown(mut self) -> Result<(), DaemonError> {
        self.stop.stop();
        match self.join.take().map(JoinHandle::join) {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(DaemonError::Kernel(Status::Cancelled)),
            None => Ok(()),
        }
    }
}

impl Drop for RunningDaemon {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            self.stop.stop();
            let _ = join.join();
        }
    }
}

/// Starts catalog services as fresh processes rooted at the daemon that launched them.
pub struct ProcessLauncher {
    kernel: Arc<Kernel>,
    root: Arc<OnceLock<Arc<Port>>>,
    mains: HashMap<String, ServiceMain>,
    launches: Arc<AtomicUsize>,
}

impl ProcessLauncher {
    /// Launcher with one entry point per service name.
    pub fn new(kernel: &Arc<Kernel>, mains: HashMap<String, ServiceMain>) -> Self {
        Self {
            kernel: Arc::clone(kernel),
            root: Arc::new(OnceLock::new()),
            mains,
            launches: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared launch counter.
    pub fn launches(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.launches)
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, service: &ServiceSpec) -> Result<ProcessId, Status> {
        let main = self.mains.get(&service.name).cloned().ok_or(Status::NotFound)?;
        let root = self.root.get().ok_or(Status::NotFound)?;
        let process = process_under(&self.kernel, root, SERVICE_UID, SERVICE_UID);
        let pid = process.id();
        let thread = process.spawn_thread();
        thread::spawn(move || {
            main(&thread);
            thread.process().exit();
        });
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(pid)
    }
}

/// Kernel with the given tunables.
pub fn kernel(config: IpcConfig) -> Arc<Kernel> {
    Kernel::new(config).expect("valid ipc config")
}

/// Creates a process rooted at `root`.
pub fn process_under(kernel: &Arc<Kernel>, root: &Arc<Port>, uid: u32, gid: u32) -> Arc<Process> {
    kernel
        .create_process(ProcessSpec::new(SecurityContext::new(uid, gid)).root_port(Arc::clone(root)))
        .expect("process")
}

/// Publishes a fresh port as `name` through the manager behind the root port.
pub fn register(thread: &Thread, name: &str) -> samgr::Result<HandleId> {
    let control = samgr::open_control(thread, Wait::Timeout(LONG))?;
    let port = thread.port_create()?;
    samgr::register_port(&control, name, port, Wait::Timeout(LONG))?;
    Ok(port)
}

/// Listens for the next connection on `port` and accepts it.
pub fn accept(thread: &Thread, port: HandleId) -> neuron_ipc::Result<Listened> {
    let listened = thread.port_listen(port, IpcFlags::empty(), Wait::Timeout(LONG))?;
    thread.connection_accept(listened.handle)?;
    Ok(listened)
}

/// `"PING "` becomes `"PONG "`; anything else is echoed.
pub fn pong(data: &[u8]) -> Vec<u8> {
    if data == b"PING " {
        b"PONG ".to_vec()
    } else {
        data.to_vec()
    }
}

/// Service main that registers `name` and answers one request on each of `connections`
/// connections with [`pong`].
pub fn pong_service(name: &str, connections: usize) -> ServiceMain {
    let name = name.to_owned();
    Arc::new(move |thread: &Thread| {
        let Ok(port) = register(thread, &name) else { return };
        for _ in 0..connections {
            let Ok(listened) = accept(thread, port) else { return };
            let conn = Connection::from_handle(thread, listened.handle, ConnectionFlags::RECEIVE_REQUESTS);
            if let Ok(request) = conn.receive(Wait::Timeout(LONG)) {
                let _ = conn.reply(CoreMessage::new_reply(&request, pong(&request.data)));
            }
        }
    })
}

/// Opens `name` and performs one ping request.
pub fn ping(thread: &Thread, name: &str) -> samgr::Result<Vec<u8>> {
    let conn = samgr::connect(thread, name, ConnectionFlags::empty(), Wait::Timeout(LONG))?;
    let reply = conn.request(CoreMessage::new_request(1, b"PING ".to_vec()), Wait::Timeout(LONG))?;
    Ok(reply.data)
}

/// Polls `cond` every 2 ms for up to [`LONG`].
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + LONG;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}
