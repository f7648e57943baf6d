// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Service-manager scenarios spanning several daemons and launched processes
//! INTENT: Session scoping, on-demand start and recovery after a service exits
//! DEPS: samgrd (daemon), samgr (client helpers), nexus-ipc
//! READINESS: Host threads; launched services exit after serving
//! TESTS: session forwarding, on-demand launch, relaunch after exit

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use neuron_ipc::{IpcConfig, Status};
use nexus_e2e::{kernel, ping, pong_service, ProcessLauncher, RunningDaemon, ServiceMain};
use nexus_ipc::IpcError;
use samgr::Launcher;
use samgrd::ServiceCatalog;
use tempfile::TempDir;

#[test]
fn session_manager_forwards_to_system() {
    let kernel = kernel(IpcConfig::default());
    let system = RunningDaemon::start(&kernel, ServiceCatalog::default(), None, HashMap::new()).unwrap();
    let session_catalog = ServiceCatalog::from_toml_str("scope = \"session\"\n").unwrap();
    let session =
        RunningDaemon::start(&kernel, session_catalog, Some(Arc::clone(system.port())), HashMap::new()).unwrap();

    let service_thread = system.process(50, 50).spawn_thread();
    let service = std::thread::spawn(move || {
        pong_service("svc.clock", 1)(&service_thread);
        service_thread
    });
    assert!(system.wait_registered("svc.clock"));

    let client = session.process(1000, 100).spawn_thread();
    assert_eq!(ping(&client, "svc.clock").unwrap(), b"PONG ");
    assert_eq!(ping(&client, "svc.nowhere"), Err(samgr::Error::NotFound));
    assert!(session.registry().service("svc.clock").is_none());

    let _service = service.join().unwrap();
    session.shutdown().unwrap();
    system.shutdown().unwrap();
}

#[test]
fn on_demand_service_is_launched_and_relaunched() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("samgrd.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "open_registration = false\n\n[[service]]\nname = \"svc.echo\"\non_demand = true").unwrap();
    let catalog = ServiceCatalog::load(&path).unwrap();

    let kernel = kernel(IpcConfig::default());
    let mut mains: HashMap<String, ServiceMain> = HashMap::new();
    mains.insert("svc.echo".into(), pong_service("svc.echo", 1));
    let daemon = RunningDaemon::start(&kernel, catalog, None, mains).unwrap();
    let client = daemon.process(1000, 100).spawn_thread();

    assert_eq!(ping(&client, "svc.echo").unwrap(), b"PONG ");
    let first = daemon.registry().service("svc.echo").unwrap();
    assert!(first.pid.is_some());

    // The first instance exits after one connection; its port is cleared on the next forward.
    assert!(nexus_e2e::wait_until(|| {
        match ping(&client, "svc.echo") {
            Ok(reply) => reply == b"PONG ",
            Err(samgr::Error::Ipc(IpcError::Kernel(Status::ConnHungup))) => false,
            Err(other) => panic!("unexpected {other:?}"),
        }
    }));
    let second = daemon.registry().service("svc.echo").unwrap();
    assert!(second.generation > first.generation);
    assert_ne!(second.pid, first.pid);

    assert_eq!(ping(&client, "svc.unlisted"), Err(samgr::Error::NotFound));
    daemon.shutdown().unwrap();
}

#[test]
fn launcher_without_entry_point_fails_cleanly() {
    let kernel = kernel(IpcConfig::default());
    let launcher = ProcessLauncher::new(&kernel, HashMap::new());
    assert_eq!(launcher.launch(&samgr::ServiceSpec::new("svc.ghost", true)), Err(Status::NotFound));
    assert_eq!(launcher.launches().load(Ordering::SeqCst), 0);

    let catalog = ServiceCatalog::from_toml_str("[[service]]\nname = \"svc.ghost\"\non_demand = true\n").unwrap();
    let daemon = RunningDaemon::start(&kernel, catalog, None, HashMap::new()).unwrap();
    let client = daemon.process(1000, 100).spawn_thread();
    assert_eq!(ping(&client, "svc.ghost"), Err(samgr::Error::NotFound));
    daemon.shutdown().unwrap();
}
