// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Seed scenarios run across the whole stack
//! INTENT: Kernel core, core connections and the service manager cooperating on one kernel
//! DEPS: neuron-ipc, nexus-ipc, samgr, samgrd
//! READINESS: Host threads; daemons stopped and joined by each test
//! TESTS: ping/pong, handle transfer, queue full, peer hangup, manager forward, interruptible listen

use std::collections::HashMap;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use neuron_ipc::{
    IpcConfig, IpcFlags, KernelObject, MessageClass, ObjectType, Resource, Status, Thread, Wait,
};
use nexus_e2e::{accept, kernel, register, RunningDaemon, LONG};
use nexus_ipc::{AttachedHandle, Connection, ConnectionFlags, CoreMessage, IpcError};
use samgrd::ServiceCatalog;

fn system(config: IpcConfig) -> RunningDaemon {
    RunningDaemon::start(&kernel(config), ServiceCatalog::default(), None, HashMap::new()).unwrap()
}

/// Registers `name` from a service process and runs `body` on each accepted connection.
fn spawn_service<F>(daemon: &RunningDaemon, name: &'static str, body: F) -> thread::JoinHandle<Thread>
where
    F: FnOnce(&Thread, Connection<'_>) + Send + 'static,
{
    let thread = daemon.process(50, 50).spawn_thread();
    thread::spawn(move || {
        let port = register(&thread, name).unwrap();
        let listened = accept(&thread, port).unwrap();
        let conn = Connection::from_handle(
            &thread,
            listened.handle,
            ConnectionFlags::RECEIVE_REQUESTS | ConnectionFlags::RECEIVE_SIGNALS,
        );
        body(&thread, conn);
        thread
    })
}

#[test]
fn ping_pong() {
    let daemon = system(IpcConfig::default());
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let service = spawn_service(&daemon, "svc.test", move |_, conn| {
        let ping = conn.receive(Wait::Timeout(LONG)).unwrap();
        assert_eq!((ping.class(), ping.id(), ping.data.as_slice()), (MessageClass::Signal, 1, &b"PING "[..]));
        conn.signal(CoreMessage::new_signal(2, b"PONG ".to_vec())).unwrap();
        assert_eq!(conn.receive(Wait::NonBlocking), Err(IpcError::Kernel(Status::WouldBlock)));
        done_rx.recv_timeout(LONG).unwrap();
    });

    let client = daemon.process(1000, 100).spawn_thread();
    let conn = samgr::connect(&client, "svc.test", ConnectionFlags::RECEIVE_SIGNALS, Wait::Timeout(LONG)).unwrap();
    conn.signal(CoreMessage::new_signal(1, b"PING ".to_vec())).unwrap();
    let pong = conn.receive(Wait::Timeout(LONG)).unwrap();
    assert_eq!((pong.id(), pong.data.as_slice()), (2, &b"PONG "[..]));
    assert_eq!(conn.stashed(), 0);
    assert_eq!(conn.receive(Wait::NonBlocking), Err(IpcError::Kernel(Status::WouldBlock)));

    done_tx.send(()).unwrap();
    let _service = service.join().unwrap();
    daemon.shutdown().unwrap();
}

#[test]
fn handle_transfer() {
    let daemon = system(IpcConfig::default());
    let service = spawn_service(&daemon, "svc.files", |thread, conn| {
        let request = conn.receive(Wait::Timeout(LONG)).unwrap();
        let resource = thread.process().handles().attach(KernelObject::Resource(Resource::new("log.txt"))).unwrap();
        conn.reply(CoreMessage::new_reply(&request, Vec::new()).with_handle(resource, true)).unwrap();
        assert_eq!(thread.handle_flags(resource), Err(Status::InvalidHandle));
    });

    let client = daemon.process(1000, 100).spawn_thread();
    let conn = samgr::connect(&client, "svc.files", ConnectionFlags::empty(), Wait::Timeout(LONG)).unwrap();
    let reply = conn.request(CoreMessage::new_request(3, b"open".to_vec()), Wait::Timeout(LONG)).unwrap();
    let Some(AttachedHandle { handle, own: true }) = reply.handle else { panic!("no handle in {reply:?}") };
    match client.process().handles().lookup(handle, Some(ObjectType::Resource)).unwrap() {
        KernelObject::Resource(resource) => assert_eq!(resource.name(), "log.txt"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(client.connection_receive_handle(conn.handle().unwrap()), Err(Status::NotFound));

    let _service = service.join().unwrap();
    daemon.shutdown().unwrap();
}

#[test]
fn queue_full_would_block() {
    let daemon = system(IpcConfig { queue_max: 4, ..IpcConfig::default() });
    let (sent_tx, sent_rx) = mpsc::channel::<()>();
    let service = spawn_service(&daemon, "svc.sink", move |_, conn| {
        sent_rx.recv_timeout(LONG).unwrap();
        for expected in 0u8..4 {
            let message = conn.receive(Wait::Timeout(LONG)).unwrap();
            assert_eq!(message.data, vec![expected]);
        }
        assert_eq!(conn.receive(Wait::NonBlocking), Err(IpcError::Kernel(Status::WouldBlock)));
    });

    let client = daemon.process(1000, 100).spawn_thread();
    let conn = samgr::connect(&client, "svc.sink", ConnectionFlags::empty(), Wait::Timeout(LONG))
        .unwrap()
        .with_send_timeout(Duration::ZERO);
    for n in 0u8..4 {
        conn.signal(CoreMessage::new_signal(10, vec![n])).unwrap();
    }
    assert_eq!(conn.signal(CoreMessage::new_signal(10, vec![4])), Err(IpcError::Kernel(Status::WouldBlock)));

    sent_tx.send(()).unwrap();
    let _service = service.join().unwrap();
    daemon.shutdown().unwrap();
}

#[test]
fn peer_hangup_during_blocking_receive() {
    let daemon = system(IpcConfig::default());
    let (ready_tx, ready_rx) = mpsc::channel::<()>();
    let service = spawn_service(&daemon, "svc.quiet", move |_, conn| {
        ready_tx.send(()).unwrap();
        assert_eq!(conn.receive(Wait::Blocking), Err(IpcError::Kernel(Status::ConnHungup)));
        assert_eq!(conn.signal(CoreMessage::new_signal(1, Vec::new())), Err(IpcError::Kernel(Status::ConnHungup)));
        assert_eq!(conn.status(), Err(IpcError::Kernel(Status::ConnHungup)));
    });

    let client = daemon.process(1000, 100).spawn_thread();
    let conn = samgr::connect(&client, "svc.quiet", ConnectionFlags::empty(), Wait::Timeout(LONG)).unwrap();
    ready_rx.recv_timeout(LONG).unwrap();
    thread::sleep(Duration::from_millis(20));
    conn.close().unwrap();

    let _service = service.join().unwrap();
    daemon.shutdown().unwrap();
}

#[test]
fn manager_forward_keeps_identity_and_payload() {
    let daemon = system(IpcConfig::default());
    let client_process = daemon.process(1000, 100);
    let client_pid = client_process.id();

    let service_thread = daemon.process(50, 50).spawn_thread();
    let service = thread::spawn(move || {
        let port = register(&service_thread, "svc.test").unwrap();
        let listened = service_thread.port_listen(port, IpcFlags::empty(), Wait::Timeout(LONG)).unwrap();
        let payload = listened.payload.unwrap();
        assert_eq!((payload.class(), payload.user_id()), (MessageClass::Request, samgr::CONNECT));
        assert_eq!(service_thread.connection_receive_data(listened.handle).unwrap(), b"svc.test");
        service_thread.connection_accept(listened.handle).unwrap();
        (service_thread, listened.client)
    });

    let client = client_process.spawn_thread();
    let handle = samgr::connect_to_service(&client, "svc.test", Wait::Timeout(LONG)).unwrap();
    let (service_thread, identity) = service.join().unwrap();
    assert_eq!(identity.pid, client_pid);
    assert_eq!((identity.security.uid, identity.security.gid), (1000, 100));
    assert_eq!(client.connection_open_remote(handle).unwrap(), service_thread.process().id());
    assert_eq!(client.connection_status(handle), Ok(()));

    daemon.shutdown().unwrap();
}

#[test]
fn interruptible_listen() {
    let daemon = system(IpcConfig::default());
    let service_thread = daemon.process(50, 50).spawn_thread();
    let port = register(&service_thread, "svc.idle").unwrap();
    let port_ref = match service_thread.process().handles().lookup(port, Some(ObjectType::Port)).unwrap() {
        KernelObject::Port(port) => port,
        other => panic!("unexpected {other:?}"),
    };
    let waiting = port_ref.waiting();
    let interrupter = service_thread.interrupter();

    let listener = thread::spawn(move || {
        let result = service_thread.port_listen(port, IpcFlags::INTERRUPTIBLE, Wait::Blocking).map(|l| l.handle);
        (service_thread, result)
    });
    thread::sleep(Duration::from_millis(30));
    interrupter.interrupt();
    let (_service_thread, result) = listener.join().unwrap();
    assert_eq!(result, Err(Status::Interrupted));
    assert_eq!(port_ref.waiting(), waiting);

    let stopped = Arc::clone(daemon.port());
    daemon.shutdown().unwrap();
    assert_eq!(stopped.owner(), None);
}
