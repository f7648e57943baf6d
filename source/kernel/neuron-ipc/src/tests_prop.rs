// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for handle allocation and endpoint queues
//! OWNERS: @kernel-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - Handle IDs: smallest free slot, stable until detached
//!   - Queue bound: non-FORCE sends stop at queue_max, FORCE overshoots
//!   - Ordering and integrity: FIFO delivery, bit-identical args and data, rising serials
//!
//! TEST_SCENARIOS:
//!   - attach_detach_matches_model(): random attach/detach against a BTreeSet model
//!   - queue_respects_bound_and_order(): random send/receive/force mix against a VecDeque model
//!   - payload_survives_transit(): arbitrary args and data arrive unchanged

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use proptest::prelude::*;

use crate::connection::{ClientInfo, Connection, Limits, Role};
use crate::handle::{HandleId, HandleTable};
use crate::kmessage::KMessage;
use crate::object::{KernelObject, Resource};
use crate::process::ProcessId;
use crate::security::SecurityContext;
use crate::status::Status;
use crate::wait::{Interrupter, IpcFlags, Sleeper, Wait};

#[derive(Clone, Debug)]
enum TableOp {
    Attach,
    Detach(u32),
}

fn arb_table_op() -> impl Strategy<Value = TableOp> {
    prop_oneof![3 => Just(TableOp::Attach), 2 => (0u32..12).prop_map(TableOp::Detach)]
}

#[derive(Clone, Debug)]
enum QueueOp {
    Send { force: bool },
    Receive,
}

fn arb_queue_op() -> impl Strategy<Value = QueueOp> {
    prop_oneof![
        4 => Just(QueueOp::Send { force: false }),
        1 => Just(QueueOp::Send { force: true }),
        3 => Just(QueueOp::Receive),
    ]
}

fn active_connection(queue_max: usize) -> Arc<Connection> {
    let client = ClientInfo { pid: ProcessId::new(2), security: SecurityContext::default() };
    let limits = Limits { queue_max, tick: Duration::from_millis(1), epoch: Instant::now() };
    let conn = Connection::new(client, None, limits);
    conn.accept(ProcessId::new(1)).unwrap();
    conn
}

proptest! {
    #[test]
    fn attach_detach_matches_model(ops in prop::collection::vec(arb_table_op(), 1..64)) {
        let table = HandleTable::new(ProcessId::new(1), 8);
        let mut model: BTreeMap<u32, Arc<Resource>> = BTreeMap::new();
        for op in ops {
            match op {
                TableOp::Attach => {
                    let resource = Resource::new("r");
                    let expected = (0..8u32).find(|id| !model.contains_key(id));
                    match table.attach(KernelObject::Resource(Arc::clone(&resource))) {
                        Ok(id) => {
                            prop_assert_eq!(Some(id.raw()), expected);
                            model.insert(id.raw(), resource);
                        }
                        Err(err) => {
                            prop_assert_eq!(err, Status::NoHandles);
                            prop_assert!(expected.is_none());
                        }
                    }
                }
                TableOp::Detach(raw) => {
                    let result = table.detach(HandleId::new(raw));
                    match model.remove(&raw) {
                        Some(resource) => {
                            let object = result.unwrap();
                            prop_assert!(object.same_object(&KernelObject::Resource(resource)));
                        }
                        None => prop_assert_eq!(result.unwrap_err(), Status::InvalidHandle),
                    }
                }
            }
            prop_assert_eq!(table.len(), model.len());
        }
    }

    #[test]
    fn queue_respects_bound_and_order(queue_max in 1usize..6, ops in prop::collection::vec(arb_queue_op(), 1..80)) {
        let conn = active_connection(queue_max);
        let irq = Interrupter::default();
        let tick = Duration::from_millis(1);
        let mut model: VecDeque<u64> = VecDeque::new();
        let mut next = 0u64;
        let mut last_serial = 0u64;

        for op in ops {
            match op {
                QueueOp::Send { force } => {
                    let flags = if force { IpcFlags::FORCE } else { IpcFlags::empty() };
                    let sleeper = Sleeper::new(Wait::NonBlocking, flags, &irq, tick);
                    let mut message = KMessage::new_signal(1, 0);
                    message.args_mut()[0] = next;
                    let result = conn.send(Role::Client, message, flags, &sleeper);
                    if !force && model.len() >= queue_max {
                        prop_assert_eq!(result, Err(Status::WouldBlock));
                    } else {
                        let serial = result.unwrap();
                        prop_assert!(serial > last_serial);
                        last_serial = serial;
                        model.push_back(next);
                        next += 1;
                    }
                }
                QueueOp::Receive => {
                    let sleeper = Sleeper::new(Wait::NonBlocking, IpcFlags::empty(), &irq, tick);
                    let result = conn.receive(Role::Server, true, &sleeper);
                    match model.pop_front() {
                        Some(expected) => prop_assert_eq!(result.unwrap().message.args[0], expected),
                        None => prop_assert_eq!(result.unwrap_err(), Status::WouldBlock),
                    }
                }
            }
            prop_assert_eq!(conn.queued(Role::Server), model.len());
        }
    }

    #[test]
    fn payload_survives_transit(
        args in prop::array::uniform6(any::<u64>()),
        data in prop::collection::vec(any::<u8>(), 0..512),
        id in 0u32..0x0fff_ffff,
    ) {
        let conn = active_connection(4);
        let irq = Interrupter::default();
        let sleeper = Sleeper::new(Wait::NonBlocking, IpcFlags::empty(), &irq, Duration::from_millis(1));
        let mut message = KMessage::new_request(id, 0);
        *message.args_mut() = args;
        message.set_data(&data);
        conn.send(Role::Server, message, IpcFlags::empty(), &sleeper).unwrap();

        let received = conn.receive(Role::Client, true, &sleeper).unwrap();
        prop_assert_eq!(received.message.user_id(), id);
        prop_assert_eq!(received.message.args, args);
        prop_assert_eq!(received.message.size as usize, data.len());
        if data.is_empty() {
            prop_assert_eq!(conn.receive_data(Role::Client), Err(Status::NotFound));
        } else {
            prop_assert_eq!(conn.receive_data(Role::Client).unwrap(), data);
            prop_assert_eq!(conn.receive_data(Role::Client), Err(Status::NotFound));
        }
    }
}
