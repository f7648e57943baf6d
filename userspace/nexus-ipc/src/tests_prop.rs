// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for payload encoding and the receive stash
//! OWNERS: @runtime
//! NOTE: Tests only; no library logic.
//!
//! TEST_SCOPE:
//!   - Payload placement: inline up to INLINE_CAPACITY, blob beyond
//!   - Stash: bounded FIFO with oldest-first eviction
//!
//! TEST_SCENARIOS:
//!   - payload_placement_is_decided_by_length(): arbitrary payloads keep their bytes
//!   - stash_matches_model(): random push/pop/take against a VecDeque model

use std::collections::VecDeque;

use proptest::prelude::*;

use crate::message::{CoreMessage, INLINE_CAPACITY};
use crate::queue::ReceiveQueue;

#[derive(Clone, Debug)]
enum StashOp {
    Push,
    Pop,
    TakeEven,
}

fn arb_stash_op() -> impl Strategy<Value = StashOp> {
    prop_oneof![4 => Just(StashOp::Push), 2 => Just(StashOp::Pop), 1 => Just(StashOp::TakeEven)]
}

proptest! {
    #[test]
    fn payload_placement_is_decided_by_length(data in prop::collection::vec(any::<u8>(), 0..128)) {
        let message = CoreMessage::new_request(5, data.clone());
        let (out, _) = message.encode();
        let header = *out.header();
        prop_assert_eq!(header.args[0], data.len() as u64);

        let blob = (data.len() > INLINE_CAPACITY).then(|| data.clone());
        let decoded = CoreMessage::decode(&header, blob).unwrap();
        prop_assert_eq!(decoded.data, data);
    }

    #[test]
    fn stash_matches_model(capacity in 0usize..5, ops in prop::collection::vec(arb_stash_op(), 1..60)) {
        let mut queue = ReceiveQueue::new(capacity);
        let mut model: VecDeque<u32> = VecDeque::new();
        let mut next = 0u32;
        let mut drops = 0u64;

        for op in ops {
            match op {
                StashOp::Push => {
                    let evicted = queue.push(CoreMessage::new_signal(next, Vec::new())).map(|m| m.id());
                    if capacity == 0 {
                        prop_assert_eq!(evicted, Some(next));
                        drops += 1;
                    } else {
                        let expected = if model.len() >= capacity { drops += 1; model.pop_front() } else { None };
                        prop_assert_eq!(evicted, expected);
                        model.push_back(next);
                    }
                    next += 1;
                }
                StashOp::Pop => prop_assert_eq!(queue.pop().map(|m| m.id()), model.pop_front()),
                StashOp::TakeEven => {
                    let expected = model.iter().position(|id| id % 2 == 0).and_then(|i| model.remove(i));
                    prop_assert_eq!(queue.take_where(|m| m.id() % 2 == 0).map(|m| m.id()), expected);
                }
            }
            prop_assert_eq!(queue.len(), model.len());
            prop_assert_eq!(queue.drops(), drops);
        }
    }
}
