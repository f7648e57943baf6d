// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for registry generations
//! OWNERS: @runtime
//! NOTE: Tests only; no manager logic.
//!
//! TEST_SCOPE:
//!   - Every successful registration change raises the registry generation
//!   - A name resolves to the last port that registered successfully
//!
//! TEST_SCENARIOS:
//!   - register_clear_sequence_tracks_model(): random register/clear calls against a map model

use std::collections::HashMap;

use neuron_ipc::{HandleId, ProcessId};
use proptest::prelude::*;

use crate::registry::{Registry, Resolution};
use crate::Error;

#[derive(Clone, Debug)]
enum Op {
    Register { name: u8, live: bool },
    Clear { name: u8 },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u8..4, any::<bool>()).prop_map(|(name, live)| Op::Register { name, live }),
        1 => (0u8..4).prop_map(|name| Op::Clear { name }),
    ]
}

proptest! {
    #[test]
    fn register_clear_sequence_tracks_model(ops in prop::collection::vec(arb_op(), 1..40)) {
        let registry = Registry::new();
        let pid = ProcessId::new(3);
        let mut model: HashMap<u8, HandleId> = HashMap::new();
        let mut next_handle = 0u32;

        for op in ops {
            let before = registry.generation();
            match op {
                Op::Register { name, live } => {
                    let key = format!("svc.{name}");
                    let port = HandleId::new(next_handle);
                    next_handle += 1;
                    let result = registry.register(&key, port, pid, |_| live);
                    match model.get(&name) {
                        Some(_) if live => prop_assert_eq!(result, Err(Error::AlreadyExists)),
                        previous => {
                            let (_, replaced) = result.unwrap();
                            prop_assert_eq!(replaced, previous.copied());
                            prop_assert!(registry.generation() > before);
                            model.insert(name, port);
                        }
                    }
                }
                Op::Clear { name } => {
                    let cleared = registry.clear_port(&format!("svc.{name}"));
                    prop_assert_eq!(cleared, model.remove(&name));
                    if cleared.is_some() {
                        prop_assert!(registry.generation() > before);
                    }
                }
            }
            for (name, port) in &model {
                prop_assert_eq!(registry.resolve(&format!("svc.{name}")), Resolution::Ready(*port));
            }
        }
    }
}
