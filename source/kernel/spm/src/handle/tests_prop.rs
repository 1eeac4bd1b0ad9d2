// Copyright 2025 Bastion OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the handle slot table
//! OWNERS: @spm-team
//! NOTE: Tests only; no kernel logic. Ensures slot claiming, ACL checks and
//!   stale-handle rejection hold under arbitrary create/destroy interleaving.
//!
//! TEST_SCOPE:
//!   - Live handles stay pairwise distinct and resolvable
//!   - Destroyed handles are never resolvable again
//!   - Encoded index always addresses a real slot; generation is non-zero

use super::HandleTable;
use crate::error::Fault;
use proptest::prelude::*;

#[derive(Clone, Copy, Debug)]
enum Op {
    Create { payload: u32, owner: i32, friend: i32 },
    DestroyLive { pick: usize },
    GetDead { pick: usize },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u32..1000, 0i32..4, 0i32..4)
            .prop_map(|(payload, owner, friend)| Op::Create { payload, owner, friend }),
        (0usize..64).prop_map(|pick| Op::DestroyLive { pick }),
        (0usize..64).prop_map(|pick| Op::GetDead { pick }),
    ]
}

proptest! {
    #[test]
    fn table_invariants_hold(ops in proptest::collection::vec(arb_op(), 1..48)) {
        const POOL: usize = 16;
        let table: HandleTable<POOL> = HandleTable::new();
        let mut live: Vec<(bastion_abi::Handle, u32, i32)> = Vec::new();
        let mut dead: Vec<(bastion_abi::Handle, i32)> = Vec::new();

        for op in ops {
            match op {
                Op::Create { payload, owner, friend } => {
                    if live.len() == POOL {
                        continue; // full pool would be a designed panic
                    }
                    let h = table.create(payload, owner, friend);
                    prop_assert!((h.index() as usize) < POOL);
                    prop_assert_ne!(h.generation(), 0);
                    prop_assert!(live.iter().all(|(other, _, _)| other.raw() != h.raw()));
                    live.push((h, payload, owner));
                }
                Op::DestroyLive { pick } => {
                    if live.is_empty() {
                        continue;
                    }
                    let (h, _, owner) = live.remove(pick % live.len());
                    prop_assert_eq!(table.destroy(h, owner), Ok(()));
                    dead.push((h, owner));
                }
                Op::GetDead { pick } => {
                    if dead.is_empty() {
                        continue;
                    }
                    let (h, owner) = dead[pick % dead.len()];
                    prop_assert_eq!(table.get(h, owner), Err(Fault::InvalidHandle));
                }
            }
        }

        for (h, payload, owner) in &live {
            prop_assert_eq!(table.get(*h, *owner), Ok(*payload));
        }
    }
}
