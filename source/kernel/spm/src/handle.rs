// Copyright 2025 Bastion OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Capability-style handle manager over a lock-free slot table
//! OWNERS: @spm-team
//! PUBLIC API: HandleTable, NO_PAYLOAD
//! DEPENDS_ON: bastion-abi handle encoding
//! INVARIANTS: A handle is valid iff its slot stores exactly its raw value;
//!   the empty sentinel is stored last on destroy; pool exhaustion panics
//!   because callers size the pool to their backing arenas
//!
//! Allocation is a compare-and-swap scan over the slot array: O(N) worst
//! case but free of double-allocation races and of locks, and the
//! index-in-upper-bits encoding makes handle-to-slot lookup O(1). The
//! generation counter is 16 bits, wrapping and skipping zero; the slot
//! index takes part in every validity comparison, so generation reuse in a
//! different slot can never alias a live handle through this API.

use core::sync::atomic::{AtomicI32, AtomicU16, AtomicU32, Ordering};

use bastion_abi::{Handle, PartitionId, MAX_HANDLE_INDEX};

use crate::error::{Fault, Result};

/// Payload sentinel meaning "slot holds no object index".
pub const NO_PAYLOAD: u32 = u32::MAX;

const EMPTY: i32 = 0;
const NO_ACL: i32 = i32::MIN;

struct Slot {
    raw: AtomicI32,
    owner: AtomicI32,
    friend: AtomicI32,
    payload: AtomicU32,
}

impl Slot {
    const fn new() -> Self {
        Self {
            raw: AtomicI32::new(EMPTY),
            owner: AtomicI32::new(NO_ACL),
            friend: AtomicI32::new(NO_ACL),
            payload: AtomicU32::new(NO_PAYLOAD),
        }
    }
}

/// Fixed-size table mapping opaque handles to owner-checked payload words.
///
/// The payload is a non-owning reference: an index into a caller-managed
/// arena. The table never allocates or frees the referenced object.
pub struct HandleTable<const N: usize> {
    slots: [Slot; N],
    next_gen: AtomicU16,
}

impl<const N: usize> Default for HandleTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> HandleTable<N> {
    /// Creates an empty table.
    pub fn new() -> Self {
        assert!(N > 0 && N <= MAX_HANDLE_INDEX as usize + 1);
        Self {
            slots: core::array::from_fn(|_| Slot::new()),
            next_gen: AtomicU16::new(1),
        }
    }

    /// Next non-zero generation value; wraps and skips the reserved zero.
    fn next_generation(&self) -> u16 {
        loop {
            let gen = self.next_gen.fetch_add(1, Ordering::Relaxed);
            if gen != 0 {
                return gen;
            }
        }
    }

    /// Claims a free slot and returns its handle.
    ///
    /// The winning compare-and-swap makes the slot non-empty before the
    /// owner, friend and payload stores; nothing can read those fields
    /// until the creator publishes the returned handle, so the late stores
    /// are race-free. Panics when no slot is free: the pool is sized to the
    /// backing arenas, so exhaustion is a configuration error, not load.
    pub fn create(&self, payload: u32, owner: PartitionId, friend: PartitionId) -> Handle {
        let gen = self.next_generation();
        for (index, slot) in self.slots.iter().enumerate() {
            let candidate = Handle::compose(index as u16, gen);
            if slot
                .raw
                .compare_exchange(EMPTY, candidate.raw(), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                slot.owner.store(owner, Ordering::Release);
                slot.friend.store(friend, Ordering::Release);
                slot.payload.store(payload, Ordering::Release);
                return candidate;
            }
        }
        panic!("handle pool exhausted: backing arenas outgrew the handle table");
    }

    fn slot_for(&self, handle: Handle) -> Result<&Slot> {
        if handle.is_null() || handle.raw() < 0 {
            return Err(Fault::InvalidHandle);
        }
        let index = handle.index() as usize;
        if index >= N {
            return Err(Fault::InvalidHandle);
        }
        let slot = &self.slots[index];
        if slot.raw.load(Ordering::Acquire) != handle.raw() {
            return Err(Fault::InvalidHandle);
        }
        Ok(slot)
    }

    fn check_acl(slot: &Slot, caller: PartitionId) -> Result<()> {
        let owner = slot.owner.load(Ordering::Acquire);
        let friend = slot.friend.load(Ordering::Acquire);
        if caller == owner || caller == friend {
            Ok(())
        } else {
            Err(Fault::AccessDenied)
        }
    }

    /// ACL-checked dereference to the payload word.
    ///
    /// Panics if a live slot carries no payload: a live handle always has a
    /// non-null backing reference.
    pub fn get(&self, handle: Handle, caller: PartitionId) -> Result<u32> {
        let slot = self.slot_for(handle)?;
        Self::check_acl(slot, caller)?;
        let payload = slot.payload.load(Ordering::Acquire);
        // Destroy never touches the payload, so a slot that still matches
        // the handle loaded a real payload; if the slot was meanwhile
        // reclaimed for a new object, the re-check catches it.
        if slot.raw.load(Ordering::Acquire) != handle.raw() {
            return Err(Fault::InvalidHandle);
        }
        if payload == NO_PAYLOAD {
            panic!("live handle without a backing object");
        }
        Ok(payload)
    }

    /// ACL-checked release of the slot.
    ///
    /// Owner and friend are cleared first and the empty sentinel is stored
    /// last, so a concurrent `get` observes either the old valid handle or
    /// the cleared slot, never a half-updated one. The payload word is
    /// deliberately left in place: owner and friend may race `get` against
    /// `destroy`, and a getter that still matches the raw word must load a
    /// real payload. The next `create` overwrites it after winning its
    /// claim.
    pub fn destroy(&self, handle: Handle, caller: PartitionId) -> Result<()> {
        let slot = self.slot_for(handle)?;
        Self::check_acl(slot, caller)?;
        slot.owner.store(NO_ACL, Ordering::Release);
        slot.friend.store(NO_ACL, Ordering::Release);
        slot.raw.store(EMPTY, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests_prop;
