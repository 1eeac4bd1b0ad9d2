// Copyright 2025 Bastion OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Memory-map collaborator seam and a host implementation
//! OWNERS: @spm-team
//! PUBLIC API: PartitionMemory, FlatMemory
//! INVARIANTS: Every cross-partition copy goes through a checked read or
//!   write; the accessibility check is the sole isolation mechanism at the
//!   data-copy layer

use std::sync::Arc;

use bastion_abi::PartitionId;
use parking_lot::Mutex;

use crate::error::{Fault, Result};

/// Accessibility oracle and checked copier over partition memory maps.
///
/// Implemented by the platform's MPU/MMU glue on hardware; the SPM never
/// dereferences a client address except through this trait.
pub trait PartitionMemory: Send + Sync {
    /// Returns `true` when `[base, base+len)` is accessible to `caller`.
    fn is_buffer_accessible(&self, base: u32, len: u32, caller: PartitionId) -> bool;

    /// Copies out of caller memory after re-running the accessibility check.
    fn read(&self, caller: PartitionId, base: u32, out: &mut [u8]) -> Result<()>;

    /// Copies into caller memory after re-running the accessibility check.
    fn write(&self, caller: PartitionId, base: u32, data: &[u8]) -> Result<()>;
}

struct MappedRegion {
    base: u32,
    len: u32,
    owner: PartitionId,
}

/// Flat host-memory implementation backing tests and the loopback facade.
///
/// One address space carved into owner-tagged regions; accesses outside a
/// caller-owned region fault exactly like an MPU violation would.
pub struct FlatMemory {
    bytes: Mutex<Vec<u8>>,
    regions: Mutex<Vec<MappedRegion>>,
}

impl FlatMemory {
    /// Creates an address space of `size` zeroed bytes with no mappings.
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            bytes: Mutex::new(vec![0; size]),
            regions: Mutex::new(Vec::new()),
        })
    }

    /// Maps `[base, base+len)` as owned by `owner`.
    ///
    /// Panics on overlap with an existing region; region layout is boot
    /// configuration, not runtime input.
    pub fn map_region(&self, base: u32, len: u32, owner: PartitionId) {
        let end = base.checked_add(len).expect("region wraps the address space");
        assert!(end as usize <= self.bytes.lock().len(), "region outside backing store");
        let mut regions = self.regions.lock();
        for region in regions.iter() {
            let overlaps = base < region.base + region.len && region.base < end;
            assert!(!overlaps, "region overlaps an existing mapping");
        }
        regions.push(MappedRegion { base, len, owner });
    }

    /// Raw poke used by tests to play the role of partition-local code.
    pub fn poke(&self, base: u32, data: &[u8]) {
        let mut bytes = self.bytes.lock();
        bytes[base as usize..base as usize + data.len()].copy_from_slice(data);
    }

    /// Raw peek used by tests to play the role of partition-local code.
    pub fn peek(&self, base: u32, len: usize) -> Vec<u8> {
        let bytes = self.bytes.lock();
        bytes[base as usize..base as usize + len].to_vec()
    }
}

impl PartitionMemory for FlatMemory {
    fn is_buffer_accessible(&self, base: u32, len: u32, caller: PartitionId) -> bool {
        if len == 0 {
            return true;
        }
        let Some(end) = base.checked_add(len) else {
            return false;
        };
        self.regions
            .lock()
            .iter()
            .any(|r| r.owner == caller && base >= r.base && end <= r.base + r.len)
    }

    fn read(&self, caller: PartitionId, base: u32, out: &mut [u8]) -> Result<()> {
        if !self.is_buffer_accessible(base, out.len() as u32, caller) {
            return Err(Fault::MemoryViolation);
        }
        let bytes = self.bytes.lock();
        out.copy_from_slice(&bytes[base as usize..base as usize + out.len()]);
        Ok(())
    }

    fn write(&self, caller: PartitionId, base: u32, data: &[u8]) -> Result<()> {
        if !self.is_buffer_accessible(base, data.len() as u32, caller) {
            return Err(Fault::MemoryViolation);
        }
        let mut bytes = self.bytes.lock();
        bytes[base as usize..base as usize + data.len()].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_abi::NSPE_ID;

    #[test]
    fn accessibility_respects_ownership() {
        let mem = FlatMemory::new(0x1000);
        mem.map_region(0x100, 0x100, NSPE_ID);
        mem.map_region(0x200, 0x100, 3);

        assert!(mem.is_buffer_accessible(0x100, 0x100, NSPE_ID));
        assert!(!mem.is_buffer_accessible(0x100, 0x100, 3));
        assert!(!mem.is_buffer_accessible(0x1f0, 0x20, NSPE_ID));
        assert!(mem.is_buffer_accessible(0x250, 0, 7), "zero length always passes");
    }

    #[test]
    fn checked_copies_fault_outside_mapping() {
        let mem = FlatMemory::new(0x1000);
        mem.map_region(0x100, 0x10, NSPE_ID);

        mem.poke(0x100, b"abcd");
        let mut buf = [0u8; 4];
        mem.read(NSPE_ID, 0x100, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");

        assert_eq!(mem.read(3, 0x100, &mut buf), Err(Fault::MemoryViolation));
        assert_eq!(mem.write(NSPE_ID, 0x900, b"x"), Err(Fault::MemoryViolation));
    }

    #[test]
    #[should_panic]
    fn overlapping_regions_rejected() {
        let mem = FlatMemory::new(0x1000);
        mem.map_region(0x100, 0x100, 1);
        mem.map_region(0x180, 0x100, 2);
    }
}
