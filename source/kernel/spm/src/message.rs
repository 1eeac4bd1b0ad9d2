// Copyright 2025 Bastion OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Active-message pool and the checked request copy layer
//! OWNERS: @spm-team
//! PUBLIC API: MsgKind, ActiveMessage, MessagePool
//! DEPENDS_ON: PartitionMemory checked copies, bastion-abi wire layouts
//! INVARIANTS: Descriptors are snapshotted into SPM-owned storage before
//!   any of them is validated or dereferenced; writes never exceed the
//!   remaining capacity of an output vector
//!
//! The snapshot ordering closes the classic time-of-check-to-time-of-use
//! window: a caller that rewrites a descriptor in its own memory after the
//! control block was copied only corrupts its own copy, never the one the
//! service reads and writes through.

use bastion_abi::wire::{CallControl, VecDesc, CONTROL_BYTES};
use bastion_abi::{PartitionId, MAX_IOVEC};

use crate::error::{Fault, Result};
use crate::memory::PartitionMemory;

/// Kind of a message as seen by the serving partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgKind {
    /// A client asked to connect.
    Connect,
    /// A client invoked the service.
    Call,
    /// A client asked to disconnect.
    Close,
}

/// Server-side view of one in-flight request.
///
/// Ephemeral: allocated when the dispatcher hands the request to the
/// service thread and destroyed on reply.
pub struct ActiveMessage {
    /// Channel slot this message belongs to.
    pub channel: u16,
    /// What the client asked for.
    pub kind: MsgKind,
    /// Requesting partition.
    pub client: PartitionId,
    in_vec: [VecDesc; MAX_IOVEC],
    in_count: usize,
    out_vec: [VecDesc; MAX_IOVEC],
    out_count: usize,
    written: [u32; MAX_IOVEC],
}

impl ActiveMessage {
    /// Builds a vector-less message for connect and disconnect requests.
    pub fn control(kind: MsgKind, channel: u16, client: PartitionId) -> Self {
        debug_assert!(kind != MsgKind::Call);
        Self {
            channel,
            kind,
            client,
            in_vec: Default::default(),
            in_count: 0,
            out_vec: Default::default(),
            out_count: 0,
            written: [0; MAX_IOVEC],
        }
    }

    /// Snapshots and validates a call's control block from client memory.
    ///
    /// Ordering is deliberate: the checked `read` both proves the control
    /// block accessible to the client and copies it into SPM-owned storage;
    /// only the copies are validated and used afterwards. Zero-length
    /// vectors are skipped by validation.
    pub fn snapshot_call(
        memory: &dyn PartitionMemory,
        channel: u16,
        client: PartitionId,
        control: u32,
    ) -> Result<Self> {
        let mut raw = [0u8; CONTROL_BYTES];
        memory.read(client, control, &mut raw)?;
        let ctrl = CallControl::from_le_bytes(&raw).map_err(|_| Fault::MemoryViolation)?;

        let live = |descs: &[VecDesc], count: u32| -> Result<()> {
            for desc in &descs[..count as usize] {
                if desc.len != 0 && !memory.is_buffer_accessible(desc.base, desc.len, client) {
                    return Err(Fault::MemoryViolation);
                }
            }
            Ok(())
        };
        live(&ctrl.in_vec, ctrl.in_count)?;
        live(&ctrl.out_vec, ctrl.out_count)?;

        Ok(Self {
            channel,
            kind: MsgKind::Call,
            client,
            in_vec: ctrl.in_vec,
            in_count: ctrl.in_count as usize,
            out_vec: ctrl.out_vec,
            out_count: ctrl.out_count as usize,
            written: [0; MAX_IOVEC],
        })
    }

    /// Remaining lengths of the input vectors.
    pub fn in_sizes(&self) -> [u32; MAX_IOVEC] {
        core::array::from_fn(|i| if i < self.in_count { self.in_vec[i].len } else { 0 })
    }

    /// Total capacities of the output vectors.
    pub fn out_sizes(&self) -> [u32; MAX_IOVEC] {
        core::array::from_fn(|i| if i < self.out_count { self.out_vec[i].len } else { 0 })
    }

    /// Copies up to `buf.len()` bytes out of input vector `index`,
    /// advancing and truncating the vector in place.
    pub fn read(
        &mut self,
        memory: &dyn PartitionMemory,
        index: usize,
        buf: &mut [u8],
    ) -> Result<usize> {
        if index >= self.in_count {
            return Err(Fault::BadVector);
        }
        let desc = &mut self.in_vec[index];
        let n = buf.len().min(desc.len as usize);
        if n > 0 {
            memory.read(self.client, desc.base, &mut buf[..n])?;
            desc.base += n as u32;
            desc.len -= n as u32;
        }
        Ok(n)
    }

    /// Advances input vector `index` by up to `amount` bytes without copying.
    pub fn skip(&mut self, index: usize, amount: usize) -> Result<usize> {
        if index >= self.in_count {
            return Err(Fault::BadVector);
        }
        let desc = &mut self.in_vec[index];
        let n = amount.min(desc.len as usize);
        desc.base += n as u32;
        desc.len -= n as u32;
        Ok(n)
    }

    /// Appends `data` to output vector `index`.
    ///
    /// Exceeding the remaining capacity is a protocol violation, not a
    /// short write.
    pub fn write(
        &mut self,
        memory: &dyn PartitionMemory,
        index: usize,
        data: &[u8],
    ) -> Result<()> {
        if index >= self.out_count {
            return Err(Fault::BadVector);
        }
        let desc = self.out_vec[index];
        let offset = self.written[index];
        let remaining = desc.len - offset;
        if data.len() as u32 > remaining {
            return Err(Fault::BufferOverrun);
        }
        memory.write(self.client, desc.base + offset, data)?;
        self.written[index] += data.len() as u32;
        Ok(())
    }
}

/// Fixed pool of active-message slots, sized alongside the handle pool.
pub struct MessagePool<const N: usize> {
    slots: Vec<spin::Mutex<Option<ActiveMessage>>>,
}

impl<const N: usize> Default for MessagePool<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> MessagePool<N> {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self { slots: (0..N).map(|_| spin::Mutex::new(None)).collect() }
    }

    /// Stores `msg`, returning its slot index.
    ///
    /// Panics on exhaustion: the pool is sized with the handle pool, so
    /// running out means the configuration was violated.
    pub fn alloc(&self, msg: ActiveMessage) -> u16 {
        for (index, slot) in self.slots.iter().enumerate() {
            let mut guard = slot.lock();
            if guard.is_none() {
                *guard = Some(msg);
                return index as u16;
            }
        }
        panic!("active message pool exhausted");
    }

    /// Removes and returns the message at `index`.
    pub fn take(&self, index: u16) -> Result<ActiveMessage> {
        self.slots[index as usize].lock().take().ok_or(Fault::NoMessage)
    }

    /// Runs `f` over the message at `index`.
    pub fn with<R>(
        &self,
        index: u16,
        f: impl FnOnce(&mut ActiveMessage) -> Result<R>,
    ) -> Result<R> {
        let mut guard = self.slots[index as usize].lock();
        let msg = guard.as_mut().ok_or(Fault::NoMessage)?;
        f(msg)
    }
}
