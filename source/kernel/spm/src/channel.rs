// Copyright 2025 Bastion OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-connection channel objects and their state machine
//! OWNERS: @spm-team
//! PUBLIC API: ChannelState, RequestKind, PendingRequest, ChannelPool
//! DEPENDS_ON: spin slot mutexes, sync::Complete
//! INVARIANTS: Transitions are compare-and-set on an atomic state word and
//!   a mismatch is a fault, never a retry; a channel returns to the free
//!   list exactly once and only after its handle has been destroyed
//!
//! Channels live in a fixed arena addressed by index. The same per-slot
//! index link serves the free list and the service FIFO; a channel is never
//! on both at once because ownership moves from client to queue to service
//! thread and back as the state advances.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use bastion_abi::{Handle, PartitionId, Sid};

use crate::directory::ServiceRef;
use crate::error::{Fault, Result};
use crate::sync::Complete;

/// Link sentinel meaning "not chained".
pub(crate) const NO_LINK: u32 = u32::MAX;

/// Lifecycle states of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    /// Slot is free or being torn down.
    Invalid = 0,
    /// Connect request issued, service has not replied yet.
    Connecting = 1,
    /// Connected, no call in flight.
    Idle = 2,
    /// Call queued, service has not dequeued it yet.
    Pending = 3,
    /// Service is processing a call.
    Active = 4,
}

impl ChannelState {
    fn from_u8(raw: u8) -> ChannelState {
        match raw {
            1 => Self::Connecting,
            2 => Self::Idle,
            3 => Self::Pending,
            4 => Self::Active,
            _ => Self::Invalid,
        }
    }
}

/// What a queued request asks the service to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    /// Establish the connection at the requested minor version.
    Connect {
        /// Requested minor version.
        version: u32,
    },
    /// Invoke the service; `control` addresses the client's control block.
    Call {
        /// Client-memory address of the serialized call control block.
        control: u32,
    },
    /// Tear the connection down.
    Close,
}

/// One queued request plus the sink its completion status goes to.
pub struct PendingRequest {
    /// Requested operation.
    pub kind: RequestKind,
    /// Completion sink (local condvar cell or mailbox reply path).
    pub completer: Arc<dyn Complete>,
}

/// Mutable per-channel fields, guarded by the slot mutex.
pub(crate) struct ChannelBody {
    /// Requesting partition (NSPE sentinel for the non-secure side).
    pub client: PartitionId,
    /// Target service SID, kept for diagnostics.
    pub sid: Sid,
    /// Directory location of the target service.
    pub service: Option<ServiceRef>,
    /// The channel's own handle (owner: client, friend: serving partition).
    pub handle: Handle,
    /// Reverse handle word stashed by the service.
    pub reverse: u32,
    /// Request currently travelling through the service queue.
    pub request: Option<PendingRequest>,
}

impl Default for ChannelBody {
    fn default() -> Self {
        Self {
            client: 0,
            sid: 0,
            service: None,
            handle: Handle::NULL,
            reverse: 0,
            request: None,
        }
    }
}

struct ChannelSlot {
    state: AtomicU8,
    link: AtomicU32,
    dropped: AtomicBool,
    body: spin::Mutex<ChannelBody>,
}

impl ChannelSlot {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(ChannelState::Invalid as u8),
            link: AtomicU32::new(NO_LINK),
            dropped: AtomicBool::new(false),
            body: spin::Mutex::new(ChannelBody::default()),
        }
    }
}

/// Fixed arena of channel slots with an index-linked free list.
pub struct ChannelPool<const N: usize> {
    slots: Vec<ChannelSlot>,
    free_head: spin::Mutex<u32>,
}

impl<const N: usize> Default for ChannelPool<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> ChannelPool<N> {
    /// Creates a pool with all slots on the free list.
    pub fn new() -> Self {
        assert!(N > 0 && N < NO_LINK as usize);
        let slots: Vec<ChannelSlot> = (0..N).map(|_| ChannelSlot::new()).collect();
        for (i, slot) in slots.iter().enumerate() {
            let next = if i + 1 < N { (i + 1) as u32 } else { NO_LINK };
            slot.link.store(next, Ordering::Relaxed);
        }
        Self { slots, free_head: spin::Mutex::new(0) }
    }

    /// Takes a slot off the free list and opens it in `Connecting` state.
    ///
    /// Returns `None` when the pool is exhausted; connect-time exhaustion
    /// is a refusal, not a fault.
    pub fn allocate(&self, client: PartitionId, sid: Sid, service: ServiceRef) -> Option<u16> {
        let index = {
            let mut head = self.free_head.lock();
            let index = *head;
            if index == NO_LINK {
                return None;
            }
            *head = self.slots[index as usize].link.load(Ordering::Relaxed);
            index
        };
        let slot = &self.slots[index as usize];
        slot.link.store(NO_LINK, Ordering::Relaxed);
        slot.dropped.store(false, Ordering::Relaxed);
        {
            let mut body = slot.body.lock();
            body.client = client;
            body.sid = sid;
            body.service = Some(service);
            body.handle = Handle::NULL;
            body.reverse = 0;
            body.request = None;
        }
        slot.state.store(ChannelState::Connecting as u8, Ordering::Release);
        Some(index as u16)
    }

    /// Returns a slot to the free list.
    ///
    /// The caller must already have destroyed the channel's handle; a
    /// handle outliving its slot would dangle into the next connection.
    pub fn free(&self, index: u16) {
        let slot = &self.slots[index as usize];
        debug_assert!(
            slot.body.lock().handle.is_null(),
            "channel freed while its handle is live"
        );
        slot.state.store(ChannelState::Invalid as u8, Ordering::Release);
        slot.dropped.store(false, Ordering::Relaxed);
        let mut head = self.free_head.lock();
        slot.link.store(*head, Ordering::Relaxed);
        *head = index as u32;
    }

    /// Current state of the slot.
    pub fn state(&self, index: u16) -> ChannelState {
        ChannelState::from_u8(self.slots[index as usize].state.load(Ordering::Acquire))
    }

    /// Compare-and-set state transition; a mismatch is a protocol violation
    /// or a structurally impossible race, and is never retried.
    pub fn transition(&self, index: u16, from: ChannelState, to: ChannelState) -> Result<()> {
        self.slots[index as usize]
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Fault::BadState)
    }

    /// Asserts the slot currently holds `expected` without changing it.
    pub fn expect_state(&self, index: u16, expected: ChannelState) -> Result<()> {
        if self.state(index) == expected {
            Ok(())
        } else {
            Err(Fault::BadState)
        }
    }

    /// Marks the connection dropped; later calls fail soft.
    pub fn set_dropped(&self, index: u16) {
        self.slots[index as usize].dropped.store(true, Ordering::Release);
    }

    /// Whether the service dropped this connection.
    pub fn is_dropped(&self, index: u16) -> bool {
        self.slots[index as usize].dropped.load(Ordering::Acquire)
    }

    /// Runs `f` over the slot body under the slot mutex.
    pub(crate) fn with_body<R>(&self, index: u16, f: impl FnOnce(&mut ChannelBody) -> R) -> R {
        f(&mut self.slots[index as usize].body.lock())
    }

    pub(crate) fn link_load(&self, index: u16) -> u32 {
        self.slots[index as usize].link.load(Ordering::Acquire)
    }

    pub(crate) fn link_store(&self, index: u16, value: u32) {
        self.slots[index as usize].link.store(value, Ordering::Release);
    }
}
