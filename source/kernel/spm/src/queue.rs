// Copyright 2025 Bastion OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-service FIFO queues and the partition signal word
//! OWNERS: @spm-team
//! PUBLIC API: PartitionRuntime
//! DEPENDS_ON: channel pool index links, sync::SignalState
//! INVARIANTS: Strict FIFO within one service queue; a service's signal bit
//!   is set iff its queue is non-empty; the queue mutex is never held
//!   across a blocking wait

use bastion_abi::Signals;
use parking_lot::Mutex;

use crate::channel::{ChannelPool, NO_LINK};
use crate::sync::SignalState;

#[derive(Clone, Copy)]
struct Fifo {
    head: u32,
    tail: u32,
}

impl Fifo {
    const EMPTY: Fifo = Fifo { head: NO_LINK, tail: NO_LINK };
}

/// Mutable runtime half of one partition: its service queues and signals.
pub struct PartitionRuntime {
    queues: Mutex<Vec<Fifo>>,
    /// Signal word the partition's thread blocks on.
    pub signals: SignalState,
}

impl PartitionRuntime {
    /// Creates the runtime for a partition exposing `services` queues.
    pub fn new(services: usize) -> Self {
        Self {
            queues: Mutex::new(vec![Fifo::EMPTY; services]),
            signals: SignalState::new(),
        }
    }

    /// Appends `channel` to the FIFO of `service` and raises its signal.
    ///
    /// Raising an already-set bit is harmless, which keeps enqueue
    /// idempotent with respect to signalling.
    pub fn enqueue<const N: usize>(
        &self,
        pool: &ChannelPool<N>,
        service: usize,
        signal: Signals,
        channel: u16,
    ) {
        {
            let mut queues = self.queues.lock();
            let fifo = &mut queues[service];
            pool.link_store(channel, NO_LINK);
            if fifo.tail == NO_LINK {
                fifo.head = channel as u32;
            } else {
                pool.link_store(fifo.tail as u16, channel as u32);
            }
            fifo.tail = channel as u32;
        }
        self.signals.raise(signal);
    }

    /// Pops the head of the FIFO of `service`, clearing the signal bit when
    /// the queue drains.
    pub fn dequeue<const N: usize>(
        &self,
        pool: &ChannelPool<N>,
        service: usize,
        signal: Signals,
    ) -> Option<u16> {
        let mut queues = self.queues.lock();
        let fifo = &mut queues[service];
        if fifo.head == NO_LINK {
            return None;
        }
        let channel = fifo.head as u16;
        fifo.head = pool.link_load(channel);
        if fifo.head == NO_LINK {
            fifo.tail = NO_LINK;
            self.signals.clear(signal);
        }
        pool.link_store(channel, NO_LINK);
        Some(channel)
    }
}
