// Copyright 2025 Bastion OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-partition server API for receiving and answering requests
//! OWNERS: @spm-team
//! PUBLIC API: ServerApi, Msg, MsgKind
//! DEPENDS_ON: state pools, queue runtime, message copy layer
//! INVARIANTS: A message handle is destroyed before its reply completes the
//!   client; a channel is freed only after its handle is destroyed; a
//!   client that faults during delivery loses the connection, not the SPM

use std::sync::Arc;

use bastion_abi::{status, Handle, PartitionId, Signals, MAX_IOVEC};
use log::warn;

pub use crate::message::MsgKind;

use crate::channel::{ChannelState, PendingRequest, RequestKind};
use crate::error::{Fault, Result};
use crate::message::ActiveMessage;
use crate::state::{Payload, SpmState};
use crate::sync::Wait;

/// One delivered request, as handed to the service thread.
#[derive(Clone, Copy, Debug)]
pub struct Msg {
    /// Ephemeral handle naming this message in read/write/reply calls.
    pub handle: Handle,
    /// What the client asked for.
    pub kind: MsgKind,
    /// Requesting partition (NSPE sentinel for the non-secure side).
    pub client: PartitionId,
    /// Remaining lengths of the client's input vectors.
    pub in_size: [u32; MAX_IOVEC],
    /// Capacities of the client's output vectors.
    pub out_size: [u32; MAX_IOVEC],
    /// Reverse handle word previously stashed on the channel.
    pub reverse: u32,
}

/// The serving side of the SPM, scoped to one partition.
///
/// One instance per partition, normally owned by its dispatch thread; the
/// methods mirror the receive/read/write/reply surface a secure partition
/// runtime exposes to RoT service code.
pub struct ServerApi {
    spm: Arc<SpmState>,
    partition: usize,
}

impl ServerApi {
    pub(crate) fn new(spm: Arc<SpmState>, partition: usize) -> Self {
        Self { spm, partition }
    }

    /// Partition id this view serves.
    pub fn identity(&self) -> PartitionId {
        self.spm.directory.partition(self.partition).id
    }

    /// Blocks per `wait` until any signal is asserted for this partition.
    pub fn wait_any(&self, wait: Wait) -> Option<Signals> {
        self.spm.partitions[self.partition].signals.wait(Signals::ANY, wait)
    }

    /// Blocks per `wait` on an explicit signal subset.
    pub fn wait(&self, mask: Signals, wait: Wait) -> Option<Signals> {
        self.spm.partitions[self.partition].signals.wait(mask, wait)
    }

    /// Clears the doorbell bit after handling a notification.
    pub fn clear_doorbell(&self) {
        self.spm.partitions[self.partition].signals.clear(Signals::DOORBELL);
    }

    /// Rings the doorbell of another partition.
    ///
    /// Panics on an unknown id: peers are named in boot configuration.
    pub fn notify(&self, id: PartitionId) {
        let index = self
            .spm
            .directory
            .partition_index(id)
            .unwrap_or_else(|| panic!("no partition with id {id}"));
        self.spm.partitions[index].signals.raise(Signals::DOORBELL);
    }

    /// Acknowledges handled interrupt bits, clearing them.
    ///
    /// Bits outside the partition's routed interrupt lines are a fault.
    pub fn end_of_interrupt(&self, signals: Signals) -> Result<()> {
        let routed = self.spm.directory.partition(self.partition).irq_signals;
        if !routed.contains(signals) {
            return Err(Fault::AccessDenied);
        }
        self.spm.partitions[self.partition].signals.clear(signals);
        Ok(())
    }

    fn service_index(&self, signal: Signals) -> Result<usize> {
        self.spm
            .directory
            .partition(self.partition)
            .services
            .iter()
            .position(|svc| svc.signal == signal)
            .ok_or(Fault::NoMessage)
    }

    /// Dequeues the next request pending on `signal` and materializes it.
    ///
    /// For calls this is where the client's control block is snapshotted;
    /// a client whose buffers fail validation at this point loses the
    /// connection and the service never sees the message.
    pub fn get(&self, signal: Signals) -> Result<Msg> {
        let service = self.service_index(signal)?;
        let channel = self.spm.partitions[self.partition]
            .dequeue(&self.spm.channels, service, signal)
            .ok_or(Fault::NoMessage)?;

        let (kind, client) = self.spm.channels.with_body(channel, |body| {
            let kind = body.request.as_ref().map(|req| req.kind);
            (kind, body.client)
        });
        let kind = kind.ok_or(Fault::NoMessage)?;

        let message = match kind {
            RequestKind::Connect { .. } => {
                self.spm.channels.expect_state(channel, ChannelState::Connecting)?;
                ActiveMessage::control(MsgKind::Connect, channel, client)
            }
            RequestKind::Close => {
                self.spm.channels.expect_state(channel, ChannelState::Idle)?;
                ActiveMessage::control(MsgKind::Close, channel, client)
            }
            RequestKind::Call { control } => {
                self.spm.channels.transition(channel, ChannelState::Pending, ChannelState::Active)?;
                match ActiveMessage::snapshot_call(
                    self.spm.memory.as_ref(),
                    channel,
                    client,
                    control,
                ) {
                    Ok(message) => message,
                    Err(fault) => {
                        // The client handed over buffers it cannot access;
                        // drop the connection and swallow the message.
                        warn!("spm: dropping connection of {client}: {fault}");
                        let request = self.spm.channels.with_body(channel, |b| b.request.take());
                        self.spm.channels.set_dropped(channel);
                        self.spm.channels.transition(
                            channel,
                            ChannelState::Active,
                            ChannelState::Idle,
                        )?;
                        if let Some(request) = request {
                            request.completer.complete(status::DROP_CONNECTION);
                        }
                        return Err(Fault::NoMessage);
                    }
                }
            }
        };

        let in_size = message.in_sizes();
        let out_size = message.out_sizes();
        let slot = self.spm.messages.alloc(message);
        let me = self.identity();
        let handle = self.spm.handles.create(Payload::Message(slot).encode(), me, me);
        let reverse = self.spm.channels.with_body(channel, |body| body.reverse);
        Ok(Msg { handle, kind: message_kind(kind), client, in_size, out_size, reverse })
    }

    fn message_of(&self, handle: Handle) -> Result<u16> {
        let payload = self.spm.handles.get(handle, self.identity())?;
        match Payload::decode(payload)? {
            Payload::Message(slot) => Ok(slot),
            Payload::Channel(_) => Err(Fault::InvalidHandle),
        }
    }

    /// Copies up to `buf.len()` bytes out of input vector `index` of the
    /// message, consuming them.
    pub fn read(&self, msg: Handle, index: usize, buf: &mut [u8]) -> Result<usize> {
        let slot = self.message_of(msg)?;
        self.spm.messages.with(slot, |m| m.read(self.spm.memory.as_ref(), index, buf))
    }

    /// Discards up to `amount` bytes of input vector `index`.
    pub fn skip(&self, msg: Handle, index: usize, amount: usize) -> Result<usize> {
        let slot = self.message_of(msg)?;
        self.spm.messages.with(slot, |m| m.skip(index, amount))
    }

    /// Appends `data` to output vector `index` of the message.
    pub fn write(&self, msg: Handle, index: usize, data: &[u8]) -> Result<()> {
        let slot = self.message_of(msg)?;
        self.spm.messages.with(slot, |m| m.write(self.spm.memory.as_ref(), index, data))
    }

    /// Stashes a reverse handle word on the message's channel; it rides
    /// back to the service in every later [`Msg::reverse`].
    pub fn set_reverse_handle(&self, msg: Handle, reverse: u32) -> Result<()> {
        let slot = self.message_of(msg)?;
        let channel = self.spm.messages.with(slot, |m| Ok(m.channel))?;
        self.spm.channels.with_body(channel, |body| body.reverse = reverse);
        Ok(())
    }

    /// Completes the message with `status` and retires it.
    ///
    /// The message handle dies first, so a service thread racing on a stale
    /// handle faults instead of touching the next request. What the status
    /// means depends on the message kind: acceptance for connects, the
    /// service-defined result for calls, ignored for closes.
    pub fn reply(&self, msg: Handle, reply_status: i32) -> Result<()> {
        let me = self.identity();
        let slot = self.message_of(msg)?;
        self.spm.handles.destroy(msg, me)?;
        let message = self.spm.messages.take(slot)?;
        let channel = message.channel;

        let (request, chan_handle) = self
            .spm
            .channels
            .with_body(channel, |body| (body.request.take(), body.handle));
        let request: PendingRequest = request.ok_or(Fault::NoMessage)?;

        match message.kind {
            MsgKind::Connect => {
                if reply_status >= 0 {
                    self.spm.channels.transition(
                        channel,
                        ChannelState::Connecting,
                        ChannelState::Idle,
                    )?;
                    request.completer.complete(chan_handle.raw());
                } else {
                    self.spm.handles.destroy(chan_handle, me)?;
                    self.spm.channels.with_body(channel, |body| body.handle = Handle::NULL);
                    self.spm.channels.free(channel);
                    request.completer.complete(status::CONNECTION_REFUSED);
                }
            }
            MsgKind::Call => {
                if reply_status == status::DROP_CONNECTION {
                    self.spm.channels.set_dropped(channel);
                }
                self.spm.channels.transition(channel, ChannelState::Active, ChannelState::Idle)?;
                request.completer.complete(reply_status);
            }
            MsgKind::Close => {
                self.spm.handles.destroy(chan_handle, me)?;
                self.spm.channels.with_body(channel, |body| body.handle = Handle::NULL);
                self.spm.channels.free(channel);
                request.completer.complete(status::SUCCESS);
            }
        }
        Ok(())
    }
}

fn message_kind(kind: RequestKind) -> MsgKind {
    match kind {
        RequestKind::Connect { .. } => MsgKind::Connect,
        RequestKind::Call { .. } => MsgKind::Call,
        RequestKind::Close => MsgKind::Close,
    }
}
