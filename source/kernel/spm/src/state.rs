// Copyright 2025 Bastion OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Top-level SPM state and the client-side request entry points
//! OWNERS: @spm-team
//! PUBLIC API: SpmState, pool size constants
//! DEPENDS_ON: directory, handle, channel, queue, message modules
//! INVARIANTS: Every accepted request is enqueued with its completer and is
//!   completed exactly once; refusals complete immediately and never
//!   allocate; the handle payload tags channel and message objects apart

use std::sync::Arc;

use bastion_abi::{status, Handle, PartitionId, Sid, Signals};
use log::{info, warn};

use crate::channel::{ChannelPool, ChannelState, PendingRequest, RequestKind};
use crate::directory::{Directory, PartitionDesc, ServiceRef};
use crate::error::{Fault, Result};
use crate::handle::HandleTable;
use crate::memory::PartitionMemory;
use crate::message::MessagePool;
use crate::queue::PartitionRuntime;
use crate::server::ServerApi;
use crate::sync::Complete;

/// Handles live across channels and messages, so this bounds both.
pub const HANDLE_POOL: usize = 32;
/// Concurrent connections across all services.
pub const CHANNEL_POOL: usize = 16;
/// In-flight messages; every message holds a handle, so at most this many.
pub const MESSAGE_POOL: usize = 16;

const TAG_SHIFT: u32 = 24;
const CHANNEL_TAG: u32 = 1 << TAG_SHIFT;
const MESSAGE_TAG: u32 = 2 << TAG_SHIFT;
const INDEX_MASK: u32 = (1 << TAG_SHIFT) - 1;

/// Object a handle payload refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Payload {
    /// Index into the channel pool.
    Channel(u16),
    /// Index into the active-message pool.
    Message(u16),
}

impl Payload {
    pub(crate) fn encode(self) -> u32 {
        match self {
            Self::Channel(index) => CHANNEL_TAG | index as u32,
            Self::Message(index) => MESSAGE_TAG | index as u32,
        }
    }

    /// A payload with an unknown tag means the handle references a kind of
    /// object the caller's operation does not apply to.
    pub(crate) fn decode(word: u32) -> Result<Self> {
        let index = (word & INDEX_MASK) as u16;
        match word >> TAG_SHIFT {
            1 => Ok(Self::Channel(index)),
            2 => Ok(Self::Message(index)),
            _ => Err(Fault::InvalidHandle),
        }
    }
}

/// The whole SPM: static directory plus every runtime pool.
///
/// Shared by reference between the client entry points below, the per-
/// partition [`ServerApi`] views, and the mailbox bridge.
pub struct SpmState {
    pub(crate) directory: Directory,
    pub(crate) handles: HandleTable<HANDLE_POOL>,
    pub(crate) channels: ChannelPool<CHANNEL_POOL>,
    pub(crate) messages: MessagePool<MESSAGE_POOL>,
    pub(crate) partitions: Vec<PartitionRuntime>,
    pub(crate) memory: Arc<dyn PartitionMemory>,
}

impl SpmState {
    /// Boots the SPM from the static partition manifest.
    pub fn new(manifest: Vec<PartitionDesc>, memory: Arc<dyn PartitionMemory>) -> Arc<Self> {
        let directory = Directory::new(manifest);
        let partitions = (0..directory.partition_count())
            .map(|index| PartitionRuntime::new(directory.partition(index).services.len()))
            .collect();
        info!("spm: {} partitions online", directory.partition_count());
        Arc::new(Self {
            directory,
            handles: HandleTable::new(),
            channels: ChannelPool::new(),
            messages: MessagePool::new(),
            partitions,
            memory,
        })
    }

    /// Server-side view for the partition identified by `id`.
    ///
    /// Panics on an unknown id: server wiring is boot configuration.
    pub fn server_api(self: &Arc<Self>, id: PartitionId) -> ServerApi {
        let partition = self
            .directory
            .partition_index(id)
            .unwrap_or_else(|| panic!("no partition with id {id}"));
        ServerApi::new(self.clone(), partition)
    }

    /// Hardware interrupt entry: asserts `signals` on the partition routed
    /// for them.
    pub fn raise_irq(&self, id: PartitionId, signals: Signals) {
        let index = self
            .directory
            .partition_index(id)
            .unwrap_or_else(|| panic!("no partition with id {id}"));
        debug_assert!(
            self.directory.partition(index).irq_signals.contains(signals),
            "interrupt line not routed to partition {id}"
        );
        self.partitions[index].signals.raise(signals);
    }

    fn enqueue(&self, sref: ServiceRef, channel: u16) {
        let signal = self.directory.service(sref).signal;
        self.partitions[sref.partition].enqueue(&self.channels, sref.service, signal, channel);
    }

    /// Resolves `handle` to the channel it references, checking the ACL and
    /// that `client` is the connecting side.
    fn channel_of(&self, handle: Handle, client: PartitionId) -> Result<u16> {
        let payload = self.handles.get(handle, client)?;
        let Payload::Channel(channel) = Payload::decode(payload)? else {
            return Err(Fault::InvalidHandle);
        };
        // The serving partition is on the ACL as friend for reverse-handle
        // access, but only the connecting client may drive the channel.
        if self.channels.with_body(channel, |body| body.client) != client {
            return Err(Fault::AccessDenied);
        }
        Ok(channel)
    }

    /// Opens a connection to `sid` on behalf of `client`.
    ///
    /// Every failure the client could not have ruled out in advance (unknown
    /// SID, access gates, version policy, pool pressure) is a refusal
    /// completed with `CONNECTION_REFUSED`, never a fault. On acceptance the
    /// service replies through `completer` with the channel handle word.
    pub fn connect(
        &self,
        client: PartitionId,
        sid: Sid,
        version: u32,
        completer: Arc<dyn Complete>,
    ) -> Result<()> {
        let refuse = |why: &str| {
            warn!("spm: refusing connect from {client} to {sid:#x}: {why}");
            completer.complete(status::CONNECTION_REFUSED);
            Ok(())
        };
        let Some(sref) = self.directory.find_service(sid) else {
            return refuse("no such service");
        };
        if let Err(reason) = self.directory.validate_connection(client, sref, version) {
            return refuse(&format!("{reason:?}"));
        }
        let Some(channel) = self.channels.allocate(client, sid, sref) else {
            return refuse("channel pool exhausted");
        };
        let serving = self.directory.partition(sref.partition).id;
        let handle = self.handles.create(Payload::Channel(channel).encode(), client, serving);
        self.channels.with_body(channel, |body| {
            body.handle = handle;
            body.request = Some(PendingRequest {
                kind: RequestKind::Connect { version },
                completer: completer.clone(),
            });
        });
        self.enqueue(sref, channel);
        Ok(())
    }

    /// Queues a call on an established connection.
    ///
    /// `control` addresses the serialized control block in the client's own
    /// memory; it is snapshotted by the serving side on dequeue. A dropped
    /// connection fails soft with `DROP_CONNECTION`.
    pub fn call(
        &self,
        client: PartitionId,
        handle: Handle,
        control: u32,
        completer: Arc<dyn Complete>,
    ) -> Result<()> {
        let channel = self.channel_of(handle, client)?;
        if self.channels.is_dropped(channel) {
            completer.complete(status::DROP_CONNECTION);
            return Ok(());
        }
        self.channels.transition(channel, ChannelState::Idle, ChannelState::Pending)?;
        let sref = self.channels.with_body(channel, |body| {
            body.request = Some(PendingRequest {
                kind: RequestKind::Call { control },
                completer: completer.clone(),
            });
            body.service
        });
        self.enqueue(sref.ok_or(Fault::BadState)?, channel);
        Ok(())
    }

    /// Queues a disconnect. Closing the null handle is an accepted no-op.
    pub fn close(
        &self,
        client: PartitionId,
        handle: Handle,
        completer: Arc<dyn Complete>,
    ) -> Result<()> {
        if handle.is_null() {
            completer.complete(status::SUCCESS);
            return Ok(());
        }
        let channel = self.channel_of(handle, client)?;
        // A close overtaking an in-flight call is a protocol violation; the
        // connection must be idle (a dropped one still idles between calls).
        self.channels.expect_state(channel, ChannelState::Idle)?;
        let sref = self.channels.with_body(channel, |body| {
            body.request = Some(PendingRequest {
                kind: RequestKind::Close,
                completer: completer.clone(),
            });
            body.service
        });
        self.enqueue(sref.ok_or(Fault::BadState)?, channel);
        Ok(())
    }

    /// Published minor version of `sid`, or `VERSION_NONE` when the service
    /// does not exist or the caller may not reach it. Never faults: probing
    /// versions is how clients discover services.
    pub fn version(&self, client: PartitionId, sid: Sid) -> u32 {
        let Some(sref) = self.directory.find_service(sid) else {
            return status::VERSION_NONE;
        };
        if self.directory.can_access(client, sref).is_err() {
            return status::VERSION_NONE;
        }
        self.directory.service(sref).min_version
    }

    /// Version of the IPC framework itself.
    pub fn framework_version(&self) -> u32 {
        status::FRAMEWORK_VERSION
    }
}
