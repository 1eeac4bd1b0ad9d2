// Copyright 2025 Bastion OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Secure Partition Manager IPC core
//! OWNERS: @spm-team
//! PUBLIC API: SpmState, ServerApi, handle/channel/queue/mailbox modules
//! DEPENDS_ON: bastion-abi, spin (slot paths), parking_lot (blocking paths)
//! INVARIANTS: Handle path is lock-free; no mutex held across a blocking
//!   wait; strict FIFO per service queue; cross-partition copies gated by
//!   PartitionMemory accessibility checks
//!
//! The SPM isolates secure partitions from each other and from the
//! non-secure caller and is the only channel through which they exchange
//! requests. Clients reach it through the blocking facade in
//! `bastion-client` (same core) or through the cross-core mailbox bridge
//! (physically separate cores sharing a memory-mapped region).

pub mod channel;
pub mod directory;
pub mod error;
pub mod handle;
pub mod mailbox;
pub mod memory;
pub mod message;
pub mod queue;
pub mod server;
pub mod state;
pub mod sync;

pub use channel::{ChannelState, RequestKind};
pub use directory::{PartitionDesc, ServiceDesc, VersionPolicy};
pub use error::Fault;
pub use mailbox::{Doorbell, MailboxBridge, MailboxCore, Region};
pub use memory::{FlatMemory, PartitionMemory};
pub use server::{Msg, MsgKind, ServerApi};
pub use state::SpmState;
pub use sync::{Complete, Completion, Wait};
