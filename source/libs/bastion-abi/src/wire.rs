// Copyright 2025 Bastion OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Binary layouts shared across the trust and core boundaries
//! OWNERS: @spm-team
//! PUBLIC API: QueueItem, MailboxMessage, VecDesc, CallControl, magics
//! INVARIANTS: Everything little-endian and 4-byte aligned; a mailbox item
//!   is exactly 3 words; the call control block is exactly 72 bytes

use core::convert::TryInto;
use core::fmt;

use crate::{Handle, Sid, MAX_IOVEC};

/// Magic tag of the shared-memory address table.
pub const ADDRESS_TABLE_MAGIC: u32 = 0xdead_beef;
/// Magic tag of each mailbox queue.
pub const QUEUE_MAGIC: u32 = 0xcafe_babe;

/// Words in the address table: `{magic, tx_offset, rx_offset}`.
pub const ADDRESS_TABLE_WORDS: usize = 3;
/// Words in a queue header: `{magic, read_index, write_index}`.
pub const QUEUE_HEADER_WORDS: usize = 3;
/// Words per queue item.
pub const ITEM_WORDS: usize = 3;
/// Smallest legal queue capacity (one usable slot).
pub const MIN_QUEUE_CAPACITY: u32 = 2;

/// One 3-word mailbox ring item.
///
/// `a` carries the message-type tag in its low byte and the correlation
/// token in its high half; `b` and `c` are interpreted per tag.
#[repr(C, align(4))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueItem {
    /// Tag and token word.
    pub a: u32,
    /// First payload word.
    pub b: u32,
    /// Second payload word.
    pub c: u32,
}

static_assertions::const_assert_eq!(core::mem::size_of::<QueueItem>(), 12);
static_assertions::const_assert_eq!(core::mem::align_of::<QueueItem>(), 4);

impl QueueItem {
    /// Serialises the item to its little-endian wire form.
    pub fn to_le_bytes(self) -> [u8; 12] {
        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&self.a.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.b.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.c.to_le_bytes());
        bytes
    }

    /// Deserialises an item from its little-endian wire form.
    pub fn from_le_bytes(bytes: [u8; 12]) -> Self {
        Self {
            a: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            b: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            c: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
        }
    }
}

/// Message-type tags carried in the low byte of [`QueueItem::a`].
pub mod tag {
    /// Connect request: `b` = SID, `c` = requested version.
    pub const CONNECT: u8 = 1;
    /// Call request: `b` = channel handle, `c` = control-block address.
    pub const CALL: u8 = 2;
    /// Close request: `b` = channel handle.
    pub const CLOSE: u8 = 3;
    /// Version query: `b` = SID.
    pub const VERSION: u8 = 4;
    /// Reply: `c` = status word (or handle/version for connect/version).
    pub const REPLY: u8 = 5;
}

/// Error produced when decoding wire data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireError {
    /// The item carried an unknown message-type tag.
    BadTag(u8),
    /// A buffer was shorter than the fixed layout requires.
    Truncated,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadTag(t) => write!(f, "unknown mailbox tag {t}"),
            Self::Truncated => write!(f, "wire buffer truncated"),
        }
    }
}

/// Typed view of one mailbox item, bridged verbatim between cores.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MailboxMessage {
    /// Open a connection to `sid` at `version`.
    Connect {
        /// Target service.
        sid: Sid,
        /// Requested minor version.
        version: u32,
    },
    /// Invoke a call on an established channel.
    Call {
        /// Channel handle returned by a previous connect.
        handle: Handle,
        /// Client-memory address of the [`CallControl`] block.
        control: u32,
    },
    /// Tear down a connection.
    Close {
        /// Channel handle to close.
        handle: Handle,
    },
    /// Query the version of `sid`.
    Version {
        /// Target service.
        sid: Sid,
    },
    /// Completion travelling back to the requesting core.
    Reply {
        /// Status word (a handle for connect, a version for version).
        status: i32,
    },
}

impl MailboxMessage {
    /// Packs the message and its correlation token into a ring item.
    pub fn pack(self, token: u16) -> QueueItem {
        let head = |t: u8| t as u32 | (token as u32) << 16;
        match self {
            Self::Connect { sid, version } => {
                QueueItem { a: head(tag::CONNECT), b: sid, c: version }
            }
            Self::Call { handle, control } => {
                QueueItem { a: head(tag::CALL), b: handle.raw() as u32, c: control }
            }
            Self::Close { handle } => {
                QueueItem { a: head(tag::CLOSE), b: handle.raw() as u32, c: 0 }
            }
            Self::Version { sid } => QueueItem { a: head(tag::VERSION), b: sid, c: 0 },
            Self::Reply { status } => {
                QueueItem { a: head(tag::REPLY), b: 0, c: status as u32 }
            }
        }
    }

    /// Unpacks a ring item into its token and typed message.
    pub fn unpack(item: QueueItem) -> Result<(u16, Self), WireError> {
        let token = (item.a >> 16) as u16;
        let msg = match (item.a & 0xff) as u8 {
            tag::CONNECT => Self::Connect { sid: item.b, version: item.c },
            tag::CALL => {
                Self::Call { handle: Handle::from_raw(item.b as i32), control: item.c }
            }
            tag::CLOSE => Self::Close { handle: Handle::from_raw(item.b as i32) },
            tag::VERSION => Self::Version { sid: item.b },
            tag::REPLY => Self::Reply { status: item.c as i32 },
            other => return Err(WireError::BadTag(other)),
        };
        Ok((token, msg))
    }
}

/// One scatter/gather descriptor: a client-memory address and a length.
#[repr(C, align(4))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VecDesc {
    /// Client-memory base address.
    pub base: u32,
    /// Length in bytes; zero-length vectors are skipped by validation.
    pub len: u32,
}

static_assertions::const_assert_eq!(core::mem::size_of::<VecDesc>(), 8);

/// Size of the serialised [`CallControl`] block.
pub const CONTROL_BYTES: usize = 8 + 2 * MAX_IOVEC * 8;

/// Control block a client writes into its own memory before a call.
///
/// The SPM snapshots the whole block into SPM-owned storage before any
/// descriptor is validated or dereferenced, closing the window in which a
/// compromised caller could rewrite a descriptor between check and use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallControl {
    /// Number of live input vectors (≤ [`MAX_IOVEC`]).
    pub in_count: u32,
    /// Number of live output vectors (≤ [`MAX_IOVEC`]).
    pub out_count: u32,
    /// Input descriptors; entries past `in_count` must be zero.
    pub in_vec: [VecDesc; MAX_IOVEC],
    /// Output descriptors; entries past `out_count` must be zero.
    pub out_vec: [VecDesc; MAX_IOVEC],
}

impl CallControl {
    /// Serialises the block to its little-endian wire form.
    pub fn to_le_bytes(&self) -> [u8; CONTROL_BYTES] {
        let mut bytes = [0u8; CONTROL_BYTES];
        bytes[0..4].copy_from_slice(&self.in_count.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.out_count.to_le_bytes());
        let mut off = 8;
        for desc in self.in_vec.iter().chain(self.out_vec.iter()) {
            bytes[off..off + 4].copy_from_slice(&desc.base.to_le_bytes());
            bytes[off + 4..off + 8].copy_from_slice(&desc.len.to_le_bytes());
            off += 8;
        }
        bytes
    }

    /// Deserialises a block, checking the vector counts.
    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < CONTROL_BYTES {
            return Err(WireError::Truncated);
        }
        let word =
            |off: usize| u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        let mut ctrl = CallControl {
            in_count: word(0),
            out_count: word(4),
            ..CallControl::default()
        };
        if ctrl.in_count as usize > MAX_IOVEC || ctrl.out_count as usize > MAX_IOVEC {
            return Err(WireError::Truncated);
        }
        let mut off = 8;
        for desc in ctrl.in_vec.iter_mut().chain(ctrl.out_vec.iter_mut()) {
            *desc = VecDesc { base: word(off), len: word(off + 4) };
            off += 8;
        }
        Ok(ctrl)
    }
}
