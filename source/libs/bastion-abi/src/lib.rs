// Copyright 2025 Bastion OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Shared ABI definitions for the Secure Partition Manager core
//! OWNERS: @spm-team
//! PUBLIC API: Handle, Sid, PartitionId, status codes, Signals, wire layouts
//! DEPENDS_ON: no_std, bitflags, static_assertions
//! INVARIANTS: Handles are non-negative i32, 0 invalid; wire structs are LE,
//!   4-byte aligned; mailbox items are exactly 3 words

pub mod wire;

use core::fmt;

/// Stable 32-bit identifier of a Root-of-Trust service.
pub type Sid = u32;

/// Identifier of a secure partition; [`NSPE_ID`] denotes the non-secure caller.
pub type PartitionId = i32;

/// Sentinel partition id for the Non-Secure Processing Environment.
pub const NSPE_ID: PartitionId = -1;

/// Maximum number of input or output vectors carried by one call.
pub const MAX_IOVEC: usize = 4;

/// Opaque, ACL-checked capability reference handed out by the handle manager.
///
/// Encoding: `0` is the reserved null value; bits \[30:16\] carry the pool
/// slot index (bit 31 stays clear so valid handles are non-negative) and
/// bits \[15:0\] a non-zero generation counter. A handle is valid iff the
/// slot at its index currently stores exactly this value, so the index
/// participates in every validity check and generation reuse across
/// different slots is not observable through this encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(i32);

/// Highest slot index representable in the handle encoding.
pub const MAX_HANDLE_INDEX: u16 = 0x7fff;

impl Handle {
    /// The reserved null handle.
    pub const NULL: Handle = Handle(0);

    /// Wraps a raw wire value without validation.
    pub const fn from_raw(raw: i32) -> Self {
        Handle(raw)
    }

    /// Returns the raw wire value.
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Composes a handle from a slot index and a non-zero generation.
    ///
    /// `index` must not exceed [`MAX_HANDLE_INDEX`]; the caller (the handle
    /// manager) sizes its pool accordingly.
    pub const fn compose(index: u16, generation: u16) -> Self {
        Handle(((index as i32) << 16) | generation as i32)
    }

    /// Slot index encoded in bits \[30:16\].
    pub const fn index(self) -> u16 {
        ((self.0 >> 16) & MAX_HANDLE_INDEX as i32) as u16
    }

    /// Generation counter encoded in bits \[15:0\].
    pub const fn generation(self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    /// Returns `true` for the reserved null value.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}/{})", self.index(), self.generation())
    }
}

/// Status codes surfaced to clients and exchanged with services.
pub mod status {
    /// Signed status word; negative values in the reserved range below are
    /// interpreted by the SPM, the rest of the range is application-defined.
    pub type Status = i32;

    /// Generic success.
    pub const SUCCESS: Status = 0;
    /// A service accepted the connection (alias of [`SUCCESS`]).
    pub const CONNECTION_ACCEPTED: Status = 0;
    /// The SPM or the service refused the connection.
    pub const CONNECTION_REFUSED: Status = -150;
    /// The service dropped the connection; later calls fail soft with this.
    pub const DROP_CONNECTION: Status = -151;

    /// `version(sid)` result when the service is unknown or unreachable.
    pub const VERSION_NONE: u32 = 0;
    /// Version of the IPC framework itself (major.minor packed as 0xMMmm).
    pub const FRAMEWORK_VERSION: u32 = 0x0101;
}

bitflags::bitflags! {
    /// Per-partition signal word observed by `wait_any`/`wait_interrupt`.
    ///
    /// Bit 0 is the inter-partition doorbell; bits 4..=27 are assigned to
    /// RoT services at build time (set iff the service queue is non-empty);
    /// bits 28..=31 are interrupt signals.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Signals: u32 {
        /// Doorbell raised by `notify(partition)`.
        const DOORBELL = 1 << 0;
        /// All bits assignable to RoT service queues.
        const SERVICE_MASK = 0x0fff_fff0;
        /// All bits assignable to interrupt sources.
        const IRQ_MASK = 0xf000_0000;
        /// Every signal a partition can block on.
        const ANY = 0xffff_fff1;
    }
}

impl Signals {
    /// First bit position usable for service signals.
    pub const SERVICE_BASE: u8 = 4;

    /// Returns the dedicated signal for the `n`-th service of a partition.
    ///
    /// Panics if the bit would fall outside [`Signals::SERVICE_MASK`];
    /// partition descriptors are validated against this at boot.
    pub fn service(n: u8) -> Signals {
        let bits = 1u32 << (Self::SERVICE_BASE + n);
        let sig = Signals::from_bits_retain(bits);
        assert!(
            Signals::SERVICE_MASK.contains(sig),
            "service signal {n} outside the assignable range"
        );
        sig
    }
}
