// Copyright 2025 Bastion OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Fault taxonomy for the SPM core
//! OWNERS: @spm-team
//! INVARIANTS: A `Fault` always denotes a violated isolation invariant and
//!   terminates the violating request; it is never retried by the core

use core::fmt;

/// Result alias used across the SPM core.
pub type Result<T> = core::result::Result<T, Fault>;

/// Isolation faults raised against hostile or buggy callers.
///
/// Faults cover the cross-boundary half of the error model: forged input
/// arriving over a trust boundary. Invariants that build-time configuration
/// guarantees (pool sizing, live handles having a backing object) are hard
/// panics instead, since continuing would mean operating on corrupted state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Handle is null, forged, stale, or references the wrong object kind.
    InvalidHandle,
    /// Caller is neither owner nor friend of the referenced slot.
    AccessDenied,
    /// Channel observed in a state the operation does not permit.
    BadState,
    /// A write exceeded the remaining capacity of an output vector.
    BufferOverrun,
    /// Vector index outside the live input/output range of a message.
    BadVector,
    /// A buffer failed the caller-accessibility check or a checked copy.
    MemoryViolation,
    /// A message operation that does not match any pending message.
    NoMessage,
    /// Mailbox region failed magic, bounds, or index validation.
    MailboxFormat,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHandle => write!(f, "invalid or stale handle"),
            Self::AccessDenied => write!(f, "caller is neither owner nor friend"),
            Self::BadState => write!(f, "illegal channel state transition"),
            Self::BufferOverrun => write!(f, "write beyond output vector capacity"),
            Self::BadVector => write!(f, "vector index outside the message"),
            Self::MemoryViolation => write!(f, "buffer not accessible to caller"),
            Self::NoMessage => write!(f, "no message pending for signal"),
            Self::MailboxFormat => write!(f, "malformed mailbox region or item"),
        }
    }
}

impl std::error::Error for Fault {}
