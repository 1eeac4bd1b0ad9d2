// Copyright 2025 Bastion OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Blocking primitives used by the queue, mailbox and facade paths
//! OWNERS: @spm-team
//! PUBLIC API: Wait, Semaphore, SignalState, Completion, Complete
//! DEPENDS_ON: parking_lot Mutex/Condvar
//! INVARIANTS: Condvar predicates are re-checked after every wakeup; a
//!   signal bit is asserted iff its service queue is non-empty

use core::time::Duration;

use bastion_abi::Signals;
use parking_lot::{Condvar, Mutex};

/// Behaviour of a blocking call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Block until the operation completes.
    Blocking,
    /// Return immediately if no progress can be made.
    NonBlocking,
    /// Block until either the operation completes or the timeout expires.
    Timeout(Duration),
}

/// Counting semaphore.
///
/// Timeouts are ordinary control flow for the mailbox paths: a lost
/// cross-core notification must not deadlock a waiter, so waits are bounded
/// and the queue state is re-checked after each one.
pub struct Semaphore {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    /// Creates a semaphore with `count` initial permits.
    pub fn new(count: usize) -> Self {
        Self { count: Mutex::new(count), cv: Condvar::new() }
    }

    /// Releases one permit and wakes a waiter.
    pub fn post(&self) {
        *self.count.lock() += 1;
        self.cv.notify_one();
    }

    /// Acquires one permit, returning `false` on timeout or when a
    /// non-blocking attempt finds no permit available.
    pub fn acquire(&self, wait: Wait) -> bool {
        let mut count = self.count.lock();
        match wait {
            Wait::Blocking => {
                while *count == 0 {
                    self.cv.wait(&mut count);
                }
            }
            Wait::NonBlocking => {
                if *count == 0 {
                    return false;
                }
            }
            Wait::Timeout(timeout) => {
                let deadline = std::time::Instant::now() + timeout;
                while *count == 0 {
                    if self.cv.wait_until(&mut count, deadline).timed_out() {
                        return false;
                    }
                }
            }
        }
        *count -= 1;
        true
    }
}

/// Per-partition signal word with condvar-based waiting.
///
/// Replaces the original mutex-plus-thread-flag emulation: the asserted
/// word is the condvar predicate, and service bits follow the
/// set-iff-non-empty invariant maintained by the queue module.
pub struct SignalState {
    asserted: Mutex<Signals>,
    cv: Condvar,
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalState {
    /// Creates an empty signal word.
    pub fn new() -> Self {
        Self { asserted: Mutex::new(Signals::empty()), cv: Condvar::new() }
    }

    /// Asserts `signals`; setting an already-set bit is harmless.
    pub fn raise(&self, signals: Signals) {
        let mut word = self.asserted.lock();
        *word |= signals;
        self.cv.notify_all();
    }

    /// Clears `signals`.
    pub fn clear(&self, signals: Signals) {
        *self.asserted.lock() &= !signals;
    }

    /// Returns the currently asserted subset of `mask` without blocking.
    pub fn peek(&self, mask: Signals) -> Signals {
        *self.asserted.lock() & mask
    }

    /// Blocks until any bit in `mask` is asserted, returning the asserted
    /// subset, or `None` on timeout / empty non-blocking poll.
    pub fn wait(&self, mask: Signals, wait: Wait) -> Option<Signals> {
        let mut word = self.asserted.lock();
        match wait {
            Wait::Blocking => {
                while (*word & mask).is_empty() {
                    self.cv.wait(&mut word);
                }
            }
            Wait::NonBlocking => {}
            Wait::Timeout(timeout) => {
                let deadline = std::time::Instant::now() + timeout;
                while (*word & mask).is_empty() {
                    if self.cv.wait_until(&mut word, deadline).timed_out() {
                        break;
                    }
                }
            }
        }
        let hit = *word & mask;
        if hit.is_empty() {
            None
        } else {
            Some(hit)
        }
    }
}

/// Sink for the completion status of one pending request.
///
/// Implemented by the local [`Completion`] cell and by the mailbox reply
/// path, so the channel machine completes requests without knowing which
/// core the client runs on.
pub trait Complete: Send + Sync {
    /// Posts the final status; exactly one call per request.
    fn complete(&self, status: i32);
}

/// One-shot completion cell a synchronous caller blocks on.
pub struct Completion {
    status: Mutex<Option<i32>>,
    cv: Condvar,
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl Completion {
    /// Creates an unsignalled completion.
    pub fn new() -> Self {
        Self { status: Mutex::new(None), cv: Condvar::new() }
    }

    /// Returns the posted status without blocking.
    pub fn poll(&self) -> Option<i32> {
        *self.status.lock()
    }

    /// Blocks until a status is posted.
    pub fn wait(&self) -> i32 {
        let mut status = self.status.lock();
        while status.is_none() {
            self.cv.wait(&mut status);
        }
        status.unwrap()
    }

    /// Blocks with a bound, returning `None` on timeout.
    pub fn wait_for(&self, timeout: Duration) -> Option<i32> {
        let deadline = std::time::Instant::now() + timeout;
        let mut status = self.status.lock();
        while status.is_none() {
            if self.cv.wait_until(&mut status, deadline).timed_out() {
                break;
            }
        }
        *status
    }
}

impl Complete for Completion {
    fn complete(&self, value: i32) {
        let mut status = self.status.lock();
        // First writer wins; a second post would be a reply-twice bug.
        debug_assert!(status.is_none(), "completion posted twice");
        if status.is_none() {
            *status = Some(value);
        }
        self.cv.notify_all();
    }
}
