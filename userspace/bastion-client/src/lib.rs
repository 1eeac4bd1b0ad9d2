// Copyright 2025 Bastion OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Synchronous client facade over the SPM request entry points
//! OWNERS: @client-team
//! PUBLIC API: Client, RemoteClient, MailboxTransport, ClientError
//! DEPENDS_ON: bastion-spm entry points and mailbox halves
//! INVARIANTS: One completion cell per request; a request is submitted
//!   exactly once and its cell is completed exactly once; control blocks
//!   are serialized into caller-owned memory before submission
//!
//! Two variants share the same surface: [`Client`] drives the SPM on the
//! same core through direct entry-point calls, [`RemoteClient`] runs on the
//! physically separate non-secure core and posts the identical requests
//! through the shared-memory mailbox, correlating replies by token.

use std::sync::Arc;
use std::time::Duration;

use bastion_abi::wire::{CallControl, MailboxMessage, VecDesc};
use bastion_abi::{status, Handle, PartitionId, Sid, MAX_IOVEC, NSPE_ID};
use bastion_spm::mailbox::{MailboxConsumer, MailboxCore, MailboxProducer};
use bastion_spm::{Complete, Completion, Fault, PartitionMemory, SpmState, Wait};
use log::{error, warn};
use parking_lot::Mutex;
use thiserror::Error;

/// Client-visible failures of the facade.
///
/// Faults mean the caller itself violated the IPC contract; refusals and
/// drops are ordinary protocol outcomes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    /// The SPM or the service refused the connection.
    #[error("connection refused")]
    Refused,
    /// The service dropped the connection.
    #[error("connection dropped by the service")]
    Dropped,
    /// The caller violated an isolation invariant.
    #[error(transparent)]
    Fault(#[from] Fault),
}

fn serialize_control(
    memory: &dyn PartitionMemory,
    caller: PartitionId,
    control_addr: u32,
    in_vecs: &[VecDesc],
    out_vecs: &[VecDesc],
) -> Result<(), ClientError> {
    assert!(in_vecs.len() <= MAX_IOVEC && out_vecs.len() <= MAX_IOVEC);
    let mut control = CallControl {
        in_count: in_vecs.len() as u32,
        out_count: out_vecs.len() as u32,
        ..Default::default()
    };
    control.in_vec[..in_vecs.len()].copy_from_slice(in_vecs);
    control.out_vec[..out_vecs.len()].copy_from_slice(out_vecs);
    memory.write(caller, control_addr, &control.to_le_bytes())?;
    Ok(())
}

/// Same-core synchronous client.
///
/// `control_addr` names a caller-owned scratch slot the control block is
/// serialized into; one slot per client, so a client is one-call-at-a-time
/// by construction.
pub struct Client {
    spm: Arc<SpmState>,
    memory: Arc<dyn PartitionMemory>,
    id: PartitionId,
    control_addr: u32,
}

impl Client {
    /// Builds a client for partition `id` (or `NSPE_ID`).
    pub fn new(
        spm: Arc<SpmState>,
        memory: Arc<dyn PartitionMemory>,
        id: PartitionId,
        control_addr: u32,
    ) -> Self {
        Self { spm, memory, id, control_addr }
    }

    /// Connects to `sid` at `version`, blocking until the service decides.
    pub fn connect(&self, sid: Sid, version: u32) -> Result<Handle, ClientError> {
        let done = Arc::new(Completion::new());
        self.spm.connect(self.id, sid, version, done.clone())?;
        let raw = done.wait();
        if raw < 0 {
            return Err(ClientError::Refused);
        }
        Ok(Handle::from_raw(raw))
    }

    /// Invokes the service behind `handle`, blocking until it replies.
    ///
    /// At most [`MAX_IOVEC`] vectors per direction; more is a programming
    /// error on this side of the boundary and asserts.
    pub fn call(
        &self,
        handle: Handle,
        in_vecs: &[VecDesc],
        out_vecs: &[VecDesc],
    ) -> Result<i32, ClientError> {
        serialize_control(self.memory.as_ref(), self.id, self.control_addr, in_vecs, out_vecs)?;
        let done = Arc::new(Completion::new());
        self.spm.call(self.id, handle, self.control_addr, done.clone())?;
        let reply = done.wait();
        if reply == status::DROP_CONNECTION {
            return Err(ClientError::Dropped);
        }
        Ok(reply)
    }

    /// Disconnects `handle`; the null handle is an accepted no-op.
    pub fn close(&self, handle: Handle) -> Result<(), ClientError> {
        let done = Arc::new(Completion::new());
        self.spm.close(self.id, handle, done.clone())?;
        done.wait();
        Ok(())
    }

    /// Published minor version of `sid`, `VERSION_NONE` when unreachable.
    pub fn version(&self, sid: Sid) -> u32 {
        self.spm.version(self.id, sid)
    }

    /// Version of the IPC framework.
    pub fn framework_version(&self) -> u32 {
        self.spm.framework_version()
    }
}

/// Tokens in flight at once; bounds the reply-correlation table.
const TOKENS: usize = 16;
/// Bound of one pump pass; replies are re-polled after each.
const PUMP_WAIT: Duration = Duration::from_millis(2);

/// Non-secure-core transport: posts requests into the mailbox and pumps
/// the reply queue, completing the cell registered under each token.
///
/// Any waiting thread may become the pump; the `pump` mutex elects one at
/// a time and the others poll their own cells with a bound.
pub struct MailboxTransport {
    producer: Arc<MailboxProducer>,
    consumer: Arc<MailboxConsumer>,
    slots: Mutex<Vec<Option<Arc<Completion>>>>,
    pump: Mutex<()>,
}

impl MailboxTransport {
    /// Wraps the non-secure core's queue pair.
    pub fn new(core: MailboxCore) -> Self {
        Self {
            producer: core.producer,
            consumer: core.consumer,
            slots: Mutex::new((0..TOKENS).map(|_| None).collect()),
            pump: Mutex::new(()),
        }
    }

    /// Forwards the mailbox interrupt into both queue semaphores.
    pub fn on_interrupt(&self) {
        self.producer.on_interrupt();
        self.consumer.on_interrupt();
    }

    fn claim(&self, done: &Arc<Completion>) -> u16 {
        loop {
            {
                let mut slots = self.slots.lock();
                if let Some(token) = slots.iter().position(Option::is_none) {
                    slots[token] = Some(done.clone());
                    return token as u16;
                }
            }
            // Every token is in flight; drain replies and retry.
            self.pump_once(Wait::Timeout(PUMP_WAIT));
        }
    }

    fn on_reply(&self, item: bastion_abi::wire::QueueItem) -> Result<(), Fault> {
        match MailboxMessage::unpack(item) {
            Ok((token, MailboxMessage::Reply { status })) => {
                let cell = self.slots.lock().get_mut(token as usize).and_then(Option::take);
                match cell {
                    Some(done) => done.complete(status),
                    None => warn!("mailbox: reply with unclaimed token {token}"),
                }
                Ok(())
            }
            Ok(_) => Err(Fault::MailboxFormat),
            Err(err) => {
                error!("mailbox: undecodable reply item: {err}");
                Err(Fault::MailboxFormat)
            }
        }
    }

    fn pump_once(&self, wait: Wait) {
        if let Some(_elected) = self.pump.try_lock() {
            if let Err(fault) = self.consumer.service(wait, |item| self.on_reply(item)) {
                // A corrupt reply ring cannot be recovered from here; the
                // pending cells will keep their waiters polling.
                error!("mailbox: reply pump failed: {fault}");
            }
        } else if let Wait::Timeout(timeout) = wait {
            std::thread::sleep(timeout);
        }
    }

    /// Posts `msg` and blocks until the correlated reply arrives.
    pub fn transact(&self, msg: MailboxMessage) -> Result<i32, ClientError> {
        let done = Arc::new(Completion::new());
        let token = self.claim(&done);
        self.producer.push(msg.pack(token))?;
        loop {
            if let Some(reply) = done.wait_for(PUMP_WAIT) {
                return Ok(reply);
            }
            self.pump_once(Wait::Timeout(PUMP_WAIT));
        }
    }
}

/// Synchronous client running on the non-secure core.
pub struct RemoteClient {
    transport: Arc<MailboxTransport>,
    memory: Arc<dyn PartitionMemory>,
    control_addr: u32,
}

impl RemoteClient {
    /// Builds the remote client over `transport`; `control_addr` must lie
    /// in memory mapped to the non-secure environment.
    pub fn new(
        transport: Arc<MailboxTransport>,
        memory: Arc<dyn PartitionMemory>,
        control_addr: u32,
    ) -> Self {
        Self { transport, memory, control_addr }
    }

    /// Connects to `sid` at `version` across the core boundary.
    pub fn connect(&self, sid: Sid, version: u32) -> Result<Handle, ClientError> {
        let raw = self.transport.transact(MailboxMessage::Connect { sid, version })?;
        if raw < 0 {
            return Err(ClientError::Refused);
        }
        Ok(Handle::from_raw(raw))
    }

    /// Invokes the service behind `handle` across the core boundary.
    pub fn call(
        &self,
        handle: Handle,
        in_vecs: &[VecDesc],
        out_vecs: &[VecDesc],
    ) -> Result<i32, ClientError> {
        serialize_control(self.memory.as_ref(), NSPE_ID, self.control_addr, in_vecs, out_vecs)?;
        let reply = self
            .transport
            .transact(MailboxMessage::Call { handle, control: self.control_addr })?;
        if reply == status::DROP_CONNECTION {
            return Err(ClientError::Dropped);
        }
        Ok(reply)
    }

    /// Disconnects `handle`; the null handle is an accepted no-op.
    pub fn close(&self, handle: Handle) -> Result<(), ClientError> {
        self.transport.transact(MailboxMessage::Close { handle })?;
        Ok(())
    }

    /// Published minor version of `sid` as seen from the non-secure side.
    pub fn version(&self, sid: Sid) -> Result<u32, ClientError> {
        Ok(self.transport.transact(MailboxMessage::Version { sid })? as u32)
    }
}
