// Copyright 2025 Bastion OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared harness for the end-to-end IPC scenarios: a two-partition
//! manifest, an echo service loop and the cross-core mailbox wiring.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bastion_abi::wire::ADDRESS_TABLE_WORDS;
use bastion_abi::{status, Signals, NSPE_ID};
use bastion_client::MailboxTransport;
use bastion_spm::mailbox::{
    attach_region, format_region, queue_words, MailboxBridge, MailboxConsumer, MailboxCore,
    MailboxProducer, NoDoorbell, Region,
};
use bastion_spm::{
    Fault, FlatMemory, MsgKind, PartitionDesc, ServiceDesc, SpmState, VersionPolicy, Wait,
};

/// Relaxed-versioned echo service, reachable from the non-secure side.
pub const ECHO_SID: u32 = 0x5000;
/// Strict-versioned service closed to the non-secure side.
pub const VAULT_SID: u32 = 0x5001;

/// Client-owned scratch addresses inside the flat test memory.
pub const CTRL: u32 = 0x100;
pub const IN: u32 = 0x200;
pub const OUT: u32 = 0x300;

/// Second scratch set for scenarios with two concurrent clients.
pub const CTRL2: u32 = 0x160;
pub const IN2: u32 = 0x240;
pub const OUT2: u32 = 0x340;

/// Published minor versions of the two services.
pub const ECHO_VERSION: u32 = 3;
pub const VAULT_VERSION: u32 = 1;

/// Boots an SPM with an echo partition, a vault partition depending on the
/// echo service, and a non-secure scratch mapping.
pub fn boot() -> (Arc<SpmState>, Arc<FlatMemory>) {
    let memory = FlatMemory::new(0x1000);
    memory.map_region(0x100, 0x300, NSPE_ID);
    let manifest = vec![
        PartitionDesc {
            id: 1,
            name: "echo",
            services: vec![ServiceDesc {
                sid: ECHO_SID,
                signal: Signals::service(0),
                min_version: ECHO_VERSION,
                policy: VersionPolicy::Relaxed,
                allow_nspe: true,
            }],
            dependencies: vec![VAULT_SID],
            irq_signals: Signals::empty(),
        },
        PartitionDesc {
            id: 2,
            name: "vault",
            services: vec![ServiceDesc {
                sid: VAULT_SID,
                signal: Signals::service(0),
                min_version: VAULT_VERSION,
                policy: VersionPolicy::Strict,
                allow_nspe: false,
            }],
            dependencies: vec![ECHO_SID],
            irq_signals: Signals::empty(),
        },
    ];
    (SpmState::new(manifest, memory.clone()), memory)
}

/// Runs the echo partition: upper-cases input into output, replying with
/// the byte count, until its connection count drops back to zero.
pub fn spawn_echo(spm: Arc<SpmState>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let server = spm.server_api(1);
        let mut connections = 0usize;
        let mut served_any = false;
        loop {
            if server.wait_any(Wait::Timeout(Duration::from_secs(5))).is_none() {
                panic!("echo service starved");
            }
            let msg = match server.get(Signals::service(0)) {
                Ok(msg) => msg,
                Err(Fault::NoMessage) => continue,
                Err(fault) => panic!("echo dispatch failed: {fault}"),
            };
            match msg.kind {
                MsgKind::Connect => {
                    connections += 1;
                    served_any = true;
                    server.reply(msg.handle, status::CONNECTION_ACCEPTED).unwrap();
                }
                MsgKind::Call => {
                    let mut buf = vec![0u8; msg.in_size[0] as usize];
                    server.read(msg.handle, 0, &mut buf).unwrap();
                    if buf == b"drop" {
                        server.reply(msg.handle, status::DROP_CONNECTION).unwrap();
                        continue;
                    }
                    buf.make_ascii_uppercase();
                    if msg.out_size[0] as usize >= buf.len() {
                        server.write(msg.handle, 0, &buf).unwrap();
                    }
                    server.reply(msg.handle, buf.len() as i32).unwrap();
                }
                MsgKind::Close => {
                    connections -= 1;
                    server.reply(msg.handle, status::SUCCESS).unwrap();
                    if served_any && connections == 0 {
                        return;
                    }
                }
            }
        }
    })
}

/// A running cross-core mailbox: bridge thread on the secure side, client
/// transport on the non-secure side.
pub struct MailboxFixture {
    pub transport: Arc<MailboxTransport>,
    stop: Arc<AtomicBool>,
    bridge: Option<thread::JoinHandle<()>>,
}

impl MailboxFixture {
    /// Formats a shared region of `capacity`-item queues, attaches both
    /// cores and starts the secure-side bridge thread.
    pub fn start(spm: Arc<SpmState>, capacity: u32) -> Self {
        let region = Region::new(ADDRESS_TABLE_WORDS + 2 * queue_words(capacity));
        // Secure core formats; the convention is that the first listed
        // queue carries non-secure requests.
        let secure = format_region(&region, capacity).unwrap();
        let core = MailboxCore {
            consumer: Arc::new(MailboxConsumer::new(secure.tx, Arc::new(NoDoorbell))),
            producer: Arc::new(MailboxProducer::new(secure.rx, Arc::new(NoDoorbell))),
        };
        let bridge = MailboxBridge::new(spm, core);

        let stop = Arc::new(AtomicBool::new(false));
        let bridge_thread = {
            let stop = stop.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    bridge
                        .service_once(Wait::Timeout(Duration::from_millis(5)))
                        .expect("mailbox bridge failed");
                }
            })
        };

        let nonsecure = attach_region(&region, capacity).unwrap();
        let transport = Arc::new(MailboxTransport::new(MailboxCore {
            producer: Arc::new(MailboxProducer::new(nonsecure.tx, Arc::new(NoDoorbell))),
            consumer: Arc::new(MailboxConsumer::new(nonsecure.rx, Arc::new(NoDoorbell))),
        }));
        Self { transport, stop, bridge: Some(bridge_thread) }
    }
}

impl Drop for MailboxFixture {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(bridge) = self.bridge.take() {
            bridge.join().expect("bridge thread exits cleanly");
        }
    }
}
