// Copyright 2025 Bastion OS Contributors
// SPDX-License-Identifier: Apache-2.0

use std::thread;
use std::time::Duration;

use bastion_abi::wire::VecDesc;
use bastion_abi::{status, Signals, NSPE_ID};
use bastion_client::{Client, ClientError};
use bastion_e2e::{boot, spawn_echo, ECHO_SID, ECHO_VERSION, VAULT_SID, VAULT_VERSION};
use bastion_e2e::{CTRL, IN, OUT};
use bastion_spm::{Fault, MsgKind, Wait};

#[test]
fn nonsecure_connect_call_close_roundtrip() {
    let (spm, memory) = boot();
    let service = spawn_echo(spm.clone());
    let client = Client::new(spm, memory.clone(), NSPE_ID, CTRL);

    assert_eq!(client.version(ECHO_SID), ECHO_VERSION);
    let handle = client.connect(ECHO_SID, 1).expect("relaxed policy accepts older minor");

    memory.poke(IN, b"hello");
    let reply = client
        .call(handle, &[VecDesc { base: IN, len: 5 }], &[VecDesc { base: OUT, len: 8 }])
        .unwrap();
    assert_eq!(reply, 5);
    assert_eq!(memory.peek(OUT, 5), b"HELLO");

    client.close(handle).unwrap();
    service.join().expect("echo thread exits cleanly");
}

#[test]
fn relaxed_policy_bounds_the_requested_minor() {
    let (spm, memory) = boot();
    let service = spawn_echo(spm.clone());
    let client = Client::new(spm, memory, NSPE_ID, CTRL);

    assert_eq!(
        client.connect(ECHO_SID, ECHO_VERSION + 1).err(),
        Some(ClientError::Refused),
        "a minor above the published version is refused"
    );

    // Let the service observe one real connection so it can retire.
    let handle = client.connect(ECHO_SID, ECHO_VERSION).unwrap();
    client.close(handle).unwrap();
    service.join().unwrap();
}

#[test]
fn strict_policy_requires_the_exact_minor() {
    let (spm, memory) = boot();
    memory.map_region(0x400, 0x100, 1);

    // The vault partition serves one connect/close pair.
    let vault = {
        let spm = spm.clone();
        thread::spawn(move || {
            let server = spm.server_api(2);
            let mut remaining = 2;
            while remaining > 0 {
                if server.wait_any(Wait::Timeout(Duration::from_secs(5))).is_none() {
                    panic!("vault service starved");
                }
                let msg = match server.get(Signals::service(0)) {
                    Ok(msg) => msg,
                    Err(Fault::NoMessage) => continue,
                    Err(fault) => panic!("vault dispatch failed: {fault}"),
                };
                match msg.kind {
                    MsgKind::Connect => server.reply(msg.handle, status::CONNECTION_ACCEPTED),
                    MsgKind::Close => server.reply(msg.handle, status::SUCCESS),
                    MsgKind::Call => server.reply(msg.handle, status::SUCCESS),
                }
                .unwrap();
                remaining -= 1;
            }
        })
    };

    // The echo partition is the authorized secure client of the vault.
    let client = Client::new(spm, memory, 1, 0x400);
    assert_eq!(
        client.connect(VAULT_SID, VAULT_VERSION + 1).err(),
        Some(ClientError::Refused),
        "strict policy admits only the exact minor"
    );
    let handle = client.connect(VAULT_SID, VAULT_VERSION).unwrap();
    client.close(handle).unwrap();
    vault.join().unwrap();
}

#[test]
fn nonsecure_side_cannot_reach_the_vault() {
    let (spm, memory) = boot();
    let client = Client::new(spm, memory, NSPE_ID, CTRL);
    assert_eq!(client.version(VAULT_SID), status::VERSION_NONE);
    assert_eq!(client.connect(VAULT_SID, VAULT_VERSION).err(), Some(ClientError::Refused));
}

#[test]
fn close_null_succeeds_without_a_service() {
    let (spm, memory) = boot();
    let client = Client::new(spm, memory, NSPE_ID, CTRL);
    client.close(bastion_abi::Handle::NULL).unwrap();
}

#[test]
fn dropped_connection_fails_soft_until_closed() {
    let (spm, memory) = boot();
    let service = spawn_echo(spm.clone());
    let client = Client::new(spm, memory.clone(), NSPE_ID, CTRL);

    let handle = client.connect(ECHO_SID, ECHO_VERSION).unwrap();
    memory.poke(IN, b"drop");
    let in_vec = [VecDesc { base: IN, len: 4 }];
    assert_eq!(client.call(handle, &in_vec, &[]).err(), Some(ClientError::Dropped));

    // Later calls fail soft without reaching the service.
    memory.poke(IN, b"more");
    assert_eq!(client.call(handle, &in_vec, &[]).err(), Some(ClientError::Dropped));

    // Disconnecting a dropped connection still works and frees the slot.
    client.close(handle).unwrap();
    service.join().unwrap();
}
