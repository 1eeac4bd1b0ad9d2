// Copyright 2025 Bastion OS Contributors
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Barrier};
use std::thread;

use bastion_abi::wire::VecDesc;
use bastion_abi::status;
use bastion_client::{ClientError, RemoteClient};
use bastion_e2e::{
    boot, spawn_echo, MailboxFixture, CTRL, CTRL2, ECHO_SID, ECHO_VERSION, IN, IN2, OUT, OUT2,
    VAULT_SID,
};

#[test]
fn remote_connect_call_close_roundtrip() {
    let (spm, memory) = boot();
    let service = spawn_echo(spm.clone());
    let mailbox = MailboxFixture::start(spm, 8);
    let client = RemoteClient::new(mailbox.transport.clone(), memory.clone(), CTRL);

    assert_eq!(client.version(ECHO_SID).unwrap(), ECHO_VERSION);
    let handle = client.connect(ECHO_SID, 1).expect("relaxed policy accepts older minor");

    memory.poke(IN, b"across cores");
    let reply = client
        .call(handle, &[VecDesc { base: IN, len: 12 }], &[VecDesc { base: OUT, len: 16 }])
        .unwrap();
    assert_eq!(reply, 12);
    assert_eq!(memory.peek(OUT, 12), b"ACROSS CORES");

    client.close(handle).unwrap();
    service.join().expect("echo thread exits cleanly");
}

#[test]
fn remote_refusals_travel_back() {
    let (spm, memory) = boot();
    let mailbox = MailboxFixture::start(spm, 4);
    let client = RemoteClient::new(mailbox.transport.clone(), memory, CTRL);

    assert_eq!(
        client.connect(ECHO_SID, ECHO_VERSION + 1).err(),
        Some(ClientError::Refused)
    );
    // The vault is closed to the non-secure side entirely.
    assert_eq!(client.version(VAULT_SID).unwrap(), status::VERSION_NONE);
    assert_eq!(client.connect(VAULT_SID, 1).err(), Some(ClientError::Refused));
}

#[test]
fn concurrent_remote_clients_correlate_replies() {
    let (spm, memory) = boot();
    let service = spawn_echo(spm.clone());
    let mailbox = MailboxFixture::start(spm, 8);

    let gate = Arc::new(Barrier::new(2));
    let mut workers = Vec::new();
    for (ctrl, input, output, text) in
        [(CTRL, IN, OUT, &b"alpha"[..]), (CTRL2, IN2, OUT2, &b"bravo"[..])]
    {
        let transport = mailbox.transport.clone();
        let memory = memory.clone();
        let gate = gate.clone();
        workers.push(thread::spawn(move || {
            let client = RemoteClient::new(transport, memory.clone(), ctrl);
            let handle = client.connect(ECHO_SID, ECHO_VERSION).unwrap();
            gate.wait();

            memory.poke(input, text);
            let len = text.len() as u32;
            let reply = client
                .call(
                    handle,
                    &[VecDesc { base: input, len }],
                    &[VecDesc { base: output, len }],
                )
                .unwrap();
            assert_eq!(reply, len as i32);
            let expected: Vec<u8> = text.to_ascii_uppercase();
            assert_eq!(memory.peek(output, text.len()), expected);

            gate.wait();
            client.close(handle).unwrap();
        }));
    }
    for worker in workers {
        worker.join().expect("remote worker exits cleanly");
    }
    service.join().expect("echo thread exits cleanly");
}
