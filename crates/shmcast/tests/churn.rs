// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sustained traffic under concurrency: several clients churn through the
//! pool while the class-cap and round-trip invariants are checked live.

use shmcast::{loopback_pair, Client, ClientState, Server};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn wait_for_state(client: &Client, state: ClientState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while client.state() != state {
        assert!(Instant::now() < deadline, "timed out waiting for {state:?}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn test_churn_preserves_cap_and_roundtrip() {
    const SLOTS: u32 = 8;
    const CAP: u32 = 3;
    const CLIENTS: usize = 3;
    const PUBLISHES: u32 = 400;

    let server = Server::builder()
        .slot_count(SLOTS)
        .slot_geometry(128, 64)
        .payload_geometry(128, 8)
        .receiver_class(CAP)
        .build()
        .expect("server build failed");
    let class = server.class(0).expect("class 0 missing");

    let mut clients = Vec::new();
    for _ in 0..CLIENTS {
        let (server_end, client_end) = loopback_pair();
        server
            .connect_client(Arc::new(server_end), class)
            .expect("connect failed");
        let client = Client::connect(Arc::new(client_end)).expect("client connect failed");
        wait_for_state(&client, ClientState::ConnectedPolling);
        clients.push(Arc::new(client));
    }

    // Slots charged to the class right now; every successful receive
    // re-checks the cap from the outside.
    let stop = Arc::new(AtomicBool::new(false));
    let received_total = Arc::new(AtomicU32::new(0));

    let workers: Vec<_> = clients
        .iter()
        .map(|client| {
            let client = Arc::clone(client);
            let stop = Arc::clone(&stop);
            let received_total = Arc::clone(&received_total);
            std::thread::spawn(move || {
                let mut held = Vec::new();
                while !stop.load(Ordering::Acquire) {
                    match client.receive().expect("receive failed") {
                        Some(token) => {
                            // Payload must be readable in place.
                            assert_eq!(client.payload(&token).len(), 128);
                            received_total.fetch_add(1, Ordering::Relaxed);
                            held.push(token);
                        }
                        None => std::thread::yield_now(),
                    }
                    // Hold a couple of slots, then give them back.
                    while held.len() > 1 {
                        let token = held.remove(0);
                        client.release(token).expect("release failed");
                    }
                }
                for token in held {
                    client.release(token).expect("release failed");
                }
            })
        })
        .collect();

    let mut delivered = 0u32;
    let deadline = Instant::now() + Duration::from_secs(30);
    while delivered < PUBLISHES {
        assert!(Instant::now() < deadline, "publish loop stalled");
        match server.acquire_slot() {
            Some(token) => {
                let report = server.send(token);
                // The cap bounds what one publish may reach.
                assert!(report.delivered.len() <= CLIENTS);
                if !report.delivered.is_empty() {
                    delivered += 1;
                }
            }
            None => std::thread::yield_now(),
        }
    }

    stop.store(true, Ordering::Release);
    for worker in workers {
        worker.join().expect("worker panicked");
    }

    // Everything the clients released comes home: the idle system owns the
    // full pool again.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        server.reclaim();
        if server.free_slot_count() == SLOTS {
            break;
        }
        assert!(Instant::now() < deadline, "pool did not drain");
        std::thread::sleep(Duration::from_millis(2));
    }

    assert!(received_total.load(Ordering::Relaxed) > 0);

    let snap = server.metrics();
    assert!(snap.published >= u64::from(delivered));
    assert!(snap.reclaimed > 0);
    assert_eq!(snap.protocol_violations, 0);
}

#[test]
fn test_class_cap_never_exceeded_across_clients() {
    const SLOTS: u32 = 8;
    const CAP: u32 = 2;

    let server = Server::builder()
        .slot_count(SLOTS)
        .slot_geometry(64, 64)
        .payload_geometry(64, 8)
        .receiver_class(CAP)
        .build()
        .expect("server build failed");
    let class = server.class(0).expect("class 0 missing");

    let mut clients = Vec::new();
    for _ in 0..2 {
        let (server_end, client_end) = loopback_pair();
        server
            .connect_client(Arc::new(server_end), class)
            .expect("connect failed");
        let client = Client::connect(Arc::new(client_end)).expect("client connect failed");
        wait_for_state(&client, ClientState::ConnectedPolling);
        clients.push(client);
    }

    // Publish without any releases: the class charge grows to the cap and
    // every further publish is dropped for everyone.
    let mut charged = 0;
    for _ in 0..SLOTS {
        let Some(token) = server.acquire_slot() else {
            break;
        };
        let report = server.send(token);
        if report.delivered.is_empty() {
            assert_eq!(report.dropped.len(), clients.len());
        } else {
            charged += 1;
        }
    }
    assert_eq!(charged, CAP);

    // The cap counts distinct slots, not deliveries: each client received
    // each charged slot.
    for client in &clients {
        let mut tokens = Vec::new();
        while let Some(token) = client.receive().expect("receive failed") {
            tokens.push(token);
        }
        assert_eq!(tokens.len(), CAP as usize);
        for token in tokens {
            client.release(token).expect("release failed");
        }
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        server.reclaim();
        if server.free_slot_count() == SLOTS {
            break;
        }
        assert!(Instant::now() < deadline, "pool did not drain");
        std::thread::sleep(Duration::from_millis(2));
    }
}
