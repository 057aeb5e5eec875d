// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publish/subscribe over a Unix socket side channel.
//!
//! One thread plays the server, one the client; in a real deployment the
//! two ends of the socket live in different processes and the payload
//! bytes still never get copied across.
//!
//! Run with: `cargo run --example uds_pubsub`

use shmcast::{Client, ClientState, Server, UdsChannel};
use std::sync::Arc;
use std::time::{Duration, Instant};

const MESSAGES: u32 = 32;

fn main() -> shmcast::Result<()> {
    let server = Server::builder()
        .slot_count(8)
        .payload_geometry(256, 8)
        .receiver_class(4)
        .build()?;
    let class = server.class(0).expect("class 0 exists");

    let (server_end, client_end) = UdsChannel::pair()?;
    server.connect_client(Arc::new(server_end), class)?;
    let client = Client::connect(Arc::new(client_end))?;

    wait_until("handshake", || client.state() == ClientState::ConnectedPolling);

    let consumer = std::thread::spawn(move || -> shmcast::Result<u32> {
        let mut seen = 0;
        let deadline = Instant::now() + Duration::from_secs(10);
        while seen < MESSAGES && Instant::now() < deadline {
            match client.receive()? {
                Some(token) => {
                    let payload = client.payload(&token);
                    let seq = u32::from_le_bytes(payload[..4].try_into().unwrap());
                    println!("client: slot {} carries message #{seq}", token.slot().index());
                    drop(payload);
                    client.release(token)?;
                    seen += 1;
                }
                None => std::thread::sleep(Duration::from_millis(1)),
            }
        }
        client.disconnect()?;
        Ok(seen)
    });

    let mut published = 0;
    let deadline = Instant::now() + Duration::from_secs(10);
    while published < MESSAGES && Instant::now() < deadline {
        match server.acquire_slot() {
            Some(token) => {
                let mut payload = server.payload_mut(&token);
                payload[..4].copy_from_slice(&published.to_le_bytes());
                drop(payload);
                let report = server.send(token);
                if report.delivered.is_empty() {
                    // Class cap reached; the slot went straight back.
                    std::thread::sleep(Duration::from_millis(1));
                } else {
                    published += 1;
                }
            }
            None => std::thread::sleep(Duration::from_millis(1)),
        }
    }

    let seen = consumer.join().expect("consumer panicked")?;
    let snap = server.metrics();
    println!(
        "server: published {} (client saw {seen}), dropped {} on class cap, reclaimed {}",
        snap.published, snap.dropped_class_limit, snap.reclaimed
    );
    Ok(())
}

fn wait_until(what: &str, mut probe: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !probe() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}
