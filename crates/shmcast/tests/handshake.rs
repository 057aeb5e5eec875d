// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lifecycle coverage: handshake ordering, remote shutdown with pending
//! data, peer crash surfacing.

use crossbeam::channel::unbounded;
use shmcast::{
    loopback_pair, Client, ClientId, ClientState, Error, GateState, LoopbackChannel, Server,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn wait_until(what: &str, mut probe: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !probe() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

struct Rig {
    server: Server,
    client: Client,
    id: ClientId,
    server_end: Arc<LoopbackChannel>,
}

fn connected_rig(slot_count: u32, slot_size: u32, slot_align: u32) -> Rig {
    let server = Server::builder()
        .slot_count(slot_count)
        .slot_geometry(slot_size, slot_align.max(8))
        .payload_geometry(slot_size, 8)
        .receiver_class(slot_count)
        .build()
        .expect("server build failed");
    let class = server.class(0).expect("class 0 missing");

    let (server_end, client_end) = loopback_pair();
    let server_end = Arc::new(server_end);
    let id = server
        .connect_client(server_end.clone(), class)
        .expect("connect_client failed");
    let client = Client::connect(Arc::new(client_end)).expect("client connect failed");

    wait_until("handshake", || client.state() == ClientState::ConnectedPolling);
    Rig {
        server,
        client,
        id,
        server_end,
    }
}

#[test]
fn test_handshake_reaches_connected_on_both_sides() {
    let rig = connected_rig(2, 64, 8);
    assert_eq!(rig.client.state(), ClientState::ConnectedPolling);
    assert_eq!(rig.server.client_state(rig.id), Some(GateState::Connected));
}

#[test]
fn test_handshake_transitions_observed_by_callback() {
    let server = Server::builder()
        .slot_count(2)
        .slot_geometry(64, 8)
        .payload_geometry(64, 8)
        .build()
        .expect("server build failed");
    let class = server.class(0).expect("class 0 missing");
    let (server_end, client_end) = loopback_pair();

    let client = Client::connect(Arc::new(client_end)).expect("client connect failed");
    let (tx, rx) = unbounded();
    client.on_state_transition(Box::new(move |state, _error| {
        let _ = tx.send(state);
    }));

    server
        .connect_client(Arc::new(server_end), class)
        .expect("connect_client failed");

    let mut seen = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !seen.contains(&ClientState::ConnectedPolling) {
        assert!(Instant::now() < deadline, "handshake states not observed");
        if let Ok(state) = rx.recv_timeout(Duration::from_millis(100)) {
            seen.push(state);
        }
    }
    assert_eq!(
        seen,
        vec![ClientState::AwaitingQueueInit, ClientState::ConnectedPolling]
    );
}

#[test]
fn test_remote_shutdown_with_pending_data() {
    let rig = connected_rig(4, 64, 8);

    // One unreceived slot sits in the client's available queue.
    let token = rig.server.acquire_slot().expect("slot");
    rig.server.payload_mut(&token)[..3].copy_from_slice(b"bye");
    rig.server.send(token);

    // Server tears the client down; the client observes DisconnectedRemote.
    rig.server.disconnect_client(rig.id).expect("disconnect failed");
    wait_until("remote shutdown", || {
        rig.client.state() == ClientState::DisconnectedRemote
    });

    // The pending slot is still receivable and readable.
    let token = rig
        .client
        .receive()
        .expect("receive failed")
        .expect("pending slot expected");
    assert_eq!(&rig.client.payload(&token)[..3], b"bye");
    rig.client.release(token).expect("release failed");

    // After the local disconnect the instance is fully out of use.
    rig.client.disconnect().expect("disconnect failed");
    assert_eq!(rig.client.state(), ClientState::Disconnected);
    wait_until("reactor drain", || !rig.client.is_in_use());
}

#[test]
fn test_peer_crash_corrupts_and_fires_callback() {
    let rig = connected_rig(4, 64, 8);

    let (tx, rx) = unbounded();
    rig.client.on_state_transition(Box::new(move |state, error| {
        let crashed = matches!(error, Some(Error::PeerCrashed));
        let _ = tx.send((state, crashed));
    }));

    // Client had asked for wake-ups (Connected, notified flavor).
    rig.client
        .start_listening(Box::new(|| {}))
        .expect("start_listening failed");
    wait_until("listening state", || {
        rig.client.state() == ClientState::ConnectedNotified
    });

    // The server process vanishes without a Shutdown.
    rig.server_end.inject_crash();

    // The listening transition may sit in front of the corruption report.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let (state, crashed) = rx
            .recv_timeout(remaining)
            .expect("no corruption transition observed");
        if state == ClientState::Corrupted {
            assert!(crashed, "error should be PeerCrashed");
            break;
        }
    }

    // Receive now refuses per the corrupted-state rules.
    assert!(matches!(rig.client.receive(), Err(Error::Protocol(_))));

    // Disconnect still reaches the terminal state.
    rig.client.disconnect().expect("disconnect failed");
    assert_eq!(rig.client.state(), ClientState::Disconnected);
}

#[test]
fn test_client_initiated_shutdown_observed_by_server() {
    let rig = connected_rig(4, 64, 8);

    rig.client.disconnect().expect("disconnect failed");
    wait_until("server sees shutdown", || {
        rig.server.client_state(rig.id) == Some(GateState::DisconnectedRemote)
    });

    // Cleanup on the server side still works.
    rig.server.disconnect_client(rig.id).expect("disconnect failed");
    assert_eq!(rig.server.client_state(rig.id), None);
}

#[test]
fn test_listening_roundtrip_delivers_wakeups() {
    let rig = connected_rig(4, 64, 8);

    let (tx, rx) = unbounded();
    rig.client
        .start_listening(Box::new(move || {
            let _ = tx.send(());
        }))
        .expect("start_listening failed");

    // Wait until the server side has processed StartListening.
    wait_until("listening state", || {
        rig.client.state() == ClientState::ConnectedNotified
    });
    std::thread::sleep(Duration::from_millis(20));

    let token = rig.server.acquire_slot().expect("slot");
    rig.server.send(token);

    rx.recv_timeout(Duration::from_secs(5))
        .expect("wake-up not delivered");

    // Notifications are hints: poll until the slot shows up.
    wait_until("published slot", || {
        rig.client.receive().expect("receive failed").is_some()
    });

    rig.client.stop_listening().expect("stop_listening failed");
    assert_eq!(rig.client.state(), ClientState::ConnectedPolling);
}

#[test]
fn test_use_of_crashed_channel_is_contained() {
    let rig = connected_rig(2, 64, 8);

    // Crash from the client's perspective; the server gate corrupts too
    // when its own channel reports the failure, but here only the client
    // side sees an event. Server keeps serving other clients.
    rig.server_end.inject_crash();
    wait_until("corruption", || rig.client.state() == ClientState::Corrupted);

    let class = rig.server.class(0).expect("class");
    let (second_end, second_client_end) = loopback_pair();
    rig.server
        .connect_client(Arc::new(second_end), class)
        .expect("second connect failed");
    let second = Client::connect(Arc::new(second_client_end)).expect("second client failed");
    wait_until("second handshake", || {
        second.state() == ClientState::ConnectedPolling
    });
}
