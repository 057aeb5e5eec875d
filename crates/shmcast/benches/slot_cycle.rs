// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Slot cycle benchmarks at the logic layer: publish, consume, return,
//! reclaim — the full zero-copy path minus the side channel.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use shmcast::logic::{LogicClient, LogicServer};
use shmcast::mem::region_name;
use shmcast::queue::IndexQueue;
use shmcast::slot::{SlotManager, SlotPool};
use shmcast::{Group, QueueConfig, SlotPoolConfig};

struct Rig {
    server: LogicServer,
    client: LogicClient,
    _pool: SlotPool,
    _client_pool: SlotPool,
}

fn rig() -> Rig {
    let group = Group::from_raw(0xBE7C);
    let cfg = SlotPoolConfig {
        slot_count: 16,
        slot_size: 4096,
        slot_align: 64,
        payload_size: 4096,
        payload_align: 8,
    };
    let queue_cfg = QueueConfig::for_slot_count(cfg.slot_count);

    let pool =
        SlotPool::create(&region_name(group, "bench_pool"), group, cfg).expect("pool failed");
    let available = IndexQueue::create(&region_name(group, "bench_avq"), queue_cfg)
        .expect("available failed");
    let free =
        IndexQueue::create(&region_name(group, "bench_frq"), queue_cfg).expect("free failed");

    let client_pool = SlotPool::attach(&pool.exchange_handle(), group, cfg).expect("attach failed");
    let available_rx =
        IndexQueue::attach(&available.exchange_handle(), queue_cfg).expect("attach failed");
    let free_rx = IndexQueue::attach(&free.exchange_handle(), queue_cfg).expect("attach failed");

    let mut server = LogicServer::new(group, SlotManager::new(group, pool.writable_slots()), 1, 8);
    let class = server.create_class(cfg.slot_count);
    server
        .register_receiver(class, available, free_rx)
        .expect("register failed");

    let client = LogicClient::new(
        group,
        SlotManager::new(group, client_pool.readable_slots()),
        available_rx,
        free,
    );

    Rig {
        server,
        client,
        _pool: pool,
        _client_pool: client_pool,
    }
}

fn bench_full_cycle(c: &mut Criterion) {
    let mut rig = rig();
    let payload = [0x5Au8; 256];

    c.bench_function("slot_cycle/publish_consume_return", |b| {
        b.iter(|| {
            let token = rig.server.acquire_slot().expect("no free slot");
            rig.server.slot_mut(&token).bytes_mut()[..256].copy_from_slice(&payload);
            let report = rig.server.send_slot(token);
            black_box(&report);

            let token = rig
                .client
                .receive_slot()
                .expect("receive failed")
                .expect("slot expected");
            black_box(rig.client.access(&token)[0]);
            rig.client.release_slot(token).expect("release failed");

            black_box(rig.server.reclaim_slots());
        });
    });
}

fn bench_publish_only(c: &mut Criterion) {
    let mut rig = rig();

    c.bench_function("slot_cycle/acquire_send", |b| {
        b.iter(|| {
            let token = rig.server.acquire_slot().expect("no free slot");
            black_box(rig.server.send_slot(token));
            // Drain so the pool never exhausts across iterations.
            while let Ok(Some(token)) = rig.client.receive_slot() {
                rig.client.release_slot(token).expect("release failed");
            }
            rig.server.reclaim_slots();
        });
    });
}

criterion_group!(benches, bench_full_cycle, bench_publish_only);
criterion_main!(benches);
