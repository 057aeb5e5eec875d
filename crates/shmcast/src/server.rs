// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server facade: slot pool owner, one gate state machine per client.
//!
//! # Architecture
//!
//! ```text
//! user threads            reactor threads (one per side channel)
//!      |                           |
//!      v                           v
//! +---------------------------------------------+
//! |            instance mutex (ServerCore)       |
//! |  LogicServer | SlotPool | gates[] | classes  |
//! +---------------------------------------------+
//! ```
//!
//! All state sits behind one mutex; facade methods and reactor callbacks
//! hold it for their whole body. Every operation inside is non-blocking,
//! so the mutex is the only wait point.
//!
//! # Gate state machine (per connected client)
//!
//! ```text
//! AwaitingConnectionAck --ConnectionAck--> Connected
//!    |                                       |  \
//!    |                               Shutdown|   \peer close w/o Shutdown,
//!    |anything else /                        v    \crash, malformed
//!    |channel error                 DisconnectedRemote   --> Corrupted
//!    +----------------> Corrupted
//! user disconnect_client from any state -> gate removed
//! ```
//!
//! After a publish the server pokes every delivered client that asked for
//! notifications (`StartListening`); wake-ups are lossy hints and a dropped
//! one is ignored. A client notification in turn triggers a reclaim pass.

use crate::config::{QueueConfig, SlotPoolConfig};
use crate::error::{Error, Result};
use crate::handle::{ClassHandle, Group, ReceiverHandle, SlotHandle};
use crate::logic::{DropReason, LogicServer, SendReport, SlotToken};
use crate::mem::{region_name, MemoryExchangeHandle};
use crate::metrics::{ChannelMetrics, ChannelMetricsSnapshot};
use crate::protocol::{HandlePart, Message};
use crate::queue::IndexQueue;
use crate::side_channel::{ChannelEvent, SideChannel};
use crate::slot::{SlotManager, SlotPool};
use parking_lot::{Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Lifecycle of one client gate as the server sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// `ConnectionRequest` sent, waiting for the client's answer
    AwaitingConnectionAck,
    /// Handshake complete; slots flow
    Connected,
    /// Client announced shutdown; reclaim still works, sends do not
    DisconnectedRemote,
    /// Protocol violation or channel failure; only disconnect remains
    Corrupted,
}

/// Identifies one client connection of one server.
///
/// Carries a connection sequence number so a stale id never aliases a
/// later client that reuses the same gate slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId {
    slot: u32,
    seq: u64,
}

struct ClientGate {
    seq: u64,
    channel: Arc<dyn SideChannel>,
    state: GateState,
    class: ClassHandle,
    receiver: Option<ReceiverHandle>,
    /// Producer end of the available queue, parked until registration
    pending_available: Option<IndexQueue>,
    listening: bool,
}

struct ServerCore {
    group: Group,
    pool_cfg: SlotPoolConfig,
    server_queue_cfg: QueueConfig,
    /// Keeps the pool region mapped for the server's lifetime
    _pool: SlotPool,
    pool_handle: MemoryExchangeHandle,
    logic: LogicServer,
    classes: Vec<ClassHandle>,
    gates: Vec<Option<ClientGate>>,
    next_seq: u64,
    accepting: bool,
}

struct ServerInner {
    core: Mutex<ServerCore>,
    metrics: ChannelMetrics,
}

/// Serving side of a channel: owns the pool, publishes slots to clients.
pub struct Server {
    inner: Arc<ServerInner>,
}

/// Configures and builds a [`Server`].
pub struct ServerBuilder {
    pool: SlotPoolConfig,
    class_caps: Vec<u32>,
    max_clients: u32,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            pool: SlotPoolConfig {
                slot_count: 16,
                slot_size: 4096,
                slot_align: 64,
                payload_size: 4096,
                payload_align: 8,
            },
            class_caps: Vec::new(),
            max_clients: 8,
        }
    }
}

impl ServerBuilder {
    /// Number of slots in the pool
    #[must_use]
    pub fn slot_count(mut self, count: u32) -> Self {
        self.pool.slot_count = count;
        self
    }

    /// Full slot size and alignment
    #[must_use]
    pub fn slot_geometry(mut self, size: u32, align: u32) -> Self {
        self.pool.slot_size = size;
        self.pool.slot_align = align;
        self
    }

    /// User-visible payload size and alignment within each slot
    #[must_use]
    pub fn payload_geometry(mut self, size: u32, align: u32) -> Self {
        self.pool.payload_size = size;
        self.pool.payload_align = align;
        self
    }

    /// Append a receiver class with an aggregate borrow cap.
    ///
    /// Classes are fixed after `build`; the n-th call creates the class
    /// returned by [`Server::class`]`(n)`.
    #[must_use]
    pub fn receiver_class(mut self, cap: u32) -> Self {
        self.class_caps.push(cap);
        self
    }

    /// Maximum simultaneously connected clients (at most 63)
    #[must_use]
    pub fn max_clients(mut self, count: u32) -> Self {
        self.max_clients = count;
        self
    }

    /// Create the pool and the bookkeeping engine.
    ///
    /// Without an explicit class, one class capped at the pool size is
    /// created so every client can borrow freely.
    pub fn build(self) -> Result<Server> {
        self.pool.validate()?;
        if self.max_clients == 0 || self.max_clients > crate::bitmap::MAX_RECEIVERS {
            return Err(Error::UnexpectedState("client count out of range"));
        }

        let group = Group::next();
        let pool = SlotPool::create(&region_name(group, "pool"), group, self.pool)?;
        let pool_handle = pool.exchange_handle();

        let caps = if self.class_caps.is_empty() {
            vec![self.pool.slot_count]
        } else {
            self.class_caps
        };

        let slots = SlotManager::new(group, pool.writable_slots());
        let mut logic = LogicServer::new(group, slots, caps.len() as u32, self.max_clients);
        let classes: Vec<ClassHandle> = caps.iter().map(|&cap| logic.create_class(cap)).collect();

        log::debug!(
            "[Server] built {group}: {} slots, {} classes, up to {} clients",
            self.pool.slot_count,
            classes.len(),
            self.max_clients
        );

        Ok(Server {
            inner: Arc::new(ServerInner {
                core: Mutex::new(ServerCore {
                    group,
                    pool_cfg: self.pool,
                    server_queue_cfg: QueueConfig::for_slot_count(self.pool.slot_count),
                    _pool: pool,
                    pool_handle,
                    logic,
                    classes,
                    gates: (0..self.max_clients).map(|_| None).collect(),
                    next_seq: 0,
                    accepting: true,
                }),
                metrics: ChannelMetrics::new(),
            }),
        })
    }
}

impl Server {
    /// Start configuring a server
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Handle of the n-th class declared at build time
    #[must_use]
    pub fn class(&self, index: usize) -> Option<ClassHandle> {
        self.inner.core.lock().classes.get(index).copied()
    }

    /// Group identifier of this instance
    #[must_use]
    pub fn group(&self) -> Group {
        self.inner.core.lock().group
    }

    /// Begin the handshake with one client over its side channel.
    ///
    /// Sends both `ConnectionRequest` parts and arms reception; the gate
    /// reaches `Connected` asynchronously when the `ConnectionAck` arrives.
    pub fn connect_client(
        &self,
        channel: Arc<dyn SideChannel>,
        class: ClassHandle,
    ) -> Result<ClientId> {
        let mut core = self.inner.core.lock();
        if !core.accepting {
            return Err(Error::UnexpectedState("connect_client after shutdown"));
        }
        if !core.classes.contains(&class) {
            return Err(Error::UnexpectedState("unknown receiver class"));
        }
        let slot = core
            .gates
            .iter()
            .position(Option::is_none)
            .ok_or(Error::UnexpectedState("client capacity exhausted"))?;

        let seq = core.next_seq;
        core.next_seq += 1;
        let id = ClientId {
            slot: slot as u32,
            seq,
        };

        let available = IndexQueue::create(
            &region_name(core.group, &format!("c{seq}_avq")),
            core.server_queue_cfg,
        )?;
        let available_handle = available.exchange_handle();

        core.gates[slot] = Some(ClientGate {
            seq,
            channel: Arc::clone(&channel),
            state: GateState::AwaitingConnectionAck,
            class,
            receiver: None,
            pending_available: Some(available),
            listening: false,
        });

        let result = Self::arm_channel(&self.inner, &mut core, id, &channel);
        if let Err(e) = result {
            core.gates[slot] = None;
            channel.close();
            return Err(e);
        }

        log::debug!("[Server] client {id:?} handshake started");
        Ok(id)
    }

    fn arm_channel(
        inner: &Arc<ServerInner>,
        core: &mut ServerCore,
        id: ClientId,
        channel: &Arc<dyn SideChannel>,
    ) -> Result<()> {
        let weak = Arc::downgrade(inner);
        channel.start_message_reception(Box::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                handle_gate_event(&inner, id, event);
            }
        }))?;

        // A client wake-up means "free queue has news": run a reclaim pass.
        let weak = Arc::downgrade(inner);
        channel.register_on_notification(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                let freed = inner.core.lock().logic.reclaim_slots();
                inner.metrics.add_reclaimed(freed.len() as u64);
                if !freed.is_empty() {
                    log::debug!("[Server] reclaimed {} slots on wake-up", freed.len());
                }
            }
        }))?;

        let request = |part| Message::ConnectionRequest {
            part,
            group: core.group.as_raw(),
            pool: core.pool_cfg,
            server_queue: core.server_queue_cfg,
        };
        channel.send(
            &request(HandlePart::PoolMemory).to_vec(),
            Some(core.pool_handle.clone()),
        )?;
        let queue_handle = core.gates[id.slot as usize]
            .as_ref()
            .and_then(|gate| gate.pending_available.as_ref())
            .map(IndexQueue::exchange_handle);
        channel.send(&request(HandlePart::QueueMemory).to_vec(), queue_handle)?;
        Ok(())
    }

    /// Orderly teardown of one client from any gate state.
    ///
    /// Sends `Shutdown` when still connected, reclaims every slot the
    /// client holds and removes its receiver.
    pub fn disconnect_client(&self, id: ClientId) -> Result<()> {
        let mut core = self.inner.core.lock();
        let gate_slot = id.slot as usize;
        let current = core.gates[gate_slot]
            .as_ref()
            .is_some_and(|gate| gate.seq == id.seq);
        if !current {
            return Err(Error::UnexpectedState("disconnect of unknown client"));
        }
        let Some(gate) = core.gates[gate_slot].take() else {
            return Err(Error::UnexpectedState("disconnect of unknown client"));
        };

        if gate.state == GateState::Connected {
            if let Err(e) = gate.channel.send(&Message::Shutdown.to_vec(), None) {
                log::warn!("[Server] shutdown notice to {id:?} failed: {e}");
            }
        }

        // Drain orderly returns first, then free whatever is still held.
        let mut reclaimed = core.logic.reclaim_slots().len();
        if let Some(receiver) = gate.receiver {
            reclaimed += core.logic.unregister_receiver(receiver).len();
        }
        self.inner.metrics.add_reclaimed(reclaimed as u64);
        gate.channel.close();
        log::debug!("[Server] client {id:?} disconnected");
        Ok(())
    }

    /// Disconnect every client and refuse further connects.
    pub fn shutdown(&self) {
        let ids: Vec<ClientId> = {
            let mut core = self.inner.core.lock();
            core.accepting = false;
            core.gates
                .iter()
                .enumerate()
                .filter_map(|(slot, gate)| {
                    gate.as_ref().map(|gate| ClientId {
                        slot: slot as u32,
                        seq: gate.seq,
                    })
                })
                .collect()
        };
        for id in ids {
            let _ = self.disconnect_client(id);
        }
    }

    /// Claim a free slot for writing.
    ///
    /// Runs one reclaim pass before giving up, so freshly returned slots
    /// are immediately reusable.
    pub fn acquire_slot(&self) -> Option<SlotToken> {
        let mut core = self.inner.core.lock();
        if !core.accepting {
            return None;
        }
        if let Some(token) = core.logic.acquire_slot() {
            return Some(token);
        }
        let freed = core.logic.reclaim_slots();
        self.inner.metrics.add_reclaimed(freed.len() as u64);
        core.logic.acquire_slot()
    }

    /// Writable view of an acquired slot's payload.
    ///
    /// The guard holds the instance mutex; keep it short-lived.
    pub fn payload_mut(&self, token: &SlotToken) -> PayloadMut<'_> {
        let mut core = self.inner.core.lock();
        let bytes = core.logic.slot_mut(token).bytes_mut();
        let ptr = bytes.as_mut_ptr();
        let len = bytes.len();
        PayloadMut {
            _guard: core,
            ptr,
            len,
        }
    }

    /// Publish the slot to every connected receiver in registration order,
    /// then poke the listeners among them.
    pub fn send(&self, token: SlotToken) -> SendReport {
        let (report, to_notify) = {
            let mut core = self.inner.core.lock();
            let report = core.logic.send_slot(token);
            let to_notify: Vec<Arc<dyn SideChannel>> = core
                .gates
                .iter()
                .flatten()
                .filter(|gate| {
                    gate.state == GateState::Connected
                        && gate.listening
                        && gate
                            .receiver
                            .is_some_and(|r| report.delivered.contains(&r))
                })
                .map(|gate| Arc::clone(&gate.channel))
                .collect();
            (report, to_notify)
        };

        self.inner.metrics.add_published(report.delivered.len() as u64);
        for (_, reason) in &report.dropped {
            match reason {
                DropReason::ClassLimited => self.inner.metrics.inc_dropped_class_limit(),
                DropReason::QueueFull => self.inner.metrics.inc_dropped_queue_full(),
            }
        }

        for channel in to_notify {
            match channel.notify() {
                Ok(()) => self.inner.metrics.inc_wakeups_sent(),
                Err(Error::DroppedNotification) => self.inner.metrics.inc_wakeups_dropped(),
                Err(e) => log::debug!("[Server] wake-up failed: {e}"),
            }
        }
        report
    }

    /// Drain every client's free queue; returns the slots that became free.
    pub fn reclaim(&self) -> Vec<SlotHandle> {
        let freed = self.inner.core.lock().logic.reclaim_slots();
        self.inner.metrics.add_reclaimed(freed.len() as u64);
        freed
    }

    /// Counter snapshot for this instance
    #[must_use]
    pub fn metrics(&self) -> ChannelMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Gate state of a client, if the id is still current
    #[must_use]
    pub fn client_state(&self, id: ClientId) -> Option<GateState> {
        let core = self.inner.core.lock();
        core.gates[id.slot as usize]
            .as_ref()
            .filter(|gate| gate.seq == id.seq)
            .map(|gate| gate.state)
    }

    /// Number of slots currently completely free
    #[must_use]
    pub fn free_slot_count(&self) -> u32 {
        self.inner.core.lock().logic.free_slot_count()
    }

    /// Number of slots in the pool
    #[must_use]
    pub fn slot_count(&self) -> u32 {
        self.inner.core.lock().logic.slot_count()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Reactor-side dispatch for one gate. Runs with the instance mutex held;
/// the server has no user callbacks, so nothing escapes the lock.
fn handle_gate_event(inner: &Arc<ServerInner>, id: ClientId, event: ChannelEvent) {
    let mut core = inner.core.lock();
    let gate_slot = id.slot as usize;
    let Some(gate) = core.gates[gate_slot].as_ref().filter(|gate| gate.seq == id.seq) else {
        return; // stale event for a gate that is already gone
    };
    let state = gate.state;

    match event {
        ChannelEvent::Message { bytes, handle } => match Message::decode(&bytes) {
            Ok(Message::ConnectionAck { client_queue })
                if state == GateState::AwaitingConnectionAck =>
            {
                if let Err(e) = complete_handshake(&mut core, gate_slot, client_queue, handle) {
                    if matches!(e, Error::Protocol(_)) {
                        inner.metrics.inc_protocol_violations();
                    }
                    corrupt_gate(&mut core, gate_slot, &e);
                }
            }
            Ok(Message::StartListening) if state == GateState::Connected => {
                set_listening(&mut core, gate_slot, true);
            }
            Ok(Message::StopListening) if state == GateState::Connected => {
                set_listening(&mut core, gate_slot, false);
            }
            Ok(Message::Shutdown) if state == GateState::Connected => {
                log::debug!("[Server] client {id:?} announced shutdown");
                if let Some(gate) = core.gates[gate_slot].as_mut() {
                    gate.state = GateState::DisconnectedRemote;
                    gate.listening = false;
                }
                if let Some(receiver) = core.gates[gate_slot].as_ref().and_then(|g| g.receiver) {
                    core.logic.mute_receiver(receiver);
                }
            }
            Ok(other) => {
                inner.metrics.inc_protocol_violations();
                corrupt_gate(
                    &mut core,
                    gate_slot,
                    &Error::Protocol(format!("unexpected {other:?} in state {state:?}")),
                );
            }
            Err(e) => {
                inner.metrics.inc_protocol_violations();
                corrupt_gate(&mut core, gate_slot, &e);
            }
        },
        ChannelEvent::PeerDisconnected => {
            // Orderly only after the peer said Shutdown first.
            if state != GateState::DisconnectedRemote {
                corrupt_gate(&mut core, gate_slot, &Error::PeerDisconnected);
            }
        }
        ChannelEvent::PeerCrashed => corrupt_gate(&mut core, gate_slot, &Error::PeerCrashed),
    }
}

/// ConnectionAck arrived: attach the client's free queue, register the
/// receiver and confirm with `AckQueueInitialization`.
fn complete_handshake(
    core: &mut ServerCore,
    gate_slot: usize,
    client_queue: QueueConfig,
    handle: Option<MemoryExchangeHandle>,
) -> Result<()> {
    let token =
        handle.ok_or_else(|| Error::Protocol("connection ack without queue handle".into()))?;
    if client_queue.capacity < core.pool_cfg.slot_count {
        return Err(Error::Protocol(format!(
            "client queue capacity {} below pool size {}",
            client_queue.capacity, core.pool_cfg.slot_count
        )));
    }
    let free = IndexQueue::attach(&token, client_queue)?;

    let (available, class, channel) = {
        let Some(gate) = core.gates[gate_slot].as_mut() else {
            return Err(Error::Protocol("connection ack for a removed gate".into()));
        };
        let available = gate
            .pending_available
            .take()
            .ok_or_else(|| Error::Protocol("duplicate connection ack".into()))?;
        (available, gate.class, Arc::clone(&gate.channel))
    };

    let receiver = core.logic.register_receiver(class, available, free)?;
    channel.send(&Message::AckQueueInitialization.to_vec(), None)?;

    if let Some(gate) = core.gates[gate_slot].as_mut() {
        gate.receiver = Some(receiver);
        gate.state = GateState::Connected;
        log::debug!("[Server] gate {gate_slot} connected as {receiver:?}");
    }
    Ok(())
}

fn set_listening(core: &mut ServerCore, gate_slot: usize, listening: bool) {
    if let Some(gate) = core.gates[gate_slot].as_mut() {
        gate.listening = listening;
    }
}

fn corrupt_gate(core: &mut ServerCore, gate_slot: usize, error: &Error) {
    if let Some(gate) = core.gates[gate_slot].as_mut() {
        log::warn!("[Server] gate {gate_slot} corrupted: {error}");
        gate.state = GateState::Corrupted;
        gate.listening = false;
        if let Some(receiver) = gate.receiver {
            core.logic.mute_receiver(receiver);
        }
    }
}

/// Writable payload view; releases the instance mutex on drop.
pub struct PayloadMut<'a> {
    _guard: MutexGuard<'a, ServerCore>,
    ptr: *mut u8,
    len: usize,
}

impl Deref for PayloadMut<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr/len were taken from the slot descriptor while the
        // guard was (and still is) held; the pool mapping outlives the
        // server core the guard protects.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl DerefMut for PayloadMut<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; the token that produced this view proves the
        // server holds the slot, so no client reads these bytes.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults_one_class() {
        let server = Server::builder()
            .slot_count(4)
            .slot_geometry(64, 64)
            .payload_geometry(48, 8)
            .build()
            .expect("build failed");
        assert!(server.class(0).is_some());
        assert!(server.class(1).is_none());
        assert_eq!(server.free_slot_count(), 4);
    }

    #[test]
    fn test_builder_rejects_bad_geometry() {
        let result = Server::builder().slot_geometry(0, 64).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_acquire_exhausts_pool() {
        let server = Server::builder()
            .slot_count(2)
            .slot_geometry(64, 64)
            .payload_geometry(64, 8)
            .build()
            .expect("build failed");

        let t0 = server.acquire_slot().expect("slot 0");
        let _t1 = server.acquire_slot().expect("slot 1");
        assert!(server.acquire_slot().is_none());

        // Without clients, send returns the slot to the pool.
        let report = server.send(t0);
        assert!(report.delivered.is_empty());
        assert!(server.acquire_slot().is_some());
    }

    #[test]
    fn test_payload_guard_writes_stick() {
        let server = Server::builder()
            .slot_count(2)
            .slot_geometry(64, 64)
            .payload_geometry(64, 8)
            .build()
            .expect("build failed");

        let token = server.acquire_slot().expect("slot");
        {
            let mut payload = server.payload_mut(&token);
            payload[0] = 0xAB;
            payload[63] = 0xCD;
        }
        let payload = server.payload_mut(&token);
        assert_eq!(payload[0], 0xAB);
        assert_eq!(payload[63], 0xCD);
        drop(payload);
        let _ = server.send(token);
    }

    #[test]
    fn test_connect_rejects_foreign_class() {
        let server_a = Server::builder().slot_count(2).build().expect("build a");
        let server_b = Server::builder().slot_count(2).build().expect("build b");
        let (channel, _peer) = crate::side_channel::loopback::loopback_pair();

        let foreign = server_b.class(0).expect("class");
        assert!(matches!(
            server_a.connect_client(Arc::new(channel), foreign),
            Err(Error::UnexpectedState(_))
        ));
    }

    #[test]
    fn test_shutdown_stops_accepting() {
        let server = Server::builder().slot_count(2).build().expect("build");
        server.shutdown();
        assert!(server.acquire_slot().is_none());

        let class = server.class(0).expect("class");
        let (channel, _peer) = crate::side_channel::loopback::loopback_pair();
        assert!(server.connect_client(Arc::new(channel), class).is_err());
    }
}
