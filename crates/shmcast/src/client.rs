// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client facade: attaches the server's pool and consumes published slots.
//!
//! # Lifecycle
//!
//! ```text
//! Connecting --CR part 0+1--> (ack sent) AwaitingQueueInit
//!       AwaitingQueueInit --AckQueueInitialization--> ConnectedPolling
//!       ConnectedPolling <--start/stop listening--> ConnectedNotified
//!       Connected* --Shutdown--> DisconnectedRemote (drain allowed)
//!       any --violation/channel error--> Corrupted
//!       any except Disconnected --user disconnect--> Disconnected
//! ```
//!
//! Handshake, shutdown and error transitions arrive on the side channel's
//! reactor thread. Each transition invokes the user's `on_state_transition`
//! callback **outside** the instance mutex, so the callback may call back
//! into the client.
//!
//! In `DisconnectedRemote` the available queue may still hold published
//! slots; `receive`/`release` keep working until the user disconnects. In
//! `Corrupted` both refuse with a protocol error and only `disconnect`
//! remains.

use crate::config::{QueueConfig, SlotPoolConfig};
use crate::error::{fatal, Error, Result};
use crate::handle::Group;
use crate::logic::{LogicClient, SlotToken};
use crate::mem::{region_name, MemoryExchangeHandle};
use crate::metrics::{ChannelMetrics, ChannelMetricsSnapshot};
use crate::protocol::{HandlePart, Message};
use crate::queue::IndexQueue;
use crate::side_channel::{ChannelEvent, OnNotification, SideChannel};
use crate::slot::{SlotManager, SlotPool};
use parking_lot::{Mutex, MutexGuard};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Distinguishes free-queue regions of multiple clients in one process
static NEXT_CONN: AtomicU64 = AtomicU64::new(0);

/// Lifecycle of a client instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Waiting for both `ConnectionRequest` parts
    Connecting,
    /// Ack sent, waiting for `AckQueueInitialization`
    AwaitingQueueInit,
    /// Live; the user polls for slots
    ConnectedPolling,
    /// Live; the server pokes the notification callback after publishes
    ConnectedNotified,
    /// Server announced shutdown; pending slots may still be drained
    DisconnectedRemote,
    /// Protocol violation or channel failure; only disconnect remains
    Corrupted,
    /// Torn down by the user
    Disconnected,
}

/// State-transition callback; the error is borrowed, not owned
pub type OnStateTransition = Box<dyn FnMut(ClientState, Option<&Error>) + Send>;

/// First `ConnectionRequest` part, parked until its sibling arrives
struct PendingRequest {
    group: u64,
    pool: SlotPoolConfig,
    server_queue: QueueConfig,
    pool_handle: MemoryExchangeHandle,
}

struct ClientCore {
    channel: Arc<dyn SideChannel>,
    phase: ClientState,
    pending: Option<PendingRequest>,
    logic: Option<LogicClient>,
    /// Keeps the pool region mapped while connected
    _pool: Option<SlotPool>,
}

struct ClientInner {
    core: Mutex<ClientCore>,
    on_transition: Mutex<Option<OnStateTransition>>,
    metrics: ChannelMetrics,
}

/// Receiving side of a channel.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Arm reception on the side channel and start the handshake.
    ///
    /// The server is expected to deliver `ConnectionRequest` next; the
    /// instance reaches `ConnectedPolling` asynchronously. Register the
    /// transition callback (or poll [`Client::state`]) to observe it.
    pub fn connect(channel: Arc<dyn SideChannel>) -> Result<Self> {
        let inner = Arc::new(ClientInner {
            core: Mutex::new(ClientCore {
                channel: Arc::clone(&channel),
                phase: ClientState::Connecting,
                pending: None,
                logic: None,
                _pool: None,
            }),
            on_transition: Mutex::new(None),
            metrics: ChannelMetrics::new(),
        });

        let weak = Arc::downgrade(&inner);
        channel.start_message_reception(Box::new(move |event| {
            handle_client_event(&weak, event);
        }))?;

        Ok(Self { inner })
    }

    /// Install the state-transition callback.
    ///
    /// Invoked outside the instance mutex, so it may call back into the
    /// client. Transitions it triggers itself are not re-reported to it.
    pub fn on_state_transition(&self, callback: OnStateTransition) {
        *self.inner.on_transition.lock() = Some(callback);
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ClientState {
        self.inner.core.lock().phase
    }

    /// Pop one published slot, or `None` when nothing is pending.
    ///
    /// Allowed while connected and in `DisconnectedRemote` (draining). A
    /// peer protocol violation corrupts the instance and surfaces here.
    pub fn receive(&self) -> Result<Option<SlotToken>> {
        let mut core = self.inner.core.lock();
        check_traffic_allowed(core.phase, "receive")?;
        let Some(logic) = core.logic.as_mut() else {
            return Err(Error::UnexpectedState("receive"));
        };
        match logic.receive_slot() {
            Ok(token) => {
                if token.is_some() {
                    self.inner.metrics.inc_received();
                }
                Ok(token)
            }
            Err(e) => {
                if matches!(e, Error::Protocol(_)) {
                    self.inner.metrics.inc_protocol_violations();
                }
                core.phase = ClientState::Corrupted;
                drop(core);
                fire_transition(&self.inner, ClientState::Corrupted, Some(&e));
                Err(e)
            }
        }
    }

    /// Read-only view of a held slot's payload.
    ///
    /// The guard holds the instance mutex; keep it short-lived.
    #[must_use]
    pub fn payload(&self, token: &SlotToken) -> Payload<'_> {
        let core = self.inner.core.lock();
        let Some(logic) = core.logic.as_ref() else {
            fatal("payload access without an attached pool");
        };
        let bytes = logic.access(token);
        let ptr = bytes.as_ptr();
        let len = bytes.len();
        Payload {
            _guard: core,
            ptr,
            len,
        }
    }

    /// Return a slot to the server and hint it to reclaim.
    pub fn release(&self, token: SlotToken) -> Result<()> {
        let mut core = self.inner.core.lock();
        check_traffic_allowed(core.phase, "release")?;
        let Some(logic) = core.logic.as_mut() else {
            return Err(Error::UnexpectedState("release"));
        };
        match logic.release_slot(token) {
            Ok(()) => {
                self.inner.metrics.inc_released();
                // Pure hint; the server reclaims on demand anyway.
                match core.channel.notify() {
                    Ok(()) => self.inner.metrics.inc_wakeups_sent(),
                    Err(Error::DroppedNotification) => self.inner.metrics.inc_wakeups_dropped(),
                    Err(Error::ChannelClosed) => {}
                    Err(e) => log::debug!("[Client] release wake-up failed: {e}"),
                }
                Ok(())
            }
            Err(e) => {
                if matches!(e, Error::Protocol(_)) {
                    self.inner.metrics.inc_protocol_violations();
                }
                core.phase = ClientState::Corrupted;
                drop(core);
                fire_transition(&self.inner, ClientState::Corrupted, Some(&e));
                Err(e)
            }
        }
    }

    /// Ask the server for wake-ups after each publish.
    ///
    /// The callback fires on the reactor thread; notifications are lossy
    /// hints, so always re-poll [`Client::receive`] until empty.
    pub fn start_listening(&self, callback: OnNotification) -> Result<()> {
        let mut core = self.inner.core.lock();
        if core.phase != ClientState::ConnectedPolling {
            return Err(Error::UnexpectedState("start_listening"));
        }
        core.channel.register_on_notification(callback)?;
        if let Err(e) = core.channel.send(&Message::StartListening.to_vec(), None) {
            core.channel.deregister_on_notification();
            let e = self.corrupt_locked(core, e);
            return Err(e);
        }
        core.phase = ClientState::ConnectedNotified;
        drop(core);
        fire_transition(&self.inner, ClientState::ConnectedNotified, None);
        Ok(())
    }

    /// Stop server wake-ups and drop the notification callback.
    pub fn stop_listening(&self) -> Result<()> {
        let mut core = self.inner.core.lock();
        if core.phase != ClientState::ConnectedNotified {
            return Err(Error::UnexpectedState("stop_listening"));
        }
        core.channel.deregister_on_notification();
        if let Err(e) = core.channel.send(&Message::StopListening.to_vec(), None) {
            let e = self.corrupt_locked(core, e);
            return Err(e);
        }
        core.phase = ClientState::ConnectedPolling;
        drop(core);
        fire_transition(&self.inner, ClientState::ConnectedPolling, None);
        Ok(())
    }

    /// Tear down from any state: best-effort `Shutdown`, return every held
    /// slot through the free queue, close the channel.
    pub fn disconnect(&self) -> Result<()> {
        let mut core = self.inner.core.lock();
        if core.phase == ClientState::Disconnected {
            return Err(Error::UnexpectedState("disconnect"));
        }

        let still_connected = matches!(
            core.phase,
            ClientState::Connecting
                | ClientState::AwaitingQueueInit
                | ClientState::ConnectedPolling
                | ClientState::ConnectedNotified
        );
        if still_connected {
            if let Err(e) = core.channel.send(&Message::Shutdown.to_vec(), None) {
                log::debug!("[Client] shutdown notice failed: {e}");
            }
        }

        if let Some(logic) = core.logic.as_mut() {
            logic.release_remaining();
        }
        core.channel.deregister_on_notification();
        core.channel.close();
        core.phase = ClientState::Disconnected;
        drop(core);
        fire_transition(&self.inner, ClientState::Disconnected, None);
        Ok(())
    }

    /// True until the instance is disconnected and its reactor has drained
    #[must_use]
    pub fn is_in_use(&self) -> bool {
        let core = self.inner.core.lock();
        core.phase != ClientState::Disconnected || core.channel.is_in_use()
    }

    /// Counter snapshot for this instance
    #[must_use]
    pub fn metrics(&self) -> ChannelMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    fn corrupt_locked(&self, mut core: MutexGuard<'_, ClientCore>, e: Error) -> Error {
        core.phase = ClientState::Corrupted;
        if let Some(logic) = core.logic.as_mut() {
            logic.set_communication_error();
        }
        drop(core);
        fire_transition(&self.inner, ClientState::Corrupted, Some(&e));
        e
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

fn check_traffic_allowed(phase: ClientState, op: &'static str) -> Result<()> {
    match phase {
        ClientState::ConnectedPolling
        | ClientState::ConnectedNotified
        | ClientState::DisconnectedRemote => Ok(()),
        ClientState::Corrupted => Err(Error::Protocol(format!(
            "{op} refused, client channel is corrupted"
        ))),
        _ => Err(Error::UnexpectedState(op)),
    }
}

/// The callback is taken out of its slot for the duration of the call, so
/// user code may call back into the client (even `disconnect`) without
/// deadlocking; a transition triggered from inside the callback is simply
/// not re-reported to it.
fn fire_transition(inner: &ClientInner, state: ClientState, error: Option<&Error>) {
    let taken = inner.on_transition.lock().take();
    if let Some(mut callback) = taken {
        callback(state, error);
        let mut slot = inner.on_transition.lock();
        if slot.is_none() {
            *slot = Some(callback);
        }
    }
}

/// Reactor-side dispatch. Computes the transition under the instance
/// mutex, fires the user callback after releasing it.
fn handle_client_event(weak: &Weak<ClientInner>, event: ChannelEvent) {
    let Some(inner) = weak.upgrade() else {
        return;
    };

    let mut core = inner.core.lock();
    if matches!(
        core.phase,
        ClientState::Corrupted | ClientState::Disconnected
    ) {
        return; // terminal for inbound traffic; nothing left to transition
    }
    let transition: Option<(ClientState, Option<Error>)> = match event {
        ChannelEvent::Message { bytes, handle } => match Message::decode(&bytes) {
            Ok(message) => dispatch_message(&mut core, message, handle),
            Err(e) => Some(corrupt(&mut core, e)),
        },
        ChannelEvent::PeerDisconnected => match core.phase {
            // Expected after a Shutdown from the server.
            ClientState::DisconnectedRemote => None,
            _ => Some(corrupt(&mut core, Error::PeerDisconnected)),
        },
        ChannelEvent::PeerCrashed => Some(corrupt(&mut core, Error::PeerCrashed)),
    };
    drop(core);

    if let Some((state, error)) = transition {
        if matches!(error, Some(Error::Protocol(_))) {
            inner.metrics.inc_protocol_violations();
        }
        fire_transition(&inner, state, error.as_ref());
    }
}

fn dispatch_message(
    core: &mut ClientCore,
    message: Message,
    handle: Option<MemoryExchangeHandle>,
) -> Option<(ClientState, Option<Error>)> {
    match (core.phase, message) {
        (
            ClientState::Connecting,
            Message::ConnectionRequest {
                part: HandlePart::PoolMemory,
                group,
                pool,
                server_queue,
            },
        ) => {
            if core.pending.is_some() {
                return Some(corrupt(
                    core,
                    Error::Protocol("duplicate connection request part 0".into()),
                ));
            }
            let Some(pool_handle) = handle else {
                return Some(corrupt(
                    core,
                    Error::Protocol("connection request without pool handle".into()),
                ));
            };
            core.pending = Some(PendingRequest {
                group,
                pool,
                server_queue,
                pool_handle,
            });
            None
        }
        (
            ClientState::Connecting,
            Message::ConnectionRequest {
                part: HandlePart::QueueMemory,
                group,
                pool,
                server_queue,
            },
        ) => match accept_request(core, group, pool, server_queue, handle) {
            Ok(()) => {
                core.phase = ClientState::AwaitingQueueInit;
                Some((ClientState::AwaitingQueueInit, None))
            }
            Err(e) => Some(corrupt(core, e)),
        },
        (ClientState::AwaitingQueueInit, Message::AckQueueInitialization) => {
            core.phase = ClientState::ConnectedPolling;
            log::debug!("[Client] channel live");
            Some((ClientState::ConnectedPolling, None))
        }
        (
            ClientState::ConnectedPolling | ClientState::ConnectedNotified,
            Message::Shutdown,
        ) => {
            core.phase = ClientState::DisconnectedRemote;
            log::debug!("[Client] server announced shutdown");
            Some((ClientState::DisconnectedRemote, None))
        }
        (phase, message) => Some(corrupt(
            core,
            Error::Protocol(format!("unexpected {message:?} in state {phase:?}")),
        )),
    }
}

/// Both request parts are in: validate, map everything, answer with the
/// free-queue handle.
fn accept_request(
    core: &mut ClientCore,
    group_raw: u64,
    pool_cfg: SlotPoolConfig,
    server_queue: QueueConfig,
    handle: Option<MemoryExchangeHandle>,
) -> Result<()> {
    let pending = core
        .pending
        .take()
        .ok_or_else(|| Error::Protocol("connection request part 1 before part 0".into()))?;
    if pending.group != group_raw
        || pending.pool != pool_cfg
        || pending.server_queue != server_queue
    {
        return Err(Error::Protocol(
            "connection request parts disagree".into(),
        ));
    }
    let queue_handle =
        handle.ok_or_else(|| Error::Protocol("connection request without queue handle".into()))?;
    if server_queue.capacity < pool_cfg.slot_count {
        return Err(Error::Protocol(format!(
            "server queue capacity {} below pool size {}",
            server_queue.capacity, pool_cfg.slot_count
        )));
    }

    let group = Group::from_raw(group_raw);
    let pool = SlotPool::attach(&pending.pool_handle, group, pool_cfg)?;
    let available = IndexQueue::attach(&queue_handle, server_queue)?;

    let conn = NEXT_CONN.fetch_add(1, Ordering::Relaxed);
    let client_queue = QueueConfig::for_slot_count(pool_cfg.slot_count);
    let free = IndexQueue::create(&region_name(group, &format!("free{conn}")), client_queue)?;
    let free_handle = free.exchange_handle();

    let slots = SlotManager::new(group, pool.readable_slots());
    core.logic = Some(LogicClient::new(group, slots, available, free));
    core._pool = Some(pool);

    core.channel.send(
        &Message::ConnectionAck { client_queue }.to_vec(),
        Some(free_handle),
    )?;
    log::debug!("[Client] accepted channel {group}: {} slots", pool_cfg.slot_count);
    Ok(())
}

fn corrupt(core: &mut ClientCore, e: Error) -> (ClientState, Option<Error>) {
    log::warn!("[Client] corrupted: {e}");
    core.phase = ClientState::Corrupted;
    if let Some(logic) = core.logic.as_mut() {
        logic.set_communication_error();
    }
    (ClientState::Corrupted, Some(e))
}

/// Read-only payload view; releases the instance mutex on drop.
pub struct Payload<'a> {
    _guard: MutexGuard<'a, ClientCore>,
    ptr: *const u8,
    len: usize,
}

impl Deref for Payload<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr/len were taken from the slot descriptor while the
        // guard was (and still is) held; the pool mapping lives inside the
        // core the guard protects, and the token that produced this view
        // keeps the server from writing the slot.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}
