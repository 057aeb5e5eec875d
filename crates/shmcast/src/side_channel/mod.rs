// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Side channel: out-of-band control transport for protocol messages.
//!
//! The messaging core never talks to a socket directly; it consumes this
//! trait. Two implementations ship with the crate:
//!
//! - [`uds::UdsChannel`] — Unix domain stream socket with a reactor thread,
//!   for real cross-process deployments.
//! - [`loopback::loopback_pair`] — in-process pair over crossbeam channels,
//!   for tests and fault injection.
//!
//! # Contract
//!
//! - [`SideChannel::send`] is synchronous, at-most-once, ordered: bytes
//!   handed to `send` before a peer event arrive at the peer's callback
//!   before that event, even if the sender closes afterwards.
//! - [`SideChannel::notify`] is a best-effort wake-up: lossy, unordered
//!   with respect to messages. A failed enqueue surfaces
//!   [`Error::DroppedNotification`](crate::Error::DroppedNotification) and
//!   callers may ignore it.
//! - [`SideChannel::start_message_reception`] may be called once; the
//!   installed callback then fires for every inbound event until `close`.
//! - Callbacks run on the channel's reactor thread. Implementations never
//!   invoke them while the caller holds channel-internal locks.

pub mod loopback;
pub mod uds;

use crate::error::Result;
use crate::mem::MemoryExchangeHandle;

/// Everything the receiver callback can observe.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A peer message, with the memory handle that rode along, if any
    Message {
        /// Raw protocol record
        bytes: Vec<u8>,
        /// Out-of-band memory handle accompanying the record
        handle: Option<MemoryExchangeHandle>,
    },
    /// Peer closed the channel in an orderly way
    PeerDisconnected,
    /// Peer vanished without closing (crash, kill)
    PeerCrashed,
}

/// Receiver callback; fires once per inbound event
pub type OnMessage = Box<dyn FnMut(ChannelEvent) + Send>;

/// Notification callback; fires once per delivered wake-up
pub type OnNotification = Box<dyn FnMut() + Send>;

/// Bidirectional byte+handle transport with a lossy notify primitive.
pub trait SideChannel: Send + Sync {
    /// Send one protocol record, optionally accompanied by a memory handle.
    ///
    /// Synchronous; at-most-once, ordered delivery to the peer's callback.
    fn send(&self, bytes: &[u8], handle: Option<MemoryExchangeHandle>) -> Result<()>;

    /// Best-effort wake-up. Lossy and unordered with respect to messages.
    fn notify(&self) -> Result<()>;

    /// Install the receiver callback and start the reactor. One-shot.
    fn start_message_reception(&self, on_message: OnMessage) -> Result<()>;

    /// Install the notification callback
    fn register_on_notification(&self, on_notification: OnNotification) -> Result<()>;

    /// Remove the notification callback
    fn deregister_on_notification(&self);

    /// Idempotent teardown; subsequent operations fail. In-flight callbacks
    /// may still complete.
    fn close(&self);

    /// False once `close` returned and no callback is active
    fn is_in_use(&self) -> bool;
}
