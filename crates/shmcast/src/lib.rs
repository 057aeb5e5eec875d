// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # shmcast — shared-memory zero-copy messaging channel
//!
//! One server process fills fixed-size slots in shared memory and
//! publishes them; up to 63 client processes read the same bytes in place
//! and hand the slots back for reuse. No payload byte ever crosses a
//! process boundary by copy.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use shmcast::{Client, Server, UdsChannel};
//! use std::sync::Arc;
//!
//! fn main() -> shmcast::Result<()> {
//!     // Server side
//!     let server = Server::builder()
//!         .slot_count(16)
//!         .payload_geometry(4096, 8)
//!         .receiver_class(4) // clients in this class share 4 borrows
//!         .build()?;
//!     let (server_end, client_end) = UdsChannel::pair()?;
//!     server.connect_client(Arc::new(server_end), server.class(0).unwrap())?;
//!
//!     // Client side (normally another process)
//!     let client = Client::connect(Arc::new(client_end))?;
//!
//!     // Publish
//!     if let Some(token) = server.acquire_slot() {
//!         server.payload_mut(&token)[..5].copy_from_slice(b"hello");
//!         server.send(token);
//!     }
//!
//!     // Consume in place, then return the slot
//!     if let Some(token) = client.receive()? {
//!         let payload = client.payload(&token);
//!         assert_eq!(&payload[..5], b"hello");
//!         drop(payload);
//!         client.release(token)?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |  Facades: Server / Client (one mutex per instance)                 |
//! +--------------------------------------------------------------------+
//! |  Lifecycle state machines  |  protocol codec  |  side channel      |
//! +--------------------------------------------------------------------+
//! |  Logic layer: LogicServer / LogicClient (pure bookkeeping)         |
//! +--------------------------------------------------------------------+
//! |  Ownership engine: BorrowedManager / ReceiverClass / bitmaps       |
//! +--------------------------------------------------------------------+
//! |  Shared memory: slot pool | SPSC index queues | regions            |
//! +--------------------------------------------------------------------+
//! ```
//!
//! The side channel (Unix socket or in-process loopback) carries only the
//! handshake, lifecycle messages and lossy wake-up hints. Payload bytes
//! live in the slot pool; slot *indices* travel through lock-free SPSC
//! queues (one available queue and one free queue per client).
//!
//! ## Safety model
//!
//! Processes do not trust each other. Every index popped from a
//! peer-writable queue is range- and ownership-checked; every mapped
//! region echoes its negotiated geometry in a validated header; a
//! misbehaving peer corrupts only its own channel, never the server core.
//! Handle-group mismatches inside one process are programming errors and
//! abort.

/// Per-slot borrow bitmaps (server bit + up to 63 receiver bits).
pub mod bitmap;
/// Slot ownership engine combining bitmaps and class caps.
pub mod borrowed;
/// Receiver classes: shared borrow budgets with O(1) cap checks.
pub mod class;
/// Client facade and lifecycle state machine.
pub mod client;
/// Channel geometry types and limits.
pub mod config;
/// Fixed-capacity trivially-copyable containers (standalone utility).
pub mod containers;
/// Error kinds and the fatal-abort policy.
pub mod error;
/// Typed handles scoped to one server instance.
pub mod handle;
/// Pure bookkeeping layer (LogicServer / LogicClient / tokens).
pub mod logic;
/// POSIX shared memory regions and exchange tokens.
pub mod mem;
/// Per-instance channel counters.
pub mod metrics;
/// Wire codec for the side-channel protocol messages.
pub mod protocol;
/// Lock-free SPSC index queues over shared memory.
pub mod queue;
/// Server facade, builder and per-client gate state machines.
pub mod server;
/// Side channel trait and the shipped transports.
pub mod side_channel;
/// Slot pool layout and typed slot descriptors.
pub mod slot;

pub use client::{Client, ClientState, OnStateTransition};
pub use config::{QueueConfig, SlotPoolConfig};
pub use error::{Error, Result};
pub use handle::{ClassHandle, Group, ReceiverHandle, SlotHandle};
pub use logic::{DropReason, SendReport, SlotToken};
pub use mem::MemoryExchangeHandle;
pub use metrics::{ChannelMetrics, ChannelMetricsSnapshot};
pub use server::{ClientId, GateState, Server, ServerBuilder};
pub use side_channel::loopback::{loopback_pair, LoopbackChannel};
pub use side_channel::uds::UdsChannel;
pub use side_channel::{ChannelEvent, SideChannel};
