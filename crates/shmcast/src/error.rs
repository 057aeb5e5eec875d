// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error kinds surfaced by the messaging core.
//!
//! Two propagation regimes exist:
//!
//! - **Recoverable** conditions return [`Error`] through `Result`. The
//!   lifecycle state machines decide which of them additionally drive a
//!   transition (usually to `Corrupted`).
//! - **Fatal** conditions (handle-group mismatch, receiver-index overflow,
//!   impossible internal state) indicate memory corruption or API misuse and
//!   abort the process via [`fatal`]. Recovering from them would be unsafe.
//!
//! `QueueError` is contained: the logic layer marks the offending receiver
//! (server side) or the whole client corrupted, but server core state stays
//! intact.

use std::fmt;
use std::io;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors observed by core entry points
#[derive(Debug)]
pub enum Error {
    /// API used in the wrong lifecycle state; no state change occurred
    UnexpectedState(&'static str),

    /// Peer violated the protocol (duplicate slot publication, malformed
    /// message, out-of-range index)
    Protocol(String),

    /// Peer closed the side channel without a prior `Shutdown`
    PeerDisconnected,

    /// Side channel reported that the peer crashed
    PeerCrashed,

    /// Structural corruption detected in a shared-memory queue
    Queue(String),

    /// A trivially-copyable container failed its self-consistency check at
    /// the read-only-view construction boundary
    ContainerCorrupted {
        /// Stored element count found in the raw bytes
        stored: usize,
        /// Maximum the container can legally hold
        capacity: usize,
    },

    /// A best-effort notification could not be queued; non-fatal, callers
    /// may ignore it
    DroppedNotification,

    /// Side channel is closed; no further traffic is possible
    ChannelClosed,

    /// Underlying OS operation failed (shared memory, sockets)
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedState(op) => {
                write!(f, "Operation '{op}' not valid in the current state")
            }
            Self::Protocol(msg) => write!(f, "Protocol violation: {msg}"),
            Self::PeerDisconnected => write!(f, "Peer closed the side channel without Shutdown"),
            Self::PeerCrashed => write!(f, "Peer crashed"),
            Self::Queue(msg) => write!(f, "Queue corruption: {msg}"),
            Self::ContainerCorrupted { stored, capacity } => {
                write!(
                    f,
                    "Container corrupted: stored size {stored} exceeds capacity {capacity}"
                )
            }
            Self::DroppedNotification => write!(f, "Notification dropped"),
            Self::ChannelClosed => write!(f, "Side channel is closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Abort the process after logging an unrecoverable invariant break.
///
/// Used for conditions that indicate memory corruption or API misuse
/// (handle from a different server instance, receiver index past the bitmap
/// width). Continuing with corrupted bookkeeping could hand a client a slot
/// the server still writes, so the only safe reaction is to stop.
#[cold]
pub(crate) fn fatal(msg: &str) -> ! {
    log::error!("[Fatal] {msg}");
    std::process::abort();
}
