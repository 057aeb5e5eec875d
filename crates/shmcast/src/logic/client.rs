// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client-side bookkeeping: consume published slots, return them.

use super::SlotToken;
use crate::error::{Error, Result};
use crate::handle::{Group, Handle};
use crate::queue::IndexQueue;
use crate::slot::{ReadableSlot, SlotManager};

/// Bookkeeping engine for the receiving side.
///
/// Owns the client's queue endpoints and the per-slot borrow marks. The
/// server's queue contents are untrusted: indices are range-checked and a
/// duplicate publication is a protocol violation, after which the engine
/// refuses further traffic.
pub struct LogicClient {
    group: Group,
    slots: SlotManager<ReadableSlot>,
    /// Server → client, client is the consumer
    available: IndexQueue,
    /// Client → server, client is the producer
    free: IndexQueue,
    /// One mark per slot; `true` while this client holds a token for it
    borrowed: Vec<bool>,
    /// Latched on protocol violation or queue corruption
    comm_error: bool,
}

impl LogicClient {
    /// Build the engine over attached pool descriptors and queue endpoints.
    #[must_use]
    pub fn new(group: Group, slots: SlotManager<ReadableSlot>, available: IndexQueue, free: IndexQueue) -> Self {
        let slot_count = slots.slot_count() as usize;
        Self {
            group,
            slots,
            available,
            free,
            borrowed: vec![false; slot_count],
            comm_error: false,
        }
    }

    /// Pop one published slot, or `None` when the queue is empty.
    ///
    /// A popped index outside the pool or one this client already holds is
    /// a protocol violation: the engine latches its communication error and
    /// refuses further receive/release calls.
    pub fn receive_slot(&mut self) -> Result<Option<SlotToken>> {
        if self.comm_error {
            return Err(Error::Protocol("client channel already corrupted".into()));
        }

        let raw = match self.available.pop() {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.comm_error = true;
                return Err(e);
            }
        };

        if raw as usize >= self.borrowed.len() {
            self.comm_error = true;
            return Err(Error::Protocol(format!(
                "published slot index {raw} out of range"
            )));
        }
        if self.borrowed[raw as usize] {
            self.comm_error = true;
            return Err(Error::Protocol(format!(
                "slot {raw} published twice"
            )));
        }

        self.borrowed[raw as usize] = true;
        Ok(Some(SlotToken::new(Handle::new(self.group, raw))))
    }

    /// Read-only payload of a held slot. Never fails for a live token.
    #[must_use]
    pub fn access(&self, token: &SlotToken) -> &[u8] {
        self.slots.get(token.slot()).bytes()
    }

    /// Hand the slot back to the server via the free queue.
    ///
    /// The free queue is sized to the pool, so "full" can only mean the
    /// peer broke the queue: it is reported as a protocol violation.
    pub fn release_slot(&mut self, token: SlotToken) -> Result<()> {
        if self.comm_error {
            return Err(Error::Protocol("client channel already corrupted".into()));
        }

        let slot = token.into_slot();
        match self.free.push(slot.index()) {
            Ok(true) => {
                self.borrowed[slot.index() as usize] = false;
                Ok(())
            }
            Ok(false) => {
                self.comm_error = true;
                Err(Error::Protocol(
                    "free queue full although sized to the pool".into(),
                ))
            }
            Err(e) => {
                self.comm_error = true;
                Err(e)
            }
        }
    }

    /// Best-effort return of every slot still held (used on disconnect).
    ///
    /// Errors are swallowed: the channel is going away either way.
    pub fn release_remaining(&mut self) {
        for index in 0..self.borrowed.len() {
            if self.borrowed[index] {
                if let Ok(true) = self.free.push(index as u32) {
                    self.borrowed[index] = false;
                }
            }
        }
    }

    /// Refuse subsequent receive/release without touching shared memory
    pub fn set_communication_error(&mut self) {
        self.comm_error = true;
    }

    /// Has a protocol violation or queue corruption been latched?
    #[must_use]
    pub fn has_communication_error(&self) -> bool {
        self.comm_error
    }

    /// Number of slots this client currently holds
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.borrowed.iter().filter(|&&b| b).count()
    }

    /// Is anything waiting in the available queue?
    pub fn has_pending(&self) -> Result<bool> {
        Ok(self.available.peek()?.is_some())
    }
}
