// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server-side bookkeeping: publish slots to receivers, reclaim returns.

use super::SlotToken;
use crate::borrowed::{AcquireOutcome, BorrowedManager};
use crate::error::{Error, Result};
use crate::handle::{ClassHandle, Group, Handle, ReceiverHandle, SlotHandle};
use crate::queue::IndexQueue;
use crate::slot::{SlotManager, WritableSlot};

/// Why a send was not delivered to one receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The receiver's class cap is exhausted
    ClassLimited,
    /// The receiver's available queue is full
    QueueFull,
}

/// Outcome of one [`LogicServer::send_slot`] call.
#[derive(Debug, Default)]
pub struct SendReport {
    /// Receivers whose available queue now carries the slot
    pub delivered: Vec<ReceiverHandle>,
    /// Receivers that did not get the slot, with the reason
    pub dropped: Vec<(ReceiverHandle, DropReason)>,
}

/// Per-receiver record: queue endpoints plus health.
struct Receiver {
    handle: ReceiverHandle,
    /// Server → client, server is the producer
    available: IndexQueue,
    /// Client → server, server is the consumer
    free: IndexQueue,
    /// Set on queue corruption or reclaim validation failure; a corrupted
    /// receiver gets no further traffic but never poisons the others
    corrupted: bool,
    /// Muted receivers get no new publications but their free queue is
    /// still drained (peer announced shutdown, returns remain valid)
    muted: bool,
}

/// Bookkeeping engine for the serving side.
///
/// Never touches shared slot contents and never talks to the side channel.
pub struct LogicServer {
    group: Group,
    borrowed: BorrowedManager,
    slots: SlotManager<WritableSlot>,
    /// Sparse table indexed by receiver index
    receivers: Vec<Option<Receiver>>,
    /// Receiver indices in registration order; publish order follows it
    order: Vec<u32>,
}

impl LogicServer {
    /// Build the engine over an already-created slot pool descriptor table.
    #[must_use]
    pub fn new(
        group: Group,
        slots: SlotManager<WritableSlot>,
        max_classes: u32,
        max_receivers: u32,
    ) -> Self {
        let slot_count = slots.slot_count();
        Self {
            group,
            borrowed: BorrowedManager::new(group, slot_count, max_classes, max_receivers),
            slots,
            receivers: (0..max_receivers).map(|_| None).collect(),
            order: Vec::new(),
        }
    }

    /// Append a receiver class (server build time only)
    pub fn create_class(&mut self, cap: u32) -> ClassHandle {
        self.borrowed.create_class(cap)
    }

    /// Allocate a receiver index and install its queue endpoints.
    ///
    /// `available` must be the producing end of the server→client queue,
    /// `free` the consuming end of the client→server queue.
    pub fn register_receiver(
        &mut self,
        class: ClassHandle,
        available: IndexQueue,
        free: IndexQueue,
    ) -> Result<ReceiverHandle> {
        let index = self
            .receivers
            .iter()
            .position(Option::is_none)
            .ok_or(Error::UnexpectedState("receiver capacity exhausted"))?;

        let handle: ReceiverHandle = Handle::new(self.group, index as u32);
        self.borrowed.register_receiver(handle, class);
        self.receivers[index] = Some(Receiver {
            handle,
            available,
            free,
            corrupted: false,
            muted: false,
        });
        self.order.push(index as u32);
        log::debug!("[LogicServer] registered receiver {handle:?}");
        Ok(handle)
    }

    /// Release every slot held by `r`, then drop it from all managers.
    ///
    /// Returns the slots that became completely free.
    pub fn unregister_receiver(&mut self, r: ReceiverHandle) -> Vec<SlotHandle> {
        let mut freed = Vec::new();
        for index in 0..self.borrowed.slot_count() {
            let s: SlotHandle = Handle::new(self.group, index);
            if self.borrowed.is_slot_borrowed_by_receiver(r, s) {
                self.borrowed.release_receiver_slot(r, s);
                if self.borrowed.is_slot_free(s) {
                    freed.push(s);
                }
            }
        }
        self.borrowed.remove_receiver(r);
        self.receivers[r.index() as usize] = None;
        self.order.retain(|&i| i != r.index());
        log::debug!(
            "[LogicServer] unregistered receiver {r:?}, {} slots freed",
            freed.len()
        );
        freed
    }

    /// Claim a free slot for writing
    pub fn acquire_slot(&mut self) -> Option<SlotToken> {
        self.borrowed.acquire_send_slot().map(SlotToken::new)
    }

    /// Writable descriptor for an acquired slot
    pub fn slot_mut(&mut self, token: &SlotToken) -> &mut WritableSlot {
        self.slots.get_mut(token.slot())
    }

    /// Publish the slot to every registered receiver in registration order.
    ///
    /// Per receiver: charge the class cap, then push the index onto its
    /// available queue. A full queue or exhausted cap drops the slot for
    /// that receiver only; a queue error additionally marks the receiver
    /// corrupted. The server's own hold ends before returning.
    pub fn send_slot(&mut self, token: SlotToken) -> SendReport {
        let s = token.into_slot();
        let mut report = SendReport::default();

        for k in 0..self.order.len() {
            let index = self.order[k] as usize;
            let Some(receiver) = self.receivers[index].as_mut() else {
                continue;
            };
            if receiver.corrupted || receiver.muted {
                continue;
            }
            let handle = receiver.handle;

            if self.borrowed.acquire_receiver_slot(handle, s) == AcquireOutcome::ClassLimited {
                report.dropped.push((handle, DropReason::ClassLimited));
                continue;
            }

            match receiver.available.push(s.index()) {
                Ok(true) => report.delivered.push(handle),
                Ok(false) => {
                    report.dropped.push((handle, DropReason::QueueFull));
                    self.borrowed.release_receiver_slot(handle, s);
                }
                Err(e) => {
                    log::warn!("[LogicServer] available queue of {handle:?} corrupted: {e}");
                    receiver.corrupted = true;
                    self.borrowed.release_receiver_slot(handle, s);
                }
            }
        }

        self.borrowed.release_send_slot(s);
        report
    }

    /// Drain every receiver's free queue and release the returned slots.
    ///
    /// Popped indices are untrusted: out-of-range values or returns of
    /// slots the receiver does not hold mark that receiver corrupted and
    /// leave server state untouched. Returns every slot that became
    /// completely free.
    pub fn reclaim_slots(&mut self) -> Vec<SlotHandle> {
        let mut freed = Vec::new();
        let slot_count = self.borrowed.slot_count();

        for k in 0..self.order.len() {
            let index = self.order[k] as usize;
            let Some(receiver) = self.receivers[index].as_mut() else {
                continue;
            };
            if receiver.corrupted {
                continue;
            }
            let handle = receiver.handle;

            loop {
                match receiver.free.pop() {
                    Ok(Some(raw)) => {
                        if raw >= slot_count {
                            log::warn!(
                                "[LogicServer] receiver {handle:?} returned index {raw} out of range"
                            );
                            receiver.corrupted = true;
                            break;
                        }
                        let s: SlotHandle = Handle::new(self.group, raw);
                        if !self.borrowed.is_slot_borrowed_by_receiver(handle, s) {
                            log::warn!(
                                "[LogicServer] receiver {handle:?} returned slot {raw} it does not hold"
                            );
                            receiver.corrupted = true;
                            break;
                        }
                        self.borrowed.release_receiver_slot(handle, s);
                        if self.borrowed.is_slot_free(s) {
                            freed.push(s);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("[LogicServer] free queue of {handle:?} corrupted: {e}");
                        receiver.corrupted = true;
                        break;
                    }
                }
            }
        }
        freed
    }

    /// Stop publishing to `r` while keeping its free queue drained.
    ///
    /// Used when the peer announced shutdown: in-flight returns stay valid
    /// but no new slot may reach it.
    pub fn mute_receiver(&mut self, r: ReceiverHandle) {
        if let Some(receiver) = self.receivers[r.index() as usize].as_mut() {
            receiver.muted = true;
        }
    }

    /// Has the receiver been marked corrupted?
    #[must_use]
    pub fn is_receiver_corrupted(&self, r: ReceiverHandle) -> bool {
        self.receivers[r.index() as usize]
            .as_ref()
            .is_some_and(|receiver| receiver.corrupted)
    }

    /// Is the slot completely free?
    #[must_use]
    pub fn is_slot_free(&self, s: SlotHandle) -> bool {
        self.borrowed.is_slot_free(s)
    }

    /// Class a receiver is bound to
    #[must_use]
    pub fn receiver_class(&self, r: ReceiverHandle) -> Option<ClassHandle> {
        self.borrowed.get_receiver_class(r)
    }

    /// Number of slots in the pool
    #[must_use]
    pub fn slot_count(&self) -> u32 {
        self.borrowed.slot_count()
    }

    /// Group identifier of this instance
    #[must_use]
    pub fn group(&self) -> Group {
        self.group
    }

    /// Count of slots currently completely free
    #[must_use]
    pub fn free_slot_count(&self) -> u32 {
        (0..self.borrowed.slot_count())
            .filter(|&i| self.borrowed.is_slot_free(Handle::new(self.group, i)))
            .count() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QueueConfig, SlotPoolConfig};
    use crate::mem::region_name;
    use crate::slot::SlotPool;

    fn pool_cfg() -> SlotPoolConfig {
        SlotPoolConfig {
            slot_count: 4,
            slot_size: 64,
            slot_align: 64,
            payload_size: 48,
            payload_align: 8,
        }
    }

    struct Rig {
        server: LogicServer,
        class: ClassHandle,
        _pool: SlotPool,
    }

    fn rig(cap: u32) -> Rig {
        let group = Group::next();
        let pool = SlotPool::create(&region_name(group, "ls_pool"), group, pool_cfg())
            .expect("pool create failed");
        let slots = SlotManager::new(group, pool.writable_slots());
        let mut server = LogicServer::new(group, slots, 4, 8);
        let class = server.create_class(cap);
        Rig {
            server,
            class,
            _pool: pool,
        }
    }

    /// Client-side views of the queues wired into a registered receiver
    fn add_receiver(rig: &mut Rig, tag: &str) -> (ReceiverHandle, IndexQueue, IndexQueue) {
        let group = rig.server.group();
        let qcfg = QueueConfig::for_slot_count(4);
        let available = IndexQueue::create(&region_name(group, &format!("{tag}_av")), qcfg)
            .expect("available queue");
        let free =
            IndexQueue::create(&region_name(group, &format!("{tag}_fr")), qcfg).expect("free queue");

        let available_rx =
            IndexQueue::attach(&available.exchange_handle(), qcfg).expect("attach available");
        let free_tx = IndexQueue::attach(&free.exchange_handle(), qcfg).expect("attach free");

        let handle = rig
            .server
            .register_receiver(rig.class, available, free)
            .expect("register failed");
        (handle, available_rx, free_tx)
    }

    #[test]
    fn test_send_delivers_to_all_receivers() {
        let mut rig = rig(4);
        let (_r0, av0, _f0) = add_receiver(&mut rig, "t1a");
        let (_r1, av1, _f1) = add_receiver(&mut rig, "t1b");

        let token = rig.server.acquire_slot().expect("slot");
        let slot = token.slot();
        let report = rig.server.send_slot(token);

        assert_eq!(report.delivered.len(), 2);
        assert!(report.dropped.is_empty());
        assert_eq!(av0.pop().expect("pop"), Some(slot.index()));
        assert_eq!(av1.pop().expect("pop"), Some(slot.index()));
    }

    #[test]
    fn test_class_limit_drops_after_first() {
        let mut rig = rig(1);
        let (r0, av, _f) = add_receiver(&mut rig, "t2");

        let t1 = rig.server.acquire_slot().expect("slot 0");
        let report = rig.server.send_slot(t1);
        assert_eq!(report.delivered, vec![r0]);

        let t2 = rig.server.acquire_slot().expect("slot 1");
        let report = rig.server.send_slot(t2);
        assert!(report.delivered.is_empty());
        assert_eq!(report.dropped, vec![(r0, DropReason::ClassLimited)]);

        // Only the first publication reached the queue.
        assert_eq!(av.pop().expect("pop"), Some(0));
        assert_eq!(av.pop().expect("pop"), None);
    }

    #[test]
    fn test_reclaim_returns_slots_to_pool() {
        let mut rig = rig(4);
        let (_r0, av, free_tx) = add_receiver(&mut rig, "t3");

        let token = rig.server.acquire_slot().expect("slot");
        let slot = token.slot();
        rig.server.send_slot(token);
        assert!(!rig.server.is_slot_free(slot));

        // Client consumes and hands the slot back.
        assert_eq!(av.pop().expect("pop"), Some(slot.index()));
        assert!(free_tx.push(slot.index()).expect("push"));

        let freed = rig.server.reclaim_slots();
        assert_eq!(freed, vec![slot]);
        assert!(rig.server.is_slot_free(slot));
        assert_eq!(rig.server.free_slot_count(), 4);
    }

    #[test]
    fn test_reclaim_rejects_out_of_range_index() {
        let mut rig = rig(4);
        let (r0, _av, free_tx) = add_receiver(&mut rig, "t4");

        assert!(free_tx.push(99).expect("push"));
        let freed = rig.server.reclaim_slots();
        assert!(freed.is_empty());
        assert!(rig.server.is_receiver_corrupted(r0));
    }

    #[test]
    fn test_reclaim_rejects_slot_not_held() {
        let mut rig = rig(4);
        let (r0, _av, free_tx) = add_receiver(&mut rig, "t5");

        // Client claims to return slot 2 it never received.
        assert!(free_tx.push(2).expect("push"));
        let freed = rig.server.reclaim_slots();
        assert!(freed.is_empty());
        assert!(rig.server.is_receiver_corrupted(r0));
    }

    #[test]
    fn test_corrupted_receiver_gets_no_traffic() {
        let mut rig = rig(4);
        let (r0, av, free_tx) = add_receiver(&mut rig, "t6");

        assert!(free_tx.push(99).expect("push"));
        rig.server.reclaim_slots();
        assert!(rig.server.is_receiver_corrupted(r0));

        let token = rig.server.acquire_slot().expect("slot");
        let report = rig.server.send_slot(token);
        assert!(report.delivered.is_empty());
        assert_eq!(av.pop().expect("pop"), None);
    }

    #[test]
    fn test_muted_receiver_still_reclaims() {
        let mut rig = rig(4);
        let (r0, av, free_tx) = add_receiver(&mut rig, "t6m");

        let token = rig.server.acquire_slot().expect("slot");
        let slot = token.slot();
        rig.server.send_slot(token);
        assert_eq!(av.pop().expect("pop"), Some(slot.index()));

        rig.server.mute_receiver(r0);

        // No new traffic while muted.
        let token = rig.server.acquire_slot().expect("slot");
        let report = rig.server.send_slot(token);
        assert!(report.delivered.is_empty());

        // In-flight return is still honored.
        assert!(free_tx.push(slot.index()).expect("push"));
        let freed = rig.server.reclaim_slots();
        assert_eq!(freed, vec![slot]);
        assert!(!rig.server.is_receiver_corrupted(r0));
    }

    #[test]
    fn test_unregister_frees_held_slots() {
        let mut rig = rig(4);
        let (r0, _av, _f) = add_receiver(&mut rig, "t7");

        let token = rig.server.acquire_slot().expect("slot");
        let slot = token.slot();
        rig.server.send_slot(token);
        assert!(!rig.server.is_slot_free(slot));

        let freed = rig.server.unregister_receiver(r0);
        assert_eq!(freed, vec![slot]);
        assert_eq!(rig.server.free_slot_count(), 4);
        assert_eq!(rig.server.receiver_class(r0), None);
    }

    #[test]
    fn test_acquired_slot_is_writable() {
        let mut rig = rig(4);
        let token = rig.server.acquire_slot().expect("slot");
        rig.server.slot_mut(&token).bytes_mut()[0] = 0x7F;
        rig.server.slot_mut(&token).reset();
        assert_eq!(rig.server.slot_mut(&token).bytes_mut()[0], 0);
        let _ = rig.server.send_slot(token);
    }
}
