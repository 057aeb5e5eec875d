// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Receiver classes: aggregate caps on concurrent slot borrows.
//!
//! A class groups receivers that share one budget: at most `cap` slots may be
//! borrowed by any subset of the members at the same time. The `held` count
//! is a cache of `|{ s : bitmap(s) ∩ members ≠ ∅ }|` so the cap check stays
//! O(1) instead of scanning every slot.
//!
//! Cache correctness rests on one precondition: every bitmap mutation for a
//! member of the class goes through [`ReceiverClass::try_acquire`] and
//! [`ReceiverClass::release`].

use crate::bitmap::{BorrowedBitmap, MAX_RECEIVERS};
use crate::error::fatal;
use crate::handle::{ClassHandle, Group, Handle, ReceiverHandle};

/// Borrow budget shared by a group of receivers.
#[derive(Debug)]
pub struct ReceiverClass {
    /// Maximum slots the members may collectively hold at once
    cap: u32,
    /// Cached count of slots currently held by any member
    held: u32,
    /// Membership bitmap (receiver bits only)
    members: BorrowedBitmap,
}

impl ReceiverClass {
    /// Create an empty class with the given aggregate cap
    #[must_use]
    pub fn new(cap: u32) -> Self {
        Self {
            cap,
            held: 0,
            members: BorrowedBitmap::new(),
        }
    }

    /// Add receiver `r` to the class. Idempotent.
    pub fn register_receiver(&mut self, r: u32) {
        self.members.set_receiver(r);
    }

    /// Remove receiver `r` from the class. Idempotent.
    ///
    /// The caller must have released every slot held by `r` first, otherwise
    /// the `held` cache goes stale.
    pub fn remove_receiver(&mut self, r: u32) {
        self.members.clear_receiver(r);
    }

    /// Try to mark slot `slot_bitmap` as borrowed by receiver `r`.
    ///
    /// Returns `true` and sets the bit unless the class budget is exhausted.
    /// Re-acquiring a slot the receiver already holds is a no-op returning
    /// `true`. Acquiring a slot another member already holds does not charge
    /// the budget again.
    pub fn try_acquire(&mut self, r: u32, slot_bitmap: &mut BorrowedBitmap) -> bool {
        if slot_bitmap.is_receiver_set(r) {
            return true;
        }
        if slot_bitmap.bitwise_and(self.members).any_set() {
            // Slot already charged to this class by another member.
            slot_bitmap.set_receiver(r);
            return true;
        }
        if self.held < self.cap {
            slot_bitmap.set_receiver(r);
            self.held += 1;
            return true;
        }
        false
    }

    /// Clear receiver `r`'s bit on `slot_bitmap`; uncharge the budget when
    /// no member holds the slot anymore. Releasing a slot not held by `r`
    /// is a no-op.
    pub fn release(&mut self, r: u32, slot_bitmap: &mut BorrowedBitmap) {
        if !slot_bitmap.is_receiver_set(r) {
            return;
        }
        slot_bitmap.clear_receiver(r);
        if !slot_bitmap.bitwise_and(self.members).any_set() {
            if self.held == 0 {
                fatal("receiver class held-count underflow");
            }
            self.held -= 1;
        }
    }

    /// Does any member of this class hold the slot?
    #[must_use]
    pub fn is_held_by_class(&self, slot_bitmap: BorrowedBitmap) -> bool {
        slot_bitmap.bitwise_and(self.members).any_set()
    }

    /// Slots currently charged to this class
    #[must_use]
    pub fn held(&self) -> u32 {
        self.held
    }

    /// Aggregate cap
    #[must_use]
    pub fn cap(&self) -> u32 {
        self.cap
    }
}

/// Ordered list of classes plus the receiver → class mapping.
///
/// Class index is the class identifier; classes are created only during
/// server build and are fixed thereafter.
#[derive(Debug)]
pub struct ClassManager {
    group: Group,
    max_classes: u32,
    classes: Vec<ReceiverClass>,
    /// Sparse table indexed by receiver index
    receivers: Vec<Option<(ReceiverHandle, ClassHandle)>>,
}

impl ClassManager {
    /// Create a manager for up to `max_classes` classes and `max_receivers`
    /// receivers (at most [`MAX_RECEIVERS`]).
    #[must_use]
    pub fn new(group: Group, max_classes: u32, max_receivers: u32) -> Self {
        if max_receivers > MAX_RECEIVERS {
            fatal(&format!(
                "receiver capacity {max_receivers} exceeds bitmap width {MAX_RECEIVERS}"
            ));
        }
        Self {
            group,
            max_classes,
            classes: Vec::with_capacity(max_classes as usize),
            receivers: (0..max_receivers).map(|_| None).collect(),
        }
    }

    /// Append a class with the given cap and hand back its handle.
    pub fn create_class(&mut self, cap: u32) -> ClassHandle {
        if self.classes.len() as u32 >= self.max_classes {
            fatal(&format!(
                "class count exceeds configured maximum {}",
                self.max_classes
            ));
        }
        let index = self.classes.len() as u32;
        self.classes.push(ReceiverClass::new(cap));
        Handle::new(self.group, index)
    }

    /// Bind receiver `r` to class `c` and add it to the membership bitmap.
    pub fn register_receiver(&mut self, r: ReceiverHandle, c: ClassHandle) {
        self.check_receiver(r);
        self.check_class(c);
        let entry = &mut self.receivers[r.index() as usize];
        if let Some((existing, _)) = entry {
            if *existing != r {
                fatal("receiver index already occupied by a different handle");
            }
        }
        *entry = Some((r, c));
        self.classes[c.index() as usize].register_receiver(r.index());
        log::debug!("[ClassManager] registered receiver {r:?} in class {c:?}");
    }

    /// Unbind receiver `r`. No-op when not registered.
    pub fn remove_receiver(&mut self, r: ReceiverHandle) {
        self.check_receiver(r);
        if let Some((_, c)) = self.receivers[r.index() as usize].take() {
            self.classes[c.index() as usize].remove_receiver(r.index());
            log::debug!("[ClassManager] removed receiver {r:?} from class {c:?}");
        }
    }

    /// Delegate an acquire to the receiver's class
    pub fn try_acquire_for_receiver(
        &mut self,
        r: ReceiverHandle,
        slot_bitmap: &mut BorrowedBitmap,
    ) -> bool {
        let c = self.class_of(r);
        self.classes[c.index() as usize].try_acquire(r.index(), slot_bitmap)
    }

    /// Delegate a release to the receiver's class
    pub fn release_for_receiver(&mut self, r: ReceiverHandle, slot_bitmap: &mut BorrowedBitmap) {
        let c = self.class_of(r);
        self.classes[c.index() as usize].release(r.index(), slot_bitmap);
    }

    /// Class the receiver is bound to, if registered
    #[must_use]
    pub fn get_class(&self, r: ReceiverHandle) -> Option<ClassHandle> {
        self.check_receiver(r);
        self.receivers[r.index() as usize].map(|(_, c)| c)
    }

    /// Borrow a class record by handle
    #[must_use]
    pub fn class(&self, c: ClassHandle) -> &ReceiverClass {
        self.check_class(c);
        &self.classes[c.index() as usize]
    }

    /// Number of created classes
    #[must_use]
    pub fn class_count(&self) -> u32 {
        self.classes.len() as u32
    }

    fn class_of(&self, r: ReceiverHandle) -> ClassHandle {
        self.check_receiver(r);
        match self.receivers[r.index() as usize] {
            Some((_, c)) => c,
            None => fatal("acquire/release for an unregistered receiver"),
        }
    }

    fn check_receiver(&self, r: ReceiverHandle) {
        if !r.is_compatible(self.group, self.receivers.len() as u32) {
            fatal("receiver handle not compatible with this class manager");
        }
    }

    fn check_class(&self, c: ClassHandle) {
        if !c.is_compatible(self.group, self.classes.len() as u32) {
            fatal("class handle not compatible with this class manager");
        }
    }
}
