// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lock-free SPSC queues carrying slot indices between processes.
//!
//! # Memory Layout
//!
//! ```text
//! +---------------------------------------------------+
//! | QueueHeader                                       |
//! |   magic/version/geometry echo (64 bytes)          |
//! |   head cursor, cache-line isolated (64 bytes)     |
//! |   tail cursor, cache-line isolated (64 bytes)     |
//! +---------------------------------------------------+
//! | entry[0] .. entry[capacity-1]  (u32 each)         |
//! +---------------------------------------------------+
//! ```
//!
//! # Synchronization Protocol
//!
//! Single producer, single consumer, monotonic 64-bit cursors:
//!
//! - Producer: read `tail` (Acquire); full when `head - tail == capacity`;
//!   store the entry, then publish `head + 1` (Release).
//! - Consumer: read `head` (Acquire); empty when `tail == head`; read the
//!   entry, then publish `tail + 1` (Release).
//!
//! The Release on the cursor pairs with the Acquire on the opposite side,
//! so an entry is always fully visible before its index range is.
//!
//! # Cross-process trust
//!
//! The peer owns one cursor and can scribble on it. Every operation
//! re-checks the structural invariant `tail <= head <= tail + capacity` and
//! reports [`Error::Queue`] on violation instead of reading out of range.
//! The creator is always the producing side here (server for the available
//! queue, client for the free queue).

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::mem::{MemoryExchangeHandle, SharedRegion};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Magic identifying an index queue region ("SCIQ")
const QUEUE_MAGIC: u32 = 0x5343_4951;
/// Queue layout version
const QUEUE_VERSION: u32 = 1;

#[repr(C, align(64))]
struct QueueHeader {
    magic: u32,
    version: u32,
    capacity: u32,
    entry_width: u32,
    _pad0: [u8; 48],
    head: AtomicU64,
    _pad1: [u8; 56],
    tail: AtomicU64,
    _pad2: [u8; 56],
}

/// Total region size for a queue with the given geometry
#[must_use]
pub fn queue_region_size(cfg: &QueueConfig) -> usize {
    std::mem::size_of::<QueueHeader>() + cfg.capacity as usize * cfg.entry_width as usize
}

/// One endpoint of an SPSC index queue over shared memory.
///
/// The same type serves both roles; which operations a side may call is
/// fixed by the transfer protocol (producer pushes, consumer pops).
pub struct IndexQueue {
    region: SharedRegion,
    capacity: u64,
    mask: u64,
}

impl IndexQueue {
    /// Create and initialize the queue region (producing side).
    pub fn create(name: &str, cfg: QueueConfig) -> Result<Self> {
        cfg.validate()?;
        let region = SharedRegion::create(name, queue_region_size(&cfg))?;

        // SAFETY: the freshly created region is zero-initialized, at least
        // header-sized and page-aligned; no other mapping exists yet.
        let header = unsafe { &mut *region.as_ptr().cast::<QueueHeader>() };
        header.magic = QUEUE_MAGIC;
        header.version = QUEUE_VERSION;
        header.capacity = cfg.capacity;
        header.entry_width = cfg.entry_width;

        Ok(Self {
            region,
            capacity: u64::from(cfg.capacity),
            mask: u64::from(cfg.capacity) - 1,
        })
    }

    /// Attach an existing queue region (consuming side) and cross-check the
    /// header against the negotiated geometry.
    pub fn attach(handle: &MemoryExchangeHandle, cfg: QueueConfig) -> Result<Self> {
        cfg.validate()?;
        let expected = queue_region_size(&cfg);
        if handle.len() != expected as u64 {
            return Err(Error::Protocol(format!(
                "queue region length {} does not match geometry ({expected})",
                handle.len()
            )));
        }
        let region = SharedRegion::attach(handle)?;

        // SAFETY: the region is at least `expected` bytes and page-aligned.
        let header = unsafe { &*region.as_ptr().cast::<QueueHeader>() };
        if header.magic != QUEUE_MAGIC
            || header.version != QUEUE_VERSION
            || header.capacity != cfg.capacity
            || header.entry_width != cfg.entry_width
        {
            return Err(Error::Protocol(format!(
                "queue header of {} does not echo the negotiated geometry",
                region.name()
            )));
        }

        Ok(Self {
            region,
            capacity: u64::from(cfg.capacity),
            mask: u64::from(cfg.capacity) - 1,
        })
    }

    /// Exchange token for the queue region
    #[must_use]
    pub fn exchange_handle(&self) -> MemoryExchangeHandle {
        self.region.handle()
    }

    /// Push one index. `Ok(false)` means the queue is full.
    ///
    /// Producer side only.
    pub fn push(&self, value: u32) -> Result<bool> {
        let header = self.header();
        let head = header.head.load(Ordering::Relaxed);
        let tail = header.tail.load(Ordering::Acquire);
        self.check_cursors(head, tail)?;

        if head - tail == self.capacity {
            return Ok(false);
        }

        self.entry(head & self.mask).store(value, Ordering::Relaxed);
        // Release publishes the entry store above to the consumer's
        // Acquire load of head.
        header.head.store(head + 1, Ordering::Release);
        Ok(true)
    }

    /// Pop one index, or `None` when empty.
    ///
    /// Consumer side only.
    pub fn pop(&self) -> Result<Option<u32>> {
        let header = self.header();
        let tail = header.tail.load(Ordering::Relaxed);
        let head = header.head.load(Ordering::Acquire);
        self.check_cursors(head, tail)?;

        if tail == head {
            return Ok(None);
        }

        let value = self.entry(tail & self.mask).load(Ordering::Relaxed);
        header.tail.store(tail + 1, Ordering::Release);
        Ok(Some(value))
    }

    /// Next index without consuming it, or `None` when empty.
    ///
    /// Consumer side only.
    pub fn peek(&self) -> Result<Option<u32>> {
        let header = self.header();
        let tail = header.tail.load(Ordering::Relaxed);
        let head = header.head.load(Ordering::Acquire);
        self.check_cursors(head, tail)?;

        if tail == head {
            return Ok(None);
        }
        Ok(Some(self.entry(tail & self.mask).load(Ordering::Relaxed)))
    }

    /// Entries currently in flight
    #[must_use]
    pub fn len(&self) -> u64 {
        let header = self.header();
        let tail = header.tail.load(Ordering::Acquire);
        let head = header.head.load(Ordering::Acquire);
        head.saturating_sub(tail)
    }

    /// True when no entry is in flight
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn header(&self) -> &QueueHeader {
        // SAFETY: the mapping starts with a QueueHeader (validated at
        // create/attach); the header uses atomics for all shared fields.
        unsafe { &*self.region.as_ptr().cast::<QueueHeader>() }
    }

    #[inline]
    fn entry(&self, index: u64) -> &AtomicU32 {
        debug_assert!(index < self.capacity);
        // SAFETY: the entries array directly follows the header and holds
        // exactly `capacity` u32 values; index is masked below capacity.
        unsafe {
            let base = self.region.as_ptr().add(std::mem::size_of::<QueueHeader>());
            &*base.cast::<AtomicU32>().add(index as usize)
        }
    }

    fn check_cursors(&self, head: u64, tail: u64) -> Result<()> {
        if tail > head || head - tail > self.capacity {
            return Err(Error::Queue(format!(
                "cursors out of range (head {head}, tail {tail}, capacity {})",
                self.capacity
            )));
        }
        Ok(())
    }
}
