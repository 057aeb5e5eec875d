// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Slot pool layout and typed slot descriptors.
//!
//! # Memory Layout
//!
//! ```text
//! +------------------------------------------------------------+
//! | PoolHeader (64 bytes, cache-aligned)                       |
//! +------------------------------------------------------------+
//! | slot[0]  (slot_stride bytes, payload at offset 0)          |
//! | slot[1]                                                    |
//! | ...                                                        |
//! | slot[slot_count-1]                                         |
//! +------------------------------------------------------------+
//! ```
//!
//! The header echoes the negotiated geometry; a client attaching the pool
//! re-validates every field against the `ConnectionRequest` it decoded, so a
//! lying or corrupted server cannot make the client read out of bounds.
//!
//! Slot contents carry no synchronization of their own. The ownership
//! engine guarantees the server writes a slot only while it holds the
//! server bit and no receiver bit is set, and clients read only between
//! popping the index from their available queue and pushing it to the free
//! queue.

use crate::config::{round_up, SlotPoolConfig};
use crate::error::{fatal, Error, Result};
use crate::handle::{Group, SlotHandle};
use crate::mem::{MemoryExchangeHandle, SharedRegion};

/// Magic identifying a slot pool region ("SCSP")
const POOL_MAGIC: u32 = 0x5343_5350;
/// Pool layout version
const POOL_VERSION: u32 = 1;

/// Header at the start of the pool region.
#[repr(C, align(64))]
struct PoolHeader {
    magic: u32,
    version: u32,
    group: u64,
    slot_count: u32,
    slot_size: u32,
    slot_align: u32,
    payload_size: u32,
    payload_align: u32,
    _pad: [u8; 28],
}

/// Total region size for a pool with the given geometry
#[must_use]
pub fn pool_region_size(cfg: &SlotPoolConfig) -> usize {
    slots_offset(cfg) + cfg.slot_count as usize * cfg.slot_stride()
}

fn slots_offset(cfg: &SlotPoolConfig) -> usize {
    round_up(std::mem::size_of::<PoolHeader>(), cfg.slot_align as usize)
}

/// The mapped slot pool, shared between the server and every client.
pub struct SlotPool {
    region: SharedRegion,
    cfg: SlotPoolConfig,
}

impl SlotPool {
    /// Create and initialize the pool region (server side).
    pub fn create(name: &str, group: Group, cfg: SlotPoolConfig) -> Result<Self> {
        cfg.validate()?;
        let region = SharedRegion::create(name, pool_region_size(&cfg))?;

        // SAFETY:
        // - the region was created with at least size_of::<PoolHeader>()
        //   bytes and is page-aligned, satisfying the header's 64-byte
        //   alignment
        // - the region was just created, so no other mapping exists yet
        let header = unsafe { &mut *region.as_ptr().cast::<PoolHeader>() };
        *header = PoolHeader {
            magic: POOL_MAGIC,
            version: POOL_VERSION,
            group: group.as_raw(),
            slot_count: cfg.slot_count,
            slot_size: cfg.slot_size,
            slot_align: cfg.slot_align,
            payload_size: cfg.payload_size,
            payload_align: cfg.payload_align,
            _pad: [0u8; 28],
        };

        Ok(Self { region, cfg })
    }

    /// Attach an existing pool region (client side) and cross-check the
    /// header against the geometry negotiated over the side channel.
    pub fn attach(handle: &MemoryExchangeHandle, group: Group, cfg: SlotPoolConfig) -> Result<Self> {
        cfg.validate()?;
        let expected = pool_region_size(&cfg);
        if handle.len() != expected as u64 {
            return Err(Error::Protocol(format!(
                "pool region length {} does not match geometry ({expected})",
                handle.len()
            )));
        }
        let region = SharedRegion::attach(handle)?;

        // SAFETY: the region is at least `expected` bytes (attach verified
        // the object size) and page-aligned; the header is plain data.
        let header = unsafe { &*region.as_ptr().cast::<PoolHeader>() };
        let echo_ok = header.magic == POOL_MAGIC
            && header.version == POOL_VERSION
            && header.group == group.as_raw()
            && header.slot_count == cfg.slot_count
            && header.slot_size == cfg.slot_size
            && header.slot_align == cfg.slot_align
            && header.payload_size == cfg.payload_size
            && header.payload_align == cfg.payload_align;
        if !echo_ok {
            return Err(Error::Protocol(format!(
                "pool header of {} does not echo the negotiated geometry",
                region.name()
            )));
        }

        Ok(Self { region, cfg })
    }

    /// Exchange token for the pool region
    #[must_use]
    pub fn exchange_handle(&self) -> MemoryExchangeHandle {
        self.region.handle()
    }

    /// Pool geometry
    #[must_use]
    pub fn config(&self) -> &SlotPoolConfig {
        &self.cfg
    }

    /// Pointer to the payload bytes of slot `index`
    fn payload_ptr(&self, index: u32) -> *mut u8 {
        debug_assert!(index < self.cfg.slot_count);
        let offset = slots_offset(&self.cfg) + index as usize * self.cfg.slot_stride();
        // SAFETY: offset + payload_size <= pool_region_size for any index
        // below slot_count, which the callers guarantee.
        unsafe { self.region.as_ptr().add(offset) }
    }

    /// Build the server's descriptor table. Call once at construction.
    #[must_use]
    pub fn writable_slots(&self) -> Vec<WritableSlot> {
        (0..self.cfg.slot_count)
            .map(|i| WritableSlot {
                ptr: self.payload_ptr(i),
                len: self.cfg.payload_size as usize,
            })
            .collect()
    }

    /// Build a client's descriptor table. Call once at construction.
    #[must_use]
    pub fn readable_slots(&self) -> Vec<ReadableSlot> {
        (0..self.cfg.slot_count)
            .map(|i| ReadableSlot {
                ptr: self.payload_ptr(i),
                len: self.cfg.payload_size as usize,
            })
            .collect()
    }
}

/// Server-side view of one slot: writable payload plus `reset`.
pub struct WritableSlot {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the pointer targets the pool mapping, which outlives the
// descriptor table holding this value; exclusive write access is enforced
// by the ownership engine (server bit set, no receiver bits).
unsafe impl Send for WritableSlot {}

impl WritableSlot {
    /// Writable payload bytes
    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: ptr/len describe the slot's payload range inside the live
        // pool mapping; &mut self gives exclusive access to this descriptor
        // and the ownership engine keeps readers away while the server
        // holds the slot.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    /// Zero the payload
    pub fn reset(&mut self) {
        self.bytes_mut().fill(0);
    }

    /// Payload size in bytes
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the payload region is empty (never for a valid pool)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Client-side view of one slot: read-only payload.
pub struct ReadableSlot {
    ptr: *const u8,
    len: usize,
}

// SAFETY: see WritableSlot; clients only read, and only while they hold
// the slot per the queue protocol.
unsafe impl Send for ReadableSlot {}

impl ReadableSlot {
    /// Read-only payload bytes
    #[inline]
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: ptr/len describe the slot's payload range inside the live
        // pool mapping; the server does not write while a receiver bit for
        // this slot is set.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// Payload size in bytes
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the payload region is empty (never for a valid pool)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Fixed table mapping a [`SlotHandle`] to its descriptor.
///
/// Descriptors are built once at construction and never reallocated.
pub struct SlotManager<D> {
    group: Group,
    descriptors: Vec<D>,
}

impl<D> SlotManager<D> {
    /// Wrap a descriptor table built from the pool
    #[must_use]
    pub fn new(group: Group, descriptors: Vec<D>) -> Self {
        Self { group, descriptors }
    }

    /// Descriptor for `s`. Handle mismatch aborts.
    #[must_use]
    pub fn get(&self, s: SlotHandle) -> &D {
        self.check(s);
        &self.descriptors[s.index() as usize]
    }

    /// Mutable descriptor for `s`. Handle mismatch aborts.
    pub fn get_mut(&mut self, s: SlotHandle) -> &mut D {
        self.check(s);
        &mut self.descriptors[s.index() as usize]
    }

    /// Number of slots in the table
    #[must_use]
    pub fn slot_count(&self) -> u32 {
        self.descriptors.len() as u32
    }

    fn check(&self, s: SlotHandle) {
        if !s.is_compatible(self.group, self.descriptors.len() as u32) {
            fatal("slot handle not compatible with this slot manager");
        }
    }
}
