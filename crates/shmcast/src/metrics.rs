// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Channel metrics with atomic counters.
//!
//! Each server or client instance owns one [`ChannelMetrics`]; there is no
//! global registry (instances are fully self-contained). Counters use
//! `Relaxed` ordering for minimal overhead and are eventually consistent
//! across threads; a [`ChannelMetricsSnapshot`] freezes one coherent-enough
//! view for logging or assertions.
//!
//! # Tracked Metrics
//!
//! - `published`: slot deliveries pushed to an available queue
//! - `dropped_class_limit` / `dropped_queue_full`: per-receiver drops
//! - `received`: slots popped by a client
//! - `released`: slots returned through a free queue
//! - `reclaimed`: slots the server took back from free queues
//! - `wakeups_sent` / `wakeups_dropped`: notify() outcomes
//! - `protocol_violations`: decode failures and peer rule breaches

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for one channel instance.
#[derive(Debug, Default)]
pub struct ChannelMetrics {
    /// Slot deliveries pushed to an available queue
    pub published: AtomicU64,
    /// Publishes dropped because a class cap was exhausted
    pub dropped_class_limit: AtomicU64,
    /// Publishes dropped because an available queue was full
    pub dropped_queue_full: AtomicU64,
    /// Slots popped from the available queue (client side)
    pub received: AtomicU64,
    /// Slots returned through the free queue (client side)
    pub released: AtomicU64,
    /// Slots the server reclaimed from free queues
    pub reclaimed: AtomicU64,
    /// Wake-up hints that reached the notify lane
    pub wakeups_sent: AtomicU64,
    /// Wake-up hints dropped by the lossy lane
    pub wakeups_dropped: AtomicU64,
    /// Protocol violations observed (malformed records, rule breaches)
    pub protocol_violations: AtomicU64,
}

impl ChannelMetrics {
    /// All counters at zero
    #[must_use]
    pub const fn new() -> Self {
        Self {
            published: AtomicU64::new(0),
            dropped_class_limit: AtomicU64::new(0),
            dropped_queue_full: AtomicU64::new(0),
            received: AtomicU64::new(0),
            released: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
            wakeups_sent: AtomicU64::new(0),
            wakeups_dropped: AtomicU64::new(0),
            protocol_violations: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn add_published(&self, n: u64) {
        self.published.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_dropped_class_limit(&self) {
        self.dropped_class_limit.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_dropped_queue_full(&self) {
        self.dropped_queue_full.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_released(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_reclaimed(&self, n: u64) {
        self.reclaimed.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_wakeups_sent(&self) {
        self.wakeups_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_wakeups_dropped(&self) {
        self.wakeups_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_protocol_violations(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    /// Freeze the current counter values
    #[must_use]
    pub fn snapshot(&self) -> ChannelMetricsSnapshot {
        ChannelMetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            dropped_class_limit: self.dropped_class_limit.load(Ordering::Relaxed),
            dropped_queue_full: self.dropped_queue_full.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            wakeups_sent: self.wakeups_sent.load(Ordering::Relaxed),
            wakeups_dropped: self.wakeups_dropped.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
        }
    }
}

/// Plain-value copy of all counters at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelMetricsSnapshot {
    /// Slot deliveries pushed to an available queue
    pub published: u64,
    /// Publishes dropped because a class cap was exhausted
    pub dropped_class_limit: u64,
    /// Publishes dropped because an available queue was full
    pub dropped_queue_full: u64,
    /// Slots popped from the available queue
    pub received: u64,
    /// Slots returned through the free queue
    pub released: u64,
    /// Slots the server reclaimed from free queues
    pub reclaimed: u64,
    /// Wake-up hints that reached the notify lane
    pub wakeups_sent: u64,
    /// Wake-up hints dropped by the lossy lane
    pub wakeups_dropped: u64,
    /// Protocol violations observed
    pub protocol_violations: u64,
}
