//! Connection admission limits.
//!
//! # Responsibilities
//! - Enforce the global concurrent-connection quota
//! - Hand out tickets that return their slot exactly once
//!
//! # Design Decisions
//! - Non-blocking: an over-quota connection is rejected, never queued
//! - Lock-free compare-and-swap on a single atomic counter
//! - A quota of zero admits nothing; `unlimited()` admits everything

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// A counter gating how many units of a resource may be held at once.
#[derive(Debug)]
pub struct ResourceCounter {
    count: AtomicUsize,
    limit: Option<usize>,
}

impl ResourceCounter {
    /// A counter that never refuses.
    pub fn unlimited() -> Self {
        Self {
            count: AtomicUsize::new(0),
            limit: None,
        }
    }

    /// A counter admitting at most `limit` concurrent holders.
    pub fn quota(limit: usize) -> Self {
        Self {
            count: AtomicUsize::new(0),
            limit: Some(limit),
        }
    }

    /// Try to take one unit. Returns `false` when the quota is exhausted.
    pub fn try_acquire(&self) -> bool {
        let Some(limit) = self.limit else {
            self.count.fetch_add(1, Ordering::AcqRel);
            return true;
        };

        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current >= limit {
                return false;
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Return one unit.
    pub fn release(&self) {
        let previous = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "released more units than were acquired");
    }

    /// Units currently held.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Configured quota, or `None` when unlimited.
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }
}

/// Admission controller for raw connections.
#[derive(Debug, Clone)]
pub struct ConnectionLimiter {
    counter: Arc<ResourceCounter>,
}

impl ConnectionLimiter {
    /// `None` means unlimited.
    pub fn new(max_connections: Option<usize>) -> Self {
        let counter = match max_connections {
            Some(limit) => ResourceCounter::quota(limit),
            None => ResourceCounter::unlimited(),
        };
        Self {
            counter: Arc::new(counter),
        }
    }

    /// Try to admit one connection.
    pub fn try_admit(&self) -> Option<AdmissionTicket> {
        self.counter.try_acquire().then(|| AdmissionTicket {
            inner: Arc::new(TicketInner {
                counter: Arc::clone(&self.counter),
                released: AtomicBool::new(false),
            }),
        })
    }

    /// Connections currently admitted.
    pub fn active(&self) -> usize {
        self.counter.count()
    }

    pub fn limit(&self) -> Option<usize> {
        self.counter.limit()
    }
}

#[derive(Debug)]
struct TicketInner {
    counter: Arc<ResourceCounter>,
    released: AtomicBool,
}

impl TicketInner {
    fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.counter.release();
        true
    }
}

/// A lease on one admission slot.
///
/// The slot returns when the ticket is released or when the last clone is
/// dropped, whichever comes first. Releasing more than once is a no-op.
#[derive(Debug, Clone)]
pub struct AdmissionTicket {
    inner: Arc<TicketInner>,
}

impl AdmissionTicket {
    /// Return the slot. Returns `true` only for the call that actually released it.
    pub fn release(&self) -> bool {
        self.inner.release()
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// A feature handle that lets downstream code release the slot early.
    pub fn releaser(&self) -> ConnectionReleaser {
        ConnectionReleaser {
            ticket: self.clone(),
        }
    }
}

impl Drop for TicketInner {
    fn drop(&mut self) {
        self.release();
    }
}

/// Connection feature: releases the admission slot ahead of connection close.
///
/// Long-lived upgraded connections call this so they stop counting against
/// the raw connection quota.
#[derive(Debug, Clone)]
pub struct ConnectionReleaser {
    ticket: AdmissionTicket,
}

impl ConnectionReleaser {
    pub fn release(&self) -> bool {
        self.ticket.release()
    }
}
