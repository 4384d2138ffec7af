//! Id sequences
//!
//! Every owning object hands out ids for its children from its own
//! sequence: the subsystem numbers namespaces, a namespace numbers buses,
//! a bus numbers endpoints, connections and messages. Ids start at 1 and
//! are never reused, even after the child is disconnected. Id 0 is
//! reserved for messages originating from the bus itself.

use core::sync::atomic::{AtomicU64, Ordering};

/// Sender id of bus-generated notifications
pub const KERNEL_ID: u64 = 0;

/// Wire value standing for "every connection on the endpoint"
pub const BROADCAST_ID: u64 = u64::MAX;

/// Monotonic 64-bit id generator
#[derive(Debug)]
pub struct IdSequence {
    next: AtomicU64,
}

impl IdSequence {
    /// Create a sequence whose first id is 1
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next id
    #[inline]
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Peek at the id the next allocation will return
    #[inline]
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for IdSequence {
    fn default() -> Self {
        Self::new()
    }
}
