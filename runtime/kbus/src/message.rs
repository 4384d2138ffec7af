//! Message envelopes and queues
//!
//! A message is allocated once per `send` and shared between every queue
//! that receives it:
//!
//! ```text
//! send(C1 → broadcast)
//!            ┌──────────────┐
//!   C2 queue │ [m7] → [m9]  │──┐
//!            └──────────────┘  │   ┌────────────────────────┐
//!            ┌──────────────┐  ├──▶│ Kmsg #9 (one payload)  │
//!   C3 queue │ [m9]         │──┘   └────────────────────────┘
//!            └──────────────┘
//! ```
//!
//! The payload is freed when the last queue entry referencing it is
//! consumed or discarded.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::id::BROADCAST_ID;

bitflags::bitflags! {
    /// Bus notifications a connection can subscribe to
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct NotifyMask: u32 {
        /// A connection said hello
        const ID_ADD = 1 << 0;
        /// A connection went away
        const ID_REMOVE = 1 << 1;
        /// A well-known name changed owner
        const NAME_CHANGE = 1 << 2;
        /// Everything above
        const ALL = Self::ID_ADD.bits() | Self::ID_REMOVE.bits() | Self::NAME_CHANGE.bits();
    }
}

/// Where a message is routed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Destination {
    /// A single connection by id
    Id(u64),
    /// The current owner of a well-known name
    Name(String),
    /// Every eligible connection on the sender's endpoint
    Broadcast,
}

impl Destination {
    /// Build a destination from a wire id, mapping [`BROADCAST_ID`]
    pub fn from_id(id: u64) -> Self {
        if id == BROADCAST_ID {
            Destination::Broadcast
        } else {
            Destination::Id(id)
        }
    }
}

/// Bus-generated change event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    /// Connection became active
    IdAdded { id: u64 },
    /// Connection disconnected
    IdRemoved { id: u64 },
    /// Ownership of a well-known name changed
    NameChanged {
        name: String,
        old_owner: Option<u64>,
        new_owner: Option<u64>,
    },
}

impl Notification {
    /// Subscription bit selecting this notification
    pub fn mask(&self) -> NotifyMask {
        match self {
            Notification::IdAdded { .. } => NotifyMask::ID_ADD,
            Notification::IdRemoved { .. } => NotifyMask::ID_REMOVE,
            Notification::NameChanged { .. } => NotifyMask::NAME_CHANGE,
        }
    }
}

/// Message contents
#[derive(Debug)]
pub enum Body {
    /// Opaque client payload
    Payload(Box<[u8]>),
    /// Bus notification
    Notification(Notification),
}

#[derive(Debug)]
struct Kmsg {
    id: u64,
    sender: u64,
    destination: Destination,
    body: Body,
}

/// Reference-counted handle to a routed message
///
/// Cloning a `Message` is the "ref" operation; dropping it the "unref".
#[derive(Debug, Clone)]
pub struct Message {
    inner: Arc<Kmsg>,
}

impl Message {
    pub(crate) fn new(id: u64, sender: u64, destination: Destination, body: Body) -> Self {
        Self {
            inner: Arc::new(Kmsg {
                id,
                sender,
                destination,
                body,
            }),
        }
    }

    /// Message id, unique within the bus
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Sending connection id ([`KERNEL_ID`](crate::KERNEL_ID) for notifications)
    #[inline]
    pub fn sender(&self) -> u64 {
        self.inner.sender
    }

    /// Destination the sender addressed
    pub fn destination(&self) -> &Destination {
        &self.inner.destination
    }

    /// Message body
    pub fn body(&self) -> &Body {
        &self.inner.body
    }

    /// Client payload, if this is not a notification
    pub fn payload(&self) -> Option<&[u8]> {
        match &self.inner.body {
            Body::Payload(data) => Some(data),
            Body::Notification(_) => None,
        }
    }

    /// Notification, if this message was generated by the bus
    pub fn notification(&self) -> Option<&Notification> {
        match &self.inner.body {
            Body::Notification(n) => Some(n),
            Body::Payload(_) => None,
        }
    }

    /// True if the message was sent to every connection on an endpoint
    pub fn is_broadcast(&self) -> bool {
        self.inner.destination == Destination::Broadcast
    }

    /// Number of live handles (queue entries plus caller copies)
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// True if both handles refer to the same routed message
    pub fn same_message(a: &Message, b: &Message) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    #[cfg(test)]
    pub(crate) fn downgrade(&self) -> std::sync::Weak<impl Sized> {
        Arc::downgrade(&self.inner)
    }
}

/// FIFO of message handles owned by a connection or an endpoint
#[derive(Debug, Default)]
pub(crate) struct MessageQueue {
    entries: VecDeque<Message>,
}

impl MessageQueue {
    pub(crate) fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn push(&mut self, message: Message) {
        self.entries.push_back(message);
    }

    /// Append, dropping the oldest entry when `limit` is reached
    ///
    /// Returns true if an entry was dropped.
    pub(crate) fn push_bounded(&mut self, message: Message, limit: usize) -> bool {
        if limit == 0 {
            return true;
        }
        let mut dropped = false;
        while self.entries.len() >= limit {
            self.entries.pop_front();
            dropped = true;
        }
        self.entries.push_back(message);
        dropped
    }

    pub(crate) fn pop(&mut self) -> Option<Message> {
        self.entries.pop_front()
    }

    /// Take every entry out of the queue
    ///
    /// Callers drop the result after releasing their lock so payloads are
    /// freed outside of it.
    pub(crate) fn take(&mut self) -> VecDeque<Message> {
        std::mem::take(&mut self.entries)
    }
}
