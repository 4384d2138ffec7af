//! Message routing
//!
//! Resolves a destination to target connections, allocates one shared
//! message and places a handle on every target queue. Targets are
//! snapshotted first and each queue is locked on its own, so no two
//! connection locks are ever held together.

use log::trace;

use crate::bus::Bus;
use crate::connection::{Connection, ConnectionState};
use crate::endpoint::Endpoint;
use crate::error::{BusError, Result};
use crate::id::KERNEL_ID;
use crate::message::{Body, Destination, Message, Notification};
use crate::policy::Rights;

pub(crate) fn send(sender: &Connection, destination: Destination, payload: Vec<u8>) -> Result<u64> {
    match sender.state() {
        ConnectionState::Created => return Err(BusError::NotActive),
        ConnectionState::Disconnected => return Err(BusError::ConnectionDisconnected),
        ConnectionState::Active => {}
    }
    let bus = sender.bus().ok_or(BusError::ConnectionDisconnected)?;
    let endpoint = sender.endpoint().ok_or(BusError::ConnectionDisconnected)?;

    let max = bus.limits().max_payload;
    if payload.len() > max {
        return Err(BusError::PayloadTooLarge {
            size: payload.len(),
            max,
        });
    }
    if !endpoint.access().permits(sender.credentials(), Rights::WRITE) {
        return Err(BusError::PermissionDenied);
    }

    let target = match &destination {
        Destination::Id(id) => Some(*id),
        Destination::Name(name) => Some(
            bus.resolver()
                .lookup(name)
                .ok_or_else(|| BusError::DestinationNotFound(name.clone()))?,
        ),
        Destination::Broadcast => None,
    };

    match target {
        Some(id) => unicast(&bus, &endpoint, sender, id, destination, payload),
        None => broadcast(&bus, &endpoint, sender, payload),
    }
}

fn unicast(
    bus: &Bus,
    endpoint: &Endpoint,
    sender: &Connection,
    target_id: u64,
    destination: Destination,
    payload: Vec<u8>,
) -> Result<u64> {
    let not_found = || BusError::DestinationNotFound(target_id.to_string());

    let target = bus
        .connection(target_id)
        .filter(|conn| conn.is_active())
        .ok_or_else(not_found)?;

    let message = Message::new(
        bus.next_message_id(),
        sender.id(),
        destination,
        Body::Payload(payload.into_boxed_slice()),
    );
    let id = message.id();

    target
        .enqueue(message.clone(), bus.limits().max_queued_messages)
        .map_err(|err| match err {
            BusError::NotActive | BusError::ConnectionDisconnected => not_found(),
            other => other,
        })?;
    endpoint.push_message(message, bus.limits().endpoint_backlog);

    trace!("kbus: message {} routed {} -> {}", id, sender.id(), target_id);
    Ok(id)
}

fn broadcast(bus: &Bus, endpoint: &Endpoint, sender: &Connection, payload: Vec<u8>) -> Result<u64> {
    let access = endpoint.access();
    let targets: Vec<_> = endpoint
        .connections()
        .into_iter()
        .filter(|conn| conn.id() != sender.id())
        .filter(|conn| access.permits(conn.credentials(), Rights::READ))
        .collect();

    let message = Message::new(
        bus.next_message_id(),
        sender.id(),
        Destination::Broadcast,
        Body::Payload(payload.into_boxed_slice()),
    );
    let id = message.id();
    let limit = bus.limits().max_queued_messages;

    let mut delivered = 0usize;
    for target in &targets {
        match target.enqueue(message.clone(), limit) {
            Ok(()) => delivered += 1,
            Err(err) => trace!("kbus: broadcast {} skipped {}: {}", id, target.id(), err),
        }
    }
    endpoint.push_message(message, bus.limits().endpoint_backlog);

    trace!(
        "kbus: broadcast {} from {} delivered to {} connections",
        id,
        sender.id(),
        delivered
    );
    Ok(id)
}

/// Deliver bus notifications to subscribed active connections
pub(crate) fn notify(bus: &Bus, events: Vec<Notification>) {
    if events.is_empty() || bus.is_disconnected() {
        return;
    }

    let connections = bus.connections();
    let limit = bus.limits().max_queued_messages;

    for event in events {
        let mask = event.mask();
        let subscribers: Vec<_> = connections
            .iter()
            .filter(|conn| conn.subscriptions().contains(mask))
            .collect();
        if subscribers.is_empty() {
            continue;
        }

        let message = Message::new(
            bus.next_message_id(),
            KERNEL_ID,
            Destination::Broadcast,
            Body::Notification(event),
        );
        for conn in subscribers {
            if let Err(err) = conn.enqueue(message.clone(), limit) {
                trace!("kbus: notification {} skipped {}: {}", message.id(), conn.id(), err);
            }
        }
    }
}
