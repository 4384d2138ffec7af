//! Endpoint - client attachment surface of a bus
//!
//! Every bus has a default endpoint called `bus`; additional endpoints
//! carry their own access policy and are named `<uid>-<name>` after the
//! user that created them.
//!
//! While at least one [`Monitor`] is registered, an endpoint keeps an
//! in-flight queue of the messages its connections send. Monitors drain it
//! and are woken when a message is appended or the endpoint is torn down.
//! With no monitor registered nothing is queued, so a message lives only as
//! long as its recipients hold it.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::bus::Bus;
use crate::connection::Connection;
use crate::error::{BusError, Result};
use crate::handle_table::Handle;
use crate::lock;
use crate::message::{Message, MessageQueue};
use crate::policy::{Access, Mode};

#[derive(Debug)]
pub(crate) struct EndpointState {
    pub(crate) disconnected: bool,
    pub(crate) connections: BTreeMap<u64, Arc<Connection>>,
    queue: MessageQueue,
    monitors: usize,
}

/// Attachment point for connections
#[derive(Debug)]
pub struct Endpoint {
    id: u64,
    name: String,
    minor: Handle,
    access: Access,
    is_default: bool,
    bus: Weak<Bus>,
    state: Mutex<EndpointState>,
    /// Signalled on append and on teardown
    wait: Condvar,
}

/// Connections and queued messages taken out of a torn-down endpoint
struct Teardown {
    connections: BTreeMap<u64, Arc<Connection>>,
    queue: MessageQueue,
}

impl Endpoint {
    pub(crate) fn new(
        bus: Weak<Bus>,
        id: u64,
        name: String,
        minor: Handle,
        access: Access,
        is_default: bool,
    ) -> Self {
        Self {
            id,
            name,
            minor,
            access,
            is_default,
            bus,
            state: Mutex::new(EndpointState {
                disconnected: false,
                connections: BTreeMap::new(),
                queue: MessageQueue::new(),
                monitors: 0,
            }),
            wait: Condvar::new(),
        }
    }

    /// Create an additional endpoint on `bus`
    ///
    /// The public name is `<uid>-<name>` so unprivileged creators cannot
    /// collide with each other.
    ///
    /// # Errors
    /// - `InvalidArgument` for an empty name or one containing `/`
    /// - `NamespaceDisconnected` / `BusDisconnected` if an ancestor is torn down
    /// - `AlreadyExists` if the bus already has an endpoint with that public name
    pub fn create(bus: &Arc<Bus>, name: &str, mode: Mode, uid: u32, gid: u32) -> Result<Arc<Endpoint>> {
        if name.is_empty() || name.contains('/') {
            return Err(BusError::InvalidArgument(format!(
                "invalid endpoint name '{}'",
                name
            )));
        }
        let public_name = format!("{}-{}", uid, name);

        let ns = bus.namespace().ok_or(BusError::BusDisconnected)?;
        let mut ns_state = ns.lock_state();
        if ns_state.disconnected {
            return Err(BusError::NamespaceDisconnected);
        }

        let mut bus_state = bus.lock_state();
        if bus_state.disconnected {
            return Err(BusError::BusDisconnected);
        }
        if bus_state.endpoints.values().any(|ep| ep.name == public_name) {
            return Err(BusError::AlreadyExists {
                kind: "endpoint",
                name: public_name,
            });
        }

        let id = bus.next_endpoint_id();
        let minor = ns_state.minors.insert(Weak::new());
        let endpoint = Arc::new(Endpoint::new(
            Arc::downgrade(bus),
            id,
            public_name,
            minor,
            Access::new(mode, uid, gid),
            false,
        ));
        if let Some(slot) = ns_state.minors.get_mut(minor) {
            *slot = Arc::downgrade(&endpoint);
        }
        bus_state.endpoints.insert(id, Arc::clone(&endpoint));

        debug!(
            "kbus: endpoint '{}' (id {}, minor {}) created on bus '{}'",
            endpoint.name,
            id,
            minor,
            bus.name()
        );
        Ok(endpoint)
    }

    /// Look up an endpoint of `bus` by public name
    pub fn find(bus: &Bus, name: &str) -> Result<Arc<Endpoint>> {
        bus.find_endpoint(name)
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, EndpointState> {
        lock(&self.state)
    }

    /// Endpoint id, unique within the bus
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Public name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Minor number within the namespace
    pub fn minor(&self) -> Handle {
        self.minor
    }

    /// Ownership and mode of the endpoint node
    pub fn access(&self) -> Access {
        self.access
    }

    /// True for the endpoint created together with the bus
    pub fn is_default(&self) -> bool {
        self.is_default
    }

    /// Owning bus, if still alive
    pub fn bus(&self) -> Option<Arc<Bus>> {
        self.bus.upgrade()
    }

    /// Node path below the namespace devpath, e.g. `kdbus/system/bus`
    pub fn node_path(&self) -> Option<String> {
        let bus = self.bus.upgrade()?;
        let ns = bus.namespace()?;
        Some(format!("{}/{}/{}", ns.devpath(), bus.name(), self.name))
    }

    /// True once the endpoint has been torn down
    pub fn is_disconnected(&self) -> bool {
        self.lock_state().disconnected
    }

    /// Connections attached through this endpoint, ascending by id
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.lock_state().connections.values().cloned().collect()
    }

    /// Number of attached connections
    pub fn connection_count(&self) -> usize {
        self.lock_state().connections.len()
    }

    /// Number of messages waiting in the in-flight queue
    pub fn pending(&self) -> usize {
        self.lock_state().queue.len()
    }

    /// Number of registered monitors
    pub fn monitor_count(&self) -> usize {
        self.lock_state().monitors
    }

    /// Register a monitor; messages are queued from now until it drops
    ///
    /// # Errors
    /// - `EndpointDisconnected` if the endpoint is torn down
    pub fn monitor(self: &Arc<Self>) -> Result<Monitor> {
        let mut state = self.lock_state();
        if state.disconnected {
            return Err(BusError::EndpointDisconnected);
        }
        state.monitors += 1;
        trace!("kbus: endpoint {} monitors: {}", self.id, state.monitors);
        Ok(Monitor {
            endpoint: Arc::clone(self),
        })
    }

    fn release_monitor(&self) {
        let discarded = {
            let mut state = self.lock_state();
            state.monitors = state.monitors.saturating_sub(1);
            if state.monitors > 0 {
                return;
            }
            std::mem::take(&mut state.queue)
        };
        if !discarded.is_empty() {
            trace!(
                "kbus: endpoint {} last monitor gone, discarded {} messages",
                self.id,
                discarded.len()
            );
        }
    }

    /// Append a routed message to the in-flight queue and wake monitors
    ///
    /// No-op unless a monitor is registered.
    pub(crate) fn push_message(&self, message: Message, backlog: usize) {
        let dropped = {
            let mut state = self.lock_state();
            if state.disconnected || state.monitors == 0 {
                return;
            }
            state.queue.push_bounded(message, backlog)
        };
        if dropped {
            trace!("kbus: endpoint {} backlog full, dropped oldest message", self.id);
        }
        self.wait.notify_all();
    }

    fn next_message(&self) -> Result<Message> {
        let mut state = self.lock_state();
        loop {
            if state.disconnected {
                return Err(BusError::EndpointDisconnected);
            }
            if let Some(message) = state.queue.pop() {
                return Ok(message);
            }
            state = self.wait.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    fn try_next_message(&self) -> Result<Message> {
        let mut state = self.lock_state();
        if state.disconnected {
            return Err(BusError::EndpointDisconnected);
        }
        state.queue.pop().ok_or(BusError::WouldBlock)
    }

    fn next_message_timeout(&self, timeout: Duration) -> Result<Message> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock_state();
        loop {
            if state.disconnected {
                return Err(BusError::EndpointDisconnected);
            }
            if let Some(message) = state.queue.pop() {
                return Ok(message);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(BusError::TimedOut);
            }
            state = self
                .wait
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    /// Administrative removal
    ///
    /// Fails with `Busy` while connections are attached and with
    /// `InvalidArgument` for the default endpoint; use
    /// [`disconnect`](Self::disconnect) to force teardown.
    pub fn remove(&self) -> Result<()> {
        let teardown = {
            let mut state = self.lock_state();
            if state.disconnected {
                return Err(BusError::EndpointDisconnected);
            }
            if self.is_default {
                return Err(BusError::InvalidArgument(
                    "the default endpoint is removed with its bus".to_string(),
                ));
            }
            if !state.connections.is_empty() {
                return Err(BusError::Busy {
                    connections: state.connections.len(),
                });
            }
            Self::begin_teardown(&mut state)
        };
        self.finish_teardown(teardown);
        Ok(())
    }

    /// Tear the endpoint down
    ///
    /// Idempotent. Disconnects every attached connection, discards the
    /// in-flight queue and wakes monitors with end-of-stream.
    pub fn disconnect(&self) {
        let teardown = {
            let mut state = self.lock_state();
            if state.disconnected {
                return;
            }
            Self::begin_teardown(&mut state)
        };
        self.finish_teardown(teardown);
    }

    fn begin_teardown(state: &mut EndpointState) -> Teardown {
        state.disconnected = true;
        Teardown {
            connections: std::mem::take(&mut state.connections),
            queue: std::mem::take(&mut state.queue),
        }
    }

    fn finish_teardown(&self, teardown: Teardown) {
        self.wait.notify_all();
        drop(teardown.queue);

        for connection in teardown.connections.values() {
            connection.disconnect();
        }

        if let Some(bus) = self.bus.upgrade() {
            bus.remove_endpoint(self.id);
            if let Some(ns) = bus.namespace() {
                ns.release_minor(self.minor);
            }
        }

        debug!("kbus: endpoint '{}' (id {}) disconnected", self.name, self.id);
    }

    pub(crate) fn remove_connection(&self, id: u64) {
        self.lock_state().connections.remove(&id);
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        trace!("kbus: endpoint {} released", self.id);
    }
}

/// Registered consumer of an endpoint's in-flight queue
///
/// Created by [`Endpoint::monitor`]. Dropping the last monitor discards
/// whatever is still queued.
#[derive(Debug)]
pub struct Monitor {
    endpoint: Arc<Endpoint>,
}

impl Monitor {
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Block until a message is queued or the endpoint is torn down
    pub fn next_message(&self) -> Result<Message> {
        self.endpoint.next_message()
    }

    /// Take the next queued message without blocking
    pub fn try_next_message(&self) -> Result<Message> {
        self.endpoint.try_next_message()
    }

    /// Like [`next_message`](Self::next_message), giving up after `timeout`
    pub fn next_message_timeout(&self, timeout: Duration) -> Result<Message> {
        self.endpoint.next_message_timeout(timeout)
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.endpoint.release_monitor();
    }
}
