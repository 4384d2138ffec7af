//! Bus - one message bus instance
//!
//! A bus owns its default endpoint (`"bus"`), any additional endpoints,
//! the directory of every connection attached under it and the name
//! registry. It numbers endpoints, connections and messages from three
//! independent sequences that are never rewound.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{debug, trace};

use crate::config::Limits;
use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::error::{BusError, Result};
use crate::id::IdSequence;
use crate::lock;
use crate::namespace::Namespace;
use crate::policy::{Access, Mode};
use crate::resolver::NameResolver;

/// Name of the endpoint every bus is created with
pub const DEFAULT_ENDPOINT: &str = "bus";

bitflags::bitflags! {
    /// Flags passed through from the bus creator to its clients untouched
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
    pub struct BusFlags: u64 {
        const _ = !0;
    }
}

#[derive(Debug)]
pub(crate) struct BusState {
    pub(crate) disconnected: bool,
    pub(crate) endpoints: BTreeMap<u64, Arc<Endpoint>>,
    pub(crate) connections: BTreeMap<u64, Arc<Connection>>,
}

/// One bus instance
#[derive(Debug)]
pub struct Bus {
    id: u64,
    name: String,
    flags: BusFlags,
    access: Access,
    ns: Weak<Namespace>,
    default_endpoint_id: u64,
    ep_ids: IdSequence,
    conn_ids: IdSequence,
    msg_ids: IdSequence,
    limits: Limits,
    resolver: NameResolver,
    state: Mutex<BusState>,
}

impl Bus {
    /// Create a bus in `ns` together with its default endpoint
    ///
    /// # Errors
    /// - `InvalidArgument` for an empty name or one containing `/`
    /// - `NamespaceDisconnected` if `ns` is torn down
    /// - `AlreadyExists` if `ns` already has a bus called `name`
    pub fn create(
        ns: &Arc<Namespace>,
        name: &str,
        mode: Mode,
        flags: BusFlags,
        uid: u32,
        gid: u32,
    ) -> Result<Arc<Bus>> {
        if name.is_empty() || name.contains('/') {
            return Err(BusError::InvalidArgument(format!("invalid bus name '{}'", name)));
        }

        let mut ns_state = ns.lock_state();
        if ns_state.disconnected {
            return Err(BusError::NamespaceDisconnected);
        }
        if ns_state.buses.values().any(|bus| bus.name() == name) {
            return Err(BusError::AlreadyExists {
                kind: "bus",
                name: name.to_string(),
            });
        }

        let id = ns.next_bus_id();
        let access = Access::new(mode, uid, gid);
        let limits = ns.limits().clone();

        // Reserve the default endpoint's minor before the endpoint exists
        let minor = ns_state.minors.insert(Weak::new());

        let bus = Arc::new_cyclic(|weak: &Weak<Bus>| {
            let ep_ids = IdSequence::new();
            let default_endpoint_id = ep_ids.next_id();
            let endpoint = Arc::new(Endpoint::new(
                weak.clone(),
                default_endpoint_id,
                DEFAULT_ENDPOINT.to_string(),
                minor,
                access,
                true,
            ));

            let mut endpoints = BTreeMap::new();
            endpoints.insert(default_endpoint_id, endpoint);

            Bus {
                id,
                name: name.to_string(),
                flags,
                access,
                ns: Arc::downgrade(ns),
                default_endpoint_id,
                ep_ids,
                conn_ids: IdSequence::new(),
                msg_ids: IdSequence::new(),
                resolver: NameResolver::new(limits.max_names_per_connection),
                limits,
                state: Mutex::new(BusState {
                    disconnected: false,
                    endpoints,
                    connections: BTreeMap::new(),
                }),
            }
        });

        if let Some(slot) = ns_state.minors.get_mut(minor) {
            *slot = bus
                .lock_state()
                .endpoints
                .get(&bus.default_endpoint_id)
                .map(Arc::downgrade)
                .unwrap_or_default();
        }
        ns_state.buses.insert(id, Arc::clone(&bus));

        debug!(
            "kbus: bus '{}' (id {}) created in namespace '{}', default endpoint minor {}",
            name,
            id,
            ns.name(),
            minor
        );
        Ok(bus)
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, BusState> {
        lock(&self.state)
    }

    /// Bus id, unique within its namespace
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Bus name, unique within its namespace
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creator-supplied pass-through flags
    pub fn flags(&self) -> BusFlags {
        self.flags
    }

    /// Ownership of the bus node
    pub fn access(&self) -> Access {
        self.access
    }

    /// Limits inherited from the subsystem
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Owning namespace, if still alive
    pub fn namespace(&self) -> Option<Arc<Namespace>> {
        self.ns.upgrade()
    }

    /// Name registry of this bus
    pub fn resolver(&self) -> &NameResolver {
        &self.resolver
    }

    /// True once the bus has been torn down
    pub fn is_disconnected(&self) -> bool {
        self.lock_state().disconnected
    }

    pub(crate) fn next_endpoint_id(&self) -> u64 {
        self.ep_ids.next_id()
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        self.conn_ids.next_id()
    }

    pub(crate) fn next_message_id(&self) -> u64 {
        self.msg_ids.next_id()
    }

    /// The endpoint created together with the bus
    pub fn default_endpoint(&self) -> Result<Arc<Endpoint>> {
        self.lock_state()
            .endpoints
            .get(&self.default_endpoint_id)
            .cloned()
            .ok_or(BusError::BusDisconnected)
    }

    /// Look up an endpoint by its public name
    pub fn find_endpoint(&self, name: &str) -> Result<Arc<Endpoint>> {
        let state = self.lock_state();
        if state.disconnected {
            return Err(BusError::BusDisconnected);
        }
        state
            .endpoints
            .values()
            .find(|ep| ep.name() == name)
            .cloned()
            .ok_or_else(|| BusError::NotFound {
                kind: "endpoint",
                name: name.to_string(),
            })
    }

    /// Endpoints in creation order, default first
    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.lock_state().endpoints.values().cloned().collect()
    }

    /// Look up a connection in the bus directory
    pub fn connection(&self, id: u64) -> Option<Arc<Connection>> {
        self.lock_state().connections.get(&id).cloned()
    }

    /// Every attached connection, ascending by id
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.lock_state().connections.values().cloned().collect()
    }

    /// Snapshot of well-known names and their owners
    pub fn list_names(&self) -> Vec<(String, u64)> {
        self.resolver.list_names()
    }

    /// Snapshot of active connection ids
    pub fn list_ids(&self) -> Vec<u64> {
        self.resolver.list_ids()
    }

    /// Tear the bus down
    ///
    /// Idempotent. Disconnects every endpoint (and so every connection)
    /// and removes the bus from its namespace.
    pub fn disconnect(&self) {
        let (endpoints, connections) = {
            let mut state = self.lock_state();
            if state.disconnected {
                return;
            }
            state.disconnected = true;
            (
                std::mem::take(&mut state.endpoints),
                std::mem::take(&mut state.connections),
            )
        };

        for endpoint in endpoints.values() {
            endpoint.disconnect();
        }
        // Every connection hangs off an endpoint; this only catches
        // attachments that raced the endpoint teardown.
        for connection in connections.values() {
            connection.disconnect();
        }

        if let Some(ns) = self.ns.upgrade() {
            ns.remove_bus(self.id);
        }

        debug!("kbus: bus '{}' (id {}) disconnected", self.name, self.id);
    }

    pub(crate) fn remove_endpoint(&self, id: u64) {
        self.lock_state().endpoints.remove(&id);
    }

    pub(crate) fn remove_connection(&self, id: u64) {
        self.lock_state().connections.remove(&id);
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        trace!("kbus: bus {} released", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Credentials;
    use crate::subsystem::Subsystem;

    fn world_bus(subsystem: &Arc<Subsystem>, name: &str) -> Arc<Bus> {
        Bus::create(subsystem.root(), name, Mode::WORLD, BusFlags::empty(), 0, 0).unwrap()
    }

    #[test]
    fn test_bus_has_default_endpoint() {
        let subsystem = Subsystem::new();
        let bus = world_bus(&subsystem, "system");

        let ep = bus.default_endpoint().unwrap();
        assert_eq!(ep.name(), DEFAULT_ENDPOINT);
        assert!(ep.is_default());
        assert!(ep.minor() >= 1);
        assert!(Arc::ptr_eq(&ep.bus().unwrap(), &bus));
        assert!(Arc::ptr_eq(&bus.find_endpoint("bus").unwrap(), &ep));
    }

    #[test]
    fn test_bus_name_unique_within_namespace() {
        let subsystem = Subsystem::new();
        let bus = world_bus(&subsystem, "system");

        let result = Bus::create(subsystem.root(), "system", Mode::WORLD, BusFlags::empty(), 0, 0);
        assert!(matches!(result, Err(BusError::AlreadyExists { .. })));

        // Other namespaces are independent
        let ns = subsystem
            .create_namespace(subsystem.root(), "other", Mode::WORLD)
            .unwrap();
        assert!(Bus::create(&ns, "system", Mode::WORLD, BusFlags::empty(), 0, 0).is_ok());

        bus.disconnect();
        let again = world_bus(&subsystem, "system");
        assert!(again.id() > bus.id());
    }

    #[test]
    fn test_bus_in_disconnected_namespace() {
        let subsystem = Subsystem::new();
        let ns = subsystem
            .create_namespace(subsystem.root(), "dead", Mode::WORLD)
            .unwrap();
        ns.disconnect();

        let result = Bus::create(&ns, "system", Mode::WORLD, BusFlags::empty(), 0, 0);
        assert_eq!(result.unwrap_err(), BusError::NamespaceDisconnected);
    }

    #[test]
    fn test_bus_flags_pass_through() {
        let subsystem = Subsystem::new();
        let flags = BusFlags::from_bits_retain(0xdead_beef);
        let bus = Bus::create(subsystem.root(), "flags", Mode::WORLD, flags, 1000, 100).unwrap();
        assert_eq!(bus.flags().bits(), 0xdead_beef);
        assert_eq!(bus.access().uid, 1000);
        assert_eq!(bus.access().gid, 100);
    }

    #[test]
    fn test_bus_disconnect_cascades() {
        let subsystem = Subsystem::new();
        let bus = world_bus(&subsystem, "system");
        let ep = bus.default_endpoint().unwrap();
        let extra = Endpoint::create(&bus, "extra", Mode::WORLD, 1000, 1000).unwrap();
        let conn = Connection::attach(&ep, Credentials::new(1000, 1000)).unwrap();
        let conn2 = Connection::attach(&extra, Credentials::new(1000, 1000)).unwrap();

        bus.disconnect();
        bus.disconnect();

        assert!(ep.is_disconnected());
        assert!(extra.is_disconnected());
        assert!(conn.is_disconnected());
        assert!(conn2.is_disconnected());
        assert!(bus.connections().is_empty());
        assert!(subsystem.root().buses().is_empty());
        assert_eq!(bus.default_endpoint().unwrap_err(), BusError::BusDisconnected);
    }

    #[test]
    fn test_ids_never_reused() {
        let subsystem = Subsystem::new();
        let bus = world_bus(&subsystem, "system");
        let ep = bus.default_endpoint().unwrap();

        let mut last = 0;
        for _ in 0..5 {
            let conn = Connection::attach(&ep, Credentials::ROOT).unwrap();
            assert!(conn.id() > last);
            last = conn.id();
            conn.disconnect();
        }

        let mut last_ep = ep.id();
        for i in 0..3 {
            let extra = Endpoint::create(&bus, &format!("e{}", i), Mode::WORLD, 0, 0).unwrap();
            assert!(extra.id() > last_ep);
            last_ep = extra.id();
            extra.disconnect();
        }
    }

    #[test]
    fn test_bus_released_after_disconnect() {
        let subsystem = Subsystem::new();
        let bus = world_bus(&subsystem, "temp");
        let ep = bus.default_endpoint().unwrap();
        let weak_bus = Arc::downgrade(&bus);
        let weak_ep = Arc::downgrade(&ep);

        drop(bus);
        drop(ep);
        // Still owned by the namespace
        let bus = weak_bus.upgrade().unwrap();

        bus.disconnect();
        drop(bus);
        assert!(weak_bus.upgrade().is_none());
        assert!(weak_ep.upgrade().is_none());
    }
}
