//! Namespace - isolation domain for buses
//!
//! A namespace owns its buses and child namespaces and maps endpoint
//! minors to endpoints. Minor 0 is the namespace's control node, so
//! endpoint minors start at 1.
//!
//! The unnamed root namespace belongs to the [`Subsystem`] and ignores
//! `disconnect()`; every other namespace is torn down by it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{debug, trace};

use crate::bus::Bus;
use crate::config::Limits;
use crate::endpoint::Endpoint;
use crate::error::{BusError, Result};
use crate::handle_table::{Handle, HandleTable};
use crate::id::IdSequence;
use crate::lock;
use crate::policy::Mode;
use crate::subsystem::Subsystem;

/// Minor number of a namespace's control node
pub const CONTROL_MINOR: Handle = 0;

#[derive(Debug)]
pub(crate) struct NamespaceState {
    pub(crate) disconnected: bool,
    pub(crate) buses: BTreeMap<u64, Arc<Bus>>,
    pub(crate) children: BTreeMap<u64, Arc<Namespace>>,
    /// Endpoint minors; entries are non-owning
    pub(crate) minors: HandleTable<Weak<Endpoint>>,
}

/// Isolation domain owning a set of buses
#[derive(Debug)]
pub struct Namespace {
    id: u64,
    name: String,
    mode: Mode,
    major: Handle,
    devpath: String,
    subsystem: Weak<Subsystem>,
    parent: Weak<Namespace>,
    bus_ids: IdSequence,
    limits: Limits,
    state: Mutex<NamespaceState>,
}

impl Namespace {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        subsystem: Weak<Subsystem>,
        parent: Weak<Namespace>,
        id: u64,
        name: String,
        mode: Mode,
        major: Handle,
        devpath: String,
        limits: Limits,
    ) -> Self {
        Self {
            id,
            name,
            mode,
            major,
            devpath,
            subsystem,
            parent,
            bus_ids: IdSequence::new(),
            limits,
            state: Mutex::new(NamespaceState {
                disconnected: false,
                buses: BTreeMap::new(),
                children: BTreeMap::new(),
                minors: HandleTable::with_base(CONTROL_MINOR + 1),
            }),
        }
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, NamespaceState> {
        lock(&self.state)
    }

    /// Namespace id, unique within the subsystem
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Namespace name; empty for the root
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True for the unnamed root namespace
    pub fn is_root(&self) -> bool {
        self.name.is_empty()
    }

    /// Mode of the control node
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Major number shared by every node of this namespace
    pub fn major(&self) -> Handle {
        self.major
    }

    /// Device directory, e.g. `kdbus/ns/test`
    pub fn devpath(&self) -> &str {
        &self.devpath
    }

    /// Parent namespace; `None` for the root or once the parent is gone
    pub fn parent(&self) -> Option<Arc<Namespace>> {
        self.parent.upgrade()
    }

    pub(crate) fn limits(&self) -> &Limits {
        &self.limits
    }

    pub(crate) fn next_bus_id(&self) -> u64 {
        self.bus_ids.next_id()
    }

    /// True once the namespace has been torn down
    pub fn is_disconnected(&self) -> bool {
        self.lock_state().disconnected
    }

    /// Buses in creation order
    pub fn buses(&self) -> Vec<Arc<Bus>> {
        self.lock_state().buses.values().cloned().collect()
    }

    /// Look up a bus by name
    pub fn find_bus(&self, name: &str) -> Result<Arc<Bus>> {
        let state = self.lock_state();
        if state.disconnected {
            return Err(BusError::NamespaceDisconnected);
        }
        state
            .buses
            .values()
            .find(|bus| bus.name() == name)
            .cloned()
            .ok_or_else(|| BusError::NotFound {
                kind: "bus",
                name: name.to_string(),
            })
    }

    /// Child namespaces in creation order
    pub fn children(&self) -> Vec<Arc<Namespace>> {
        self.lock_state().children.values().cloned().collect()
    }

    /// Resolve an endpoint minor
    pub fn endpoint_by_minor(&self, minor: Handle) -> Result<Arc<Endpoint>> {
        let state = self.lock_state();
        if state.disconnected {
            return Err(BusError::NamespaceDisconnected);
        }
        state
            .minors
            .get(minor)
            .and_then(Weak::upgrade)
            .ok_or_else(|| BusError::NotFound {
                kind: "minor",
                name: minor.to_string(),
            })
    }

    /// Tear the namespace down
    ///
    /// Idempotent. Cascades to every bus and child namespace and removes
    /// the namespace from the subsystem directory and from its parent.
    /// The root namespace is exempt.
    pub fn disconnect(&self) {
        if self.is_root() {
            trace!("kbus: ignoring disconnect of the root namespace");
            return;
        }
        self.teardown();
    }

    /// Disconnect without the root exemption
    pub(crate) fn teardown(&self) {
        let (buses, children) = {
            let mut state = self.lock_state();
            if state.disconnected {
                return;
            }
            state.disconnected = true;
            (
                std::mem::take(&mut state.buses),
                std::mem::take(&mut state.children),
            )
        };

        for child in children.values() {
            child.teardown();
        }
        for bus in buses.values() {
            bus.disconnect();
        }

        if !self.is_root() {
            if let Some(subsystem) = self.subsystem.upgrade() {
                subsystem.unregister(&self.name, self.major);
            }
        }
        if let Some(parent) = self.parent.upgrade() {
            parent.lock_state().children.remove(&self.id);
        }

        debug!("kbus: namespace '{}' (id {}) disconnected", self.name, self.id);
    }

    pub(crate) fn remove_bus(&self, id: u64) {
        self.lock_state().buses.remove(&id);
    }

    pub(crate) fn release_minor(&self, minor: Handle) {
        self.lock_state().minors.remove(minor);
    }
}

impl Drop for Namespace {
    fn drop(&mut self) {
        trace!("kbus: namespace {} released", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusFlags;

    #[test]
    fn test_disconnect_cascades_to_buses() {
        let subsystem = Subsystem::new();
        let root = Arc::clone(subsystem.root());
        let ns = subsystem.create_namespace(&root, "user", Mode::WORLD).unwrap();

        let bus = Bus::create(&ns, "session", Mode::WORLD, BusFlags::empty(), 0, 0).unwrap();
        let ep = bus.default_endpoint().unwrap();
        assert!(Arc::ptr_eq(&ns.endpoint_by_minor(ep.minor()).unwrap(), &ep));

        ns.disconnect();
        ns.disconnect();

        assert!(ns.is_disconnected());
        assert!(bus.is_disconnected());
        assert!(ep.is_disconnected());
        assert!(ns.buses().is_empty());
        assert!(root.children().is_empty());
        assert_eq!(
            ns.endpoint_by_minor(ep.minor()).unwrap_err(),
            BusError::NamespaceDisconnected
        );
    }

    #[test]
    fn test_disconnect_cascades_to_children() {
        let subsystem = Subsystem::new();
        let root = Arc::clone(subsystem.root());
        let parent = subsystem.create_namespace(&root, "parent", Mode::WORLD).unwrap();
        let child = subsystem.create_namespace(&parent, "child", Mode::WORLD).unwrap();
        assert!(Arc::ptr_eq(&child.parent().unwrap(), &parent));
        assert_eq!(parent.children().len(), 1);

        parent.disconnect();
        assert!(child.is_disconnected());
        assert!(subsystem.find_namespace("child").is_err());
    }

    #[test]
    fn test_namespace_released_after_disconnect() {
        let subsystem = Subsystem::new();
        let root = Arc::clone(subsystem.root());
        let ns = subsystem.create_namespace(&root, "gone", Mode::WORLD).unwrap();
        let weak = Arc::downgrade(&ns);

        // The parent still owns it
        drop(ns);
        let ns = weak.upgrade().expect("namespace owned by parent");

        ns.disconnect();
        assert!(weak.upgrade().is_some()); // we still hold a handle
        drop(ns);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_find_bus() {
        let subsystem = Subsystem::new();
        let root = Arc::clone(subsystem.root());
        let bus = Bus::create(&root, "system", Mode::WORLD, BusFlags::empty(), 0, 0).unwrap();

        assert!(Arc::ptr_eq(&root.find_bus("system").unwrap(), &bus));
        assert!(matches!(root.find_bus("nope"), Err(BusError::NotFound { .. })));
    }
}
