//! Name resolver
//!
//! Registry of well-known names and live connection ids for one bus.
//! Every mutation returns the [`Notification`]s it produced; the caller
//! fans them out through the router after the registry lock is released.
//!
//! A name maps to at most one connection id at any time. Names owned by a
//! connection are released when the connection is removed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use log::{debug, trace};

use crate::error::{BusError, Result};
use crate::message::Notification;

/// Maximum length of a well-known name
pub const MAX_NAME_LEN: usize = 255;

/// Check a well-known name
///
/// Names are at least two dot-separated elements of `[A-Za-z0-9_-]`, no
/// element starts with a digit and the whole name fits in
/// [`MAX_NAME_LEN`] bytes. Unique names (leading `:`) are assigned by the
/// bus and cannot be registered.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |why: &str| Err(BusError::InvalidArgument(format!("name '{}' {}", name, why)));

    if name.is_empty() {
        return invalid("is empty");
    }
    if name.len() > MAX_NAME_LEN {
        return invalid("is too long");
    }
    if name.starts_with(':') {
        return invalid("is a unique name");
    }

    let mut elements = 0;
    for element in name.split('.') {
        elements += 1;
        let mut chars = element.chars();
        match chars.next() {
            None => return invalid("has an empty element"),
            Some(c) if c.is_ascii_digit() => return invalid("has an element starting with a digit"),
            Some(_) => {}
        }
        if !element
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return invalid("contains an invalid character");
        }
    }
    if elements < 2 {
        return invalid("needs at least two elements");
    }

    Ok(())
}

#[derive(Debug, Default)]
struct Registry {
    /// name → owner id
    names: BTreeMap<String, u64>,
    /// owner id → names it holds
    owned: HashMap<u64, BTreeSet<String>>,
    /// Connections that said hello and have not been removed
    live: BTreeSet<u64>,
}

/// Per-bus name registry
#[derive(Debug)]
pub struct NameResolver {
    registry: Mutex<Registry>,
    max_names: usize,
}

impl NameResolver {
    /// Create an empty registry allowing `max_names` names per connection
    pub fn new(max_names: usize) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            max_names,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        crate::lock(&self.registry)
    }

    /// Record a connection as live
    ///
    /// `alive` is evaluated under the registry lock; a connection that
    /// disconnected before the registry saw it is not recorded.
    pub(crate) fn id_added(&self, id: u64, alive: impl FnOnce() -> bool) -> Vec<Notification> {
        let mut reg = self.lock();
        if !alive() || !reg.live.insert(id) {
            return Vec::new();
        }
        trace!("resolver: id {} added", id);
        vec![Notification::IdAdded { id }]
    }

    /// Forget a connection and release every name it owns
    pub(crate) fn id_removed(&self, id: u64) -> Vec<Notification> {
        let mut reg = self.lock();
        if !reg.live.remove(&id) {
            return Vec::new();
        }

        let mut events = Vec::new();
        for name in reg.owned.remove(&id).unwrap_or_default() {
            reg.names.remove(&name);
            debug!("resolver: name '{}' released by {}", name, id);
            events.push(Notification::NameChanged {
                name,
                old_owner: Some(id),
                new_owner: None,
            });
        }
        events.push(Notification::IdRemoved { id });
        events
    }

    /// Bind `name` to connection `id`
    ///
    /// Returns `None` when the connection already owned the name.
    pub(crate) fn set_name(&self, id: u64, name: &str) -> Result<Option<Notification>> {
        validate_name(name)?;

        let mut reg = self.lock();
        if !reg.live.contains(&id) {
            return Err(BusError::ConnectionDisconnected);
        }

        let previous = reg.names.get(name).copied();
        match previous {
            Some(owner) if owner == id => return Ok(None),
            Some(owner) if reg.live.contains(&owner) => {
                return Err(BusError::NameTaken {
                    name: name.to_string(),
                    owner,
                })
            }
            _ => {}
        }

        if reg.owned.get(&id).map_or(0, |n| n.len()) >= self.max_names {
            return Err(BusError::TooManyNames { id });
        }

        // A stale binding only survives a removal that raced us; drop it.
        if let Some(stale) = previous {
            if let Some(names) = reg.owned.get_mut(&stale) {
                names.remove(name);
            }
        }

        reg.names.insert(name.to_string(), id);
        reg.owned.entry(id).or_default().insert(name.to_string());
        debug!("resolver: name '{}' acquired by {}", name, id);

        Ok(Some(Notification::NameChanged {
            name: name.to_string(),
            old_owner: previous,
            new_owner: Some(id),
        }))
    }

    /// Unbind `name` if connection `id` owns it
    pub(crate) fn remove_name(&self, id: u64, name: &str) -> Result<Notification> {
        let mut reg = self.lock();
        match reg.names.get(name).copied() {
            None => Err(BusError::NotFound {
                kind: "name",
                name: name.to_string(),
            }),
            Some(owner) if owner != id => Err(BusError::NotOwner {
                name: name.to_string(),
            }),
            Some(_) => {
                reg.names.remove(name);
                if let Some(names) = reg.owned.get_mut(&id) {
                    names.remove(name);
                    if names.is_empty() {
                        reg.owned.remove(&id);
                    }
                }
                debug!("resolver: name '{}' released by {}", name, id);
                Ok(Notification::NameChanged {
                    name: name.to_string(),
                    old_owner: Some(id),
                    new_owner: None,
                })
            }
        }
    }

    /// Current owner of `name`
    pub fn lookup(&self, name: &str) -> Option<u64> {
        self.lock().names.get(name).copied()
    }

    /// True if `id` said hello and has not been removed
    pub fn is_live(&self, id: u64) -> bool {
        self.lock().live.contains(&id)
    }

    /// Names currently owned by `id`
    pub fn names_of(&self, id: u64) -> Vec<String> {
        self.lock()
            .owned
            .get(&id)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every binding, sorted by name
    pub fn list_names(&self) -> Vec<(String, u64)> {
        self.lock()
            .names
            .iter()
            .map(|(name, id)| (name.clone(), *id))
            .collect()
    }

    /// Snapshot of live connection ids, ascending
    pub fn list_ids(&self) -> Vec<u64> {
        self.lock().live.iter().copied().collect()
    }
}
