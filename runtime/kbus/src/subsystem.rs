//! Subsystem - global namespace directory
//!
//! The subsystem owns the unnamed root namespace, numbers every namespace,
//! hands out major numbers and keeps the name → namespace directory used
//! by [`Subsystem::find_namespace`].
//!
//! One process-wide instance is available through [`Subsystem::global`];
//! tests and embedders create private instances with [`Subsystem::new`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use log::{debug, info};

use crate::config::{BusConfig, Limits};
use crate::error::{BusError, Result};
use crate::handle_table::{Handle, HandleTable};
use crate::id::IdSequence;
use crate::lock;
use crate::namespace::Namespace;
use crate::policy::Mode;

/// First major number handed out
pub const FIRST_MAJOR: Handle = 1;

/// Base of every device path
pub const DEVPATH_ROOT: &str = "kdbus";

#[derive(Debug)]
struct Directory {
    /// Named namespaces; the root is not listed
    names: HashMap<String, Weak<Namespace>>,
    /// Major number → namespace id
    majors: HandleTable<u64>,
}

/// Process-level container of namespaces
#[derive(Debug)]
pub struct Subsystem {
    root: Arc<Namespace>,
    directory: Mutex<Directory>,
    ns_ids: IdSequence,
    limits: Limits,
}

impl Subsystem {
    /// Create a subsystem with default limits
    pub fn new() -> Arc<Self> {
        Self::with_config(BusConfig::default())
    }

    /// Create a subsystem and its root namespace
    pub fn with_config(config: BusConfig) -> Arc<Self> {
        let ns_ids = IdSequence::new();
        let mut majors = HandleTable::with_base(FIRST_MAJOR);

        let root_id = ns_ids.next_id();
        let root_major = majors.insert(root_id);

        let subsystem = Arc::new_cyclic(|weak: &Weak<Subsystem>| {
            let root = Arc::new(Namespace::new(
                weak.clone(),
                Weak::new(),
                root_id,
                String::new(),
                Mode::WORLD,
                root_major,
                DEVPATH_ROOT.to_string(),
                config.limits.clone(),
            ));

            Self {
                root,
                directory: Mutex::new(Directory {
                    names: HashMap::new(),
                    majors,
                }),
                ns_ids,
                limits: config.limits,
            }
        });

        info!("kbus: subsystem up, root namespace major {}", root_major);
        subsystem
    }

    /// Process-wide subsystem, created on first use
    pub fn global() -> &'static Arc<Subsystem> {
        static GLOBAL: OnceLock<Arc<Subsystem>> = OnceLock::new();
        GLOBAL.get_or_init(Subsystem::new)
    }

    /// Unnamed root namespace
    pub fn root(&self) -> &Arc<Namespace> {
        &self.root
    }

    /// Limits applied to every bus
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Create a named namespace below `parent`
    ///
    /// # Errors
    /// - `InvalidArgument` for an empty name or one containing `/`
    /// - `AlreadyExists` if the name is registered anywhere in the subsystem
    /// - `NamespaceDisconnected` if `parent` is torn down
    pub fn create_namespace(
        self: &Arc<Self>,
        parent: &Arc<Namespace>,
        name: &str,
        mode: Mode,
    ) -> Result<Arc<Namespace>> {
        if name.is_empty() || name.contains('/') {
            return Err(BusError::InvalidArgument(format!(
                "invalid namespace name '{}'",
                name
            )));
        }

        let mut dir = lock(&self.directory);
        if dir.names.get(name).and_then(Weak::upgrade).is_some() {
            return Err(BusError::AlreadyExists {
                kind: "namespace",
                name: name.to_string(),
            });
        }

        let mut parent_state = parent.lock_state();
        if parent_state.disconnected {
            return Err(BusError::NamespaceDisconnected);
        }

        let id = self.ns_ids.next_id();
        let major = dir.majors.insert(id);
        let ns = Arc::new(Namespace::new(
            Arc::downgrade(self),
            Arc::downgrade(parent),
            id,
            name.to_string(),
            mode,
            major,
            format!("{}/ns/{}", DEVPATH_ROOT, name),
            self.limits.clone(),
        ));

        parent_state.children.insert(id, Arc::clone(&ns));
        dir.names.insert(name.to_string(), Arc::downgrade(&ns));

        debug!("kbus: namespace '{}' created (id {}, major {})", name, id, major);
        Ok(ns)
    }

    /// Look up a namespace by name
    pub fn find_namespace(&self, name: &str) -> Result<Arc<Namespace>> {
        if name.is_empty() {
            return Ok(Arc::clone(&self.root));
        }

        lock(&self.directory)
            .names
            .get(name)
            .and_then(Weak::upgrade)
            .filter(|ns| !ns.is_disconnected())
            .ok_or_else(|| BusError::NotFound {
                kind: "namespace",
                name: name.to_string(),
            })
    }

    /// Names of every live named namespace, sorted
    pub fn namespace_names(&self) -> Vec<String> {
        let dir = lock(&self.directory);
        let mut names: Vec<String> = dir
            .names
            .iter()
            .filter(|(_, ns)| ns.strong_count() > 0)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Number of major numbers in use
    pub fn majors_in_use(&self) -> usize {
        lock(&self.directory).majors.len()
    }

    /// Drop a namespace from the directory and free its major
    pub(crate) fn unregister(&self, name: &str, major: Handle) {
        let mut dir = lock(&self.directory);
        dir.names.remove(name);
        dir.majors.remove(major);
    }
}

impl Drop for Subsystem {
    fn drop(&mut self) {
        self.root.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_namespace() {
        let subsystem = Subsystem::new();
        let root = subsystem.root();
        assert!(root.is_root());
        assert_eq!(root.name(), "");
        assert_eq!(root.devpath(), "kdbus");
        assert_eq!(root.major(), FIRST_MAJOR);
        assert!(Arc::ptr_eq(&subsystem.find_namespace("").unwrap(), root));
    }

    #[test]
    fn test_root_survives_disconnect() {
        let subsystem = Subsystem::new();
        subsystem.root().disconnect();
        assert!(!subsystem.root().is_disconnected());
    }

    #[test]
    fn test_namespace_name_unique() {
        let subsystem = Subsystem::new();
        let root = Arc::clone(subsystem.root());

        let ns = subsystem.create_namespace(&root, "test", Mode::WORLD).unwrap();
        assert_eq!(ns.devpath(), "kdbus/ns/test");

        let result = subsystem.create_namespace(&root, "test", Mode::WORLD);
        assert!(matches!(result, Err(BusError::AlreadyExists { .. })));

        // Names are global, not per parent
        let result = subsystem.create_namespace(&ns, "test", Mode::WORLD);
        assert!(matches!(result, Err(BusError::AlreadyExists { .. })));

        ns.disconnect();
        let again = subsystem.create_namespace(&root, "test", Mode::WORLD).unwrap();
        assert!(again.id() > ns.id());
    }

    #[test]
    fn test_namespace_invalid_name() {
        let subsystem = Subsystem::new();
        let root = Arc::clone(subsystem.root());
        assert!(matches!(
            subsystem.create_namespace(&root, "", Mode::WORLD),
            Err(BusError::InvalidArgument(_))
        ));
        assert!(matches!(
            subsystem.create_namespace(&root, "a/b", Mode::WORLD),
            Err(BusError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_find_namespace() {
        let subsystem = Subsystem::new();
        let root = Arc::clone(subsystem.root());
        let ns = subsystem.create_namespace(&root, "apps", Mode::WORLD).unwrap();

        let found = subsystem.find_namespace("apps").unwrap();
        assert!(Arc::ptr_eq(&found, &ns));
        assert_eq!(subsystem.namespace_names(), vec!["apps".to_string()]);

        ns.disconnect();
        assert!(matches!(
            subsystem.find_namespace("apps"),
            Err(BusError::NotFound { .. })
        ));
        assert!(subsystem.namespace_names().is_empty());
    }

    #[test]
    fn test_major_released() {
        let subsystem = Subsystem::new();
        let root = Arc::clone(subsystem.root());
        assert_eq!(subsystem.majors_in_use(), 1);

        let ns = subsystem.create_namespace(&root, "a", Mode::WORLD).unwrap();
        assert_eq!(subsystem.majors_in_use(), 2);
        assert_ne!(ns.major(), root.major());

        ns.disconnect();
        assert_eq!(subsystem.majors_in_use(), 1);
    }

    #[test]
    fn test_create_under_disconnected_parent() {
        let subsystem = Subsystem::new();
        let root = Arc::clone(subsystem.root());
        let parent = subsystem.create_namespace(&root, "parent", Mode::WORLD).unwrap();
        parent.disconnect();

        let result = subsystem.create_namespace(&parent, "child", Mode::WORLD);
        assert_eq!(result.unwrap_err(), BusError::NamespaceDisconnected);
    }

    #[test]
    fn test_global_is_shared() {
        let a = Subsystem::global();
        let b = Subsystem::global();
        assert!(Arc::ptr_eq(a, b));
        assert!(a.root().is_root());
    }
}
