//! Runtime limits
//!
//! Limits are fixed when a [`Subsystem`](crate::Subsystem) is created and
//! copied into every bus it hosts. All fields have defaults so a partial
//! TOML table is enough:
//!
//! ```toml
//! [limits]
//! max_queued_messages = 512
//! ```

use serde::Deserialize;

/// Per-bus resource limits
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Limits {
    /// Messages a connection queue may hold before unicast sends fail
    pub max_queued_messages: usize,
    /// Messages kept in an endpoint's in-flight queue (oldest dropped)
    pub endpoint_backlog: usize,
    /// Largest payload accepted by `send`, in bytes
    pub max_payload: usize,
    /// Well-known names a single connection may own
    pub max_names_per_connection: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_queued_messages: 1024,
            endpoint_backlog: 256,
            max_payload: 128 * 1024,
            max_names_per_connection: 64,
        }
    }
}

/// Subsystem configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BusConfig {
    /// Limits applied to every bus
    pub limits: Limits,
}
