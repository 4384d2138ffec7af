//! kbus - in-process message bus
//!
//! # Purpose
//! Provides D-Bus-like point-to-point and broadcast messaging between
//! connections, organised as a strict ownership hierarchy.
//!
//! # Architecture
//! ```text
//! Subsystem
//!   └─ Namespace (root, unnamed, lives as long as the subsystem)
//!        ├─ Namespace "test"          (child namespaces)
//!        └─ Bus "system"
//!             ├─ Endpoint "bus"       (default, minor N)
//!             │    ├─ Connection 1
//!             │    └─ Connection 2
//!             ├─ Endpoint "1000-custom"
//!             │    └─ Connection 3
//!             └─ NameResolver         ("org.example.Foo" → 2)
//! ```
//!
//! Parents own their children through `Arc`s, children point back at
//! their parents through `Weak`s. `disconnect()` tears down reachability
//! and cascades downwards; memory is released when the last handle
//! drops. Messages are shared between every queue they are delivered to.
//!
//! # Locking
//! Locks are taken strictly top-down: subsystem directory → namespace →
//! bus → name registry → endpoint → connection. No code path acquires a
//! parent lock while holding a child lock.
//!
//! # Usage
//! ```
//! use kbus::{Bus, BusFlags, Connection, Credentials, Destination, Mode, Subsystem};
//!
//! let subsystem = Subsystem::new();
//! let bus = Bus::create(subsystem.root(), "system", Mode::WORLD, BusFlags::empty(), 0, 0)?;
//! let endpoint = bus.default_endpoint()?;
//!
//! let c1 = Connection::attach(&endpoint, Credentials::new(1000, 1000))?;
//! let c2 = Connection::attach(&endpoint, Credentials::new(1000, 1000))?;
//! c1.hello()?;
//! c2.hello()?;
//!
//! c1.send(Destination::Id(c2.id()), b"ping".to_vec())?;
//! let msg = c2.receive()?;
//! assert_eq!(msg.payload(), Some(&b"ping"[..]));
//! assert_eq!(msg.sender(), c1.id());
//! # Ok::<(), kbus::BusError>(())
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod bus;
pub mod config;
pub mod connection;
pub mod control;
pub mod endpoint;
pub mod error;
pub mod handle_table;
pub mod id;
pub mod message;
pub mod namespace;
pub mod policy;
pub mod resolver;
mod router;
pub mod subsystem;

pub use bus::{Bus, BusFlags};
pub use config::{BusConfig, Limits};
pub use connection::{Connection, ConnectionState};
pub use control::{ConnectionKind, Delivery, Request, Response, Session};
pub use endpoint::{Endpoint, Monitor};
pub use error::{BusError, ErrorCode, Result};
pub use handle_table::{Handle, HandleTable};
pub use id::{IdSequence, BROADCAST_ID, KERNEL_ID};
pub use message::{Body, Destination, Message, Notification, NotifyMask};
pub use namespace::Namespace;
pub use policy::{Access, Credentials, Mode, Rights};
pub use resolver::NameResolver;
pub use subsystem::Subsystem;

static_assertions::assert_impl_all!(Subsystem: Send, Sync);
static_assertions::assert_impl_all!(Namespace: Send, Sync);
static_assertions::assert_impl_all!(Bus: Send, Sync);
static_assertions::assert_impl_all!(Endpoint: Send, Sync);
static_assertions::assert_impl_all!(Monitor: Send, Sync);
static_assertions::assert_impl_all!(Connection: Send, Sync);
static_assertions::assert_impl_all!(Message: Send, Sync);

/// Lock a mutex, recovering the data if a previous holder panicked
///
/// State transitions are applied in one step under each lock, so a
/// panicking holder never leaves a half-updated table behind.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
