//! Connection - one client session on an endpoint
//!
//! A connection is attached in the `Created` state, becomes addressable
//! after `hello()` and ends in the terminal `Disconnected` state:
//!
//! ```text
//! attach ──▶ Created ──hello──▶ Active ──disconnect──▶ Disconnected
//!               └──────────────disconnect───────────────────┘
//! ```
//!
//! Every connection owns a private FIFO of message handles. Receivers block
//! on a condition variable that is signalled on enqueue and on teardown.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::bus::Bus;
use crate::endpoint::Endpoint;
use crate::error::{BusError, Result};
use crate::lock;
use crate::message::{Destination, Message, MessageQueue, NotifyMask};
use crate::policy::Credentials;
use crate::router;

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Attached, not yet addressable
    Created,
    /// Said hello; can send and receive
    Active,
    /// Terminal
    Disconnected,
}

#[derive(Debug)]
struct Inbox {
    state: ConnectionState,
    messages: MessageQueue,
}

/// Client session attached to an endpoint
#[derive(Debug)]
pub struct Connection {
    id: u64,
    creds: Credentials,
    bus: Weak<Bus>,
    endpoint: Weak<Endpoint>,
    subscriptions: AtomicU32,
    inbox: Mutex<Inbox>,
    ready: Condvar,
}

impl Connection {
    /// Attach a new connection to `endpoint`
    ///
    /// The connection is registered with the endpoint and the bus
    /// directory but stays unaddressable until [`hello`](Self::hello).
    ///
    /// # Errors
    /// - `EndpointDisconnected` if the endpoint or its bus is torn down
    /// - `PermissionDenied` if the endpoint policy grants neither read nor write
    pub fn attach(endpoint: &Arc<Endpoint>, creds: Credentials) -> Result<Arc<Connection>> {
        let bus = endpoint.bus().ok_or(BusError::EndpointDisconnected)?;

        let mut bus_state = bus.lock_state();
        if bus_state.disconnected {
            return Err(BusError::EndpointDisconnected);
        }
        let mut ep_state = endpoint.lock_state();
        if ep_state.disconnected {
            return Err(BusError::EndpointDisconnected);
        }
        if !endpoint.access().permits_attach(&creds) {
            return Err(BusError::PermissionDenied);
        }

        let id = bus.next_connection_id();
        let connection = Arc::new(Connection {
            id,
            creds,
            bus: Arc::downgrade(&bus),
            endpoint: Arc::downgrade(endpoint),
            subscriptions: AtomicU32::new(0),
            inbox: Mutex::new(Inbox {
                state: ConnectionState::Created,
                messages: MessageQueue::new(),
            }),
            ready: Condvar::new(),
        });
        ep_state.connections.insert(id, Arc::clone(&connection));
        bus_state.connections.insert(id, Arc::clone(&connection));

        debug!(
            "kbus: connection {} attached to endpoint '{}' (uid {}, gid {})",
            id,
            endpoint.name(),
            creds.uid,
            creds.gid
        );
        Ok(connection)
    }

    fn lock_inbox(&self) -> MutexGuard<'_, Inbox> {
        lock(&self.inbox)
    }

    /// Connection id, unique within the bus
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Credentials the connection was attached with
    pub fn credentials(&self) -> &Credentials {
        &self.creds
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.lock_inbox().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub fn is_disconnected(&self) -> bool {
        self.state() == ConnectionState::Disconnected
    }

    /// Owning bus, if still alive
    pub fn bus(&self) -> Option<Arc<Bus>> {
        self.bus.upgrade()
    }

    /// Endpoint the connection is attached through, if still alive
    pub fn endpoint(&self) -> Option<Arc<Endpoint>> {
        self.endpoint.upgrade()
    }

    /// Number of messages waiting to be received
    pub fn queued(&self) -> usize {
        self.lock_inbox().messages.len()
    }

    /// Current notification subscriptions
    pub fn subscriptions(&self) -> NotifyMask {
        NotifyMask::from_bits_truncate(self.subscriptions.load(Ordering::Acquire))
    }

    /// Replace the notification subscriptions
    pub fn subscribe(&self, mask: NotifyMask) {
        self.subscriptions.store(mask.bits(), Ordering::Release);
    }

    /// Well-known names currently owned by this connection
    pub fn names(&self) -> Vec<String> {
        self.bus
            .upgrade()
            .map(|bus| bus.resolver().names_of(self.id))
            .unwrap_or_default()
    }

    /// Make the connection addressable
    ///
    /// # Errors
    /// - `AlreadyActive` when called twice
    /// - `ConnectionDisconnected` once torn down
    pub fn hello(&self) -> Result<()> {
        {
            let mut inbox = self.lock_inbox();
            match inbox.state {
                ConnectionState::Created => inbox.state = ConnectionState::Active,
                ConnectionState::Active => return Err(BusError::AlreadyActive),
                ConnectionState::Disconnected => return Err(BusError::ConnectionDisconnected),
            }
        }

        let bus = self.bus.upgrade().ok_or(BusError::ConnectionDisconnected)?;
        let events = bus.resolver().id_added(self.id, || self.is_active());
        router::notify(&bus, events);

        debug!("kbus: connection {} active on bus '{}'", self.id, bus.name());
        Ok(())
    }

    /// Send `payload` to `destination`, returning the message id
    pub fn send(&self, destination: Destination, payload: Vec<u8>) -> Result<u64> {
        router::send(self, destination, payload)
    }

    /// Block until a message is available
    ///
    /// Returns `ConnectionDisconnected` once the connection is torn down,
    /// including while blocked.
    pub fn receive(&self) -> Result<Message> {
        let mut inbox = self.lock_inbox();
        loop {
            if let Some(message) = Self::take_next(&mut inbox)? {
                return Ok(message);
            }
            inbox = self.ready.wait(inbox).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Take the next message without blocking (`WouldBlock` if none)
    pub fn try_receive(&self) -> Result<Message> {
        let mut inbox = self.lock_inbox();
        Self::take_next(&mut inbox)?.ok_or(BusError::WouldBlock)
    }

    /// Like [`receive`](Self::receive), giving up with `TimedOut` after `timeout`
    pub fn receive_timeout(&self, timeout: Duration) -> Result<Message> {
        let deadline = Instant::now() + timeout;
        let mut inbox = self.lock_inbox();
        loop {
            if let Some(message) = Self::take_next(&mut inbox)? {
                return Ok(message);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(BusError::TimedOut);
            }
            inbox = self
                .ready
                .wait_timeout(inbox, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    fn take_next(inbox: &mut Inbox) -> Result<Option<Message>> {
        match inbox.state {
            ConnectionState::Created => Err(BusError::NotActive),
            ConnectionState::Disconnected => Err(BusError::ConnectionDisconnected),
            ConnectionState::Active => Ok(inbox.messages.pop()),
        }
    }

    /// Acquire a well-known name on the bus
    pub fn set_name(&self, name: &str) -> Result<()> {
        let bus = self.require_active()?;
        if let Some(event) = bus.resolver().set_name(self.id, name)? {
            router::notify(&bus, vec![event]);
        }
        Ok(())
    }

    /// Release a well-known name owned by this connection
    pub fn remove_name(&self, name: &str) -> Result<()> {
        let bus = self.require_active()?;
        let event = bus.resolver().remove_name(self.id, name)?;
        router::notify(&bus, vec![event]);
        Ok(())
    }

    /// Bus of an active connection
    pub(crate) fn require_active(&self) -> Result<Arc<Bus>> {
        match self.state() {
            ConnectionState::Created => Err(BusError::NotActive),
            ConnectionState::Disconnected => Err(BusError::ConnectionDisconnected),
            ConnectionState::Active => self.bus.upgrade().ok_or(BusError::ConnectionDisconnected),
        }
    }

    /// Append a message to the queue and wake one receiver
    pub(crate) fn enqueue(&self, message: Message, limit: usize) -> Result<()> {
        {
            let mut inbox = self.lock_inbox();
            match inbox.state {
                ConnectionState::Created => return Err(BusError::NotActive),
                ConnectionState::Disconnected => return Err(BusError::ConnectionDisconnected),
                ConnectionState::Active => {}
            }
            if inbox.messages.len() >= limit {
                return Err(BusError::QueueFull { id: self.id });
            }
            inbox.messages.push(message);
        }
        self.ready.notify_one();
        Ok(())
    }

    /// Tear the connection down
    ///
    /// Idempotent. Drops every queued message, wakes blocked receivers,
    /// detaches from the endpoint and bus directory and, if the connection
    /// was active, releases its names and announces its removal.
    pub fn disconnect(&self) {
        let (was_active, drained) = {
            let mut inbox = self.lock_inbox();
            let previous = inbox.state;
            if previous == ConnectionState::Disconnected {
                return;
            }
            inbox.state = ConnectionState::Disconnected;
            (previous == ConnectionState::Active, inbox.messages.take())
        };
        self.ready.notify_all();
        drop(drained);

        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.remove_connection(self.id);
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.remove_connection(self.id);
            if was_active {
                let events = bus.resolver().id_removed(self.id);
                router::notify(&bus, events);
            }
        }

        debug!("kbus: connection {} disconnected", self.id);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        trace!("kbus: connection {} released", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusFlags;
    use crate::config::{BusConfig, Limits};
    use crate::id::KERNEL_ID;
    use crate::message::Notification;
    use crate::policy::Mode;
    use crate::subsystem::Subsystem;
    use std::thread;

    fn bus_with(limits: Limits) -> (Arc<Subsystem>, Arc<Bus>) {
        let subsystem = Subsystem::with_config(BusConfig { limits });
        let bus = Bus::create(subsystem.root(), "test", Mode::WORLD, BusFlags::empty(), 0, 0).unwrap();
        (subsystem, bus)
    }

    fn active(ep: &Arc<Endpoint>, creds: Credentials) -> Arc<Connection> {
        let conn = Connection::attach(ep, creds).unwrap();
        conn.hello().unwrap();
        conn
    }

    #[test]
    fn test_state_machine() {
        let (_subsystem, bus) = bus_with(Limits::default());
        let ep = bus.default_endpoint().unwrap();
        let conn = Connection::attach(&ep, Credentials::ROOT).unwrap();

        assert_eq!(conn.state(), ConnectionState::Created);
        assert_eq!(conn.try_receive().unwrap_err(), BusError::NotActive);
        assert_eq!(conn.receive().unwrap_err(), BusError::NotActive);
        assert_eq!(conn.set_name("org.example.A").unwrap_err(), BusError::NotActive);
        assert!(!bus.list_ids().contains(&conn.id()));

        conn.hello().unwrap();
        assert_eq!(conn.state(), ConnectionState::Active);
        assert_eq!(conn.hello().unwrap_err(), BusError::AlreadyActive);
        assert_eq!(bus.list_ids(), vec![conn.id()]);

        conn.disconnect();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.hello().unwrap_err(), BusError::ConnectionDisconnected);
        assert_eq!(conn.try_receive().unwrap_err(), BusError::ConnectionDisconnected);
        assert!(bus.list_ids().is_empty());
        assert!(bus.connection(conn.id()).is_none());
        assert!(ep.connections().is_empty());
    }

    #[test]
    fn test_disconnect_created_connection() {
        let (_subsystem, bus) = bus_with(Limits::default());
        let ep = bus.default_endpoint().unwrap();
        let watcher = active(&ep, Credentials::ROOT);
        watcher.subscribe(NotifyMask::ALL);

        let conn = Connection::attach(&ep, Credentials::ROOT).unwrap();
        conn.disconnect();
        conn.disconnect();

        // Never active, so never announced
        assert_eq!(watcher.try_receive().unwrap_err(), BusError::WouldBlock);
    }

    #[test]
    fn test_receive_timeout_and_would_block() {
        let (_subsystem, bus) = bus_with(Limits::default());
        let ep = bus.default_endpoint().unwrap();
        let conn = active(&ep, Credentials::ROOT);

        assert_eq!(conn.try_receive().unwrap_err(), BusError::WouldBlock);
        assert_eq!(
            conn.receive_timeout(Duration::from_millis(10)).unwrap_err(),
            BusError::TimedOut
        );
    }

    #[test]
    fn test_blocked_receive_woken_by_send() {
        let (_subsystem, bus) = bus_with(Limits::default());
        let ep = bus.default_endpoint().unwrap();
        let sender = active(&ep, Credentials::ROOT);
        let receiver = active(&ep, Credentials::ROOT);

        let handle = {
            let receiver = Arc::clone(&receiver);
            thread::spawn(move || receiver.receive())
        };
        thread::sleep(Duration::from_millis(20));
        sender.send(Destination::Id(receiver.id()), b"wake".to_vec()).unwrap();

        let msg = handle.join().unwrap().unwrap();
        assert_eq!(msg.payload(), Some(&b"wake"[..]));
    }

    #[test]
    fn test_blocked_receive_woken_by_disconnect() {
        let (_subsystem, bus) = bus_with(Limits::default());
        let ep = bus.default_endpoint().unwrap();
        let conn = active(&ep, Credentials::ROOT);

        let handle = {
            let conn = Arc::clone(&conn);
            thread::spawn(move || conn.receive())
        };
        thread::sleep(Duration::from_millis(20));
        conn.disconnect();

        assert_eq!(handle.join().unwrap().unwrap_err(), BusError::ConnectionDisconnected);
    }

    #[test]
    fn test_disconnect_drops_queued_messages() {
        let (_subsystem, bus) = bus_with(Limits::default());
        let ep = bus.default_endpoint().unwrap();
        let c1 = active(&ep, Credentials::ROOT);
        let c2 = active(&ep, Credentials::ROOT);

        c1.send(Destination::Id(c2.id()), b"a".to_vec()).unwrap();
        c1.send(Destination::Id(c2.id()), b"b".to_vec()).unwrap();
        assert_eq!(c2.queued(), 2);

        c2.disconnect();
        assert_eq!(c2.queued(), 0);
    }

    #[test]
    fn test_queue_full() {
        let limits = Limits {
            max_queued_messages: 2,
            ..Limits::default()
        };
        let (_subsystem, bus) = bus_with(limits);
        let ep = bus.default_endpoint().unwrap();
        let c1 = active(&ep, Credentials::ROOT);
        let c2 = active(&ep, Credentials::ROOT);

        c1.send(Destination::Id(c2.id()), vec![1]).unwrap();
        c1.send(Destination::Id(c2.id()), vec![2]).unwrap();
        assert_eq!(
            c1.send(Destination::Id(c2.id()), vec![3]).unwrap_err(),
            BusError::QueueFull { id: c2.id() }
        );

        // Broadcast skips the full recipient instead of failing
        assert!(c1.send(Destination::Broadcast, vec![4]).is_ok());

        c2.try_receive().unwrap();
        assert!(c1.send(Destination::Id(c2.id()), vec![5]).is_ok());
    }

    #[test]
    fn test_payload_limit() {
        let limits = Limits {
            max_payload: 4,
            ..Limits::default()
        };
        let (_subsystem, bus) = bus_with(limits);
        let ep = bus.default_endpoint().unwrap();
        let c1 = active(&ep, Credentials::ROOT);
        let c2 = active(&ep, Credentials::ROOT);

        assert!(c1.send(Destination::Id(c2.id()), vec![0; 4]).is_ok());
        assert_eq!(
            c1.send(Destination::Id(c2.id()), vec![0; 5]).unwrap_err(),
            BusError::PayloadTooLarge { size: 5, max: 4 }
        );
    }

    #[test]
    fn test_attach_policy() {
        let subsystem = Subsystem::new();
        let bus = Bus::create(subsystem.root(), "private", Mode::PRIVATE, BusFlags::empty(), 1000, 1000).unwrap();
        let ep = bus.default_endpoint().unwrap();

        assert!(Connection::attach(&ep, Credentials::new(1000, 1000)).is_ok());
        assert!(Connection::attach(&ep, Credentials::ROOT).is_ok());
        assert_eq!(
            Connection::attach(&ep, Credentials::new(2000, 2000)).unwrap_err(),
            BusError::PermissionDenied
        );
    }

    #[test]
    fn test_send_requires_write_access() {
        let subsystem = Subsystem::new();
        let mode = Mode::PRIVATE | Mode::OTHER_READ;
        let bus = Bus::create(subsystem.root(), "ro", mode, BusFlags::empty(), 1000, 1000).unwrap();
        let ep = bus.default_endpoint().unwrap();

        let owner = active(&ep, Credentials::new(1000, 1000));
        let reader = active(&ep, Credentials::new(2000, 2000));

        assert_eq!(
            reader.send(Destination::Id(owner.id()), b"x".to_vec()).unwrap_err(),
            BusError::PermissionDenied
        );
        assert!(owner.send(Destination::Id(reader.id()), b"x".to_vec()).is_ok());
    }

    #[test]
    fn test_broadcast_filtered_by_read_access() {
        let subsystem = Subsystem::new();
        let mode = Mode::PRIVATE | Mode::OTHER_WRITE;
        let bus = Bus::create(subsystem.root(), "wo", mode, BusFlags::empty(), 1000, 1000).unwrap();
        let ep = bus.default_endpoint().unwrap();

        let owner = active(&ep, Credentials::new(1000, 1000));
        let peer = active(&ep, Credentials::new(1000, 1000));
        let writer = active(&ep, Credentials::new(2000, 2000));

        writer.send(Destination::Broadcast, b"all".to_vec()).unwrap();
        assert_eq!(owner.try_receive().unwrap().payload(), Some(&b"all"[..]));
        assert_eq!(peer.try_receive().unwrap().payload(), Some(&b"all"[..]));

        owner.send(Destination::Broadcast, b"again".to_vec()).unwrap();
        assert_eq!(writer.try_receive().unwrap_err(), BusError::WouldBlock);
    }

    #[test]
    fn test_send_by_name() {
        let (_subsystem, bus) = bus_with(Limits::default());
        let ep = bus.default_endpoint().unwrap();
        let client = active(&ep, Credentials::ROOT);
        let service = active(&ep, Credentials::ROOT);

        assert!(matches!(
            client.send(Destination::Name("org.example.Service".into()), vec![]),
            Err(BusError::DestinationNotFound(_))
        ));

        service.set_name("org.example.Service").unwrap();
        assert_eq!(service.names(), vec!["org.example.Service".to_string()]);
        client
            .send(Destination::Name("org.example.Service".into()), b"call".to_vec())
            .unwrap();

        let msg = service.try_receive().unwrap();
        assert_eq!(msg.sender(), client.id());
        assert_eq!(msg.destination(), &Destination::Name("org.example.Service".into()));

        service.remove_name("org.example.Service").unwrap();
        assert!(service.names().is_empty());
        assert!(matches!(
            client.remove_name("org.example.Service"),
            Err(BusError::NotFound { .. })
        ));
    }

    #[test]
    fn test_notifications_follow_subscription() {
        let (_subsystem, bus) = bus_with(Limits::default());
        let ep = bus.default_endpoint().unwrap();
        let watcher = active(&ep, Credentials::ROOT);
        assert_eq!(watcher.subscriptions(), NotifyMask::empty());

        // Unsubscribed: nothing arrives
        let quiet = active(&ep, Credentials::ROOT);
        assert_eq!(watcher.try_receive().unwrap_err(), BusError::WouldBlock);

        watcher.subscribe(NotifyMask::ID_ADD | NotifyMask::NAME_CHANGE);
        let peer = active(&ep, Credentials::ROOT);
        let added = watcher.try_receive().unwrap();
        assert_eq!(added.sender(), KERNEL_ID);
        assert_eq!(added.notification(), Some(&Notification::IdAdded { id: peer.id() }));

        peer.set_name("org.example.Peer").unwrap();
        assert_eq!(
            watcher.try_receive().unwrap().notification(),
            Some(&Notification::NameChanged {
                name: "org.example.Peer".into(),
                old_owner: None,
                new_owner: Some(peer.id()),
            })
        );

        // Removal announces the released name but not the id (not subscribed)
        peer.disconnect();
        assert_eq!(
            watcher.try_receive().unwrap().notification(),
            Some(&Notification::NameChanged {
                name: "org.example.Peer".into(),
                old_owner: Some(peer.id()),
                new_owner: None,
            })
        );
        assert_eq!(watcher.try_receive().unwrap_err(), BusError::WouldBlock);

        watcher.subscribe(NotifyMask::ID_REMOVE);
        quiet.disconnect();
        assert_eq!(
            watcher.try_receive().unwrap().notification(),
            Some(&Notification::IdRemoved { id: quiet.id() })
        );
    }

    #[test]
    fn test_attach_after_endpoint_disconnect() {
        let (_subsystem, bus) = bus_with(Limits::default());
        let ep = bus.default_endpoint().unwrap();
        ep.disconnect();
        assert_eq!(
            Connection::attach(&ep, Credentials::ROOT).unwrap_err(),
            BusError::EndpointDisconnected
        );
    }
}
