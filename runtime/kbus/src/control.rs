//! Control plane
//!
//! A [`Session`] models one opened device node. Sessions opened on a
//! namespace's control minor start as `Control` and become `NsOwner` or
//! `BusOwner` once they create something; sessions opened on an endpoint
//! minor carry an attached connection. Closing a session disconnects
//! whatever it owns.
//!
//! Requests and responses are plain serde enums. [`Session::handle_frame`]
//! accepts bincode-encoded requests and always answers with an encoded
//! [`Response`], turning failures into [`Response::Error`].

use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::bus::{Bus, BusFlags};
use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::error::{BusError, ErrorCode, Result};
use crate::handle_table::Handle;
use crate::message::{Destination, Message, Notification, NotifyMask};
use crate::namespace::{Namespace, CONTROL_MINOR};
use crate::policy::{Credentials, Mode};
use crate::subsystem::Subsystem;

/// Role of an opened node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionKind {
    /// Closed
    Undefined,
    /// Control node that has not created anything yet
    Control,
    /// Control node that created a namespace
    NsOwner,
    /// Control node that created a bus
    BusOwner,
    /// Endpoint node with an attached connection
    Endpoint,
}

/// Control-plane request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    NsCreate { name: String, mode: Mode },
    BusCreate { name: String, mode: Mode, flags: BusFlags },
    EpCreate { name: String, mode: Mode },
    EpRemove { name: String },
    Hello,
    Send { destination: Destination, payload: Vec<u8> },
    Receive,
    TryReceive,
    SetName { name: String },
    RemoveName { name: String },
    ListNames,
    ListIds,
    Subscribe { mask: NotifyMask },
    Disconnect,
}

/// A received message in wire form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: u64,
    pub sender: u64,
    pub destination: Destination,
    pub payload: Option<Vec<u8>>,
    pub notification: Option<Notification>,
}

impl From<&Message> for Delivery {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id(),
            sender: message.sender(),
            destination: message.destination().clone(),
            payload: message.payload().map(<[u8]>::to_vec),
            notification: message.notification().cloned(),
        }
    }
}

/// Control-plane response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Ok,
    NsCreated { id: u64, major: Handle },
    BusCreated { id: u64, endpoint_minor: Handle },
    EpCreated { id: u64, name: String, minor: Handle },
    Hello { id: u64 },
    Sent { id: u64 },
    Message(Delivery),
    Names(Vec<(String, u64)>),
    Ids(Vec<u64>),
    Error { code: ErrorCode, message: String },
}

#[derive(Debug)]
enum Owned {
    Nothing,
    Namespace(Arc<Namespace>),
    Bus(Arc<Bus>),
    Connection(Arc<Connection>),
}

/// One opened node
#[derive(Debug)]
pub struct Session {
    subsystem: Arc<Subsystem>,
    ns: Arc<Namespace>,
    creds: Credentials,
    kind: ConnectionKind,
    owned: Owned,
}

impl Session {
    /// Open `minor` of namespace `ns`
    ///
    /// Minor 0 opens the control node; any other minor attaches a new
    /// connection to the endpoint registered under it.
    pub fn open(
        subsystem: &Arc<Subsystem>,
        ns: &Arc<Namespace>,
        minor: Handle,
        creds: Credentials,
    ) -> Result<Session> {
        let (kind, owned) = if minor == CONTROL_MINOR {
            if ns.is_disconnected() {
                return Err(BusError::NamespaceDisconnected);
            }
            (ConnectionKind::Control, Owned::Nothing)
        } else {
            let endpoint = ns.endpoint_by_minor(minor)?;
            let connection = Connection::attach(&endpoint, creds)?;
            (ConnectionKind::Endpoint, Owned::Connection(connection))
        };

        debug!(
            "kbus: session opened on {}:{} as {:?}",
            ns.major(),
            minor,
            kind
        );
        Ok(Session {
            subsystem: Arc::clone(subsystem),
            ns: Arc::clone(ns),
            creds,
            kind,
            owned,
        })
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn credentials(&self) -> &Credentials {
        &self.creds
    }

    /// Namespace the node belongs to
    pub fn namespace(&self) -> &Arc<Namespace> {
        &self.ns
    }

    /// Connection of an endpoint session
    pub fn connection(&self) -> Option<&Arc<Connection>> {
        match &self.owned {
            Owned::Connection(conn) => Some(conn),
            _ => None,
        }
    }

    /// Bus created by a bus-owner session
    pub fn owned_bus(&self) -> Option<&Arc<Bus>> {
        match &self.owned {
            Owned::Bus(bus) => Some(bus),
            _ => None,
        }
    }

    /// Namespace created by a namespace-owner session
    pub fn owned_namespace(&self) -> Option<&Arc<Namespace>> {
        match &self.owned {
            Owned::Namespace(ns) => Some(ns),
            _ => None,
        }
    }

    fn wrong_kind(&self, request: &Request) -> BusError {
        BusError::InvalidArgument(format!(
            "{:?} is not valid on a {:?} session",
            request, self.kind
        ))
    }

    fn require_connection(&self, request: &Request) -> Result<&Arc<Connection>> {
        self.connection().ok_or_else(|| self.wrong_kind(request))
    }

    fn require_bus(&self, request: &Request) -> Result<&Arc<Bus>> {
        self.owned_bus().ok_or_else(|| self.wrong_kind(request))
    }

    /// Bus a query request is answered from
    fn query_bus(&self, request: &Request) -> Result<Arc<Bus>> {
        match &self.owned {
            Owned::Bus(bus) => Ok(Arc::clone(bus)),
            Owned::Connection(conn) => conn.bus().ok_or(BusError::ConnectionDisconnected),
            _ => Err(self.wrong_kind(request)),
        }
    }

    /// Dispatch one request
    pub fn handle(&mut self, request: Request) -> Result<Response> {
        match &request {
            Request::NsCreate { name, mode } => {
                if self.kind != ConnectionKind::Control {
                    return Err(self.wrong_kind(&request));
                }
                let ns = self.subsystem.create_namespace(&self.ns, name, *mode)?;
                let response = Response::NsCreated {
                    id: ns.id(),
                    major: ns.major(),
                };
                self.kind = ConnectionKind::NsOwner;
                self.owned = Owned::Namespace(ns);
                Ok(response)
            }
            Request::BusCreate { name, mode, flags } => {
                if self.kind != ConnectionKind::Control {
                    return Err(self.wrong_kind(&request));
                }
                let bus = Bus::create(&self.ns, name, *mode, *flags, self.creds.uid, self.creds.gid)?;
                let response = Response::BusCreated {
                    id: bus.id(),
                    endpoint_minor: bus.default_endpoint()?.minor(),
                };
                self.kind = ConnectionKind::BusOwner;
                self.owned = Owned::Bus(bus);
                Ok(response)
            }
            Request::EpCreate { name, mode } => {
                let bus = self.require_bus(&request)?;
                let ep = Endpoint::create(bus, name, *mode, self.creds.uid, self.creds.gid)?;
                Ok(Response::EpCreated {
                    id: ep.id(),
                    name: ep.name().to_string(),
                    minor: ep.minor(),
                })
            }
            Request::EpRemove { name } => {
                let bus = self.require_bus(&request)?;
                bus.find_endpoint(name)?.remove()?;
                Ok(Response::Ok)
            }
            Request::Hello => {
                let conn = self.require_connection(&request)?;
                conn.hello()?;
                Ok(Response::Hello { id: conn.id() })
            }
            Request::Send {
                destination,
                payload,
            } => {
                let conn = self.require_connection(&request)?;
                let id = conn.send(destination.clone(), payload.clone())?;
                Ok(Response::Sent { id })
            }
            Request::Receive => {
                let conn = self.require_connection(&request)?;
                let message = conn.receive()?;
                Ok(Response::Message(Delivery::from(&message)))
            }
            Request::TryReceive => {
                let conn = self.require_connection(&request)?;
                let message = conn.try_receive()?;
                Ok(Response::Message(Delivery::from(&message)))
            }
            Request::SetName { name } => {
                self.require_connection(&request)?.set_name(name)?;
                Ok(Response::Ok)
            }
            Request::RemoveName { name } => {
                self.require_connection(&request)?.remove_name(name)?;
                Ok(Response::Ok)
            }
            Request::ListNames => Ok(Response::Names(self.query_bus(&request)?.list_names())),
            Request::ListIds => Ok(Response::Ids(self.query_bus(&request)?.list_ids())),
            Request::Subscribe { mask } => {
                self.require_connection(&request)?.subscribe(*mask);
                Ok(Response::Ok)
            }
            Request::Disconnect => {
                self.disconnect_owned();
                Ok(Response::Ok)
            }
        }
    }

    /// Decode a bincode request, dispatch it and encode the response
    pub fn handle_frame(&mut self, frame: &[u8]) -> Vec<u8> {
        let response = decode_request(frame)
            .and_then(|request| self.handle(request))
            .unwrap_or_else(|err| Response::Error {
                code: err.code(),
                message: err.to_string(),
            });

        bincode::serialize(&response).unwrap_or_else(|err| {
            warn!("kbus: failed to encode response: {}", err);
            Vec::new()
        })
    }

    fn disconnect_owned(&self) {
        match &self.owned {
            Owned::Nothing => {}
            Owned::Namespace(ns) => ns.disconnect(),
            Owned::Bus(bus) => bus.disconnect(),
            Owned::Connection(conn) => conn.disconnect(),
        }
    }

    /// Close the node, disconnecting whatever it owns
    pub fn close(&mut self) {
        if self.kind == ConnectionKind::Undefined {
            return;
        }
        self.disconnect_owned();
        self.owned = Owned::Nothing;
        debug!("kbus: {:?} session closed", self.kind);
        self.kind = ConnectionKind::Undefined;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Encode a request frame
pub fn encode_request(request: &Request) -> Result<Vec<u8>> {
    bincode::serialize(request).map_err(|e| BusError::Protocol(e.to_string()))
}

/// Decode a request frame
pub fn decode_request(frame: &[u8]) -> Result<Request> {
    bincode::deserialize(frame).map_err(|e| BusError::Protocol(e.to_string()))
}

/// Decode a response frame
pub fn decode_response(frame: &[u8]) -> Result<Response> {
    bincode::deserialize(frame).map_err(|e| BusError::Protocol(e.to_string()))
}
