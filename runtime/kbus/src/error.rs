//! Error types for bus operations
//!
//! Every lifecycle and routing failure is returned to the caller as a
//! [`BusError`]. Teardown (`disconnect`) never fails.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by namespace, bus, endpoint and connection operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("namespace is disconnected")]
    NamespaceDisconnected,

    #[error("bus is disconnected")]
    BusDisconnected,

    #[error("endpoint is disconnected")]
    EndpointDisconnected,

    #[error("connection is disconnected")]
    ConnectionDisconnected,

    #[error("connection has not said hello yet")]
    NotActive,

    #[error("connection is already active")]
    AlreadyActive,

    #[error("destination {0} not found")]
    DestinationNotFound(String),

    #[error("name '{name}' is owned by connection {owner}")]
    NameTaken { name: String, owner: u64 },

    #[error("name '{name}' is not owned by the caller")]
    NotOwner { name: String },

    #[error("operation would block")]
    WouldBlock,

    #[error("operation timed out")]
    TimedOut,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("endpoint busy ({connections} connections attached)")]
    Busy { connections: usize },

    #[error("queue of connection {id} is full")]
    QueueFull { id: u64 },

    #[error("payload of {size} bytes exceeds limit of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("connection {id} owns too many names")]
    TooManyNames { id: u64 },

    #[error("malformed control frame: {0}")]
    Protocol(String),
}

/// Result type for bus operations
pub type Result<T> = core::result::Result<T, BusError>;

/// Stable numeric codes used when errors cross the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    AlreadyExists,
    NotFound,
    NamespaceDisconnected,
    BusDisconnected,
    EndpointDisconnected,
    ConnectionDisconnected,
    NotActive,
    AlreadyActive,
    DestinationNotFound,
    NameTaken,
    NotOwner,
    WouldBlock,
    TimedOut,
    InvalidArgument,
    PermissionDenied,
    Busy,
    QueueFull,
    PayloadTooLarge,
    TooManyNames,
    Protocol,
}

impl BusError {
    /// Code reported to control-plane clients
    pub fn code(&self) -> ErrorCode {
        match self {
            BusError::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            BusError::NotFound { .. } => ErrorCode::NotFound,
            BusError::NamespaceDisconnected => ErrorCode::NamespaceDisconnected,
            BusError::BusDisconnected => ErrorCode::BusDisconnected,
            BusError::EndpointDisconnected => ErrorCode::EndpointDisconnected,
            BusError::ConnectionDisconnected => ErrorCode::ConnectionDisconnected,
            BusError::NotActive => ErrorCode::NotActive,
            BusError::AlreadyActive => ErrorCode::AlreadyActive,
            BusError::DestinationNotFound(_) => ErrorCode::DestinationNotFound,
            BusError::NameTaken { .. } => ErrorCode::NameTaken,
            BusError::NotOwner { .. } => ErrorCode::NotOwner,
            BusError::WouldBlock => ErrorCode::WouldBlock,
            BusError::TimedOut => ErrorCode::TimedOut,
            BusError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            BusError::PermissionDenied => ErrorCode::PermissionDenied,
            BusError::Busy { .. } => ErrorCode::Busy,
            BusError::QueueFull { .. } => ErrorCode::QueueFull,
            BusError::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            BusError::TooManyNames { .. } => ErrorCode::TooManyNames,
            BusError::Protocol(_) => ErrorCode::Protocol,
        }
    }

    /// True for the end-of-stream family of errors
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            BusError::NamespaceDisconnected
                | BusError::BusDisconnected
                | BusError::EndpointDisconnected
                | BusError::ConnectionDisconnected
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BusError::NameTaken {
            name: "org.example.Foo".into(),
            owner: 7,
        };
        assert_eq!(err.to_string(), "name 'org.example.Foo' is owned by connection 7");

        let err = BusError::AlreadyExists {
            kind: "bus",
            name: "system".into(),
        };
        assert_eq!(err.to_string(), "bus 'system' already exists");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(BusError::WouldBlock.code(), ErrorCode::WouldBlock);
        assert_eq!(
            BusError::DestinationNotFound("9999".into()).code(),
            ErrorCode::DestinationNotFound
        );
        assert!(BusError::ConnectionDisconnected.is_disconnect());
        assert!(!BusError::NotActive.is_disconnect());
    }
}
