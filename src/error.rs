use std::fmt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ConnectionId;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the connection-management core.
///
/// Most selection operations fail soft and never produce one of these; they are
/// reserved for configuration validation, explicit close calls and the external
/// connection service.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {field} - {reason}")]
    Configuration { field: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed: {connection_id}")]
    ConnectionClosed { connection_id: ConnectionId },

    #[error("Connection service error: {reason}")]
    Service { reason: String },

    #[error("No transfer of {folder}/{file} on connection {connection_id}")]
    TransferNotFound {
        connection_id: ConnectionId,
        folder: String,
        file: String,
    },
}

impl Error {
    pub fn configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn service(reason: impl Into<String>) -> Self {
        Error::Service { reason: reason.into() }
    }
}

/// Platform-independent classification of a transport failure.
///
/// Platform adapters only supply the mapping into this set; the set itself never
/// grows per platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    ConnectionReset,
    Timeout,
    ConnectionRefused,
    NetworkUnreachable,
    NetworkDown,
    HostUnreachable,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 7] = [
        ErrorCategory::ConnectionReset,
        ErrorCategory::Timeout,
        ErrorCategory::ConnectionRefused,
        ErrorCategory::NetworkUnreachable,
        ErrorCategory::NetworkDown,
        ErrorCategory::HostUnreachable,
        ErrorCategory::Unknown,
    ];

    /// Whether the failure points at the network path rather than the peer.
    pub fn is_path_failure(&self) -> bool {
        matches!(
            self,
            ErrorCategory::NetworkUnreachable
                | ErrorCategory::NetworkDown
                | ErrorCategory::HostUnreachable
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::ConnectionReset => write!(f, "connection_reset"),
            ErrorCategory::Timeout => write!(f, "timeout"),
            ErrorCategory::ConnectionRefused => write!(f, "connection_refused"),
            ErrorCategory::NetworkUnreachable => write!(f, "network_unreachable"),
            ErrorCategory::NetworkDown => write!(f, "network_down"),
            ErrorCategory::HostUnreachable => write!(f, "host_unreachable"),
            ErrorCategory::Unknown => write!(f, "unknown"),
        }
    }
}
