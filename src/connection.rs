use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::Result;

/// Shared handle to a transport connection.
///
/// The pool, scheduler and migration manager all hold clones of the same handle;
/// none of them closes it on behalf of the others.
pub type ConnectionRef = Arc<dyn Connection>;

/// Capability every transport connection exposes to the management core.
///
/// The core never establishes or owns connections; it only observes, ranks and
/// (on explicit pool close) releases them.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// Stable identifier of this connection
    fn id(&self) -> &str;

    /// Remote device this connection leads to
    fn device_id(&self) -> &str;

    /// Configured priority, lower is more preferred
    fn priority(&self) -> i32;

    /// When the transport finished establishing the connection
    fn established_at(&self) -> Instant;

    /// Transport type tag
    fn transport_type(&self) -> TransportType;

    /// Current traffic statistics
    fn statistics(&self) -> ConnectionStatistics;

    /// Current health score in [0, 100]
    fn health_score(&self) -> f64;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// Transport and network scope of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    TcpLan,
    TcpWan,
    QuicLan,
    QuicWan,
    Relay,
}

impl TransportType {
    pub fn is_lan(&self) -> bool {
        matches!(self, TransportType::TcpLan | TransportType::QuicLan)
    }

    pub fn is_relay(&self) -> bool {
        matches!(self, TransportType::Relay)
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportType::TcpLan => write!(f, "tcp-lan"),
            TransportType::TcpWan => write!(f, "tcp-wan"),
            TransportType::QuicLan => write!(f, "quic-lan"),
            TransportType::QuicWan => write!(f, "quic-wan"),
            TransportType::Relay => write!(f, "relay"),
        }
    }
}

/// Traffic counters reported by the transport layer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionStatistics {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub started_at: Instant,
}

impl ConnectionStatistics {
    pub fn new(started_at: Instant) -> Self {
        Self {
            bytes_in: 0,
            bytes_out: 0,
            started_at,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_in + self.bytes_out
    }

    /// Time since the counters started
    pub fn elapsed(&self) -> Duration {
        Instant::now().saturating_duration_since(self.started_at)
    }

    /// Average inbound and outbound rates in bytes per second
    pub fn throughput_bps(&self) -> (f64, f64) {
        let secs = self.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return (0.0, 0.0);
        }
        (self.bytes_in as f64 / secs, self.bytes_out as f64 / secs)
    }
}
