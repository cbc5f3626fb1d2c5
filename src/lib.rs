pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod health;
pub mod hysteresis;
pub mod migration;
pub mod monitoring;
pub mod pool;
pub mod prioritizer;
pub mod retry;
pub mod scheduler;

pub use config::{MultipathConfig, RandomPortConfig, TransportPriorities};
pub use connection::{Connection, ConnectionRef, ConnectionStatistics, TransportType};
pub use error::{Error, ErrorCategory, Result};
pub use events::{Event, EventCategory, EventLevel, EventSink, EventSinkRef, LogEventSink, MemoryEventSink};
pub use health::{ConnectionHealthTracker, HealthMonitor};
pub use hysteresis::{HysteresisController, HysteresisPhase};
pub use migration::{MigrationManager, TransferKey, TransferState};
pub use monitoring::{ConnectionService, ContinuousMonitor, MonitoringReport};
pub use pool::{ConnectionPool, ConnectionPoolManager, SelectionStrategy};
pub use prioritizer::{ConnectionObservation, ConnectionPrioritizer};
pub use retry::{AdaptiveTimeouts, RetryConfig, RetryPolicy};
pub use scheduler::{PacketScheduler, PathMetrics};

/// Identifier of a remote device
pub type DeviceId = String;

/// Identifier of a single transport connection
pub type ConnectionId = String;
