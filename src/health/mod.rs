// Connection health
//
// Per-endpoint health scoring with adaptive keep-alive, per-(device, address)
// error tracking, and the error classifier both of them rely on.

pub mod classifier;
pub mod monitor;
pub mod tracker;

pub use classifier::{categorize, is_version_issue};
pub use monitor::{HealthConfig, HealthMonitor, latency_score, loss_score};
pub use tracker::{ConnectionHealth, ConnectionHealthTracker, TrackerConfig};
