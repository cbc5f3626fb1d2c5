use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::classifier;
use crate::{DeviceId, ErrorCategory};

/// Configuration for per-(device, address) error tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Consecutive errors at which an address stops being healthy
    pub unhealthy_threshold: u32,
    /// Addresses retained per device; the oldest entry is evicted beyond this
    pub max_entries_per_device: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            unhealthy_threshold: 3,
            max_entries_per_device: 16,
        }
    }
}

/// Error statistics for one address of one device
#[derive(Debug, Clone)]
pub struct ConnectionHealth {
    pub address: String,
    pub consecutive_errors: u32,
    pub total_errors: u64,
    pub success_count: u64,
    pub last_error: Option<ErrorCategory>,
    pub is_healthy: bool,
    pub last_updated: Instant,
}

impl ConnectionHealth {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            consecutive_errors: 0,
            total_errors: 0,
            success_count: 0,
            last_error: None,
            is_healthy: true,
            last_updated: Instant::now(),
        }
    }

    /// errors / (errors + successes), 0 without observations
    pub fn error_rate(&self) -> f64 {
        let observations = self.total_errors + self.success_count;
        if observations == 0 {
            0.0
        } else {
            self.total_errors as f64 / observations as f64
        }
    }
}

/// Tracks connection errors and successes per device and address.
///
/// Entries for a device are kept in insertion order so the oldest address is the
/// one evicted when the per-device cap is exceeded.
#[derive(Debug)]
pub struct ConnectionHealthTracker {
    devices: Arc<RwLock<HashMap<DeviceId, Vec<ConnectionHealth>>>>,
    config: TrackerConfig,
}

impl ConnectionHealthTracker {
    pub fn new() -> Self {
        Self::with_config(TrackerConfig::default())
    }

    pub fn with_config(config: TrackerConfig) -> Self {
        Self {
            devices: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Classify and record a connection error, returning its category
    pub async fn record_connection_error(
        &self,
        device_id: &str,
        address: &str,
        err: &(dyn StdError + 'static),
    ) -> ErrorCategory {
        let category = classifier::categorize(err);
        self.record_error_category(device_id, address, category).await;
        category
    }

    /// Record an error whose category is already known
    pub async fn record_error_category(&self, device_id: &str, address: &str, category: ErrorCategory) {
        let mut devices = self.devices.write().await;
        let entries = devices.entry(device_id.to_string()).or_default();
        let threshold = self.config.unhealthy_threshold;

        let health = Self::entry_mut(entries, address, self.config.max_entries_per_device, device_id);
        health.consecutive_errors += 1;
        health.total_errors += 1;
        health.last_error = Some(category);
        health.last_updated = Instant::now();

        let was_healthy = health.is_healthy;
        health.is_healthy = health.consecutive_errors < threshold;
        if was_healthy && !health.is_healthy {
            log::warn!(
                "Address {} of device {} marked unhealthy after {} consecutive errors (last: {})",
                address, device_id, health.consecutive_errors, category
            );
        }
    }

    pub async fn record_connection_success(&self, device_id: &str, address: &str) {
        let mut devices = self.devices.write().await;
        let entries = devices.entry(device_id.to_string()).or_default();

        let health = Self::entry_mut(entries, address, self.config.max_entries_per_device, device_id);
        health.consecutive_errors = 0;
        health.success_count += 1;
        health.is_healthy = true;
        health.last_updated = Instant::now();
    }

    pub async fn get_error_rate(&self, device_id: &str, address: &str) -> f64 {
        self.connection_health(device_id, address)
            .await
            .map(|health| health.error_rate())
            .unwrap_or(0.0)
    }

    pub async fn connection_health(&self, device_id: &str, address: &str) -> Option<ConnectionHealth> {
        let devices = self.devices.read().await;
        devices
            .get(device_id)?
            .iter()
            .find(|health| health.address == address)
            .cloned()
    }

    /// Unknown addresses count as healthy
    pub async fn is_healthy(&self, device_id: &str, address: &str) -> bool {
        self.connection_health(device_id, address)
            .await
            .map(|health| health.is_healthy)
            .unwrap_or(true)
    }

    pub async fn tracked_addresses(&self, device_id: &str) -> Vec<String> {
        let devices = self.devices.read().await;
        devices
            .get(device_id)
            .map(|entries| entries.iter().map(|health| health.address.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn forget_device(&self, device_id: &str) {
        self.devices.write().await.remove(device_id);
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    fn entry_mut<'a>(
        entries: &'a mut Vec<ConnectionHealth>,
        address: &str,
        cap: usize,
        device_id: &str,
    ) -> &'a mut ConnectionHealth {
        let index = match entries.iter().position(|health| health.address == address) {
            Some(index) => index,
            None => {
                if cap > 0 && entries.len() >= cap {
                    let evicted = entries.remove(0);
                    log::debug!("Evicted stats for {} of device {}", evicted.address, device_id);
                }
                entries.push(ConnectionHealth::new(address));
                entries.len() - 1
            }
        };
        &mut entries[index]
    }
}

impl Default for ConnectionHealthTracker {
    fn default() -> Self {
        Self::new()
    }
}
