//! Per-device path selection across simultaneous connections.
//!
//! Implements:
//! - best-health selection
//! - traffic-aware selection (latency, bandwidth and loss together)
//! - smooth weighted round-robin load balancing
//! - bandwidth-biased chunk distribution

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::health::{latency_score, loss_score};
use crate::{ConnectionId, ConnectionRef, DeviceId};

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// When false every selection and every chunk goes to the healthiest path.
    pub multipath_enabled: bool,
    /// Weight for latency in traffic-based scoring (0-1).
    pub latency_weight: f64,
    /// Weight for bandwidth in traffic-based scoring (0-1).
    pub bandwidth_weight: f64,
    /// Weight for loss in traffic-based scoring (0-1).
    pub loss_weight: f64,
    /// Bandwidth that scores 100 in traffic-based scoring (Mbps).
    pub excellent_bandwidth_mbps: f64,
    /// Upper bound on chunks produced by one distribution; chunks grow to fit.
    pub max_chunks: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            multipath_enabled: true,
            latency_weight: 0.4,
            bandwidth_weight: 0.3,
            loss_weight: 0.3,
            excellent_bandwidth_mbps: 100.0,
            max_chunks: 4096,
        }
    }
}

/// Observed characteristics of one path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PathMetrics {
    pub latency: Option<Duration>,
    pub bandwidth_mbps: Option<f64>,
    pub loss_percent: f64,
}

/// One chunk of a logical transfer bound to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkAssignment {
    pub index: u64,
    pub offset: u64,
    pub size: u64,
    pub connection_id: ConnectionId,
}

#[derive(Debug)]
struct ScheduledPath {
    connection: ConnectionRef,
    metrics: PathMetrics,
    /// Smooth weighted round-robin credit
    current_weight: f64,
}

#[derive(Debug, Default)]
struct DeviceSchedule {
    paths: Vec<ScheduledPath>,
}

/// Packet scheduler.
#[derive(Debug)]
pub struct PacketScheduler {
    devices: Arc<RwLock<HashMap<DeviceId, Arc<RwLock<DeviceSchedule>>>>>,
    config: SchedulerConfig,
}

impl PacketScheduler {
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        Self {
            devices: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Add a connection to its device's set. Returns false if the id is already present.
    pub async fn add_connection(&self, connection: ConnectionRef) -> bool {
        let schedule = self.device_schedule(connection.device_id()).await;
        let mut schedule = schedule.write().await;
        if schedule.paths.iter().any(|p| p.connection.id() == connection.id()) {
            return false;
        }

        log::debug!(
            "Scheduling {} ({}) for {}",
            connection.id(),
            connection.transport_type(),
            connection.device_id()
        );
        schedule.paths.push(ScheduledPath {
            connection,
            metrics: PathMetrics::default(),
            current_weight: 0.0,
        });
        true
    }

    pub async fn remove_connection(&self, device_id: &str, connection_id: &str) -> Option<ConnectionRef> {
        let schedule = self.existing_schedule(device_id).await?;
        let mut schedule = schedule.write().await;
        let index = schedule
            .paths
            .iter()
            .position(|p| p.connection.id() == connection_id)?;
        Some(schedule.paths.remove(index).connection)
    }

    /// Update observed metrics for a path. Returns false for unknown connections.
    pub async fn update_path_metrics(&self, device_id: &str, connection_id: &str, metrics: PathMetrics) -> bool {
        let Some(schedule) = self.existing_schedule(device_id).await else {
            return false;
        };
        let mut schedule = schedule.write().await;
        match schedule.paths.iter_mut().find(|p| p.connection.id() == connection_id) {
            Some(path) => {
                path.metrics = metrics;
                true
            }
            None => false,
        }
    }

    /// Highest-health connection of the device.
    pub async fn select_connection(&self, device_id: &str) -> Option<ConnectionRef> {
        let schedule = self.existing_schedule(device_id).await?;
        let schedule = schedule.read().await;
        let index = healthiest(&schedule.paths)?;
        Some(schedule.paths[index].connection.clone())
    }

    /// Connection with the best combined latency, bandwidth and loss score.
    pub async fn select_connection_based_on_traffic(&self, device_id: &str) -> Option<ConnectionRef> {
        let schedule = self.existing_schedule(device_id).await?;
        let schedule = schedule.read().await;

        let mut best: Option<(&ScheduledPath, f64)> = None;
        for path in &schedule.paths {
            let score = self.traffic_score(path);
            if best.map(|(_, top)| score > top).unwrap_or(true) {
                best = Some((path, score));
            }
        }
        best.map(|(path, _)| path.connection.clone())
    }

    /// Spread selections across all paths in proportion to their health.
    ///
    /// Smooth weighted round-robin: deterministic, never starves a path, and
    /// interleaves heavier paths instead of bursting them.
    pub async fn select_connection_for_load_balancing(&self, device_id: &str) -> Option<ConnectionRef> {
        let schedule = self.existing_schedule(device_id).await?;
        let mut schedule = schedule.write().await;
        if !self.config.multipath_enabled {
            let index = healthiest(&schedule.paths)?;
            return Some(schedule.paths[index].connection.clone());
        }
        if schedule.paths.is_empty() {
            return None;
        }

        let weights: Vec<f64> = schedule
            .paths
            .iter()
            .map(|p| health_weight(p.connection.health_score()))
            .collect();
        let index = smooth_wrr_pick(&mut schedule.paths, &weights);
        Some(schedule.paths[index].connection.clone())
    }

    pub async fn get_connection_bandwidth(&self, device_id: &str, connection_id: &str) -> Option<f64> {
        let schedule = self.existing_schedule(device_id).await?;
        let schedule = schedule.read().await;
        schedule
            .paths
            .iter()
            .find(|p| p.connection.id() == connection_id)
            .and_then(|p| p.metrics.bandwidth_mbps)
    }

    /// Sum of known path bandwidths for the device (Mbps).
    pub async fn get_aggregated_bandwidth(&self, device_id: &str) -> f64 {
        let Some(schedule) = self.existing_schedule(device_id).await else {
            return 0.0;
        };
        let schedule = schedule.read().await;
        schedule
            .paths
            .iter()
            .filter_map(|p| p.metrics.bandwidth_mbps)
            .sum()
    }

    /// Split `total_size` bytes into chunks and bind each to a path, favouring
    /// higher-bandwidth paths. Paths without a bandwidth estimate get an equal share.
    ///
    /// A `chunk_size` of 0 means one chunk per path. Chunks are enlarged so that
    /// no more than `max_chunks` are produced.
    pub async fn distribute_data_chunks(
        &self,
        device_id: &str,
        total_size: u64,
        chunk_size: u64,
    ) -> Vec<ChunkAssignment> {
        let Some(schedule) = self.existing_schedule(device_id).await else {
            return Vec::new();
        };
        let schedule = schedule.read().await;
        if schedule.paths.is_empty() {
            return Vec::new();
        }

        let known: Vec<f64> = schedule
            .paths
            .iter()
            .filter_map(|p| p.metrics.bandwidth_mbps)
            .filter(|bw| *bw > 0.0)
            .collect();
        let fallback = if known.is_empty() {
            1.0
        } else {
            known.iter().sum::<f64>() / known.len() as f64
        };
        let weights: Vec<f64> = schedule
            .paths
            .iter()
            .map(|p| match p.metrics.bandwidth_mbps {
                Some(bw) if bw > 0.0 => bw,
                _ => fallback,
            })
            .collect();

        let path_count = if self.config.multipath_enabled { schedule.paths.len() as u64 } else { 1 };
        let mut chunk_size = if chunk_size == 0 {
            total_size.div_ceil(path_count).max(1)
        } else {
            chunk_size
        };
        let max_chunks = self.config.max_chunks.max(1);
        if total_size.div_ceil(chunk_size) > max_chunks {
            chunk_size = total_size.div_ceil(max_chunks);
        }
        let chunk_count = total_size.div_ceil(chunk_size).max(1);

        if !self.config.multipath_enabled {
            let Some(best) = healthiest(&schedule.paths) else {
                return Vec::new();
            };
            let connection_id = schedule.paths[best].connection.id().to_string();
            return (0..chunk_count)
                .map(|index| {
                    let offset = index * chunk_size;
                    ChunkAssignment {
                        index,
                        offset,
                        size: chunk_size.min(total_size.saturating_sub(offset)),
                        connection_id: connection_id.clone(),
                    }
                })
                .collect();
        }
        let mut credits = vec![0.0; weights.len()];
        let total_weight: f64 = weights.iter().sum();

        let mut assignments = Vec::with_capacity(chunk_count as usize);
        for index in 0..chunk_count {
            let offset = index * chunk_size;
            let size = chunk_size.min(total_size.saturating_sub(offset));

            let mut chosen = 0;
            for (i, weight) in weights.iter().enumerate() {
                credits[i] += weight;
                if credits[i] > credits[chosen] {
                    chosen = i;
                }
            }
            credits[chosen] -= total_weight;

            assignments.push(ChunkAssignment {
                index,
                offset,
                size,
                connection_id: schedule.paths[chosen].connection.id().to_string(),
            });
        }
        assignments
    }

    pub async fn connections(&self, device_id: &str) -> Vec<ConnectionRef> {
        let Some(schedule) = self.existing_schedule(device_id).await else {
            return Vec::new();
        };
        let schedule = schedule.read().await;
        schedule.paths.iter().map(|p| p.connection.clone()).collect()
    }

    pub async fn connection_count(&self, device_id: &str) -> usize {
        match self.existing_schedule(device_id).await {
            Some(schedule) => schedule.read().await.paths.len(),
            None => 0,
        }
    }

    pub async fn devices(&self) -> Vec<DeviceId> {
        self.devices.read().await.keys().cloned().collect()
    }

    fn traffic_score(&self, path: &ScheduledPath) -> f64 {
        let health = path.connection.health_score();
        let latency = path
            .metrics
            .latency
            .map(|l| latency_score(l.as_secs_f64() * 1000.0))
            .unwrap_or(health);
        let bandwidth = path
            .metrics
            .bandwidth_mbps
            .map(|bw| (bw / self.config.excellent_bandwidth_mbps * 100.0).clamp(0.0, 100.0))
            .unwrap_or(50.0);
        let loss = loss_score(path.metrics.loss_percent);

        latency * self.config.latency_weight
            + bandwidth * self.config.bandwidth_weight
            + loss * self.config.loss_weight
    }

    async fn device_schedule(&self, device_id: &str) -> Arc<RwLock<DeviceSchedule>> {
        if let Some(schedule) = self.existing_schedule(device_id).await {
            return schedule;
        }
        let mut devices = self.devices.write().await;
        devices.entry(device_id.to_string()).or_default().clone()
    }

    async fn existing_schedule(&self, device_id: &str) -> Option<Arc<RwLock<DeviceSchedule>>> {
        self.devices.read().await.get(device_id).cloned()
    }
}

impl Default for PacketScheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn health_weight(health: f64) -> f64 {
    if health.is_finite() { health.max(1.0) } else { 1.0 }
}

/// Index of the highest-health path, first one on ties
fn healthiest(paths: &[ScheduledPath]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, path) in paths.iter().enumerate() {
        let health = path.connection.health_score();
        if best.map(|(_, score)| health > score).unwrap_or(true) {
            best = Some((i, health));
        }
    }
    best.map(|(i, _)| i)
}

fn smooth_wrr_pick(paths: &mut [ScheduledPath], weights: &[f64]) -> usize {
    let total: f64 = weights.iter().sum();
    let mut chosen = 0;
    for (i, path) in paths.iter_mut().enumerate() {
        path.current_weight += weights[i];
    }
    for i in 1..paths.len() {
        if paths[i].current_weight > paths[chosen].current_weight {
            chosen = i;
        }
    }
    paths[chosen].current_weight -= total;
    chosen
}
