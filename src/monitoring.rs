// Continuous Monitoring Module
//
// One background loop per monitor instance that samples the connection service,
// scores overall connectivity, requests redials when too many connection
// attempts are failing, and reports long-lived idle connections.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::events::{Event, EventCategory, EventLevel, EventSinkRef};
use crate::{ConnectionId, ConnectionStatistics, DeviceId, Error, Result};

/// Weight of the connected-device fraction in the overall health score
const CONNECTIVITY_WEIGHT: f64 = 0.6;
/// Weight of the error-free fraction in the overall health score
const RELIABILITY_WEIGHT: f64 = 0.4;

/// Last known state of one dial target as reported by the connection service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub when: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Connection service consumed by the monitor.
///
/// Implemented by the host's transport layer.
#[async_trait]
pub trait ConnectionService: Send + Sync + fmt::Debug {
    /// Devices with at least one live connection
    async fn connected_devices(&self) -> Result<Vec<DeviceId>>;

    /// Every device the node is configured to talk to
    async fn configured_devices(&self) -> Result<Vec<DeviceId>>;

    async fn device_connections(&self, device_id: &str) -> Result<Vec<ConnectionId>>;

    async fn connection_statistics(&self, connection_id: &str) -> Result<ConnectionStatistics>;

    /// Status of every dial target, keyed by target identifier
    async fn connection_status(&self) -> Result<HashMap<String, ConnectionStatus>>;

    /// Force an immediate reconnection attempt
    async fn dial_now(&self) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// Fraction of failing status entries above which a redial is requested
    pub redial_error_ratio: f64,
    /// Throughput below which a connection counts as idle, per direction
    pub low_throughput_bytes_per_sec: f64,
    /// Connections younger than this are never flagged as idle
    pub low_throughput_min_age: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            redial_error_ratio: 0.3,
            low_throughput_bytes_per_sec: 1024.0,
            low_throughput_min_age: Duration::from_secs(300),
        }
    }
}

/// A long-lived connection moving almost no data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LowThroughputConnection {
    pub device_id: DeviceId,
    pub connection_id: ConnectionId,
    pub bytes_in_per_sec: f64,
    pub bytes_out_per_sec: f64,
    pub age: Duration,
}

/// Outcome of one monitoring cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringReport {
    pub generated_at: DateTime<Utc>,
    pub health_score: f64,
    pub connected_devices: usize,
    pub expected_devices: usize,
    pub error_ratio: f64,
    pub redial_requested: bool,
    pub low_throughput: Vec<LowThroughputConnection>,
}

/// Overall health from connectivity and error ratio, in [0, 100]
pub fn overall_health(connected: usize, expected: usize, error_ratio: f64) -> f64 {
    let connectivity = if expected == 0 {
        1.0
    } else {
        (connected as f64 / expected as f64).min(1.0)
    };
    let reliability = 1.0 - error_ratio.clamp(0.0, 1.0);
    (100.0 * (CONNECTIVITY_WEIGHT * connectivity + RELIABILITY_WEIGHT * reliability)).clamp(0.0, 100.0)
}

#[derive(Debug)]
struct MonitorCore {
    service: Arc<dyn ConnectionService>,
    sink: EventSinkRef,
    config: MonitorConfig,
    last_report: RwLock<Option<MonitoringReport>>,
    known_devices: RwLock<HashSet<DeviceId>>,
}

impl MonitorCore {
    async fn run_cycle(&self) -> MonitoringReport {
        let connected = match self.service.connected_devices().await {
            Ok(devices) => Some(devices),
            Err(e) => {
                log::warn!("Monitoring cycle could not list connected devices: {}", e);
                None
            }
        };
        let configured = match self.service.configured_devices().await {
            Ok(devices) => Some(devices.len()),
            Err(e) => {
                log::warn!("Monitoring cycle could not list configured devices: {}", e);
                None
            }
        };
        // An unknown device list keeps the previous count rather than reading as zero
        let connected_count = match &connected {
            Some(devices) => devices.len(),
            None => match self.last_report.read().await.as_ref() {
                Some(previous) => previous.connected_devices,
                None => configured.unwrap_or(0),
            },
        };
        let expected = configured.unwrap_or(connected_count);

        let statuses = match self.service.connection_status().await {
            Ok(statuses) => statuses,
            Err(e) => {
                log::warn!("Monitoring cycle could not read connection status: {}", e);
                HashMap::new()
            }
        };
        let failing = statuses.values().filter(|status| status.error.is_some()).count();
        let error_ratio = if statuses.is_empty() {
            0.0
        } else {
            failing as f64 / statuses.len() as f64
        };

        let low_throughput = match &connected {
            Some(devices) => {
                let flagged = self.find_low_throughput(devices).await;
                self.announce_new_devices(devices).await;
                flagged
            }
            None => Vec::new(),
        };

        let redial_requested = error_ratio > self.config.redial_error_ratio;
        if redial_requested {
            log::info!(
                "{} of {} connection targets failing, requesting redial",
                failing,
                statuses.len()
            );
            let mut event = Event::new(EventLevel::Warn, EventCategory::Failure, "connection error ratio above threshold")
                .with_field("error_ratio", format!("{:.2}", error_ratio))
                .with_field("failing", failing);
            if let Err(e) = self.service.dial_now().await {
                log::warn!("Redial request failed: {}", e);
                event = event.with_field("dial_error", e);
            }
            self.sink.emit(event).await;
        }

        let health_score = overall_health(connected_count, expected, error_ratio);
        let report = MonitoringReport {
            generated_at: Utc::now(),
            health_score,
            connected_devices: connected_count,
            expected_devices: expected,
            error_ratio,
            redial_requested,
            low_throughput,
        };

        self.sink
            .emit(
                Event::new(EventLevel::Info, EventCategory::StateChanged, "connectivity health updated")
                    .with_field("health_score", format!("{:.1}", health_score))
                    .with_field("connected_devices", report.connected_devices)
                    .with_field("expected_devices", report.expected_devices),
            )
            .await;
        log::debug!(
            "Monitoring cycle: health {:.1}, {}/{} devices, error ratio {:.2}",
            health_score, report.connected_devices, expected, error_ratio
        );

        *self.last_report.write().await = Some(report.clone());
        report
    }

    async fn find_low_throughput(&self, devices: &[DeviceId]) -> Vec<LowThroughputConnection> {
        let mut flagged = Vec::new();
        for device_id in devices {
            let connections = match self.service.device_connections(device_id).await {
                Ok(connections) => connections,
                Err(e) => {
                    log::warn!("Skipping device {} this cycle: {}", device_id, e);
                    continue;
                }
            };

            let lookups = connections
                .iter()
                .map(|connection_id| self.service.connection_statistics(connection_id));
            let results = join_all(lookups).await;

            for (connection_id, result) in connections.into_iter().zip(results) {
                let stats = match result {
                    Ok(stats) => stats,
                    Err(e) => {
                        log::debug!("No statistics for {}: {}", connection_id, e);
                        continue;
                    }
                };

                let age = stats.elapsed();
                if age <= self.config.low_throughput_min_age {
                    continue;
                }
                let (rate_in, rate_out) = stats.throughput_bps();
                let limit = self.config.low_throughput_bytes_per_sec;
                if rate_in < limit && rate_out < limit {
                    log::info!(
                        "Connection {} to {} idle for {:?}: {:.0} B/s in, {:.0} B/s out",
                        connection_id, device_id, age, rate_in, rate_out
                    );
                    flagged.push(LowThroughputConnection {
                        device_id: device_id.clone(),
                        connection_id,
                        bytes_in_per_sec: rate_in,
                        bytes_out_per_sec: rate_out,
                        age,
                    });
                }
            }
        }
        flagged
    }

    async fn announce_new_devices(&self, connected: &[DeviceId]) {
        let fresh: Vec<DeviceId> = {
            let mut known = self.known_devices.write().await;
            let current: HashSet<DeviceId> = connected.iter().cloned().collect();
            let fresh = current.difference(&known).cloned().collect();
            *known = current;
            fresh
        };
        for device_id in fresh {
            self.sink
                .emit(
                    Event::new(EventLevel::Info, EventCategory::DeviceConnected, "device connected")
                        .with_device(device_id),
                )
                .await;
        }
    }
}

/// Periodic connectivity monitor with an explicit start/stop lifecycle
#[derive(Debug)]
pub struct ContinuousMonitor {
    core: Arc<MonitorCore>,
    interval_tx: watch::Sender<Duration>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ContinuousMonitor {
    /// Fails if the configured interval is zero.
    pub fn new(service: Arc<dyn ConnectionService>, sink: EventSinkRef, config: MonitorConfig) -> Result<Self> {
        if config.interval.is_zero() {
            return Err(Error::configuration("monitor.interval", "must be greater than zero"));
        }
        let (interval_tx, _) = watch::channel(config.interval);
        Ok(Self {
            core: Arc::new(MonitorCore {
                service,
                sink,
                config,
                last_report: RwLock::new(None),
                known_devices: RwLock::new(HashSet::new()),
            }),
            interval_tx,
            task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.core.config
    }

    /// Start the background loop. Returns false if it is already running.
    pub async fn start(&self) -> bool {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return false;
        }

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let core = self.core.clone();
        let mut interval_rx = self.interval_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut period = *interval_rx.borrow_and_update();
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    changed = interval_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        period = *interval_rx.borrow_and_update();
                        ticker = tokio::time::interval_at(Instant::now() + period, period);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        log::debug!("Monitoring interval set to {:?}", period);
                    }
                    _ = ticker.tick() => {
                        core.run_cycle().await;
                    }
                }
            }
            log::debug!("Monitoring loop exited");
        });

        *task = Some((token, handle));
        log::info!("Continuous monitoring started (interval {:?})", *self.interval_tx.borrow());
        true
    }

    /// Stop the loop and wait for it to exit. Safe to call repeatedly.
    pub async fn stop(&self) {
        let running = self.task.lock().await.take();
        if let Some((token, handle)) = running {
            token.cancel();
            if let Err(e) = handle.await {
                log::warn!("Monitoring loop ended abnormally: {}", e);
            }
            log::info!("Continuous monitoring stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }

    /// Change the cycle interval. A running loop restarts its timer from now.
    pub fn set_interval(&self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(Error::configuration("monitor.interval", "must be greater than zero"));
        }
        self.interval_tx.send_replace(interval);
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        *self.interval_tx.borrow()
    }

    /// Run one cycle immediately, independent of the loop
    pub async fn run_cycle(&self) -> MonitoringReport {
        self.core.run_cycle().await
    }

    pub async fn last_report(&self) -> Option<MonitoringReport> {
        self.core.last_report.read().await.clone()
    }
}

impl Drop for ContinuousMonitor {
    fn drop(&mut self) {
        if let Some((token, _)) = self.task.get_mut().as_ref() {
            token.cancel();
        }
    }
}
