use std::time::Duration;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::health::{HealthConfig, TrackerConfig};
use crate::hysteresis::HysteresisConfig;
use crate::migration::MigrationConfig;
use crate::monitoring::MonitorConfig;
use crate::pool::PoolConfig;
use crate::prioritizer::PrioritizerConfig;
use crate::retry::TimeoutConfig;
use crate::scheduler::SchedulerConfig;
use crate::{Error, Result, TransportType};

/// Configured priority per transport, lower is preferred
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportPriorities {
    pub tcp_lan: i32,
    pub quic_lan: i32,
    pub tcp_wan: i32,
    pub quic_wan: i32,
    pub relay: i32,
}

impl Default for TransportPriorities {
    fn default() -> Self {
        Self {
            tcp_lan: 10,
            quic_lan: 20,
            tcp_wan: 30,
            quic_wan: 40,
            relay: 50,
        }
    }
}

impl TransportPriorities {
    pub fn priority_for(&self, transport: TransportType) -> i32 {
        match transport {
            TransportType::TcpLan => self.tcp_lan,
            TransportType::QuicLan => self.quic_lan,
            TransportType::TcpWan => self.tcp_wan,
            TransportType::QuicWan => self.quic_wan,
            TransportType::Relay => self.relay,
        }
    }
}

/// Listen on a random port from a range instead of a fixed one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomPortConfig {
    pub enabled: bool,
    pub min_port: u16,
    pub max_port: u16,
}

impl Default for RandomPortConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_port: 49152,
            max_port: 65535,
        }
    }
}

impl RandomPortConfig {
    /// A random port in range when enabled, otherwise `fallback`
    pub fn pick(&self, fallback: u16) -> u16 {
        if !self.enabled || self.min_port > self.max_port {
            return fallback;
        }
        rand::thread_rng().gen_range(self.min_port..=self.max_port)
    }
}

/// Settings for the multipath connection core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultipathConfig {
    pub adaptive_keep_alive_enabled: bool,
    pub adaptive_keep_alive_min_secs: u64,
    pub adaptive_keep_alive_max_secs: u64,
    pub multipath_enabled: bool,
    /// Primary age after which switching gets easier (seconds)
    pub connection_replacement_age_secs: u64,
    /// Priority improvement required to replace a connection
    pub connection_priority_threshold: i32,
    pub transport_priorities: TransportPriorities,
    pub random_port: RandomPortConfig,

    pub health: HealthConfig,
    pub tracker: TrackerConfig,
    pub hysteresis: HysteresisConfig,
    pub pool: PoolConfig,
    pub scheduler: SchedulerConfig,
    pub migration: MigrationConfig,
    pub monitor: MonitorConfig,
    pub timeouts: TimeoutConfig,
    pub prioritizer: PrioritizerConfig,
}

impl Default for MultipathConfig {
    fn default() -> Self {
        Self {
            adaptive_keep_alive_enabled: true,
            adaptive_keep_alive_min_secs: 10,
            adaptive_keep_alive_max_secs: 60,
            multipath_enabled: true,
            connection_replacement_age_secs: 300,
            connection_priority_threshold: 10,
            transport_priorities: TransportPriorities::default(),
            random_port: RandomPortConfig::default(),
            health: HealthConfig::default(),
            tracker: TrackerConfig::default(),
            hysteresis: HysteresisConfig::default(),
            pool: PoolConfig::default(),
            scheduler: SchedulerConfig::default(),
            migration: MigrationConfig::default(),
            monitor: MonitorConfig::default(),
            timeouts: TimeoutConfig::default(),
            prioritizer: PrioritizerConfig::default(),
        }
    }
}

impl MultipathConfig {
    /// Check cross-field constraints, reporting the first violation
    pub fn validate(&self) -> Result<()> {
        if self.adaptive_keep_alive_min_secs == 0 || self.adaptive_keep_alive_max_secs == 0 {
            return Err(Error::configuration(
                "adaptive_keep_alive",
                "keep-alive bounds must be greater than zero",
            ));
        }
        if self.adaptive_keep_alive_min_secs > self.adaptive_keep_alive_max_secs {
            return Err(Error::configuration(
                "adaptive_keep_alive",
                format!(
                    "minimum {}s exceeds maximum {}s",
                    self.adaptive_keep_alive_min_secs, self.adaptive_keep_alive_max_secs
                ),
            ));
        }
        if self.connection_priority_threshold <= 0 {
            return Err(Error::configuration(
                "connection_priority_threshold",
                "must be positive",
            ));
        }
        if self.hysteresis.max_switches_per_minute == 0 {
            return Err(Error::configuration(
                "hysteresis.max_switches_per_minute",
                "must allow at least one switch",
            ));
        }
        if self.pool.max_total == 0 {
            return Err(Error::configuration("pool.max_total", "must be greater than zero"));
        }
        if self.pool.max_idle > self.pool.max_total {
            return Err(Error::configuration(
                "pool.max_idle",
                format!("{} exceeds max_total {}", self.pool.max_idle, self.pool.max_total),
            ));
        }
        if self.random_port.enabled && self.random_port.min_port > self.random_port.max_port {
            return Err(Error::configuration(
                "random_port",
                format!("empty range {}-{}", self.random_port.min_port, self.random_port.max_port),
            ));
        }
        if self.timeouts.min_tls_handshake_timeout > self.timeouts.max_tls_handshake_timeout {
            return Err(Error::configuration(
                "timeouts",
                "minimum TLS handshake timeout exceeds maximum",
            ));
        }
        if self.monitor.interval.is_zero() {
            return Err(Error::configuration("monitor.interval", "must be greater than zero"));
        }
        let ratio = self.monitor.redial_error_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(Error::configuration(
                "monitor.redial_error_ratio",
                format!("{} is outside (0, 1]", ratio),
            ));
        }
        Ok(())
    }

    /// Health monitor settings with the keep-alive surface applied
    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            adaptive_enabled: self.adaptive_keep_alive_enabled,
            min_interval: Duration::from_secs(self.adaptive_keep_alive_min_secs),
            max_interval: Duration::from_secs(self.adaptive_keep_alive_max_secs),
            ..self.health.clone()
        }
    }

    /// Hysteresis settings with the replacement threshold and age applied
    pub fn hysteresis_config(&self) -> HysteresisConfig {
        HysteresisConfig {
            base_priority_threshold: self.connection_priority_threshold,
            stable_duration: Duration::from_secs(self.connection_replacement_age_secs),
            ..self.hysteresis.clone()
        }
    }

    /// Scheduler settings with the multipath switch applied
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            multipath_enabled: self.multipath_enabled,
            ..self.scheduler.clone()
        }
    }

    /// Migration settings with the replacement threshold applied
    pub fn migration_config(&self) -> MigrationConfig {
        MigrationConfig {
            priority_threshold: self.connection_priority_threshold,
            ..self.migration.clone()
        }
    }

    pub fn priority_for(&self, transport: TransportType) -> i32 {
        self.transport_priorities.priority_for(transport)
    }
}
