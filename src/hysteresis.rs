use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::{ConnectionRef, DeviceId};

/// Tuning for primary-connection switching
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HysteresisConfig {
    /// Priority improvement a candidate needs in the stable phase
    pub base_priority_threshold: i32,
    /// Window after a switch during which the threshold is multiplied
    pub cooldown: Duration,
    pub cooldown_multiplier: f64,
    /// Hard cap on switches inside any sliding `rate_window`
    pub max_switches_per_minute: u32,
    pub rate_window: Duration,
    pub rate_limit_multiplier: f64,
    /// Primary age after which the threshold is relaxed
    pub stable_duration: Duration,
    pub stable_relaxation: f64,
}

impl Default for HysteresisConfig {
    fn default() -> Self {
        Self {
            base_priority_threshold: 10,
            cooldown: Duration::from_secs(30),
            cooldown_multiplier: 2.0,
            max_switches_per_minute: 3,
            rate_window: Duration::from_secs(60),
            rate_limit_multiplier: 3.0,
            stable_duration: Duration::from_secs(300), // 5 minutes
            stable_relaxation: 0.5,
        }
    }
}

/// Where a device sits in the switching state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HysteresisPhase {
    NoPrimary,
    Stable,
    Cooldown,
    /// The rate window is full; no switch until the oldest one ages out
    RateLimited,
}

impl fmt::Display for HysteresisPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HysteresisPhase::NoPrimary => write!(f, "no-primary"),
            HysteresisPhase::Stable => write!(f, "stable"),
            HysteresisPhase::Cooldown => write!(f, "cooldown"),
            HysteresisPhase::RateLimited => write!(f, "rate-limited"),
        }
    }
}

#[derive(Debug, Default)]
struct HysteresisState {
    primary: Option<ConnectionRef>,
    primary_since: Option<Instant>,
    last_switch: Option<Instant>,
    switches: VecDeque<Instant>,
    proposed: Option<ConnectionRef>,
}

impl HysteresisState {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.switches.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.switches.pop_front();
            } else {
                break;
            }
        }
    }

    fn in_cooldown(&self, now: Instant, cooldown: Duration) -> bool {
        self.last_switch
            .map(|at| now.saturating_duration_since(at) < cooldown)
            .unwrap_or(false)
    }
}

/// Decides whether a candidate connection may replace a device's primary.
///
/// Holds only references: the controller never closes a connection it has seen.
#[derive(Debug)]
pub struct HysteresisController {
    devices: Arc<RwLock<HashMap<DeviceId, Arc<RwLock<HysteresisState>>>>>,
    config: HysteresisConfig,
}

/// Threshold decision for one device at one instant
struct Assessment {
    phase: HysteresisPhase,
    threshold: f64,
    blocked: bool,
}

impl HysteresisController {
    pub fn new() -> Self {
        Self::with_config(HysteresisConfig::default())
    }

    pub fn with_config(config: HysteresisConfig) -> Self {
        Self {
            devices: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    pub fn config(&self) -> &HysteresisConfig {
        &self.config
    }

    /// Decide whether `candidate` should become the primary of its device.
    ///
    /// `current` defaults to the tracked primary. An accepted switch is committed
    /// immediately.
    pub async fn should_switch_connection(
        &self,
        current: Option<&ConnectionRef>,
        candidate: &ConnectionRef,
    ) -> bool {
        let device_state = self.device_state(candidate.device_id()).await;
        let mut state = device_state.write().await;
        let now = Instant::now();
        state.prune(now, self.config.rate_window);

        let current = current.cloned().or_else(|| state.primary.clone());
        let Some(current) = current else {
            log::info!(
                "Adopting {} as first primary for {}",
                candidate.id(),
                candidate.device_id()
            );
            state.primary = Some(candidate.clone());
            state.primary_since = Some(now);
            return true;
        };

        if current.id() == candidate.id() {
            return false;
        }
        if state.primary.as_ref().map(|p| p.id()) != Some(current.id()) {
            state.primary = Some(current.clone());
            state.primary_since = Some(now);
        }

        let assessment = self.assess(&state, now);
        if assessment.blocked {
            log::debug!(
                "Switch to {} for {} refused: {} switches in the last {:?}",
                candidate.id(),
                candidate.device_id(),
                state.switches.len(),
                self.config.rate_window
            );
            return false;
        }

        let improvement = (i64::from(current.priority()) - i64::from(candidate.priority())) as f64;
        if improvement < assessment.threshold {
            return false;
        }

        log::info!(
            "Switching primary for {} from {} to {} (improvement {}, threshold {:.1}, phase {})",
            candidate.device_id(),
            current.id(),
            candidate.id(),
            improvement,
            assessment.threshold,
            assessment.phase
        );
        state.primary = Some(candidate.clone());
        state.primary_since = Some(now);
        state.last_switch = Some(now);
        state.switches.push_back(now);
        if state.proposed.as_ref().map(|p| p.id()) == Some(candidate.id()) {
            state.proposed = None;
        }
        true
    }

    /// Effective priority improvement a candidate currently needs for `device_id`
    pub async fn get_adjusted_priority_threshold(&self, device_id: &str) -> f64 {
        let Some(device_state) = self.existing_state(device_id).await else {
            return self.config.base_priority_threshold as f64;
        };
        let mut state = device_state.write().await;
        let now = Instant::now();
        state.prune(now, self.config.rate_window);
        self.assess(&state, now).threshold
    }

    pub async fn phase(&self, device_id: &str) -> HysteresisPhase {
        let Some(device_state) = self.existing_state(device_id).await else {
            return HysteresisPhase::NoPrimary;
        };
        let mut state = device_state.write().await;
        let now = Instant::now();
        state.prune(now, self.config.rate_window);
        self.assess(&state, now).phase
    }

    /// Switches counted in the current sliding window
    pub async fn switch_count(&self, device_id: &str) -> usize {
        let Some(device_state) = self.existing_state(device_id).await else {
            return 0;
        };
        let mut state = device_state.write().await;
        state.prune(Instant::now(), self.config.rate_window);
        state.switches.len()
    }

    pub async fn current_primary(&self, device_id: &str) -> Option<ConnectionRef> {
        let device_state = self.existing_state(device_id).await?;
        let state = device_state.read().await;
        state.primary.clone()
    }

    /// Stage a candidate for later batch evaluation without switching
    pub async fn propose_connection(&self, candidate: ConnectionRef) {
        let device_state = self.device_state(candidate.device_id()).await;
        device_state.write().await.proposed = Some(candidate);
    }

    pub async fn get_proposed_connection(&self, device_id: &str) -> Option<ConnectionRef> {
        let device_state = self.existing_state(device_id).await?;
        let state = device_state.read().await;
        state.proposed.clone()
    }

    pub async fn clear_proposed_connection(&self, device_id: &str) {
        if let Some(device_state) = self.existing_state(device_id).await {
            device_state.write().await.proposed = None;
        }
    }

    pub async fn forget_device(&self, device_id: &str) {
        self.devices.write().await.remove(device_id);
    }

    fn assess(&self, state: &HysteresisState, now: Instant) -> Assessment {
        let base = self.config.base_priority_threshold as f64;
        if state.primary.is_none() {
            return Assessment {
                phase: HysteresisPhase::NoPrimary,
                threshold: base,
                blocked: false,
            };
        }

        let max = self.config.max_switches_per_minute as usize;
        let recent = state.switches.len();
        let blocked = recent >= max;
        let cooling = state.in_cooldown(now, self.config.cooldown);

        let (phase, threshold) = if blocked {
            (HysteresisPhase::RateLimited, base * self.config.rate_limit_multiplier)
        } else if cooling {
            (HysteresisPhase::Cooldown, base * self.config.cooldown_multiplier)
        } else {
            let stable_for = state
                .primary_since
                .map(|since| now.saturating_duration_since(since))
                .unwrap_or_default();
            if stable_for >= self.config.stable_duration {
                (HysteresisPhase::Stable, base * self.config.stable_relaxation)
            } else {
                (HysteresisPhase::Stable, base)
            }
        };

        Assessment { phase, threshold, blocked }
    }

    async fn device_state(&self, device_id: &str) -> Arc<RwLock<HysteresisState>> {
        if let Some(state) = self.existing_state(device_id).await {
            return state;
        }
        let mut devices = self.devices.write().await;
        devices.entry(device_id.to_string()).or_default().clone()
    }

    async fn existing_state(&self, device_id: &str) -> Option<Arc<RwLock<HysteresisState>>> {
        self.devices.read().await.get(device_id).cloned()
    }
}

impl Default for HysteresisController {
    fn default() -> Self {
        Self::new()
    }
}
