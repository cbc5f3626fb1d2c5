use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::sleep;

use crate::ErrorCategory;
use crate::health::{ConnectionHealthTracker, classifier};

/// Largest bump applied to a retry budget for a flapping address
const MAX_ESCALATION_STEPS: u32 = 5;
/// Symmetric jitter applied to computed delays
const JITTER_FRACTION: f64 = 0.25;

/// Retry budget for one (device, address) pair. All fields are strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl RetryConfig {
    /// Delay before retry `attempt` (1-based): base * factor^(attempt-1), capped
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        cap_secs(secs, self.max_delay)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt >= 1 && attempt <= self.max_retries
    }

    pub fn is_valid(&self) -> bool {
        self.max_retries > 0
            && !self.base_delay.is_zero()
            && !self.max_delay.is_zero()
            && self.backoff_factor.is_finite()
            && self.backoff_factor > 0.0
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        adaptive_retry_config(ErrorCategory::Unknown)
    }
}

/// Tuned retry defaults for an error category.
///
/// Resets retry quickly and give up early; path-level failures back off harder
/// because the network itself has to recover first.
pub fn adaptive_retry_config(category: ErrorCategory) -> RetryConfig {
    match category {
        ErrorCategory::ConnectionReset => RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_factor: 1.5,
        },
        ErrorCategory::Timeout => RetryConfig {
            max_retries: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
        },
        ErrorCategory::ConnectionRefused => RetryConfig {
            max_retries: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        },
        ErrorCategory::NetworkUnreachable
        | ErrorCategory::NetworkDown
        | ErrorCategory::HostUnreachable => RetryConfig {
            max_retries: 6,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(120),
            backoff_factor: 2.0,
        },
        ErrorCategory::Unknown => RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        },
    }
}

/// min(base * 2^(attempt-1), cap)
pub fn exponential_backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(64) as i32;
    cap_secs(base.as_secs_f64() * 2f64.powi(exponent), cap)
}

/// Perturb a delay by up to ±25% so many peers do not retry in lockstep
pub fn apply_jitter(delay: Duration) -> Duration {
    let factor = 1.0 + rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
    Duration::from_secs_f64((delay.as_secs_f64() * factor).max(0.0))
}

fn cap_secs(secs: f64, cap: Duration) -> Duration {
    if !secs.is_finite() || secs >= cap.as_secs_f64() {
        cap
    } else {
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Produces retry budgets from error history kept by a [`ConnectionHealthTracker`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    tracker: Arc<ConnectionHealthTracker>,
}

impl RetryPolicy {
    pub fn new(tracker: Arc<ConnectionHealthTracker>) -> Self {
        Self { tracker }
    }

    pub fn tracker(&self) -> &Arc<ConnectionHealthTracker> {
        &self.tracker
    }

    /// Category defaults, made more conservative the longer an address keeps failing
    pub async fn get_retry_config_for_connection(&self, device_id: &str, address: &str) -> RetryConfig {
        let Some(health) = self.tracker.connection_health(device_id, address).await else {
            return adaptive_retry_config(ErrorCategory::Unknown);
        };

        let category = health.last_error.unwrap_or(ErrorCategory::Unknown);
        let mut config = adaptive_retry_config(category);

        if health.consecutive_errors >= 2 {
            let steps = (health.consecutive_errors - 1).min(MAX_ESCALATION_STEPS);
            config.max_retries += steps;
            config.base_delay = exponential_backoff(steps + 1, config.base_delay, config.max_delay);
        }

        config
    }

    /// Jittered delay before retry `attempt`, or None once the budget is spent
    pub async fn next_delay(&self, device_id: &str, address: &str, attempt: u32) -> Option<Duration> {
        let config = self.get_retry_config_for_connection(device_id, address).await;
        if !config.should_retry(attempt) {
            return None;
        }
        Some(apply_jitter(config.delay_for_attempt(attempt)))
    }

    /// Run `operation` until it succeeds or the adaptive retry budget runs out.
    ///
    /// Every outcome is recorded against (device, address), so the budget tightens
    /// while the loop is still running.
    pub async fn retry<F, Fut, T, E>(&self, device_id: &str, address: &str, operation: F) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StdError + 'static,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    self.tracker.record_connection_success(device_id, address).await;
                    if attempt > 0 {
                        log::info!("Connected to {} at {} after {} retries", device_id, address, attempt);
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let category = self
                        .tracker
                        .record_connection_error(device_id, address, &err)
                        .await;
                    attempt += 1;

                    match self.next_delay(device_id, address, attempt).await {
                        Some(delay) => {
                            log::debug!(
                                "Retry {} for {} at {} in {:?} after {} error: {}",
                                attempt, device_id, address, delay, category, err
                            );
                            sleep(delay).await;
                        }
                        None => {
                            log::warn!(
                                "Giving up on {} at {} after {} attempts: {}",
                                device_id, address, attempt, err
                            );
                            return Err(err);
                        }
                    }
                }
            }
        }
    }
}

/// Bounds and tuning for the adaptive TLS handshake timeout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub base_tls_handshake_timeout: Duration,
    pub min_tls_handshake_timeout: Duration,
    pub max_tls_handshake_timeout: Duration,
    /// Added per tracked version-compatibility issue
    pub version_issue_penalty: Duration,
    /// Weight of the newest outcome in the rolling success rate
    pub success_rate_smoothing: f64,
    /// Floor applied to the success rate before it divides the timeout
    pub min_success_rate: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            base_tls_handshake_timeout: Duration::from_secs(10),
            min_tls_handshake_timeout: Duration::from_secs(5),
            max_tls_handshake_timeout: Duration::from_secs(30),
            version_issue_penalty: Duration::from_secs(2),
            success_rate_smoothing: 0.1,
            min_success_rate: 0.2,
        }
    }
}

#[derive(Debug, Clone)]
struct TimeoutState {
    success_rate: f64,
    version_issues: u32,
    current: Duration,
}

/// Adapts the TLS handshake timeout to recent handshake outcomes.
#[derive(Debug)]
pub struct AdaptiveTimeouts {
    state: Arc<RwLock<TimeoutState>>,
    config: TimeoutConfig,
}

impl AdaptiveTimeouts {
    pub fn new() -> Self {
        Self::with_config(TimeoutConfig::default())
    }

    pub fn with_config(config: TimeoutConfig) -> Self {
        let current = timeout_for(&config, 0, 1.0);
        Self {
            state: Arc::new(RwLock::new(TimeoutState {
                success_rate: 1.0,
                version_issues: 0,
                current,
            })),
            config,
        }
    }

    /// Recompute the handshake timeout from the tracked rate and issue count
    pub async fn calculate_adaptive_tls_handshake_timeout(&self) -> Duration {
        let mut state = self.state.write().await;
        state.current = timeout_for(&self.config, state.version_issues, state.success_rate);
        state.current
    }

    pub async fn update_connection_success_rate(&self, success: bool, is_version_issue: bool) {
        let mut state = self.state.write().await;
        let outcome = if success { 1.0 } else { 0.0 };
        let alpha = self.config.success_rate_smoothing.clamp(f64::EPSILON, 1.0);
        state.success_rate = (state.success_rate + alpha * (outcome - state.success_rate)).clamp(0.0, 1.0);

        if is_version_issue {
            state.version_issues = state.version_issues.saturating_add(1);
            log::debug!("Version compatibility issue #{} detected", state.version_issues);
        } else if success {
            state.version_issues = state.version_issues.saturating_sub(1);
        }

        state.current = timeout_for(&self.config, state.version_issues, state.success_rate);
    }

    /// Record a handshake outcome, classifying failures as version issues where they look like one
    pub async fn record_handshake_result(&self, result: Result<(), &(dyn StdError + 'static)>) {
        match result {
            Ok(()) => self.update_connection_success_rate(true, false).await,
            Err(err) => {
                let version_issue = classifier::is_version_issue(err);
                self.update_connection_success_rate(false, version_issue).await;
            }
        }
    }

    pub async fn current_timeout(&self) -> Duration {
        self.state.read().await.current
    }

    pub async fn success_rate(&self) -> f64 {
        self.state.read().await.success_rate
    }

    pub async fn version_issue_count(&self) -> u32 {
        self.state.read().await.version_issues
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }
}

impl Default for AdaptiveTimeouts {
    fn default() -> Self {
        Self::new()
    }
}

/// (base + penalty * issues) / success_rate, clamped to [min, max]
pub fn timeout_for(config: &TimeoutConfig, version_issues: u32, success_rate: f64) -> Duration {
    let min = config.min_tls_handshake_timeout;
    let max = config.max_tls_handshake_timeout.max(min);

    let rate = if success_rate.is_finite() { success_rate } else { 0.0 };
    let rate = rate.clamp(config.min_success_rate.clamp(0.01, 1.0), 1.0);

    let secs = (config.base_tls_handshake_timeout.as_secs_f64()
        + config.version_issue_penalty.as_secs_f64() * version_issues as f64)
        / rate;

    cap_secs(secs, max).max(min)
}
