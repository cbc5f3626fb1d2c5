use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Latency at or below which the latency term saturates at 100
const LATENCY_FLOOR_MS: f64 = 20.0;
/// Decay constant of the latency curve beyond the floor
const LATENCY_DECAY_MS: f64 = 150.0;
/// Score points lost per percent of packet loss
const LOSS_PENALTY_PER_PERCENT: f64 = 5.0;
const LATENCY_WEIGHT: f64 = 0.6;
const LOSS_WEIGHT: f64 = 0.4;

/// Configuration for per-endpoint health monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// When false the keep-alive interval is pinned to `max_interval`
    pub adaptive_enabled: bool,
    /// Keep-alive interval used at health score 0
    pub min_interval: Duration,
    /// Keep-alive interval used at health score 100
    pub max_interval: Duration,
    /// Weight of the newest sample in the moving averages (0, 1]
    pub smoothing: f64,
    /// Number of raw samples retained for diagnostics
    pub history_size: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            adaptive_enabled: true,
            min_interval: Duration::from_secs(10),
            max_interval: Duration::from_secs(60),
            smoothing: 0.5,
            history_size: 20,
        }
    }
}

#[derive(Debug, Clone)]
struct HealthState {
    score: f64,
    interval: Duration,
    latency_ms: Option<f64>,
    loss_percent: f64,
    throughput_mbps: Option<f64>,
    latencies: VecDeque<Duration>,
    losses: VecDeque<f64>,
    samples: u64,
}

/// Converts latency and loss observations for one endpoint into a health score
/// and an adaptive keep-alive interval.
///
/// Every observation recomputes both immediately; readers always see the effect
/// of the latest sample.
#[derive(Debug)]
pub struct HealthMonitor {
    endpoint: String,
    state: Arc<RwLock<HealthState>>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_config(endpoint, HealthConfig::default())
    }

    pub fn with_config(endpoint: impl Into<String>, config: HealthConfig) -> Self {
        let state = HealthState {
            score: 100.0,
            interval: interval_for_score(&config, 100.0),
            latency_ms: None,
            loss_percent: 0.0,
            throughput_mbps: None,
            latencies: VecDeque::with_capacity(config.history_size),
            losses: VecDeque::with_capacity(config.history_size),
            samples: 0,
        };

        Self {
            endpoint: endpoint.into(),
            state: Arc::new(RwLock::new(state)),
            config,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Record a round-trip latency observation
    pub async fn record_latency(&self, latency: Duration) {
        let mut state = self.state.write().await;
        let ms = latency.as_secs_f64() * 1000.0;
        state.latency_ms = Some(match state.latency_ms {
            Some(avg) => smooth(avg, ms, self.config.smoothing),
            None => ms,
        });

        push_bounded(&mut state.latencies, latency, self.config.history_size);
        state.samples += 1;
        self.recompute(&mut state);
    }

    /// Record a packet loss observation in percent
    pub async fn record_packet_loss(&self, percent: f64) {
        let percent = if percent.is_finite() { percent.clamp(0.0, 100.0) } else { 100.0 };

        let mut state = self.state.write().await;
        state.loss_percent = if state.losses.is_empty() {
            percent
        } else {
            smooth(state.loss_percent, percent, self.config.smoothing)
        };

        push_bounded(&mut state.losses, percent, self.config.history_size);
        state.samples += 1;
        self.recompute(&mut state);
    }

    /// Record an observed throughput in megabits per second
    pub async fn record_throughput(&self, mbps: f64) {
        if !mbps.is_finite() || mbps < 0.0 {
            return;
        }
        let mut state = self.state.write().await;
        state.throughput_mbps = Some(match state.throughput_mbps {
            Some(avg) => smooth(avg, mbps, self.config.smoothing),
            None => mbps,
        });
    }

    pub async fn get_health_score(&self) -> f64 {
        self.state.read().await.score
    }

    pub async fn get_interval(&self) -> Duration {
        self.state.read().await.interval
    }

    pub fn is_adaptive_enabled(&self) -> bool {
        self.config.adaptive_enabled
    }

    /// Snapshot of quality figures: `health_score`, `latency_ms`,
    /// `packet_loss_percent`, `interval_secs` and, once known, `throughput_mbps`.
    pub async fn get_connection_quality_metrics(&self) -> HashMap<String, f64> {
        let state = self.state.read().await;
        let mut metrics = HashMap::new();
        metrics.insert("health_score".to_string(), state.score);
        metrics.insert("packet_loss_percent".to_string(), state.loss_percent);
        metrics.insert("interval_secs".to_string(), state.interval.as_secs_f64());
        metrics.insert("samples".to_string(), state.samples as f64);
        if let Some(latency) = state.latency_ms {
            metrics.insert("latency_ms".to_string(), latency);
        }
        if let Some(throughput) = state.throughput_mbps {
            metrics.insert("throughput_mbps".to_string(), throughput);
        }
        metrics
    }

    /// Most recent raw latency samples, oldest first
    pub async fn recent_latencies(&self) -> Vec<Duration> {
        self.state.read().await.latencies.iter().copied().collect()
    }

    /// Keep-alive interval this monitor would use at the given score
    pub fn interval_for_score(&self, score: f64) -> Duration {
        interval_for_score(&self.config, score)
    }

    fn recompute(&self, state: &mut HealthState) {
        let latency_term = state.latency_ms.map(latency_score).unwrap_or(100.0);
        let loss_term = loss_score(state.loss_percent);
        let score = (LATENCY_WEIGHT * latency_term + LOSS_WEIGHT * loss_term).clamp(0.0, 100.0);

        let previous = state.score;
        state.score = score;
        state.interval = interval_for_score(&self.config, score);

        if (previous - score).abs() >= 25.0 {
            log::debug!(
                "Health of {} moved {:.1} -> {:.1}, keep-alive {:?}",
                self.endpoint, previous, score, state.interval
            );
        }
    }
}

/// Latency term: saturates at 100 below the floor and decays toward 0 beyond it.
pub fn latency_score(latency_ms: f64) -> f64 {
    if !latency_ms.is_finite() {
        return 0.0;
    }
    let excess = (latency_ms - LATENCY_FLOOR_MS).max(0.0);
    (100.0 * (-excess / LATENCY_DECAY_MS).exp()).clamp(0.0, 100.0)
}

/// Loss term: linear penalty on the loss percentage.
pub fn loss_score(loss_percent: f64) -> f64 {
    (100.0 - loss_percent * LOSS_PENALTY_PER_PERCENT).clamp(0.0, 100.0)
}

fn interval_for_score(config: &HealthConfig, score: f64) -> Duration {
    let (min, max) = if config.min_interval <= config.max_interval {
        (config.min_interval, config.max_interval)
    } else {
        (config.max_interval, config.min_interval)
    };
    if !config.adaptive_enabled {
        return max;
    }

    let score = if score.is_finite() { score.clamp(0.0, 100.0) } else { 0.0 };
    let span = (max - min).as_secs_f64();
    let interval = min + Duration::from_secs_f64(span * score / 100.0);
    interval.clamp(min, max)
}

fn smooth(average: f64, sample: f64, alpha: f64) -> f64 {
    let alpha = alpha.clamp(f64::EPSILON, 1.0);
    average + alpha * (sample - average)
}

fn push_bounded<T>(history: &mut VecDeque<T>, value: T, capacity: usize) {
    if capacity == 0 {
        return;
    }
    if history.len() >= capacity {
        history.pop_front();
    }
    history.push_back(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_state() {
        let monitor = HealthMonitor::new("device-a@192.168.1.10:22000");
        assert_eq!(monitor.get_health_score().await, 100.0);
        assert_eq!(monitor.get_interval().await, Duration::from_secs(60));

        let metrics = monitor.get_connection_quality_metrics().await;
        assert!(!metrics.contains_key("latency_ms"));
        assert!(!metrics.contains_key("throughput_mbps"));
    }

    #[tokio::test]
    async fn test_good_then_bad_burst() {
        let monitor = HealthMonitor::new("endpoint");
        for _ in 0..5 {
            monitor.record_latency(Duration::from_millis(20)).await;
            monitor.record_packet_loss(0.0).await;
        }
        let good_score = monitor.get_health_score().await;
        let good_interval = monitor.get_interval().await;

        for _ in 0..5 {
            monitor.record_latency(Duration::from_millis(600)).await;
            monitor.record_packet_loss(20.0).await;
        }
        let bad_score = monitor.get_health_score().await;
        let bad_interval = monitor.get_interval().await;

        assert!(bad_interval < good_interval);
        assert!(bad_score < good_score);
        assert!(bad_score < 10.0, "score after bad burst was {}", bad_score);
    }

    #[tokio::test]
    async fn test_single_sample_moves_score() {
        let monitor = HealthMonitor::new("endpoint");
        monitor.record_latency(Duration::from_millis(10)).await;
        let before = monitor.get_health_score().await;
        let interval_before = monitor.get_interval().await;

        monitor.record_latency(Duration::from_millis(800)).await;
        assert!(monitor.get_health_score().await < before);
        assert!(monitor.get_interval().await < interval_before);
    }

    #[tokio::test]
    async fn test_recovery_after_bad_reading() {
        let monitor = HealthMonitor::new("endpoint");
        monitor.record_latency(Duration::from_secs(2)).await;
        monitor.record_packet_loss(50.0).await;
        let degraded = monitor.get_health_score().await;

        let mut previous = degraded;
        for _ in 0..10 {
            monitor.record_latency(Duration::from_millis(15)).await;
            monitor.record_packet_loss(0.0).await;
            let score = monitor.get_health_score().await;
            assert!(score >= previous);
            previous = score;
        }
        assert!(previous > 95.0, "score did not recover: {}", previous);
    }

    #[test]
    fn test_interval_monotonic_and_bounded() {
        let monitor = HealthMonitor::new("endpoint");
        let min = monitor.config().min_interval;
        let max = monitor.config().max_interval;

        let mut previous = Duration::ZERO;
        for step in 0..=200 {
            let score = step as f64 / 2.0;
            let interval = monitor.interval_for_score(score);
            assert!(interval >= previous);
            assert!(interval >= min && interval <= max);
            previous = interval;
        }
        assert_eq!(monitor.interval_for_score(0.0), min);
        assert_eq!(monitor.interval_for_score(100.0), max);
        assert_eq!(monitor.interval_for_score(-5.0), min);
        assert_eq!(monitor.interval_for_score(f64::NAN), min);
    }

    #[tokio::test]
    async fn test_adaptive_disabled_pins_interval() {
        let config = HealthConfig {
            adaptive_enabled: false,
            ..HealthConfig::default()
        };
        let monitor = HealthMonitor::with_config("endpoint", config);
        monitor.record_latency(Duration::from_secs(1)).await;
        assert_eq!(monitor.get_interval().await, Duration::from_secs(60));
        assert!(monitor.get_health_score().await < 100.0);
    }

    #[tokio::test]
    async fn test_quality_metrics_and_history() {
        let config = HealthConfig {
            history_size: 3,
            ..HealthConfig::default()
        };
        let monitor = HealthMonitor::with_config("endpoint", config);
        for ms in [10, 20, 30, 40] {
            monitor.record_latency(Duration::from_millis(ms)).await;
        }
        monitor.record_throughput(80.0).await;

        let history = monitor.recent_latencies().await;
        assert_eq!(
            history,
            vec![Duration::from_millis(20), Duration::from_millis(30), Duration::from_millis(40)]
        );

        let metrics = monitor.get_connection_quality_metrics().await;
        assert!(metrics["latency_ms"] > 10.0 && metrics["latency_ms"] < 40.0);
        assert_eq!(metrics["throughput_mbps"], 80.0);
        assert_eq!(metrics["samples"], 4.0);
    }

    #[test]
    fn test_score_terms() {
        assert_eq!(latency_score(5.0), 100.0);
        assert_eq!(latency_score(20.0), 100.0);
        assert!(latency_score(100.0) < latency_score(50.0));
        assert!(latency_score(900.0) < 1.0);
        assert_eq!(loss_score(0.0), 100.0);
        assert_eq!(loss_score(10.0), 50.0);
        assert_eq!(loss_score(40.0), 0.0);
    }
}
