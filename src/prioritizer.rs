use std::cmp::Ordering;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::{Connection, ConnectionId, ConnectionRef};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrioritizerConfig {
    /// Milliseconds over which the latency score decays by a factor of e
    pub latency_decay_ms: f64,
    /// Bandwidth that earns a full bandwidth score (Mbps)
    pub excellent_bandwidth_mbps: f64,
    /// Priority value mapped to a priority score of 0
    pub max_priority: i32,
    /// Uptime after which a connection earns full stability credit
    pub stability_window: Duration,
    /// Composite points a newcomer must gain to replace an existing connection
    pub replace_margin: f64,
}

impl Default for PrioritizerConfig {
    fn default() -> Self {
        Self {
            latency_decay_ms: 100.0,
            excellent_bandwidth_mbps: 100.0,
            max_priority: 100,
            stability_window: Duration::from_secs(600),
            replace_margin: 10.0,
        }
    }
}

/// What is known about a connection's recent behaviour
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionObservation {
    pub latency: Option<Duration>,
    pub bandwidth_mbps: Option<f64>,
    /// Fraction of failed operations in [0, 1]
    pub error_rate: f64,
}

/// Sub-scores and composite for one connection, all in [0, 100]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEvaluation {
    pub connection_id: ConnectionId,
    pub latency_score: f64,
    pub bandwidth_score: f64,
    pub stability_score: f64,
    pub priority_score: f64,
    pub composite: f64,
}

/// Ranks connections to the same device
#[derive(Debug, Clone, Default)]
pub struct ConnectionPrioritizer {
    config: PrioritizerConfig,
}

impl ConnectionPrioritizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: PrioritizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PrioritizerConfig {
        &self.config
    }

    pub fn evaluate_connection(
        &self,
        connection: &dyn Connection,
        observation: &ConnectionObservation,
    ) -> ConnectionEvaluation {
        // Unknown measurements score neutral
        let latency_score = observation
            .latency
            .map(|l| 100.0 * (-(l.as_secs_f64() * 1000.0) / self.config.latency_decay_ms).exp())
            .unwrap_or(50.0);

        let bandwidth_score = observation
            .bandwidth_mbps
            .map(|bw| (bw / self.config.excellent_bandwidth_mbps).clamp(0.0, 1.0) * 100.0)
            .unwrap_or(50.0);

        let window = self.config.stability_window.as_secs_f64();
        let maturity = if window > 0.0 {
            (connection.established_at().elapsed().as_secs_f64() / window).min(1.0)
        } else {
            1.0
        };
        let reliability = 1.0 - observation.error_rate.clamp(0.0, 1.0);
        let stability_score = reliability * (50.0 + 50.0 * maturity);

        let max_priority = self.config.max_priority.max(1);
        let normalized = connection.priority().clamp(0, max_priority) as f64 / max_priority as f64;
        let priority_score = 100.0 * (1.0 - normalized);

        let composite = (latency_score + bandwidth_score + stability_score + priority_score) / 4.0;

        ConnectionEvaluation {
            connection_id: connection.id().to_string(),
            latency_score,
            bandwidth_score,
            stability_score,
            priority_score,
            composite: composite.clamp(0.0, 100.0),
        }
    }

    /// Orders better connections first
    pub fn compare_connections(&self, a: &ConnectionEvaluation, b: &ConnectionEvaluation) -> Ordering {
        b.composite.partial_cmp(&a.composite).unwrap_or(Ordering::Equal)
    }

    /// Up to `limit` connections, best first. Equal scores keep their input order.
    pub fn select_best_connections(
        &self,
        candidates: &[(ConnectionRef, ConnectionObservation)],
        limit: usize,
    ) -> Vec<ConnectionRef> {
        self.rank(candidates)
            .into_iter()
            .take(limit)
            .map(|(connection, _)| connection)
            .collect()
    }

    /// The connections to drop so that at most `desired` remain, worst first
    pub fn select_for_pruning(
        &self,
        candidates: &[(ConnectionRef, ConnectionObservation)],
        desired: usize,
    ) -> Vec<ConnectionRef> {
        let mut ranked = self.rank(candidates);
        if ranked.len() <= desired {
            return Vec::new();
        }
        let mut surplus: Vec<ConnectionRef> = ranked.drain(desired..).map(|(connection, _)| connection).collect();
        surplus.reverse();
        surplus
    }

    /// Whether `new` is worth replacing `existing`: a composite gain above the
    /// replace margin, or a priority gain of at least `upgrade_threshold`.
    pub fn should_replace_connection(
        &self,
        existing: (&dyn Connection, &ConnectionObservation),
        new: (&dyn Connection, &ConnectionObservation),
        upgrade_threshold: i32,
    ) -> bool {
        let current = self.evaluate_connection(existing.0, existing.1);
        let candidate = self.evaluate_connection(new.0, new.1);

        let score_gain = candidate.composite - current.composite;
        let priority_gain = i64::from(existing.0.priority()) - i64::from(new.0.priority());
        let replace = score_gain > self.config.replace_margin || priority_gain >= i64::from(upgrade_threshold);
        if replace {
            log::debug!(
                "{} should replace {} (score +{:.1}, priority +{})",
                candidate.connection_id, current.connection_id, score_gain, priority_gain
            );
        }
        replace
    }

    fn rank(&self, candidates: &[(ConnectionRef, ConnectionObservation)]) -> Vec<(ConnectionRef, ConnectionEvaluation)> {
        let mut ranked: Vec<(ConnectionRef, ConnectionEvaluation)> = candidates
            .iter()
            .map(|(connection, observation)| {
                (connection.clone(), self.evaluate_connection(&**connection, observation))
            })
            .collect();
        // sort_by is stable
        ranked.sort_by(|a, b| self.compare_connections(&a.1, &b.1));
        ranked
    }
}
