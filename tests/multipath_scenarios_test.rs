// Multipath connection core, end to end through the public API

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use pathmesh::hysteresis::HysteresisConfig;
use pathmesh::migration::BlockRequest;
use pathmesh::monitoring::{ConnectionStatus, MonitorConfig};
use pathmesh::pool::PoolConfig;
use pathmesh::retry::{TimeoutConfig, timeout_for};
use pathmesh::*;

#[derive(Debug)]
struct TestConnection {
    id: String,
    device_id: String,
    priority: i32,
    established_at: Instant,
    health: Mutex<f64>,
    closed: AtomicBool,
}

impl TestConnection {
    fn new(id: &str, device_id: &str, priority: i32, health: f64) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            device_id: device_id.to_string(),
            priority,
            established_at: Instant::now(),
            health: Mutex::new(health),
            closed: AtomicBool::new(false),
        })
    }

    fn set_health(&self, health: f64) {
        *self.health.lock().unwrap() = health;
    }
}

#[async_trait]
impl Connection for TestConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn established_at(&self) -> Instant {
        self.established_at
    }

    fn transport_type(&self) -> TransportType {
        TransportType::QuicWan
    }

    fn statistics(&self) -> ConnectionStatistics {
        ConnectionStatistics::new(self.established_at)
    }

    fn health_score(&self) -> f64 {
        *self.health.lock().unwrap()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn conn(id: &str, device: &str, priority: i32, health: f64) -> ConnectionRef {
    TestConnection::new(id, device, priority, health)
}

#[tokio::test]
async fn test_health_degrades_then_recovers() {
    let monitor = HealthMonitor::new("device-a@10.0.0.2:22000");
    let initial = monitor.get_health_score().await;

    for _ in 0..5 {
        monitor.record_latency(Duration::from_millis(20)).await;
        monitor.record_packet_loss(0.0).await;
    }
    let good_interval = monitor.get_interval().await;
    let good_score = monitor.get_health_score().await;

    for _ in 0..5 {
        monitor.record_latency(Duration::from_millis(600)).await;
        monitor.record_packet_loss(20.0).await;
    }
    let bad_interval = monitor.get_interval().await;
    let bad_score = monitor.get_health_score().await;

    assert!(bad_interval < good_interval);
    assert!(bad_score < initial);

    monitor.record_latency(Duration::from_millis(20)).await;
    monitor.record_packet_loss(0.0).await;
    assert!(monitor.get_health_score().await > bad_score);
    assert!(good_score > bad_score);
}

#[derive(Debug)]
struct DialError {
    source: io::Error,
}

impl std::fmt::Display for DialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dial tcp 10.0.0.2:22000")
    }
}

impl std::error::Error for DialError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

#[test]
fn test_eof_classification() {
    let eof = io::Error::from(io::ErrorKind::UnexpectedEof);
    assert_eq!(health::categorize(&eof), ErrorCategory::ConnectionReset);

    let wrapped = DialError { source: io::Error::from(io::ErrorKind::UnexpectedEof) };
    assert_eq!(health::categorize(&wrapped), ErrorCategory::ConnectionReset);

    let message_only = io::Error::new(io::ErrorKind::Other, "connection reset by peer");
    assert_eq!(health::categorize(&message_only), ErrorCategory::Unknown);
}

#[tokio::test]
async fn test_error_rate_and_retry_escalation() {
    let tracker = Arc::new(ConnectionHealthTracker::new());
    let refused = io::Error::from(io::ErrorKind::ConnectionRefused);

    for _ in 0..3 {
        tracker.record_connection_error("device-a", "tcp://10.0.0.2:22000", &refused).await;
    }
    assert!(!tracker.is_healthy("device-a", "tcp://10.0.0.2:22000").await);

    let policy = RetryPolicy::new(tracker.clone());
    let escalated = policy
        .get_retry_config_for_connection("device-a", "tcp://10.0.0.2:22000")
        .await;
    let baseline = retry::adaptive_retry_config(ErrorCategory::ConnectionRefused);
    assert!(escalated.max_retries > baseline.max_retries);
    assert!(escalated.base_delay > baseline.base_delay);

    for _ in 0..2 {
        tracker.record_connection_success("device-a", "tcp://10.0.0.2:22000").await;
    }
    assert!((tracker.get_error_rate("device-a", "tcp://10.0.0.2:22000").await - 0.6).abs() < 1e-12);

    let health = tracker
        .connection_health("device-a", "tcp://10.0.0.2:22000")
        .await
        .unwrap();
    assert_eq!(health.consecutive_errors, 0);
    assert!(health.is_healthy);
}

#[tokio::test(start_paused = true)]
async fn test_retry_gives_up_on_persistent_failure() {
    let tracker = Arc::new(ConnectionHealthTracker::new());
    let policy = RetryPolicy::new(tracker.clone());
    let calls = AtomicU32::new(0);

    let result: std::result::Result<(), io::Error> = policy
        .retry("device-b", "quic://10.0.0.3:22000", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(io::Error::from(io::ErrorKind::ConnectionReset)) }
        })
        .await;

    assert!(result.is_err());
    assert!(calls.load(Ordering::SeqCst) > 1);
    let health = tracker
        .connection_health("device-b", "quic://10.0.0.3:22000")
        .await
        .unwrap();
    assert_eq!(health.last_error, Some(ErrorCategory::ConnectionReset));
    assert_eq!(health.total_errors, calls.load(Ordering::SeqCst) as u64);
}

#[tokio::test(start_paused = true)]
async fn test_hysteresis_window_cap_under_adversarial_proposals() {
    let config = HysteresisConfig {
        max_switches_per_minute: 2,
        cooldown: Duration::from_secs(5),
        ..HysteresisConfig::default()
    };
    let max = config.max_switches_per_minute as usize;
    let controller = HysteresisController::with_config(config);

    let mut current = conn("p-0", "device-a", 0, 90.0);
    assert!(controller.should_switch_connection(None, &current).await);

    let mut switches: Vec<Instant> = Vec::new();
    for step in 1..=300 {
        let candidate = conn(&format!("p-{}", step), "device-a", -1_000 * step, 90.0);
        if controller.should_switch_connection(Some(&current), &candidate).await {
            switches.push(Instant::now());
            current = candidate;
        }
        tokio::time::advance(Duration::from_millis(700)).await;
    }

    assert!(switches.len() > max);
    for (i, start) in switches.iter().enumerate() {
        let within = switches[i..]
            .iter()
            .filter(|at| at.duration_since(*start) < Duration::from_secs(60))
            .count();
        assert!(within <= max);
    }
    assert_eq!(controller.current_primary("device-a").await.unwrap().id(), current.id());
}

#[tokio::test]
async fn test_pool_round_robin_single_and_capacity() {
    let manager = ConnectionPoolManager::with_config(PoolConfig {
        max_idle: 2,
        max_total: 2,
        ..PoolConfig::default()
    });

    let only = TestConnection::new("lan", "device-a", 10, 80.0);
    assert!(manager.add_connection(only.clone()).await);
    for _ in 0..10 {
        let checked_out = manager
            .get_connection("device-a", SelectionStrategy::RoundRobin)
            .await
            .unwrap();
        assert_eq!(checked_out.id(), "lan");
        assert!(manager.return_connection(&checked_out).await);
    }

    assert!(manager.add_connection(conn("wan", "device-a", 30, 95.0)).await);
    assert!(!manager.add_connection(conn("relay", "device-a", 50, 99.0)).await);
    let pool = manager.existing_pool("device-a").await.unwrap();
    assert_eq!(pool.len().await, 2);

    let best = manager
        .get_connection("device-a", SelectionStrategy::HealthBased)
        .await
        .unwrap();
    assert_eq!(best.id(), "wan");

    assert!(manager.get_connection("device-z", SelectionStrategy::RoundRobin).await.is_none());
    manager.close_all_pools().await.unwrap();
    assert!(pool.is_closed().await);
    assert!(only.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_scheduler_balances_equal_paths() {
    let scheduler = PacketScheduler::new();
    for id in ["a", "b", "c"] {
        assert!(scheduler.add_connection(conn(id, "device-a", 10, 70.0)).await);
    }

    let rounds = 3_000;
    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..rounds {
        let chosen = scheduler
            .select_connection_for_load_balancing("device-a")
            .await
            .unwrap();
        *counts.entry(chosen.id().to_string()).or_default() += 1;
    }

    let fair = rounds / 3;
    for id in ["a", "b", "c"] {
        let count = counts[id];
        assert!(count.abs_diff(fair) <= fair / 20, "{} selected {} times", id, count);
    }
}

#[tokio::test]
async fn test_scheduler_follows_health_changes() {
    let scheduler = PacketScheduler::new();
    let lan = TestConnection::new("lan", "device-a", 10, 60.0);
    let wan = TestConnection::new("wan", "device-a", 30, 80.0);
    scheduler.add_connection(lan.clone()).await;
    scheduler.add_connection(wan.clone()).await;

    assert_eq!(scheduler.select_connection("device-a").await.unwrap().id(), "wan");
    lan.set_health(95.0);
    assert_eq!(scheduler.select_connection("device-a").await.unwrap().id(), "lan");

    scheduler
        .update_path_metrics("device-a", "lan", PathMetrics {
            latency: Some(Duration::from_millis(5)),
            bandwidth_mbps: Some(300.0),
            loss_percent: 0.0,
        })
        .await;
    scheduler
        .update_path_metrics("device-a", "wan", PathMetrics {
            latency: Some(Duration::from_millis(80)),
            bandwidth_mbps: Some(100.0),
            loss_percent: 1.0,
        })
        .await;
    assert_eq!(scheduler.get_aggregated_bandwidth("device-a").await, 400.0);

    let chunks = scheduler.distribute_data_chunks("device-a", 1 << 20, 64 << 10).await;
    assert_eq!(chunks.len(), 16);
    assert_eq!(chunks.iter().map(|c| c.size).sum::<u64>(), 1 << 20);
    let on_lan = chunks.iter().filter(|c| c.connection_id == "lan").count();
    assert_eq!(on_lan, 12);
}

#[tokio::test]
async fn test_migration_round_trip() {
    let manager = MigrationManager::new();
    let relay = conn("relay", "device-a", 50, 40.0);
    let lan = conn("lan", "device-a", 10, 90.0);
    let key = TransferKey::new("relay", "photos", "holiday.mp4");

    manager.register_transfer(key.clone(), 10 << 20, 128 << 10).await;
    manager.update_transfer_progress(&key, 3 << 20).await.unwrap();
    for index in [24, 25, 26] {
        manager
            .add_pending_request(&key, BlockRequest {
                index,
                offset: index * (128 << 10),
                size: 128 << 10,
                hash: vec![index as u8; 32],
            })
            .await
            .unwrap();
    }
    let before = manager.get_transfer_state(&key).await.unwrap();

    let candidates = vec![relay.clone(), lan.clone()];
    assert!(manager.should_migrate_transfer(&relay, &candidates, "photos", "holiday.mp4").await);
    let target = manager.get_best_connection_for_transfer(&relay, &candidates).unwrap();
    assert_eq!(target.id(), "lan");

    assert!(manager.migrate_transfer("relay", target.id(), "photos", "holiday.mp4").await);
    assert!(manager.get_transfer_state(&key).await.is_none());

    let moved = manager
        .get_transfer_state(&TransferKey::new("lan", "photos", "holiday.mp4"))
        .await
        .unwrap();
    assert_eq!(moved, before);

    let stale = manager.update_transfer_progress(&key, 4 << 20).await;
    assert!(matches!(stale, Err(Error::TransferNotFound { .. })));
}

#[tokio::test]
async fn test_tls_timeout_monotonic_in_version_issues() {
    let config = TimeoutConfig::default();
    let mut previous = Duration::ZERO;
    for issues in 0..40 {
        let timeout = timeout_for(&config, issues, 0.8);
        assert!(timeout >= previous);
        assert!(timeout >= config.min_tls_handshake_timeout);
        assert!(timeout <= config.max_tls_handshake_timeout);
        previous = timeout;
    }

    let timeouts = AdaptiveTimeouts::new();
    let start = timeouts.calculate_adaptive_tls_handshake_timeout().await;
    let eof = io::Error::from(io::ErrorKind::UnexpectedEof);
    for _ in 0..3 {
        timeouts.record_handshake_result(Err(&eof)).await;
    }
    assert_eq!(timeouts.version_issue_count().await, 3);
    let grown = timeouts.calculate_adaptive_tls_handshake_timeout().await;
    assert!(grown > start);
    assert!(grown <= timeouts.config().max_tls_handshake_timeout);
}

#[derive(Debug, Default)]
struct TestService {
    connected: Mutex<Vec<DeviceId>>,
    configured: Vec<DeviceId>,
    statuses: Mutex<HashMap<String, ConnectionStatus>>,
    dials: AtomicU32,
}

#[async_trait]
impl ConnectionService for TestService {
    async fn connected_devices(&self) -> Result<Vec<DeviceId>> {
        Ok(self.connected.lock().unwrap().clone())
    }

    async fn configured_devices(&self) -> Result<Vec<DeviceId>> {
        Ok(self.configured.clone())
    }

    async fn device_connections(&self, _device_id: &str) -> Result<Vec<ConnectionId>> {
        Err(Error::service("connection listing unavailable"))
    }

    async fn connection_statistics(&self, connection_id: &str) -> Result<ConnectionStatistics> {
        Err(Error::service(format!("no statistics for {}", connection_id)))
    }

    async fn connection_status(&self) -> Result<HashMap<String, ConnectionStatus>> {
        Ok(self.statuses.lock().unwrap().clone())
    }

    async fn dial_now(&self) -> Result<()> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_monitor_loop_redials_and_reports() {
    let service = Arc::new(TestService {
        configured: vec!["device-a".to_string(), "device-b".to_string()],
        ..TestService::default()
    });
    service.connected.lock().unwrap().push("device-a".to_string());
    {
        let mut statuses = service.statuses.lock().unwrap();
        statuses.insert("tcp://10.0.0.2:22000".to_string(), ConnectionStatus::default());
        statuses.insert(
            "tcp://10.0.0.3:22000".to_string(),
            ConnectionStatus { when: None, error: Some("i/o timeout".to_string()) },
        );
    }

    let sink = Arc::new(MemoryEventSink::default());
    let config = MonitorConfig {
        interval: Duration::from_secs(10),
        ..MonitorConfig::default()
    };
    let monitor = ContinuousMonitor::new(service.clone(), sink.clone(), config).unwrap();
    assert!(monitor.start().await);

    tokio::time::sleep(Duration::from_secs(25)).await;
    monitor.stop().await;
    assert!(!monitor.is_running().await);

    // Two cycles at 10s and 20s; device listing failures are skipped
    assert_eq!(service.dials.load(Ordering::SeqCst), 2);
    assert_eq!(sink.count(EventCategory::StateChanged).await, 2);
    assert_eq!(sink.count(EventCategory::DeviceConnected).await, 1);
    assert_eq!(sink.count(EventCategory::Failure).await, 2);

    let report = monitor.last_report().await.unwrap();
    assert_eq!(report.connected_devices, 1);
    assert_eq!(report.expected_devices, 2);
    assert!(report.redial_requested);
    assert!((report.health_score - 50.0).abs() < 1e-9);
    assert!(report.low_throughput.is_empty());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(service.dials.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_components_from_one_config() {
    let config: MultipathConfig = serde_json::from_str(
        r#"{
            "connection_priority_threshold": 20,
            "adaptive_keep_alive_min_secs": 15,
            "adaptive_keep_alive_max_secs": 45,
            "pool": { "max_idle": 1, "max_total": 1, "ttl": { "secs": 60, "nanos": 0 } }
        }"#,
    )
    .unwrap();
    config.validate().unwrap();

    let monitor = HealthMonitor::with_config("endpoint", config.health_config());
    assert_eq!(monitor.get_interval().await, Duration::from_secs(45));

    let controller = HysteresisController::with_config(config.hysteresis_config());
    let first = conn("c1", "device-a", 40, 80.0);
    controller.should_switch_connection(None, &first).await;
    assert!(!controller.should_switch_connection(Some(&first), &conn("c2", "device-a", 25, 80.0)).await);
    assert!(controller.should_switch_connection(Some(&first), &conn("c3", "device-a", 20, 80.0)).await);

    let pools = ConnectionPoolManager::with_config(config.pool.clone());
    assert!(pools.add_connection(conn("c1", "device-a", 40, 80.0)).await);
    assert!(!pools.add_connection(conn("c2", "device-a", 25, 80.0)).await);
}
