use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::{ConnectionRef, DeviceId, Result};

/// Bounds applied to every per-device pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Connections kept while nobody has them checked out
    pub max_idle: usize,
    /// Hard cap on pooled connections per device
    pub max_total: usize,
    /// Idle entries older than this are expired by cleanup
    pub ttl: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 4,
            max_total: 8,
            ttl: Duration::from_secs(300),
        }
    }
}

/// How `get_connection` picks among pooled connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    RoundRobin,
    HealthBased,
    Random,
    LeastUsed,
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total: usize,
    pub in_use: usize,
    pub idle: usize,
    pub checkouts: u64,
}

#[derive(Debug)]
struct PooledConnection {
    connection: ConnectionRef,
    usage_count: u64,
    outstanding: u32,
    created_at: Instant,
    last_used: Instant,
}

impl PooledConnection {
    fn new(connection: ConnectionRef) -> Self {
        let now = Instant::now();
        Self {
            connection,
            usage_count: 0,
            outstanding: 0,
            created_at: now,
            last_used: now,
        }
    }

    fn is_idle(&self) -> bool {
        self.outstanding == 0
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.is_idle() && self.last_used.elapsed() >= ttl
    }
}

#[derive(Debug, Default)]
struct PoolState {
    entries: Vec<PooledConnection>,
    cursor: usize,
    checkouts: u64,
    closed: bool,
}

/// Bounded set of reusable connections to one device.
///
/// Checking a connection out does not remove it: the same handle may be shared
/// by several callers, and the usage counters only steer selection.
#[derive(Debug)]
pub struct ConnectionPool {
    device_id: DeviceId,
    config: PoolConfig,
    state: RwLock<PoolState>,
}

impl ConnectionPool {
    pub fn new(device_id: impl Into<DeviceId>, config: PoolConfig) -> Self {
        Self {
            device_id: device_id.into(),
            config,
            state: RwLock::new(PoolState::default()),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Add a connection. Returns false when the pool is full, closed, or
    /// already holds a connection with the same id.
    pub async fn add_connection(&self, connection: ConnectionRef) -> bool {
        let mut state = self.state.write().await;
        if state.closed {
            return false;
        }
        if state.entries.len() >= self.config.max_total {
            log::debug!(
                "Pool for {} at capacity ({}), rejecting {}",
                self.device_id,
                self.config.max_total,
                connection.id()
            );
            return false;
        }
        if state.entries.iter().any(|e| e.connection.id() == connection.id()) {
            return false;
        }

        state.entries.push(PooledConnection::new(connection));
        true
    }

    /// Check out a connection using the given strategy
    pub async fn get_connection(&self, strategy: SelectionStrategy) -> Option<ConnectionRef> {
        let mut state = self.state.write().await;
        if state.closed || state.entries.is_empty() {
            return None;
        }

        let len = state.entries.len();
        let index = match strategy {
            SelectionStrategy::RoundRobin => {
                let index = state.cursor % len;
                state.cursor = (index + 1) % len;
                index
            }
            SelectionStrategy::HealthBased => {
                let mut best = 0;
                for (i, entry) in state.entries.iter().enumerate().skip(1) {
                    if entry.connection.health_score() > state.entries[best].connection.health_score() {
                        best = i;
                    }
                }
                best
            }
            SelectionStrategy::Random => rand::thread_rng().gen_range(0..len),
            SelectionStrategy::LeastUsed => state
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(i, entry)| (entry.usage_count, *i))
                .map(|(i, _)| i)
                .unwrap_or(0),
        };

        state.checkouts += 1;
        let entry = &mut state.entries[index];
        entry.usage_count += 1;
        entry.outstanding += 1;
        entry.last_used = Instant::now();
        Some(entry.connection.clone())
    }

    /// Hand a checked-out connection back. The connection stays open and pooled.
    pub async fn return_connection(&self, connection_id: &str) -> bool {
        let mut state = self.state.write().await;
        match state.entries.iter_mut().find(|e| e.connection.id() == connection_id) {
            Some(entry) => {
                entry.outstanding = entry.outstanding.saturating_sub(1);
                entry.last_used = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Drop a connection from the pool without closing it
    pub async fn remove_connection(&self, connection_id: &str) -> Option<ConnectionRef> {
        let mut state = self.state.write().await;
        let index = state
            .entries
            .iter()
            .position(|e| e.connection.id() == connection_id)?;
        let removed = state.entries.remove(index);
        if state.cursor > index {
            state.cursor -= 1;
        }
        Some(removed.connection)
    }

    /// Expire idle entries past their TTL, then trim idle entries down to
    /// `max_idle`, least recently used first. Removed handles are returned
    /// unclosed; their owners decide what to do with them.
    pub async fn cleanup_expired(&self) -> Vec<ConnectionRef> {
        let mut state = self.state.write().await;
        let mut removed = Vec::new();
        let ttl = self.config.ttl;

        let mut i = 0;
        while i < state.entries.len() {
            if state.entries[i].is_expired(ttl) {
                let entry = state.entries.remove(i);
                log::debug!(
                    "Expired pooled connection {} of {} (age {:?})",
                    entry.connection.id(),
                    self.device_id,
                    entry.created_at.elapsed()
                );
                removed.push(entry.connection);
            } else {
                i += 1;
            }
        }

        loop {
            let idle = state.entries.iter().filter(|e| e.is_idle()).count();
            if idle <= self.config.max_idle {
                break;
            }
            let oldest = state
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.is_idle())
                .min_by_key(|(_, e)| e.last_used)
                .map(|(i, _)| i);
            match oldest {
                Some(index) => removed.push(state.entries.remove(index).connection),
                None => break,
            }
        }

        let len = state.entries.len();
        state.cursor = if len == 0 { 0 } else { state.cursor % len };
        removed
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.read().await;
        let in_use = state.entries.iter().filter(|e| !e.is_idle()).count();
        PoolStats {
            total: state.entries.len(),
            in_use,
            idle: state.entries.len() - in_use,
            checkouts: state.checkouts,
        }
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.read().await.closed
    }

    /// Close every pooled connection and refuse further use.
    ///
    /// All connections are closed even if some fail; the first failure is returned.
    pub async fn close(&self) -> Result<()> {
        let entries = {
            let mut state = self.state.write().await;
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.cursor = 0;
            std::mem::take(&mut state.entries)
        };

        let mut first_error = None;
        for entry in entries {
            if let Err(e) = entry.connection.close().await {
                log::warn!("Failed to close pooled connection {}: {}", entry.connection.id(), e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        log::debug!("Closed connection pool for {}", self.device_id);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Lazily created per-device pools.
#[derive(Debug)]
pub struct ConnectionPoolManager {
    pools: Arc<RwLock<HashMap<DeviceId, Arc<ConnectionPool>>>>,
    config: PoolConfig,
}

impl ConnectionPoolManager {
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    pub fn with_config(config: PoolConfig) -> Self {
        Self {
            pools: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Pool for a device, created on first use
    pub async fn get_pool(&self, device_id: &str) -> Arc<ConnectionPool> {
        if let Some(pool) = self.existing_pool(device_id).await {
            return pool;
        }
        let mut pools = self.pools.write().await;
        pools
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(ConnectionPool::new(device_id, self.config.clone())))
            .clone()
    }

    pub async fn existing_pool(&self, device_id: &str) -> Option<Arc<ConnectionPool>> {
        self.pools.read().await.get(device_id).cloned()
    }

    pub async fn add_connection(&self, connection: ConnectionRef) -> bool {
        let pool = self.get_pool(connection.device_id()).await;
        pool.add_connection(connection).await
    }

    /// Check out a connection to `device_id`; None when no pool exists yet
    pub async fn get_connection(&self, device_id: &str, strategy: SelectionStrategy) -> Option<ConnectionRef> {
        let pool = self.existing_pool(device_id).await?;
        pool.get_connection(strategy).await
    }

    pub async fn return_connection(&self, connection: &ConnectionRef) -> bool {
        match self.existing_pool(connection.device_id()).await {
            Some(pool) => pool.return_connection(connection.id()).await,
            None => false,
        }
    }

    /// Run TTL expiry on every pool, returning how many entries were removed
    pub async fn cleanup_all(&self) -> usize {
        let pools: Vec<Arc<ConnectionPool>> = self.pools.read().await.values().cloned().collect();
        let mut removed = 0;
        for pool in pools {
            removed += pool.cleanup_expired().await.len();
        }
        if removed > 0 {
            log::debug!("Pool cleanup removed {} connections", removed);
        }
        removed
    }

    /// Close one device's pool and forget it
    pub async fn remove_pool(&self, device_id: &str) -> Result<()> {
        let pool = self.pools.write().await.remove(device_id);
        match pool {
            Some(pool) => pool.close().await,
            None => Ok(()),
        }
    }

    /// Close every pool. Pools handed out earlier stay closed.
    pub async fn close_all_pools(&self) -> Result<()> {
        let pools: Vec<Arc<ConnectionPool>> = {
            let mut pools = self.pools.write().await;
            pools.drain().map(|(_, pool)| pool).collect()
        };

        let mut first_error = None;
        for pool in pools {
            if let Err(e) = pool.close().await {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        log::info!("Closed all connection pools");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn devices(&self) -> Vec<DeviceId> {
        self.pools.read().await.keys().cloned().collect()
    }
}

impl Default for ConnectionPoolManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use crate::connection::test_support::MockConnection;

    const DEVICE: &str = "device-a";

    fn small_config() -> PoolConfig {
        PoolConfig {
            max_idle: 2,
            max_total: 3,
            ttl: Duration::from_secs(60),
        }
    }

    async fn pool_with(healths: &[f64]) -> ConnectionPool {
        let pool = ConnectionPool::new(DEVICE, PoolConfig::default());
        for (i, health) in healths.iter().enumerate() {
            assert!(pool.add_connection(MockConnection::new(&format!("c{}", i), DEVICE, 10, *health)).await);
        }
        pool
    }

    #[tokio::test]
    async fn test_capacity() {
        let pool = ConnectionPool::new(DEVICE, small_config());
        for i in 0..3 {
            assert!(pool.add_connection(MockConnection::new(&format!("c{}", i), DEVICE, 10, 50.0)).await);
        }
        assert!(!pool.add_connection(MockConnection::new("c3", DEVICE, 10, 50.0)).await);
        assert_eq!(pool.len().await, 3);
    }

    #[tokio::test]
    async fn test_round_robin_single() {
        let pool = pool_with(&[70.0]).await;
        for _ in 0..10 {
            assert_eq!(pool.get_connection(SelectionStrategy::RoundRobin).await.unwrap().id(), "c0");
        }
    }

    #[tokio::test]
    async fn test_round_robin_cycles() {
        let pool = pool_with(&[70.0, 70.0, 70.0]).await;
        let mut ids = Vec::new();
        for _ in 0..6 {
            ids.push(pool.get_connection(SelectionStrategy::RoundRobin).await.unwrap().id().to_string());
        }
        assert_eq!(ids, vec!["c0", "c1", "c2", "c0", "c1", "c2"]);
    }

    #[tokio::test]
    async fn test_health_based() {
        let pool = pool_with(&[40.0, 95.0, 60.0]).await;
        assert_eq!(pool.get_connection(SelectionStrategy::HealthBased).await.unwrap().id(), "c1");
        assert_eq!(pool.get_connection(SelectionStrategy::HealthBased).await.unwrap().id(), "c1");
    }

    #[tokio::test]
    async fn test_random_covers_all() {
        let pool = pool_with(&[50.0, 50.0, 50.0]).await;
        let mut seen = HashSet::new();
        for _ in 0..300 {
            seen.insert(pool.get_connection(SelectionStrategy::Random).await.unwrap().id().to_string());
        }
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn test_least_used() {
        let pool = pool_with(&[50.0, 50.0, 50.0]).await;
        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(pool.get_connection(SelectionStrategy::LeastUsed).await.unwrap().id().to_string());
        }
        // ties go to insertion order
        assert_eq!(ids, vec!["c0", "c1", "c2", "c0"]);
    }

    #[tokio::test]
    async fn test_return_updates_stats() {
        let pool = pool_with(&[50.0, 50.0]).await;
        let conn = pool.get_connection(SelectionStrategy::RoundRobin).await.unwrap();
        let stats = pool.stats().await;
        assert_eq!(stats, PoolStats { total: 2, in_use: 1, idle: 1, checkouts: 1 });

        assert!(pool.return_connection(conn.id()).await);
        assert!(!pool.return_connection("unknown").await);
        assert_eq!(pool.stats().await.in_use, 0);
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_expired() {
        let pool = ConnectionPool::new(DEVICE, small_config());
        pool.add_connection(MockConnection::new("c0", DEVICE, 10, 50.0)).await;
        pool.add_connection(MockConnection::new("c1", DEVICE, 10, 50.0)).await;

        tokio::time::advance(Duration::from_secs(30)).await;
        let busy = pool.get_connection(SelectionStrategy::RoundRobin).await.unwrap();
        assert_eq!(busy.id(), "c0");

        tokio::time::advance(Duration::from_secs(31)).await;
        let removed = pool.cleanup_expired().await;
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id(), "c1");
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_trims_idle() {
        let pool = ConnectionPool::new(DEVICE, small_config());
        for i in 0..3 {
            pool.add_connection(MockConnection::new(&format!("c{}", i), DEVICE, 10, 50.0)).await;
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        let removed = pool.cleanup_expired().await;
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id(), "c0");
        assert_eq!(pool.stats().await.idle, 2);
    }

    #[tokio::test]
    async fn test_close() {
        let pool = ConnectionPool::new(DEVICE, PoolConfig::default());
        let conn = MockConnection::new("c0", DEVICE, 10, 50.0);
        pool.add_connection(conn.clone()).await;

        pool.close().await.unwrap();
        assert!(conn.is_closed());
        assert!(pool.is_closed().await);
        assert!(pool.get_connection(SelectionStrategy::RoundRobin).await.is_none());
        assert!(!pool.add_connection(MockConnection::new("c1", DEVICE, 10, 50.0)).await);
        // idempotent
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_manager_lazy_pools() {
        let manager = ConnectionPoolManager::new();
        assert!(manager.get_connection(DEVICE, SelectionStrategy::RoundRobin).await.is_none());

        assert!(manager.add_connection(MockConnection::new("a0", DEVICE, 10, 50.0)).await);
        assert!(manager.add_connection(MockConnection::new("b0", "device-b", 10, 50.0)).await);
        let mut devices = manager.devices().await;
        devices.sort();
        assert_eq!(devices, vec!["device-a", "device-b"]);

        let conn = manager.get_connection(DEVICE, SelectionStrategy::HealthBased).await.unwrap();
        assert_eq!(conn.id(), "a0");
        assert!(manager.return_connection(&conn).await);
    }

    #[tokio::test]
    async fn test_manager_close_all() {
        let manager = ConnectionPoolManager::new();
        let a = MockConnection::new("a0", DEVICE, 10, 50.0);
        let b = MockConnection::new("b0", "device-b", 10, 50.0);
        manager.add_connection(a.clone()).await;
        manager.add_connection(b.clone()).await;
        let held = manager.get_pool(DEVICE).await;

        manager.close_all_pools().await.unwrap();
        assert!(a.is_closed() && b.is_closed());
        assert!(manager.get_connection(DEVICE, SelectionStrategy::RoundRobin).await.is_none());
        assert!(held.get_connection(SelectionStrategy::RoundRobin).await.is_none());
        assert!(manager.devices().await.is_empty());
    }
}
