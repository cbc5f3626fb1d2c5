// Connection Migration Module
//
// Tracks in-flight block transfers per connection and moves their bookkeeping
// to a better connection without restarting them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use crate::{ConnectionId, ConnectionRef, Error, Result};

/// Thresholds a replacement connection must clear
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Health points a candidate must gain over the current connection
    pub health_margin: f64,
    /// Priority improvement that justifies a move on its own
    pub priority_threshold: i32,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            health_margin: 20.0,
            priority_threshold: 10,
        }
    }
}

/// Identifies one file transfer on one connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferKey {
    pub connection_id: ConnectionId,
    pub folder: String,
    pub file: String,
}

impl TransferKey {
    pub fn new(connection_id: impl Into<ConnectionId>, folder: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            folder: folder.into(),
            file: file.into(),
        }
    }

    fn on(&self, connection_id: &str) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            folder: self.folder.clone(),
            file: self.file.clone(),
        }
    }
}

/// An outstanding block request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRequest {
    pub index: u64,
    pub offset: u64,
    pub size: u64,
    pub hash: Vec<u8>,
}

/// Progress of one transfer
#[derive(Debug, Clone, PartialEq)]
pub struct TransferState {
    pub id: Uuid,
    pub total_size: u64,
    pub block_size: u64,
    pub bytes_transferred: u64,
    /// Outstanding requests ordered by block index
    pub pending: BTreeMap<u64, BlockRequest>,
    pub started_at: Instant,
    pub updated_at: Instant,
}

impl TransferState {
    fn new(total_size: u64, block_size: u64) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            total_size,
            block_size,
            bytes_transferred: 0,
            pending: BTreeMap::new(),
            started_at: now,
            updated_at: now,
        }
    }

    pub fn remaining_bytes(&self) -> u64 {
        self.total_size - self.bytes_transferred
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_transferred >= self.total_size && self.pending.is_empty()
    }

    fn set_progress(&mut self, bytes: u64) {
        self.bytes_transferred = bytes.min(self.total_size);
        self.updated_at = Instant::now();
    }
}

/// Moves transfer bookkeeping between connections to the same device
#[derive(Debug)]
pub struct MigrationManager {
    transfers: Arc<RwLock<HashMap<TransferKey, TransferState>>>,
    config: MigrationConfig,
}

impl MigrationManager {
    pub fn new() -> Self {
        Self::with_config(MigrationConfig::default())
    }

    pub fn with_config(config: MigrationConfig) -> Self {
        Self {
            transfers: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Start tracking a transfer, replacing any previous state under the same key
    pub async fn register_transfer(&self, key: TransferKey, total_size: u64, block_size: u64) -> Uuid {
        let state = TransferState::new(total_size, block_size);
        let id = state.id;
        log::debug!(
            "Registered transfer {} of {}/{} on {} ({} bytes)",
            id, key.folder, key.file, key.connection_id, total_size
        );
        self.transfers.write().await.insert(key, state);
        id
    }

    /// Set the acknowledged byte count. Values past the total are clamped.
    pub async fn update_transfer_progress(&self, key: &TransferKey, bytes_transferred: u64) -> Result<()> {
        let mut transfers = self.transfers.write().await;
        let state = transfers.get_mut(key).ok_or_else(|| not_found(key))?;
        state.set_progress(bytes_transferred);
        Ok(())
    }

    pub async fn add_pending_request(&self, key: &TransferKey, request: BlockRequest) -> Result<()> {
        let mut transfers = self.transfers.write().await;
        let state = transfers.get_mut(key).ok_or_else(|| not_found(key))?;
        state.pending.insert(request.index, request);
        state.updated_at = Instant::now();
        Ok(())
    }

    /// Mark a pending block as received and credit its bytes
    pub async fn complete_request(&self, key: &TransferKey, block_index: u64) -> bool {
        let mut transfers = self.transfers.write().await;
        let Some(state) = transfers.get_mut(key) else {
            return false;
        };
        match state.pending.remove(&block_index) {
            Some(request) => {
                let progress = state.bytes_transferred.saturating_add(request.size);
                state.set_progress(progress);
                true
            }
            None => false,
        }
    }

    pub async fn get_transfer_state(&self, key: &TransferKey) -> Option<TransferState> {
        self.transfers.read().await.get(key).cloned()
    }

    /// Whether the transfer should leave `current` for another connection
    pub async fn should_migrate_transfer(
        &self,
        current: &ConnectionRef,
        device_connections: &[ConnectionRef],
        folder: &str,
        file: &str,
    ) -> bool {
        let key = TransferKey::new(current.id(), folder, file);
        if !self.transfers.read().await.contains_key(&key) {
            return false;
        }
        self.get_best_connection_for_transfer(current, device_connections).is_some()
    }

    /// Best replacement for `current` among the device's other connections,
    /// or None when nothing is meaningfully better
    pub fn get_best_connection_for_transfer(
        &self,
        current: &ConnectionRef,
        device_connections: &[ConnectionRef],
    ) -> Option<ConnectionRef> {
        let mut best: Option<&ConnectionRef> = None;
        for candidate in device_connections {
            if candidate.id() == current.id() || candidate.device_id() != current.device_id() {
                continue;
            }
            if !self.is_better(current, candidate) {
                continue;
            }
            let replace = match best {
                None => true,
                Some(top) => {
                    candidate.health_score() > top.health_score()
                        || (candidate.health_score() == top.health_score()
                            && candidate.priority() < top.priority())
                }
            };
            if replace {
                best = Some(candidate);
            }
        }
        best.cloned()
    }

    /// Re-key a transfer onto another connection. Progress and pending requests
    /// carry over unchanged. Fails if the source is unknown or the destination
    /// already carries the same file.
    pub async fn migrate_transfer(&self, from: &str, to: &str, folder: &str, file: &str) -> bool {
        if from == to {
            return false;
        }
        let source = TransferKey::new(from, folder, file);
        let target = source.on(to);

        let mut transfers = self.transfers.write().await;
        if transfers.contains_key(&target) {
            log::warn!("Cannot migrate {}/{} to {}: transfer already present", folder, file, to);
            return false;
        }
        let Some(state) = transfers.remove(&source) else {
            return false;
        };

        log::info!(
            "Migrated transfer {} of {}/{} from {} to {} ({} of {} bytes, {} pending)",
            state.id,
            folder,
            file,
            from,
            to,
            state.bytes_transferred,
            state.total_size,
            state.pending.len()
        );
        transfers.insert(target, state);
        true
    }

    /// Move every transfer on `from` to `to`, returning how many moved
    pub async fn migrate_connection_transfers(&self, from: &str, to: &str) -> usize {
        let keys = self.transfers_for_connection(from).await;
        let mut moved = 0;
        for key in keys {
            if self.migrate_transfer(from, to, &key.folder, &key.file).await {
                moved += 1;
            }
        }
        moved
    }

    pub async fn complete_transfer(&self, key: &TransferKey) -> Option<TransferState> {
        let state = self.transfers.write().await.remove(key)?;
        log::debug!("Transfer {} of {}/{} completed", state.id, key.folder, key.file);
        Some(state)
    }

    pub async fn abandon_transfer(&self, key: &TransferKey) -> Option<TransferState> {
        let state = self.transfers.write().await.remove(key)?;
        log::debug!(
            "Transfer {} of {}/{} abandoned with {} pending",
            state.id, key.folder, key.file, state.pending.len()
        );
        Some(state)
    }

    pub async fn transfers_for_connection(&self, connection_id: &str) -> Vec<TransferKey> {
        let transfers = self.transfers.read().await;
        let mut keys: Vec<TransferKey> = transfers
            .keys()
            .filter(|key| key.connection_id == connection_id)
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub async fn transfer_count(&self) -> usize {
        self.transfers.read().await.len()
    }

    fn is_better(&self, current: &ConnectionRef, candidate: &ConnectionRef) -> bool {
        let current_health = current.health_score();
        let candidate_health = candidate.health_score();
        if candidate_health >= current_health + self.config.health_margin {
            return true;
        }
        let priority_gain = i64::from(current.priority()) - i64::from(candidate.priority());
        priority_gain >= i64::from(self.config.priority_threshold) && candidate_health >= current_health
    }
}

impl Default for MigrationManager {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(key: &TransferKey) -> Error {
    Error::TransferNotFound {
        connection_id: key.connection_id.clone(),
        folder: key.folder.clone(),
        file: key.file.clone(),
    }
}
