use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::DeviceId;

/// Kind of structured event emitted by the connection core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    DeviceConnected,
    StateChanged,
    Failure,
    RemoteIndexUpdated,
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventCategory::DeviceConnected => write!(f, "device_connected"),
            EventCategory::StateChanged => write!(f, "state_changed"),
            EventCategory::Failure => write!(f, "failure"),
            EventCategory::RemoteIndexUpdated => write!(f, "remote_index_updated"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<EventLevel> for log::Level {
    fn from(level: EventLevel) -> Self {
        match level {
            EventLevel::Debug => log::Level::Debug,
            EventLevel::Info => log::Level::Info,
            EventLevel::Warn => log::Level::Warn,
            EventLevel::Error => log::Level::Error,
        }
    }
}

/// A structured health or monitoring event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: EventLevel,
    pub category: EventCategory,
    pub device_id: Option<DeviceId>,
    pub message: String,
    pub fields: BTreeMap<String, String>,
}

impl Event {
    pub fn new(level: EventLevel, category: EventCategory, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            level,
            category,
            device_id: None,
            message: message.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_device(mut self, device_id: impl Into<DeviceId>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.fields.insert(key.into(), value.to_string());
        self
    }

    pub fn format_human_readable(&self) -> String {
        let mut parts = vec![format!("[{}]", self.category)];
        if let Some(device_id) = &self.device_id {
            parts.push(format!("device={}", device_id));
        }
        for (key, value) in &self.fields {
            parts.push(format!("{}={}", key, value));
        }
        format!("{} {}", parts.join(" "), self.message)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Receiver for structured events
#[async_trait]
pub trait EventSink: Send + Sync + fmt::Debug {
    async fn emit(&self, event: Event);
}

pub type EventSinkRef = Arc<dyn EventSink>;

/// Forwards events to the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventSink;

#[async_trait]
impl EventSink for LogEventSink {
    async fn emit(&self, event: Event) {
        log::log!(target: "pathmesh::events", log::Level::from(event.level), "{}", event.format_human_readable());
    }
}

/// Keeps the most recent events of each category in memory
#[derive(Debug)]
pub struct MemoryEventSink {
    events: Arc<RwLock<HashMap<EventCategory, VecDeque<Event>>>>,
    counts: Arc<RwLock<HashMap<EventCategory, u64>>>,
    max_per_category: usize,
}

impl MemoryEventSink {
    pub fn new(max_per_category: usize) -> Self {
        Self {
            events: Arc::new(RwLock::new(HashMap::new())),
            counts: Arc::new(RwLock::new(HashMap::new())),
            max_per_category,
        }
    }

    /// Retained events of a category, oldest first
    pub async fn events(&self, category: EventCategory) -> Vec<Event> {
        let events = self.events.read().await;
        events
            .get(&category)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Retained events of a device across all categories, oldest first
    pub async fn events_for_device(&self, device_id: &str) -> Vec<Event> {
        let events = self.events.read().await;
        let mut matching: Vec<Event> = events
            .values()
            .flatten()
            .filter(|event| event.device_id.as_deref() == Some(device_id))
            .cloned()
            .collect();
        matching.sort_by_key(|event| event.timestamp);
        matching
    }

    /// Events ever emitted in a category, including ones no longer retained
    pub async fn count(&self, category: EventCategory) -> u64 {
        self.counts.read().await.get(&category).copied().unwrap_or(0)
    }

    pub async fn clear(&self) {
        self.events.write().await.clear();
    }
}

impl Default for MemoryEventSink {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn emit(&self, event: Event) {
        let category = event.category;
        {
            let mut events = self.events.write().await;
            let entries = events.entry(category).or_default();
            entries.push_back(event);
            while entries.len() > self.max_per_category {
                entries.pop_front();
            }
        }
        *self.counts.write().await.entry(category).or_insert(0) += 1;
    }
}
