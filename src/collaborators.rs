//! Collaborator interfaces: `SessionStore` (persistence) and `EventBus`
//! (log/chart/metrics fan-out). The real implementations (a database-backed
//! store, a websocket/SSE-fed bus) are non-core collaborators; this module
//! ships in-memory reference implementations so the engine is runnable and
//! testable standalone.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::metrics::MetricsSnapshot;
use crate::session::record::{ChartSample, LogEntry, Session, VehicleProfile};

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_all(&self) -> anyhow::Result<Vec<Session>>;
    async fn save(&self, session: &Session) -> anyhow::Result<()>;
    async fn delete(&self, session_id: uuid::Uuid) -> anyhow::Result<()>;
    async fn load_vehicle(&self, vehicle_id: &str) -> anyhow::Result<VehicleProfile>;
}

#[derive(Debug, Clone)]
pub enum OcppMessageDirection {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone)]
pub struct OcppMessageEvent {
    pub direction: OcppMessageDirection,
    pub action: String,
    pub payload: serde_json::Value,
    pub t: chrono::DateTime<chrono::Utc>,
}

pub trait EventBus: Send + Sync {
    fn publish_log(&self, session_id: uuid::Uuid, entry: LogEntry);
    fn publish_chart(&self, session_id: uuid::Uuid, sample: ChartSample);
    fn publish_ocpp_message(&self, session_id: uuid::Uuid, event: OcppMessageEvent);
    fn publish_metrics(&self, snapshot: MetricsSnapshot);
}

/// Reference `SessionStore`: a guarded `HashMap`, last-writer-wins, plus a
/// small built-in vehicle catalogue so the engine can run standalone.
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<uuid::Uuid, Session>>,
    vehicles: RwLock<HashMap<String, VehicleProfile>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        let mut vehicles = HashMap::new();
        vehicles.insert(
            "generic-60kwh".to_string(),
            VehicleProfile {
                id: "generic-60kwh".to_string(),
                brand: "Generic".to_string(),
                model: "EV".to_string(),
                battery_capacity_kwh: 60.0,
                max_ac_power_kw: 11.0,
                max_ac_phases: 3,
                max_ac_current_a: 16.0,
                max_dc_power_kw: 50.0,
                charging_curve: vec![(0.0, 11.0), (80.0, 11.0), (100.0, 3.0)],
                ac_efficiency: 0.95,
                dc_efficiency: 0.97,
            },
        );
        Self {
            sessions: RwLock::new(HashMap::new()),
            vehicles: RwLock::new(vehicles),
        }
    }

    pub fn register_vehicle(&self, profile: VehicleProfile) {
        self.vehicles.write().insert(profile.id.clone(), profile);
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load_all(&self) -> anyhow::Result<Vec<Session>> {
        Ok(self.sessions.read().values().cloned().collect())
    }

    async fn save(&self, session: &Session) -> anyhow::Result<()> {
        self.sessions.write().insert(session.id, session.clone());
        Ok(())
    }

    async fn delete(&self, session_id: uuid::Uuid) -> anyhow::Result<()> {
        self.sessions.write().remove(&session_id);
        Ok(())
    }

    async fn load_vehicle(&self, vehicle_id: &str) -> anyhow::Result<VehicleProfile> {
        self.vehicles
            .read()
            .get(vehicle_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown vehicle profile id `{vehicle_id}`"))
    }
}

/// Reference `EventBus` backed by bounded broadcast channels. Publishers
/// never block on subscribers: a full channel just drops the oldest
/// unread sample for slow subscribers, matching the ring-buffer discipline.
pub struct ChannelEventBus {
    logs: broadcast::Sender<(uuid::Uuid, LogEntry)>,
    charts: broadcast::Sender<(uuid::Uuid, ChartSample)>,
    messages: broadcast::Sender<(uuid::Uuid, OcppMessageEvent)>,
    metrics: broadcast::Sender<MetricsSnapshot>,
}

impl ChannelEventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            logs: broadcast::channel(capacity).0,
            charts: broadcast::channel(capacity).0,
            messages: broadcast::channel(capacity).0,
            metrics: broadcast::channel(capacity.min(64)).0,
        }
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<(uuid::Uuid, LogEntry)> {
        self.logs.subscribe()
    }

    pub fn subscribe_charts(&self) -> broadcast::Receiver<(uuid::Uuid, ChartSample)> {
        self.charts.subscribe()
    }

    pub fn subscribe_metrics(&self) -> broadcast::Receiver<MetricsSnapshot> {
        self.metrics.subscribe()
    }
}

impl Default for ChannelEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus for ChannelEventBus {
    fn publish_log(&self, session_id: uuid::Uuid, entry: LogEntry) {
        let _ = self.logs.send((session_id, entry));
    }

    fn publish_chart(&self, session_id: uuid::Uuid, sample: ChartSample) {
        let _ = self.charts.send((session_id, sample));
    }

    fn publish_ocpp_message(&self, session_id: uuid::Uuid, event: OcppMessageEvent) {
        let _ = self.messages.send((session_id, event));
    }

    fn publish_metrics(&self, snapshot: MetricsSnapshot) {
        let _ = self.metrics.send(snapshot);
    }
}

pub type SharedSessionStore = Arc<dyn SessionStore>;
pub type SharedEventBus = Arc<dyn EventBus>;
