//! Engine / dispatcher — creates, indexes, and destroys session supervisors,
//! runs batch operations (connect/boot/start/stop/disconnect) across many
//! sessions with pacing, and aggregates a periodic metrics snapshot.
//!
//! Each session still runs its own cooperative task and owns its state
//! outright; the engine only ever touches the shared registry (behind a
//! `RwLock` sized for many concurrent readers, one writer at a time) and the
//! metrics aggregator, never a session's internals directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::collaborators::{SharedEventBus, SharedSessionStore};
use crate::error::CoreResult;
use crate::metrics::{MetricsAggregator, MetricsSnapshot};
use crate::ocpp::messages::StopReason;
use crate::session::record::{ChargerKind, Session};
use crate::session::state_machine::SessionState;
use crate::session::supervisor::{SessionSupervisor, SupervisorConfig, SupervisorHandle, SupervisorOp};

/// Describes the sessions a `create_n` batch should mint. Every minted
/// session shares the template and gets a zero-padded, index-suffixed cp id.
#[derive(Debug, Clone)]
pub struct SessionTemplate {
    pub cp_id_prefix: String,
    pub csms_endpoint: String,
    pub bearer_token: Option<String>,
    pub charger_kind: ChargerKind,
    pub vehicle_profile_id: String,
}

/// Pacing for a batch operation: a concurrency cap (messages/sec) and an
/// optional fixed delay between dispatches, to avoid overloading a CSMS.
#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    pub per_second: usize,
    pub per_operation_delay: Duration,
}

impl Pacing {
    pub fn messages_per_second(rate: usize) -> Self {
        Self {
            per_second: rate.max(1),
            per_operation_delay: Duration::from_secs_f64(1.0 / rate.max(1) as f64),
        }
    }
}

impl Default for Pacing {
    fn default() -> Self {
        Self { per_second: 50, per_operation_delay: Duration::ZERO }
    }
}

/// `submitted = succeeded + failed + cancelled` always holds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub errors: Vec<(Uuid, String)>,
}

pub struct Engine {
    sessions: Arc<RwLock<HashMap<Uuid, SupervisorHandle>>>,
    session_store: SharedSessionStore,
    event_bus: SharedEventBus,
    supervisor_config: SupervisorConfig,
    metrics: Arc<Mutex<MetricsAggregator>>,
    max_sessions: usize,
}

impl Engine {
    pub fn new(
        session_store: SharedSessionStore,
        event_bus: SharedEventBus,
        supervisor_config: SupervisorConfig,
        max_sessions: usize,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            session_store,
            event_bus,
            supervisor_config,
            metrics: Arc::new(Mutex::new(MetricsAggregator::new(4096))),
            max_sessions,
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn session_ids(&self) -> Vec<Uuid> {
        self.sessions.read().await.keys().copied().collect()
    }

    pub async fn handle_for(&self, id: Uuid) -> Option<SupervisorHandle> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Cancel the session's cooperative task and drop it from the registry.
    /// The supervisor removes its own `SessionStore` entry on exit.
    pub async fn delete(&self, id: Uuid) -> bool {
        let handle = self.sessions.write().await.remove(&id);
        match handle {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    // -- batch primitives (spec's createN/connectAll/bootAll/startAll/stopAll/disconnectAll) --

    pub async fn create_n(&self, count: usize, template: SessionTemplate, pacing: Pacing) -> BatchOutcome {
        let submitted = count;
        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut cancelled = 0usize;
        let mut errors = Vec::new();

        for i in 0..count {
            if self.sessions.read().await.len() >= self.max_sessions {
                cancelled += count - i;
                warn!(max_sessions = self.max_sessions, "session limit reached, remaining createN requests cancelled");
                break;
            }

            let vehicle = match self.session_store.load_vehicle(&template.vehicle_profile_id).await {
                Ok(vehicle) => vehicle,
                Err(e) => {
                    failed += 1;
                    errors.push((Uuid::nil(), e.to_string()));
                    continue;
                }
            };

            let mut session = Session::new(
                format!("{}-{:04}", template.cp_id_prefix, i),
                1,
                template.csms_endpoint.clone(),
                template.charger_kind,
                template.vehicle_profile_id.clone(),
            );
            session.bearer_token = template.bearer_token.clone();
            let id = session.id;

            let (supervisor, handle) = SessionSupervisor::new(
                session.clone(),
                vehicle,
                self.supervisor_config.clone(),
                self.session_store.clone(),
                self.event_bus.clone(),
            );

            if let Err(e) = self.session_store.save(&session).await {
                failed += 1;
                errors.push((id, e.to_string()));
                continue;
            }

            self.sessions.write().await.insert(id, handle);
            tokio::spawn(supervisor.run());
            succeeded += 1;

            if !pacing.per_operation_delay.is_zero() {
                tokio::time::sleep(pacing.per_operation_delay).await;
            }
        }

        BatchOutcome { submitted, succeeded, failed, cancelled, errors }
    }

    pub async fn connect_all(
        &self,
        ids: Option<Vec<Uuid>>,
        pacing: Pacing,
        cancel: Option<CancellationToken>,
    ) -> BatchOutcome {
        let ids = self.resolve_ids(ids).await;
        self.run_batch(ids, SupervisorOp::Connect, pacing, cancel).await
    }

    pub async fn boot_all(
        &self,
        ids: Option<Vec<Uuid>>,
        pacing: Pacing,
        cancel: Option<CancellationToken>,
    ) -> BatchOutcome {
        let ids = self.resolve_ids(ids).await;
        self.run_batch(ids, SupervisorOp::Boot, pacing, cancel).await
    }

    pub async fn start_all(
        &self,
        id_tag: String,
        ids: Option<Vec<Uuid>>,
        pacing: Pacing,
        cancel: Option<CancellationToken>,
    ) -> BatchOutcome {
        let ids = self.resolve_ids(ids).await;
        self.run_batch(ids, SupervisorOp::StartTransaction { id_tag }, pacing, cancel).await
    }

    pub async fn stop_all(
        &self,
        reason: StopReason,
        ids: Option<Vec<Uuid>>,
        pacing: Pacing,
        cancel: Option<CancellationToken>,
    ) -> BatchOutcome {
        let ids = self.resolve_ids(ids).await;
        self.run_batch(ids, SupervisorOp::StopTransaction { reason }, pacing, cancel).await
    }

    pub async fn disconnect_all(
        &self,
        ids: Option<Vec<Uuid>>,
        pacing: Pacing,
        cancel: Option<CancellationToken>,
    ) -> BatchOutcome {
        let ids = self.resolve_ids(ids).await;
        self.run_batch(ids, SupervisorOp::Disconnect, pacing, cancel).await
    }

    async fn resolve_ids(&self, ids: Option<Vec<Uuid>>) -> Vec<Uuid> {
        match ids {
            Some(ids) => ids,
            None => self.session_ids().await,
        }
    }

    /// Bounded-concurrency fan-out of one `SupervisorOp` over `ids`. The
    /// semaphore caps in-flight calls at `pacing.per_second`; the optional
    /// delay between dispatches is what actually throttles the send rate.
    /// `cancel` lets a caller abort mid-flight; everything not yet
    /// dispatched is reported `cancelled`, not `failed`.
    async fn run_batch(
        &self,
        ids: Vec<Uuid>,
        op: SupervisorOp,
        pacing: Pacing,
        cancel: Option<CancellationToken>,
    ) -> BatchOutcome {
        let submitted = ids.len();
        let semaphore = Arc::new(Semaphore::new(pacing.per_second.max(1)));
        let mut join_set = JoinSet::new();
        let mut cancelled = 0usize;
        let action = action_name(&op);

        for session_id in ids {
            if cancel.as_ref().is_some_and(|token| token.is_cancelled()) {
                cancelled += 1;
                continue;
            }

            let handle = self.sessions.read().await.get(&session_id).cloned();
            let Some(handle) = handle else {
                cancelled += 1;
                continue;
            };

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("batch semaphore is never closed");
            self.metrics.lock().await.record_sent(action);

            let op = op.clone();
            join_set.spawn(async move {
                let outcome = handle.call(op).await;
                drop(permit);
                (session_id, outcome)
            });

            if !pacing.per_operation_delay.is_zero() {
                tokio::time::sleep(pacing.per_operation_delay).await;
            }
        }

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut errors = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((id, Ok(_))) => succeeded += 1,
                Ok((id, Err(e))) => {
                    failed += 1;
                    self.metrics.lock().await.record_error();
                    errors.push((id, e.to_string()));
                }
                Err(join_error) => {
                    failed += 1;
                    self.metrics.lock().await.record_error();
                    errors.push((Uuid::nil(), join_error.to_string()));
                }
            }
        }

        BatchOutcome { submitted, succeeded, failed, cancelled, errors }
    }

    // -- metrics --------------------------------------------------------------

    /// Snapshot connection/session counts from the `SessionStore` (the
    /// authoritative record each supervisor persists) and message/latency
    /// figures from the batch-driven aggregator, then publish to the bus.
    pub async fn snapshot_metrics(&self) -> MetricsSnapshot {
        let total_sessions = self.session_count().await as u64;
        let records = self.session_store.load_all().await.unwrap_or_default();
        let active_connections = records.iter().filter(|s| s.connected).count() as u64;
        let charging_sessions = records.iter().filter(|s| s.state == SessionState::Charging).count() as u64;

        let snapshot = self
            .metrics
            .lock()
            .await
            .snapshot(active_connections, total_sessions, charging_sessions);
        self.event_bus.publish_metrics(snapshot.clone());
        snapshot
    }

    /// Runs until `cancel` fires, periodically publishing a metrics snapshot.
    pub async fn run_metrics_loop(&self, period: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let _ = self.snapshot_metrics().await;
                }
            }
        }
    }
}

fn action_name(op: &SupervisorOp) -> &'static str {
    match op {
        SupervisorOp::Connect => "Connect",
        SupervisorOp::Disconnect => "Disconnect",
        SupervisorOp::Boot => "BootNotification",
        SupervisorOp::Authorize { .. } => "Authorize",
        SupervisorOp::Park | SupervisorOp::Unpark | SupervisorOp::Plug | SupervisorOp::Unplug => "Transition",
        SupervisorOp::StartTransaction { .. } => "StartTransaction",
        SupervisorOp::StopTransaction { .. } => "StopTransaction",
        SupervisorOp::SendHeartbeat => "Heartbeat",
        SupervisorOp::SendMeterValues => "MeterValues",
        SupervisorOp::SetChargingProfile(_) => "SetChargingProfile",
        SupervisorOp::ClearChargingProfile { .. } => "ClearChargingProfile",
        SupervisorOp::GetCompositeSchedule { .. } => "GetCompositeSchedule",
        SupervisorOp::Update(_) => "Update",
        SupervisorOp::Delete => "Delete",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{ChannelEventBus, InMemorySessionStore};

    fn engine() -> Engine {
        Engine::new(
            Arc::new(InMemorySessionStore::new()),
            Arc::new(ChannelEventBus::new(64)),
            SupervisorConfig::default(),
            1000,
        )
    }

    fn template() -> SessionTemplate {
        SessionTemplate {
            cp_id_prefix: "LOAD".to_string(),
            csms_endpoint: "ws://mock-csms/ocpp".to_string(),
            bearer_token: None,
            charger_kind: ChargerKind::AcTri,
            vehicle_profile_id: "generic-60kwh".to_string(),
        }
    }

    #[tokio::test]
    async fn create_n_mints_the_requested_count() {
        let engine = engine();
        let outcome = engine.create_n(10, template(), Pacing::default()).await;
        assert_eq!(outcome.submitted, 10);
        assert_eq!(outcome.succeeded, 10);
        assert_eq!(outcome.failed, 0);
        assert_eq!(engine.session_count().await, 10);
    }

    #[tokio::test]
    async fn create_n_reports_unknown_vehicle_profile_as_failed_not_panicking() {
        let engine = engine();
        let mut bad_template = template();
        bad_template.vehicle_profile_id = "does-not-exist".to_string();
        let outcome = engine.create_n(3, bad_template, Pacing::default()).await;
        assert_eq!(outcome.submitted, 3);
        assert_eq!(outcome.succeeded, 0);
        assert_eq!(outcome.failed, 3);
        assert_eq!(outcome.submitted, outcome.succeeded + outcome.failed + outcome.cancelled);
    }

    #[tokio::test]
    async fn create_n_stops_at_the_session_limit() {
        let mut engine = engine();
        engine.max_sessions = 4;
        let outcome = engine.create_n(10, template(), Pacing::default()).await;
        assert_eq!(outcome.submitted, 10);
        assert_eq!(outcome.succeeded, 4);
        assert_eq!(outcome.cancelled, 6);
        assert_eq!(outcome.submitted, outcome.succeeded + outcome.failed + outcome.cancelled);
    }

    #[tokio::test]
    async fn batch_accounting_always_sums_to_submitted() {
        let engine = engine();
        engine.create_n(5, template(), Pacing::default()).await;
        let ids = engine.session_ids().await;
        let outcome = engine.connect_all(Some(ids), Pacing::default(), None).await;
        assert_eq!(outcome.submitted, outcome.succeeded + outcome.failed + outcome.cancelled);
    }

    #[tokio::test]
    async fn connect_all_against_an_unknown_id_is_cancelled_not_failed() {
        let engine = engine();
        let outcome = engine.connect_all(Some(vec![Uuid::new_v4()]), Pacing::default(), None).await;
        assert_eq!(outcome.cancelled, 1);
        assert_eq!(outcome.failed, 0);
    }

    #[tokio::test]
    async fn delete_removes_from_the_registry() {
        let engine = engine();
        engine.create_n(1, template(), Pacing::default()).await;
        let id = engine.session_ids().await[0];
        assert!(engine.delete(id).await);
        assert_eq!(engine.session_count().await, 0);
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn batch_accounting_invariant_holds_for_any_fleet_size(count in 1usize..40) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let (create_outcome, connect_outcome) = rt.block_on(async {
                let engine = engine();
                let create_outcome = engine.create_n(count, template(), Pacing::default()).await;
                let ids = engine.session_ids().await;
                let connect_outcome = engine.connect_all(Some(ids), Pacing::default(), None).await;
                (create_outcome, connect_outcome)
            });

            prop_assert_eq!(
                create_outcome.submitted,
                create_outcome.succeeded + create_outcome.failed + create_outcome.cancelled
            );
            prop_assert_eq!(
                connect_outcome.submitted,
                connect_outcome.succeeded + connect_outcome.failed + connect_outcome.cancelled
            );
        }
    }
}
