//! Session supervisor — owns one session end-to-end: the peer connection,
//! request correlation, state machine, SCP store, physics, and the inbound
//! handler registry. Runs as a single cooperative task; every mutation of
//! session-owned state happens here, so nothing in this module needs a lock.

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use chrono::Utc;
use chrono_tz::Tz;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::collaborators::{OcppMessageDirection, OcppMessageEvent, SharedEventBus, SharedSessionStore};
use crate::error::{CoreError, CoreResult, FatalEngineError, StateMachineError};
use crate::ocpp::codec::{ErrorCode, OcppFrame};
use crate::ocpp::correlator::{Correlator, CorrelatorOutcome};
use crate::ocpp::handlers::{self, Handler};
use crate::ocpp::messages::*;
use crate::ocpp::peer::{Peer, PeerEvent, ReconnectBackoff};
use crate::physics::{self, ChargingOutcome};
use crate::session::context::{AsyncAction, SessionContext};
use crate::session::record::{ChartSample, LogEntry, LogLevel, Session, VehicleProfile};
use crate::session::state_machine::SessionState;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub request_timeout: StdDuration,
    pub outbound_queue_depth: usize,
    pub timezone: Tz,
    pub station_max_power_kw: f64,
    pub reconnect_initial: StdDuration,
    pub reconnect_max: StdDuration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            request_timeout: StdDuration::from_secs(30),
            outbound_queue_depth: 128,
            timezone: chrono_tz::UTC,
            station_max_power_kw: 11.0,
            reconnect_initial: StdDuration::from_secs(1),
            reconnect_max: StdDuration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub heartbeat_interval_secs: Option<i64>,
    pub meter_values_interval_secs: Option<i64>,
    pub target_soc_percent: Option<f64>,
}

#[derive(Debug, Clone)]
pub enum SupervisorOp {
    Connect,
    Disconnect,
    Boot,
    Authorize { id_tag: String },
    Park,
    Unpark,
    Plug,
    Unplug,
    StartTransaction { id_tag: String },
    StopTransaction { reason: StopReason },
    SendHeartbeat,
    SendMeterValues,
    SetChargingProfile(ChargingProfile),
    ClearChargingProfile {
        id: Option<i32>,
        purpose: Option<ChargingProfilePurpose>,
        stack_level: Option<i32>,
    },
    GetCompositeSchedule {
        duration_secs: i64,
        rate_unit: ChargingRateUnit,
    },
    Update(SessionUpdate),
    Delete,
}

struct SupervisorCommand {
    op: SupervisorOp,
    reply: oneshot::Sender<CoreResult<Value>>,
}

/// A completed outbound CALL, forwarded here by the small task spawned to
/// await its correlator receiver, so the main loop never blocks on a reply.
enum InternalEvent {
    CallCompleted { action: String, outcome: CorrelatorOutcome },
}

/// A cloneable reference a collaborator (engine, load-test harness, REST
/// shim) uses to drive one session.
#[derive(Clone)]
pub struct SupervisorHandle {
    pub session_id: Uuid,
    command_tx: mpsc::Sender<SupervisorCommand>,
    cancel: CancellationToken,
}

impl SupervisorHandle {
    pub async fn call(&self, op: SupervisorOp) -> CoreResult<Value> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(SupervisorCommand { op, reply: tx })
            .await
            .map_err(|_| CoreError::Fatal(FatalEngineError("supervisor task has stopped".into())))?;
        rx.await
            .map_err(|_| CoreError::Fatal(FatalEngineError("supervisor dropped its reply channel".into())))?
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

pub struct SessionSupervisor {
    ctx: SessionContext,
    vehicle: VehicleProfile,
    config: SupervisorConfig,
    session_store: SharedSessionStore,
    event_bus: SharedEventBus,
    registry: HashMap<&'static str, Handler>,
    correlator: Correlator,

    outbound_tx: Option<mpsc::Sender<WsMessage>>,
    peer_events_tx: mpsc::Sender<PeerEvent>,
    peer_events_rx: mpsc::Receiver<PeerEvent>,

    internal_tx: mpsc::Sender<InternalEvent>,
    internal_rx: mpsc::Receiver<InternalEvent>,

    command_tx: mpsc::Sender<SupervisorCommand>,
    command_rx: mpsc::Receiver<SupervisorCommand>,

    backoff: ReconnectBackoff,
    cancel: CancellationToken,
    disconnect_requested: bool,
    pending_auth_id_tag: Option<String>,
}

impl SessionSupervisor {
    pub fn new(
        session: Session,
        vehicle: VehicleProfile,
        config: SupervisorConfig,
        session_store: SharedSessionStore,
        event_bus: SharedEventBus,
    ) -> (Self, SupervisorHandle) {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (peer_events_tx, peer_events_rx) = mpsc::channel(config.outbound_queue_depth);
        let (internal_tx, internal_rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();

        let handle = SupervisorHandle {
            session_id: session.id,
            command_tx: command_tx.clone(),
            cancel: cancel.clone(),
        };

        let backoff = ReconnectBackoff::new(config.reconnect_initial, config.reconnect_max);
        let request_timeout = config.request_timeout;

        let supervisor = Self {
            ctx: SessionContext::new(session, config.timezone),
            vehicle,
            config,
            session_store,
            event_bus,
            registry: handlers::build_registry(),
            correlator: Correlator::new(request_timeout),
            outbound_tx: None,
            peer_events_tx,
            peer_events_rx,
            internal_tx,
            internal_rx,
            command_tx,
            command_rx,
            backoff,
            cancel,
            disconnect_requested: false,
            pending_auth_id_tag: None,
        };

        (supervisor, handle)
    }

    pub async fn run(mut self) {
        let mut heartbeat = interval(StdDuration::from_secs(
            self.ctx.session.heartbeat_interval_secs.max(1) as u64,
        ));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut physics_tick = interval(StdDuration::from_secs(
            self.ctx.session.meter_values_interval_secs.max(1) as u64,
        ));
        physics_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reservation_watchdog = interval(StdDuration::from_secs(1));
        let mut timeout_sweep = interval(StdDuration::from_secs(1));

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(session_id = %self.ctx.session.id, "supervisor cancelled");
                    break;
                }
                Some(cmd) = self.command_rx.recv() => {
                    let result = self.handle_command(cmd.op).await;
                    let _ = cmd.reply.send(result);
                }
                Some(event) = self.peer_events_rx.recv() => {
                    self.handle_peer_event(event).await;
                }
                Some(event) = self.internal_rx.recv() => {
                    self.handle_internal(event).await;
                }
                _ = heartbeat.tick() => {
                    self.send_heartbeat().await;
                }
                _ = physics_tick.tick() => {
                    self.on_physics_tick().await;
                }
                _ = reservation_watchdog.tick() => {
                    self.on_reservation_tick().await;
                }
                _ = timeout_sweep.tick() => {
                    for timeout in self.correlator.sweep_expired() {
                        warn!(session_id = %self.ctx.session.id, action = %timeout.action, "request timed out");
                    }
                }
                else => break,
            }
        }

        let _ = self.session_store.delete(self.ctx.session.id).await;
    }

    // -- operator-facing commands -----------------------------------------

    async fn handle_command(&mut self, op: SupervisorOp) -> CoreResult<Value> {
        match op {
            SupervisorOp::Connect => self.connect().await,
            SupervisorOp::Disconnect => self.disconnect().await,
            SupervisorOp::Boot => self.send_boot_notification().await,
            SupervisorOp::Authorize { id_tag } => self.send_authorize(id_tag).await,
            SupervisorOp::Park => self.simple_transition(SessionState::Parked).await,
            SupervisorOp::Unpark => self.simple_transition(SessionState::Available).await,
            SupervisorOp::Plug => self.simple_transition(SessionState::Plugged).await,
            SupervisorOp::Unplug => self.simple_transition(SessionState::Available).await,
            SupervisorOp::StartTransaction { id_tag } => self.send_start_transaction(id_tag).await,
            SupervisorOp::StopTransaction { reason } => self.send_stop_transaction(reason).await,
            SupervisorOp::SendHeartbeat => {
                self.send_heartbeat().await;
                Ok(serde_json::json!({"scheduled": true}))
            }
            SupervisorOp::SendMeterValues => {
                self.on_physics_tick().await;
                Ok(serde_json::json!({"scheduled": true}))
            }
            SupervisorOp::SetChargingProfile(profile) => {
                self.ctx
                    .scp
                    .install(profile, self.ctx.session.active_transaction_id)
                    .map_err(CoreError::from)?;
                Ok(serde_json::json!({"status": "Accepted"}))
            }
            SupervisorOp::ClearChargingProfile { id, purpose, stack_level } => {
                let removed = self.ctx.scp.clear(id, purpose, stack_level);
                Ok(serde_json::json!({"removed": removed}))
            }
            SupervisorOp::GetCompositeSchedule { duration_secs, rate_unit } => {
                let schedule = self.ctx.scp.composite_schedule(
                    Utc::now(),
                    duration_secs,
                    self.config.timezone,
                    self.config.station_max_power_kw * 1000.0,
                    rate_unit,
                );
                Ok(serde_json::to_value(schedule).unwrap())
            }
            SupervisorOp::Update(update) => {
                if let Some(v) = update.heartbeat_interval_secs {
                    self.ctx.session.heartbeat_interval_secs = v;
                }
                if let Some(v) = update.meter_values_interval_secs {
                    self.ctx.session.meter_values_interval_secs = v;
                }
                if let Some(v) = update.target_soc_percent {
                    self.ctx.session.target_soc_percent = v;
                }
                let _ = self.session_store.save(&self.ctx.session).await;
                Ok(serde_json::json!({"updated": true}))
            }
            SupervisorOp::Delete => {
                self.cancel.cancel();
                Ok(serde_json::json!({"deleted": true}))
            }
        }
    }

    async fn connect(&mut self) -> CoreResult<Value> {
        self.disconnect_requested = false;
        self.transition(SessionState::Connecting)?;

        let peer = Peer::new(
            self.ctx.session.csms_endpoint.clone(),
            self.ctx.session.bearer_token.clone(),
            self.config.outbound_queue_depth,
        );
        self.outbound_tx = Some(peer.sender());

        let events_tx = self.peer_events_tx.clone();
        tokio::spawn(async move {
            let mut peer = peer;
            match peer.connect().await {
                Ok(stream) => {
                    let _ = peer.run(stream, events_tx).await;
                }
                Err(e) => {
                    let _ = events_tx.send(PeerEvent::Disconnected(e.to_string())).await;
                }
            }
        });

        let _ = self.session_store.save(&self.ctx.session).await;
        Ok(serde_json::json!({"state": "connecting"}))
    }

    async fn disconnect(&mut self) -> CoreResult<Value> {
        self.disconnect_requested = true;
        self.ctx.session.connected = false;
        self.outbound_tx = None;
        self.correlator.fail_all_disconnected();
        let _ = self.transition(SessionState::Disconnecting);
        let _ = self.transition(SessionState::Disconnected);
        let _ = self.session_store.save(&self.ctx.session).await;
        Ok(serde_json::json!({"state": "disconnected"}))
    }

    async fn simple_transition(&mut self, to: SessionState) -> CoreResult<Value> {
        let status = self.transition(to)?;
        if let Some(status) = status {
            self.send_status_notification(status).await;
        }
        Ok(serde_json::json!({"state": format!("{to:?}")}))
    }

    fn transition(&mut self, to: SessionState) -> CoreResult<Option<ChargePointStatus>> {
        Ok(self.transition_result(to)?)
    }

    // -- peer/correlator wiring --------------------------------------------

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Connected => {
                self.backoff.reset();
                self.ctx.session.connected = true;
                let _ = self.transition(SessionState::Connected);
            }
            PeerEvent::Frame(text) => self.handle_inbound_frame(text).await,
            PeerEvent::Disconnected(reason) => {
                warn!(session_id = %self.ctx.session.id, %reason, "peer disconnected");
                self.ctx.session.connected = false;
                self.outbound_tx = None;
                self.correlator.fail_all_disconnected();
                if !self.disconnect_requested {
                    let delay = self.backoff.next_delay();
                    let command_tx = self.command_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let (tx, _rx) = oneshot::channel();
                        let _ = command_tx.send(SupervisorCommand { op: SupervisorOp::Connect, reply: tx }).await;
                    });
                }
            }
        }
    }

    async fn handle_inbound_frame(&mut self, text: String) {
        let frame = match OcppFrame::decode(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(session_id = %self.ctx.session.id, error = %e, "failed to decode inbound frame");
                return;
            }
        };

        match frame {
            OcppFrame::Call { message_id, action, payload } => {
                self.event_bus.publish_ocpp_message(
                    self.ctx.session.id,
                    OcppMessageEvent {
                        direction: OcppMessageDirection::Inbound,
                        action: action.clone(),
                        payload: payload.clone(),
                        t: Utc::now(),
                    },
                );

                let reply = match self.registry.get(action.as_str()) {
                    Some(handler) => match handler(&mut self.ctx, payload) {
                        Ok(value) => OcppFrame::CallResult { message_id, payload: value },
                        Err(e) => OcppFrame::error(message_id, e.error_code(), &e.to_string()),
                    },
                    None => OcppFrame::error(
                        message_id,
                        ErrorCode::NotImplemented,
                        &format!("no handler registered for action `{action}`"),
                    ),
                };

                self.send_frame(reply.encode()).await;

                for pending in self.ctx.drain_pending_actions() {
                    self.perform_async_action(pending).await;
                }
            }
            OcppFrame::CallResult { message_id, payload } => {
                self.correlator.fulfil_success(&message_id, payload);
            }
            OcppFrame::CallError { message_id, error_code, error_description, .. } => {
                self.correlator
                    .fulfil_error(&message_id, error_code.to_string(), error_description);
            }
        }
    }

    async fn send_frame(&self, frame: String) {
        if let Some(tx) = &self.outbound_tx {
            if tx.send(WsMessage::Text(frame)).await.is_err() {
                warn!(session_id = %self.ctx.session.id, "outbound queue closed, frame dropped");
            }
        }
    }

    /// Non-critical frames (MeterValues) fail silently on a full queue
    /// rather than awaiting space, per the outbound-queue budget.
    fn try_send_frame(&self, frame: String) {
        if let Some(tx) = &self.outbound_tx {
            if tx.try_send(WsMessage::Text(frame)).is_err() {
                warn!(session_id = %self.ctx.session.id, "outbound queue full, non-critical frame dropped");
            }
        }
    }

    /// Send a CALL and, without awaiting it here, spawn a task that awaits
    /// the correlator's oneshot and forwards the outcome back into the
    /// main loop as an `InternalEvent`.
    async fn send_call(&mut self, action: &str, payload: Value) {
        let message_id = self.correlator.next_message_id();
        let rx = self.correlator.register(message_id.clone(), action);
        self.send_frame(OcppFrame::Call { message_id, action: action.to_string(), payload }.encode())
            .await;

        self.event_bus.publish_ocpp_message(
            self.ctx.session.id,
            OcppMessageEvent {
                direction: OcppMessageDirection::Outbound,
                action: action.to_string(),
                payload: Value::Null,
                t: Utc::now(),
            },
        );

        let internal_tx = self.internal_tx.clone();
        let action = action.to_string();
        tokio::spawn(async move {
            let outcome = rx.await.unwrap_or(CorrelatorOutcome::Disconnected);
            let _ = internal_tx.send(InternalEvent::CallCompleted { action, outcome }).await;
        });
    }

    async fn perform_async_action(&mut self, action: AsyncAction) {
        match action {
            AsyncAction::Authorize { id_tag } => {
                let _ = self.send_authorize(id_tag).await;
            }
            AsyncAction::StartTransaction { id_tag } => {
                let _ = self.send_start_transaction(id_tag).await;
            }
            AsyncAction::StopTransaction { reason } => {
                let _ = self.send_stop_transaction(reason).await;
            }
            AsyncAction::SendBootNotification => {
                let _ = self.send_boot_notification().await;
            }
            AsyncAction::SendHeartbeat => self.send_heartbeat().await,
            AsyncAction::SendStatusNotification => {
                let status = self.ctx.state_machine.current().ocpp_status();
                self.send_status_notification(status).await;
            }
            AsyncAction::ReconnectTransport => {
                let _ = self.disconnect().await;
                let _ = self.connect().await;
            }
        }
    }

    // -- outbound message builders (F) --------------------------------------

    async fn send_boot_notification(&mut self) -> CoreResult<Value> {
        let payload = serde_json::to_value(BootNotificationRequest {
            charge_point_vendor: self.ctx.session.vendor.clone(),
            charge_point_model: self.ctx.session.model.clone(),
            charge_point_serial_number: Some(self.ctx.session.serial_number.clone()),
            firmware_version: Some(self.ctx.session.firmware_version.clone()),
        })
        .unwrap();
        self.send_call("BootNotification", payload).await;
        Ok(serde_json::json!({"scheduled": "BootNotification"}))
    }

    async fn send_heartbeat(&mut self) {
        let payload = serde_json::to_value(HeartbeatRequest {}).unwrap();
        self.send_call("Heartbeat", payload).await;
    }

    async fn send_authorize(&mut self, id_tag: String) -> CoreResult<Value> {
        self.transition(SessionState::Authorizing)?;
        self.pending_auth_id_tag = Some(id_tag.clone());
        let payload = serde_json::to_value(AuthorizeRequest { id_tag }).unwrap();
        self.send_call("Authorize", payload).await;
        Ok(serde_json::json!({"scheduled": "Authorize"}))
    }

    async fn send_start_transaction(&mut self, id_tag: String) -> CoreResult<Value> {
        self.transition(SessionState::Starting)?;
        let payload = serde_json::to_value(StartTransactionRequest {
            connector_id: self.ctx.session.connector_id,
            id_tag,
            meter_start: self.ctx.session.energy_register_wh,
            timestamp: Utc::now(),
            reservation_id: self.ctx.session.active_reservation_id,
        })
        .unwrap();
        self.send_call("StartTransaction", payload).await;
        Ok(serde_json::json!({"scheduled": "StartTransaction"}))
    }

    async fn send_stop_transaction(&mut self, reason: StopReason) -> CoreResult<Value> {
        let Some(transaction_id) = self.ctx.session.active_transaction_id else {
            return Ok(serde_json::json!({"scheduled": false, "reason": "no active transaction"}));
        };
        self.transition(SessionState::Stopping)?;
        let payload = serde_json::to_value(StopTransactionRequest {
            transaction_id,
            meter_stop: self.ctx.session.energy_register_wh,
            timestamp: Utc::now(),
            reason,
            id_tag: None,
            transaction_data: None,
        })
        .unwrap();
        self.send_call("StopTransaction", payload).await;
        Ok(serde_json::json!({"scheduled": "StopTransaction"}))
    }

    async fn send_status_notification(&mut self, status: ChargePointStatus) {
        let payload = serde_json::to_value(StatusNotificationRequest {
            connector_id: self.ctx.session.connector_id,
            error_code: ChargePointErrorCode::NoError,
            status,
            timestamp: Utc::now(),
            info: None,
            vendor_id: None,
            vendor_error_code: None,
        })
        .unwrap();
        let message_id = self.correlator.next_message_id();
        self.try_send_frame(
            OcppFrame::Call { message_id, action: "StatusNotification".to_string(), payload }.encode(),
        );
    }

    fn build_meter_values(&self) -> MeterValuesRequest {
        let session = &self.ctx.session;
        let mut sampled = vec![
            SampledValue {
                value: session.energy_register_wh.to_string(),
                context: Some(ReadingContext::SamplePeriodic),
                format: None,
                measurand: Some(Measurand::EnergyActiveImportRegister),
                phase: None,
                location: None,
                unit: Some(UnitOfMeasure::Wh),
            },
            SampledValue {
                value: (session.applied_power_kw * 1000.0).round().to_string(),
                context: Some(ReadingContext::SamplePeriodic),
                format: None,
                measurand: Some(Measurand::PowerActiveImport),
                phase: None,
                location: None,
                unit: Some(UnitOfMeasure::W),
            },
            SampledValue {
                value: session.max_voltage_v.to_string(),
                context: Some(ReadingContext::SamplePeriodic),
                format: None,
                measurand: Some(Measurand::Voltage),
                phase: Some(Phase::L1),
                location: None,
                unit: Some(UnitOfMeasure::V),
            },
            SampledValue {
                value: session.applied_current_a.to_string(),
                context: Some(ReadingContext::SamplePeriodic),
                format: None,
                measurand: Some(Measurand::CurrentImport),
                phase: Some(Phase::L1),
                location: None,
                unit: Some(UnitOfMeasure::A),
            },
        ];
        if session.in_transaction() {
            sampled.push(SampledValue {
                value: session.current_soc_percent.round().to_string(),
                context: Some(ReadingContext::SamplePeriodic),
                format: None,
                measurand: Some(Measurand::StateOfCharge),
                phase: None,
                location: Some(Location::Ev),
                unit: Some(UnitOfMeasure::Percent),
            });
        }

        MeterValuesRequest {
            connector_id: session.connector_id,
            transaction_id: session.active_transaction_id,
            meter_value: vec![MeterValue { timestamp: Utc::now(), sampled_value: sampled }],
        }
    }

    // -- periodic duties ------------------------------------------------------

    async fn on_physics_tick(&mut self) {
        if !matches!(
            self.ctx.state_machine.current(),
            SessionState::Charging | SessionState::SuspendedEvse | SessionState::SuspendedEv
        ) {
            return;
        }

        let outcome = physics::tick(
            &mut self.ctx.session,
            &self.vehicle,
            &self.ctx.scp,
            self.config.timezone,
            self.config.station_max_power_kw,
            self.ctx.session.meter_values_interval_secs as f64,
        );

        self.event_bus.publish_chart(
            self.ctx.session.id,
            ChartSample {
                t: Utc::now(),
                soc_percent: self.ctx.session.current_soc_percent,
                power_w: self.ctx.session.applied_power_kw * 1000.0,
                energy_wh: self.ctx.session.energy_register_wh as f64,
            },
        );

        let meter_values = self.build_meter_values();
        self.try_send_frame(
            OcppFrame::Call {
                message_id: self.correlator.next_message_id(),
                action: "MeterValues".to_string(),
                payload: serde_json::to_value(meter_values).unwrap(),
            }
            .encode(),
        );

        match outcome {
            ChargingOutcome::Suspended => {
                if self.ctx.state_machine.current() == SessionState::Charging {
                    if let Ok(Some(status)) = self.transition_result(SessionState::SuspendedEvse) {
                        self.send_status_notification(status).await;
                    }
                }
            }
            ChargingOutcome::Charging { .. } => {
                if matches!(
                    self.ctx.state_machine.current(),
                    SessionState::SuspendedEvse | SessionState::SuspendedEv
                ) {
                    if let Ok(Some(status)) = self.transition_result(SessionState::Charging) {
                        self.send_status_notification(status).await;
                    }
                }
            }
            ChargingOutcome::TargetReached => {
                let _ = self.send_stop_transaction(StopReason::Local).await;
            }
        }

        let _ = self.session_store.save(&self.ctx.session).await;
    }

    fn transition_result(&mut self, to: SessionState) -> Result<Option<ChargePointStatus>, StateMachineError> {
        let status = self.ctx.state_machine.transition(to)?;
        self.ctx.session.state = to;
        self.ctx.session.last_state_change_at = Utc::now();
        Ok(status)
    }

    async fn on_reservation_tick(&mut self) {
        let now = Utc::now();
        if self.ctx.reservations.is_expired(now) && self.ctx.state_machine.current() == SessionState::Reserved {
            self.ctx.reservations.clear();
            if let Ok(Some(status)) = self.transition_result(SessionState::Available) {
                self.send_status_notification(status).await;
            }
        }
    }

    async fn handle_internal(&mut self, event: InternalEvent) {
        let InternalEvent::CallCompleted { action, outcome } = event;

        self.event_bus.publish_log(
            self.ctx.session.id,
            LogEntry {
                timestamp: Utc::now(),
                level: LogLevel::Debug,
                category: "ocpp".to_string(),
                message: format!("{action} completed"),
            },
        );

        match (action.as_str(), outcome) {
            ("BootNotification", CorrelatorOutcome::Success(payload)) => {
                if let Ok(resp) = serde_json::from_value::<BootNotificationResponse>(payload) {
                    if resp.status == RegistrationStatus::Accepted {
                        self.ctx.session.heartbeat_interval_secs = resp.interval;
                        if let Ok(Some(status)) = self.transition_result(SessionState::BootAccepted) {
                            let _ = self.transition_result(SessionState::Available);
                            self.send_status_notification(status).await;
                        }
                    }
                }
            }
            ("Authorize", CorrelatorOutcome::Success(payload)) => {
                if let Ok(resp) = serde_json::from_value::<AuthorizeResponse>(payload) {
                    if resp.id_tag_info.status == AuthorizationStatus::Accepted {
                        if let Some(id_tag) = self.pending_auth_id_tag.take() {
                            self.ctx.reservations.consume_if_matches(&id_tag);
                        }
                        let _ = self.transition(SessionState::Authorized);
                    } else {
                        let _ = self.transition(SessionState::Plugged);
                    }
                }
            }
            ("Authorize", _) => {
                let _ = self.transition(SessionState::Plugged);
            }
            ("StartTransaction", CorrelatorOutcome::Success(payload)) => {
                if let Ok(resp) = serde_json::from_value::<StartTransactionResponse>(payload) {
                    self.ctx.session.active_transaction_id = Some(resp.transaction_id);
                    self.ctx.next_transaction_id = resp.transaction_id + 1;
                    if let Ok(Some(status)) = self.transition_result(SessionState::Charging) {
                        self.send_status_notification(status).await;
                    }
                }
            }
            ("StartTransaction", _) => {
                // Scenario D: a dropped StartTransaction returns to AUTHORIZED so a retry can proceed.
                let _ = self.transition(SessionState::Authorized);
            }
            ("StopTransaction", CorrelatorOutcome::Success(_)) => {
                self.ctx.session.active_transaction_id = None;
                if let Ok(Some(status)) = self.transition_result(SessionState::Finishing) {
                    self.send_status_notification(status).await;
                }
                if let Ok(Some(status)) = self.transition_result(SessionState::Available) {
                    self.send_status_notification(status).await;
                }
            }
            ("StopTransaction", _) => {
                warn!(session_id = %self.ctx.session.id, "StopTransaction did not complete");
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{ChannelEventBus, InMemorySessionStore};
    use crate::session::record::ChargerKind;
    use std::sync::Arc;

    fn vehicle() -> VehicleProfile {
        VehicleProfile {
            id: "generic-60kwh".into(),
            brand: "Generic".into(),
            model: "EV".into(),
            battery_capacity_kwh: 60.0,
            max_ac_power_kw: 11.0,
            max_ac_phases: 3,
            max_ac_current_a: 16.0,
            max_dc_power_kw: 50.0,
            charging_curve: vec![(0.0, 11.0), (80.0, 11.0), (100.0, 3.0)],
            ac_efficiency: 0.95,
            dc_efficiency: 0.97,
        }
    }

    fn make_supervisor() -> (SessionSupervisor, SupervisorHandle) {
        let session = Session::new("CP-A", 1, "ws://localhost/ocpp", ChargerKind::AcTri, "generic-60kwh");
        SessionSupervisor::new(
            session,
            vehicle(),
            SupervisorConfig::default(),
            Arc::new(InMemorySessionStore::new()),
            Arc::new(ChannelEventBus::new(64)),
        )
    }

    #[test]
    fn build_meter_values_always_includes_core_measurands() {
        let (supervisor, _handle) = make_supervisor();
        let mv = supervisor.build_meter_values();
        let measurands: Vec<_> = mv.meter_value[0]
            .sampled_value
            .iter()
            .filter_map(|v| v.measurand)
            .collect();
        assert!(measurands.contains(&Measurand::EnergyActiveImportRegister));
        assert!(measurands.contains(&Measurand::PowerActiveImport));
        assert!(measurands.contains(&Measurand::Voltage));
        assert!(measurands.contains(&Measurand::CurrentImport));
    }

    #[test]
    fn soc_measurand_omitted_outside_transaction() {
        let (supervisor, _handle) = make_supervisor();
        let mv = supervisor.build_meter_values();
        assert!(!mv.meter_value[0]
            .sampled_value
            .iter()
            .any(|v| v.measurand == Some(Measurand::StateOfCharge)));
    }

    #[tokio::test]
    async fn reservation_watchdog_returns_to_available_on_expiry() {
        let (mut supervisor, _handle) = make_supervisor();
        supervisor.transition(SessionState::Connecting).unwrap();
        supervisor.transition(SessionState::Connected).unwrap();
        supervisor.transition(SessionState::BootAccepted).unwrap();
        supervisor.transition(SessionState::Available).unwrap();
        supervisor.transition(SessionState::Reserved).unwrap();
        supervisor
            .ctx
            .reservations
            .install(1, "TAG_X".to_string(), Utc::now() - chrono::Duration::seconds(1));

        supervisor.on_reservation_tick().await;
        assert_eq!(supervisor.ctx.state_machine.current(), SessionState::Available);
    }
}
