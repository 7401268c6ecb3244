//! Per-session mutable context inbound handlers operate on. Lives on the
//! session's own task; handlers never need a lock around it.

use chrono_tz::Tz;

use crate::scp::ScpStore;
use crate::session::record::Session;
use crate::session::reservation::ReservationManager;
use crate::session::state_machine::SessionStateMachine;

/// Work a handler wants performed asynchronously, after its reply has been
/// serialised and sent — e.g. RemoteStartTransaction triggers Authorize
/// and StartTransaction but must answer the CALL immediately.
#[derive(Debug, Clone)]
pub enum AsyncAction {
    Authorize { id_tag: String },
    StartTransaction { id_tag: String },
    StopTransaction { reason: crate::ocpp::messages::StopReason },
    SendBootNotification,
    SendHeartbeat,
    SendStatusNotification,
    ReconnectTransport,
}

pub struct SessionContext {
    pub session: Session,
    pub state_machine: SessionStateMachine,
    pub scp: ScpStore,
    pub reservations: ReservationManager,
    pub next_transaction_id: i64,
    pub pending_actions: Vec<AsyncAction>,
    pub config_registry: std::collections::HashMap<String, (String, bool)>,
    pub available_for_operator_use: bool,
    /// Engine-configured timezone recurring SCP schedules are anchored to.
    /// Threaded in at construction so inbound handlers (which only see
    /// `SessionContext`, not the supervisor's own config) can evaluate
    /// schedules against the same timezone the physics tick enforces.
    pub timezone: Tz,
}

impl SessionContext {
    pub fn new(session: Session, timezone: Tz) -> Self {
        let mut config_registry = std::collections::HashMap::new();
        config_registry.insert(
            "HeartbeatInterval".to_string(),
            (session.heartbeat_interval_secs.to_string(), false),
        );
        config_registry.insert(
            "MeterValueSampleInterval".to_string(),
            (session.meter_values_interval_secs.to_string(), false),
        );
        config_registry.insert("NumberOfConnectors".to_string(), ("1".to_string(), true));

        Self {
            session,
            state_machine: SessionStateMachine::new(),
            scp: ScpStore::new(),
            reservations: ReservationManager::new(),
            next_transaction_id: 1,
            pending_actions: Vec::new(),
            config_registry,
            available_for_operator_use: true,
            timezone,
        }
    }

    pub fn queue(&mut self, action: AsyncAction) {
        self.pending_actions.push(action);
    }

    pub fn drain_pending_actions(&mut self) -> Vec<AsyncAction> {
        std::mem::take(&mut self.pending_actions)
    }
}
