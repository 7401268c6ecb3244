//! Session data model: the Session record, vehicle profiles, transactions,
//! and the small value types that travel to the EventBus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state_machine::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargerKind {
    AcMono,
    AcBi,
    AcTri,
    Dc,
}

impl ChargerKind {
    pub fn nominal_phase_count(&self) -> u8 {
        match self {
            ChargerKind::AcMono => 1,
            ChargerKind::AcBi => 2,
            ChargerKind::AcTri => 3,
            ChargerKind::Dc => 0,
        }
    }
}

/// Static vehicle characteristics, looked up by id from [`crate::collaborators::SessionStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleProfile {
    pub id: String,
    pub brand: String,
    pub model: String,
    pub battery_capacity_kwh: f64,
    pub max_ac_power_kw: f64,
    pub max_ac_phases: u8,
    pub max_ac_current_a: f64,
    pub max_dc_power_kw: f64,
    /// (SoC %, achievable power kW), ascending by SoC, piecewise-linear.
    pub charging_curve: Vec<(f64, f64)>,
    pub ac_efficiency: f64,
    pub dc_efficiency: f64,
}

impl VehicleProfile {
    /// Linear-interpolate the vehicle's maximum deliverable power at the
    /// given state of charge.
    pub fn power_at_soc_kw(&self, soc_percent: f64, dc: bool) -> f64 {
        let cap = if dc {
            self.max_dc_power_kw
        } else {
            self.max_ac_power_kw
        };
        if self.charging_curve.is_empty() {
            return cap;
        }
        let soc = soc_percent.clamp(0.0, 100.0);
        let curve = &self.charging_curve;
        if soc <= curve[0].0 {
            return curve[0].1.min(cap);
        }
        if soc >= curve[curve.len() - 1].0 {
            return curve[curve.len() - 1].1.min(cap);
        }
        for window in curve.windows(2) {
            let (s0, p0) = window[0];
            let (s1, p1) = window[1];
            if soc >= s0 && soc <= s1 {
                if (s1 - s0).abs() < f64::EPSILON {
                    return p0.min(cap);
                }
                let t = (soc - s0) / (s1 - s0);
                return (p0 + t * (p1 - p0)).min(cap);
            }
        }
        cap
    }

    pub fn efficiency(&self, dc: bool) -> f64 {
        if dc {
            self.dc_efficiency
        } else {
            self.ac_efficiency
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub id_tag: String,
    pub meter_start_wh: i64,
    pub meter_stop_wh: Option<i64>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageDirection {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Pending,
    Success,
    Error,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub message_id: String,
    pub action: String,
    pub direction: MessageDirection,
    pub payload: serde_json::Value,
    pub sent_at: DateTime<Utc>,
    pub replied_at: Option<DateTime<Utc>>,
    pub status: MessageStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Success,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub category: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartSample {
    pub t: DateTime<Utc>,
    pub soc_percent: f64,
    pub power_w: f64,
    pub energy_wh: f64,
}

/// The per-session record described by the data model: identity, wiring
/// info, current lifecycle state, and the mutable fields physics/protocol
/// handling advances over time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub cp_id: String,
    pub connector_id: i32,
    pub csms_endpoint: String,
    pub bearer_token: Option<String>,

    pub state: SessionState,
    pub connected: bool,
    pub authorized: bool,

    pub active_transaction_id: Option<i64>,
    pub active_reservation_id: Option<i32>,
    pub reservation_expiry: Option<DateTime<Utc>>,

    pub charger_kind: ChargerKind,
    pub max_voltage_v: f64,
    pub max_current_a: f64,
    pub max_power_kw: f64,
    pub nominal_phase_count: u8,

    pub vehicle_profile_id: String,
    pub initial_soc_percent: f64,
    pub current_soc_percent: f64,
    pub target_soc_percent: f64,

    pub applied_power_kw: f64,
    pub applied_current_a: f64,
    pub energy_register_wh: i64,

    pub created_at: DateTime<Utc>,
    pub last_state_change_at: DateTime<Utc>,

    pub vendor: String,
    pub model: String,
    pub firmware_version: String,
    pub serial_number: String,

    pub heartbeat_interval_secs: i64,
    pub meter_values_interval_secs: i64,
}

impl Session {
    pub fn new(
        cp_id: impl Into<String>,
        connector_id: i32,
        csms_endpoint: impl Into<String>,
        charger_kind: ChargerKind,
        vehicle_profile_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            cp_id: cp_id.into(),
            connector_id,
            csms_endpoint: csms_endpoint.into(),
            bearer_token: None,
            state: SessionState::Disconnected,
            connected: false,
            authorized: false,
            active_transaction_id: None,
            active_reservation_id: None,
            reservation_expiry: None,
            charger_kind,
            max_voltage_v: 230.0,
            max_current_a: 16.0,
            max_power_kw: 11.0,
            nominal_phase_count: charger_kind.nominal_phase_count(),
            vehicle_profile_id: vehicle_profile_id.into(),
            initial_soc_percent: 20.0,
            current_soc_percent: 20.0,
            target_soc_percent: 80.0,
            applied_power_kw: 0.0,
            applied_current_a: 0.0,
            energy_register_wh: 0,
            created_at: now,
            last_state_change_at: now,
            vendor: "SimCorp".to_string(),
            model: "VirtualCP".to_string(),
            firmware_version: "1.0.0".to_string(),
            serial_number: format!("SIM-{}", Uuid::new_v4().simple()),
            heartbeat_interval_secs: 30,
            meter_values_interval_secs: 10,
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.active_transaction_id.is_some()
    }

    pub fn is_dc(&self) -> bool {
        matches!(self.charger_kind, ChargerKind::Dc)
    }
}
