//! Inbound handler registry — routes CSMS -> CP CALLs to per-action
//! handlers. Validation precedes execution; handlers mutate the session's
//! context and may queue async follow-up work but never await before
//! returning their reply payload.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::Value;

use crate::error::ProtocolFormationError;
use crate::ocpp::messages::*;
use crate::session::context::{AsyncAction, SessionContext};
use crate::session::state_machine::SessionState;

pub type HandlerResult = Result<Value, ProtocolFormationError>;
pub type Handler = fn(&mut SessionContext, Value) -> HandlerResult;

fn parse<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, ProtocolFormationError> {
    serde_json::from_value(payload).map_err(|_| ProtocolFormationError::ShapeMismatch)
}

fn remote_start_transaction(ctx: &mut SessionContext, payload: Value) -> HandlerResult {
    let req: RemoteStartTransactionRequest = parse(payload)?;

    let state = ctx.state_machine.current();
    let acceptable_state = matches!(
        state,
        SessionState::Available
            | SessionState::BootAccepted
            | SessionState::Parked
            | SessionState::Plugged
            | SessionState::Finishing
    );
    let reservation_match = state == SessionState::Reserved
        && ctx
            .reservations
            .active()
            .is_some_and(|r| r.id_tag == req.id_tag);

    let accepted = acceptable_state || reservation_match;
    if accepted {
        ctx.queue(AsyncAction::Authorize {
            id_tag: req.id_tag.clone(),
        });
        ctx.queue(AsyncAction::StartTransaction {
            id_tag: req.id_tag,
        });
    }

    let status = if accepted {
        RemoteStartStopStatus::Accepted
    } else {
        RemoteStartStopStatus::Rejected
    };
    Ok(serde_json::to_value(RemoteStartTransactionResponse { status }).unwrap())
}

fn remote_stop_transaction(ctx: &mut SessionContext, payload: Value) -> HandlerResult {
    let req: RemoteStopTransactionRequest = parse(payload)?;

    let matches_active = ctx.session.active_transaction_id == Some(req.transaction_id);
    let state_permits = matches!(
        ctx.state_machine.current(),
        SessionState::Charging | SessionState::SuspendedEvse | SessionState::SuspendedEv
    );

    let accepted = matches_active && state_permits;
    if accepted {
        ctx.queue(AsyncAction::StopTransaction {
            reason: StopReason::Remote,
        });
    }

    let status = if accepted {
        RemoteStartStopStatus::Accepted
    } else {
        RemoteStartStopStatus::Rejected
    };
    Ok(serde_json::to_value(RemoteStopTransactionResponse { status }).unwrap())
}

fn reserve_now(ctx: &mut SessionContext, payload: Value) -> HandlerResult {
    let req: ReserveNowRequest = parse(payload)?;

    let status = if req.expiry_date <= Utc::now() {
        ReservationStatus::Rejected
    } else {
        match ctx.state_machine.current() {
            SessionState::Faulted => ReservationStatus::Faulted,
            SessionState::Unavailable => ReservationStatus::Unavailable,
            SessionState::Available | SessionState::Parked | SessionState::BootAccepted => {
                ctx.reservations
                    .install(req.reservation_id, req.id_tag, req.expiry_date);
                if ctx.state_machine.transition(SessionState::Reserved).is_ok() {
                    ctx.queue(AsyncAction::SendStatusNotification);
                }
                ReservationStatus::Accepted
            }
            _ => ReservationStatus::Occupied,
        }
    };

    Ok(serde_json::to_value(ReserveNowResponse { status }).unwrap())
}

fn cancel_reservation(ctx: &mut SessionContext, payload: Value) -> HandlerResult {
    let req: CancelReservationRequest = parse(payload)?;

    let status = if ctx.reservations.cancel_by_id(req.reservation_id) {
        if ctx.state_machine.current() == SessionState::Reserved
            && ctx.state_machine.transition(SessionState::Available).is_ok()
        {
            ctx.queue(AsyncAction::SendStatusNotification);
        }
        CancelReservationStatus::Accepted
    } else {
        CancelReservationStatus::Rejected
    };

    Ok(serde_json::to_value(CancelReservationResponse { status }).unwrap())
}

fn set_charging_profile(ctx: &mut SessionContext, payload: Value) -> HandlerResult {
    let req: SetChargingProfileRequest = parse(payload)?;

    let status = if req.cs_charging_profiles.charging_profile_purpose
        == ChargingProfilePurpose::TxProfile
        && ctx.session.active_transaction_id.is_none()
    {
        ChargingProfileStatus::Rejected
    } else {
        match ctx
            .scp
            .install(req.cs_charging_profiles, ctx.session.active_transaction_id)
        {
            Ok(()) => ChargingProfileStatus::Accepted,
            Err(_) => ChargingProfileStatus::Rejected,
        }
    };

    Ok(serde_json::to_value(SetChargingProfileResponse { status }).unwrap())
}

fn clear_charging_profile(ctx: &mut SessionContext, payload: Value) -> HandlerResult {
    let req: ClearChargingProfileRequest = parse(payload)?;
    let removed = ctx
        .scp
        .clear(req.id, req.charging_profile_purpose, req.stack_level);

    let status = if removed > 0 {
        ClearChargingProfileStatus::Accepted
    } else {
        ClearChargingProfileStatus::Unknown
    };
    Ok(serde_json::to_value(ClearChargingProfileResponse { status }).unwrap())
}

fn get_composite_schedule(ctx: &mut SessionContext, payload: Value) -> HandlerResult {
    let req: GetCompositeScheduleRequest = parse(payload)?;
    let schedule = ctx.scp.composite_schedule(
        Utc::now(),
        req.duration,
        ctx.timezone,
        ctx.session.max_power_kw * 1000.0,
        req.charging_rate_unit.unwrap_or(ChargingRateUnit::W),
    );

    Ok(serde_json::to_value(GetCompositeScheduleResponse {
        status: GetCompositeScheduleStatus::Accepted,
        connector_id: Some(req.connector_id),
        schedule_start: schedule.start_schedule,
        charging_schedule: Some(schedule),
    })
    .unwrap())
}

fn get_configuration(ctx: &mut SessionContext, payload: Value) -> HandlerResult {
    let req: GetConfigurationRequest = parse(payload)?;

    let mut configuration_key = Vec::new();
    let mut unknown_key = Vec::new();

    match req.key {
        Some(keys) => {
            for key in keys {
                match ctx.config_registry.get(&key) {
                    Some((value, readonly)) => configuration_key.push(ConfigurationKeyValue {
                        key: key.clone(),
                        readonly: *readonly,
                        value: Some(value.clone()),
                    }),
                    None => unknown_key.push(key),
                }
            }
        }
        None => {
            for (key, (value, readonly)) in &ctx.config_registry {
                configuration_key.push(ConfigurationKeyValue {
                    key: key.clone(),
                    readonly: *readonly,
                    value: Some(value.clone()),
                });
            }
        }
    }

    Ok(serde_json::to_value(GetConfigurationResponse {
        configuration_key,
        unknown_key,
    })
    .unwrap())
}

fn change_configuration(ctx: &mut SessionContext, payload: Value) -> HandlerResult {
    let req: ChangeConfigurationRequest = parse(payload)?;

    let status = match ctx.config_registry.get(&req.key) {
        Some((_, true)) => ConfigurationStatus::Rejected,
        Some(_) => {
            ctx.config_registry
                .insert(req.key.clone(), (req.value.clone(), false));
            if req.key == "HeartbeatInterval" {
                if let Ok(v) = req.value.parse() {
                    ctx.session.heartbeat_interval_secs = v;
                }
            }
            ConfigurationStatus::Accepted
        }
        None => ConfigurationStatus::NotSupported,
    };

    Ok(serde_json::to_value(ChangeConfigurationResponse { status }).unwrap())
}

fn change_availability(ctx: &mut SessionContext, payload: Value) -> HandlerResult {
    let req: ChangeAvailabilityRequest = parse(payload)?;

    let status = if req.availability_type == AvailabilityType::Inoperative
        && ctx.session.in_transaction()
    {
        AvailabilityStatus::Scheduled
    } else {
        ctx.available_for_operator_use = req.availability_type == AvailabilityType::Operative;
        AvailabilityStatus::Accepted
    };

    Ok(serde_json::to_value(ChangeAvailabilityResponse { status }).unwrap())
}

fn reset(ctx: &mut SessionContext, payload: Value) -> HandlerResult {
    let req: ResetRequest = parse(payload)?;

    if req.reset_type == ResetType::Hard && ctx.session.in_transaction() {
        ctx.queue(AsyncAction::StopTransaction {
            reason: StopReason::HardReset,
        });
    }
    ctx.queue(AsyncAction::ReconnectTransport);
    ctx.queue(AsyncAction::SendBootNotification);

    Ok(serde_json::to_value(ResetResponse {
        status: ResetStatus::Accepted,
    })
    .unwrap())
}

fn unlock_connector(ctx: &mut SessionContext, payload: Value) -> HandlerResult {
    let _req: UnlockConnectorRequest = parse(payload)?;

    let status = if ctx.state_machine.current() == SessionState::Charging {
        UnlockStatus::UnlockFailed
    } else {
        UnlockStatus::Unlocked
    };
    Ok(serde_json::to_value(UnlockConnectorResponse { status }).unwrap())
}

fn trigger_message(ctx: &mut SessionContext, payload: Value) -> HandlerResult {
    let req: TriggerMessageRequest = parse(payload)?;

    let status = match req.requested_message.as_str() {
        "BootNotification" => {
            ctx.queue(AsyncAction::SendBootNotification);
            TriggerMessageStatus::Accepted
        }
        "Heartbeat" => {
            ctx.queue(AsyncAction::SendHeartbeat);
            TriggerMessageStatus::Accepted
        }
        "StatusNotification" => {
            ctx.queue(AsyncAction::SendStatusNotification);
            TriggerMessageStatus::Accepted
        }
        _ => TriggerMessageStatus::NotImplemented,
    };

    Ok(serde_json::to_value(TriggerMessageResponse { status }).unwrap())
}

fn data_transfer(_ctx: &mut SessionContext, payload: Value) -> HandlerResult {
    let _req: DataTransferRequest = parse(payload)?;
    Ok(serde_json::to_value(DataTransferResponse {
        status: DataTransferStatus::Accepted,
        data: None,
    })
    .unwrap())
}

/// Build the stateless action -> handler dispatch table. One instance is
/// shared (by value, it's just function pointers) across every session.
pub fn build_registry() -> HashMap<&'static str, Handler> {
    let mut registry: HashMap<&'static str, Handler> = HashMap::new();
    registry.insert("RemoteStartTransaction", remote_start_transaction);
    registry.insert("RemoteStopTransaction", remote_stop_transaction);
    registry.insert("ReserveNow", reserve_now);
    registry.insert("CancelReservation", cancel_reservation);
    registry.insert("SetChargingProfile", set_charging_profile);
    registry.insert("ClearChargingProfile", clear_charging_profile);
    registry.insert("GetCompositeSchedule", get_composite_schedule);
    registry.insert("GetConfiguration", get_configuration);
    registry.insert("ChangeConfiguration", change_configuration);
    registry.insert("ChangeAvailability", change_availability);
    registry.insert("Reset", reset);
    registry.insert("UnlockConnector", unlock_connector);
    registry.insert("TriggerMessage", trigger_message);
    registry.insert("DataTransfer", data_transfer);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::record::{ChargerKind, Session};
    use chrono::Duration;

    fn ctx() -> SessionContext {
        let session = Session::new(
            "CP-A",
            1,
            "ws://localhost/ocpp",
            ChargerKind::AcTri,
            "generic-60kwh",
        );
        SessionContext::new(session, chrono_tz::UTC)
    }

    #[test]
    fn remote_start_rejected_when_no_reservation_and_not_available() {
        let mut context = ctx();
        let registry = build_registry();
        let handler = registry["RemoteStartTransaction"];
        let payload = serde_json::json!({"idTag": "TAG_Y"});
        let resp = handler(&mut context, payload).unwrap();
        assert_eq!(resp["status"], "Rejected");
    }

    #[test]
    fn reservation_scenario_c() {
        let mut context = ctx();
        context.state_machine.transition(SessionState::Connecting).unwrap();
        context.state_machine.transition(SessionState::Connected).unwrap();
        context.state_machine.transition(SessionState::BootAccepted).unwrap();
        context.state_machine.transition(SessionState::Available).unwrap();

        let registry = build_registry();
        let reserve = registry["ReserveNow"];
        let resp = reserve(
            &mut context,
            serde_json::json!({
                "connectorId": 1,
                "expiryDate": (Utc::now() + Duration::minutes(5)).to_rfc3339(),
                "idTag": "TAG_X",
                "reservationId": 42
            }),
        )
        .unwrap();
        assert_eq!(resp["status"], "Accepted");
        assert_eq!(context.state_machine.current(), SessionState::Reserved);

        let start = registry["RemoteStartTransaction"];
        let rejected = start(&mut context, serde_json::json!({"idTag": "TAG_Y"})).unwrap();
        assert_eq!(rejected["status"], "Rejected");

        let accepted = start(&mut context, serde_json::json!({"idTag": "TAG_X"})).unwrap();
        assert_eq!(accepted["status"], "Accepted");
    }

    #[test]
    fn unlock_connector_fails_while_charging() {
        let mut context = ctx();
        context.state_machine.transition(SessionState::Connecting).unwrap();
        context.state_machine.transition(SessionState::Connected).unwrap();
        context.state_machine.transition(SessionState::BootAccepted).unwrap();
        context.state_machine.transition(SessionState::Plugged).unwrap();
        context.state_machine.transition(SessionState::Authorizing).unwrap();
        context.state_machine.transition(SessionState::Authorized).unwrap();
        context.state_machine.transition(SessionState::Starting).unwrap();
        context.state_machine.transition(SessionState::Charging).unwrap();

        let registry = build_registry();
        let unlock = registry["UnlockConnector"];
        let resp = unlock(&mut context, serde_json::json!({"connectorId": 1})).unwrap();
        assert_eq!(resp["status"], "UnlockFailed");
    }

    #[test]
    fn clear_charging_profile_is_idempotent() {
        let mut context = ctx();
        let registry = build_registry();
        let set = registry["SetChargingProfile"];
        context.session.active_transaction_id = Some(1);
        set(
            &mut context,
            serde_json::json!({
                "connectorId": 1,
                "csChargingProfiles": {
                    "chargingProfileId": 7,
                    "stackLevel": 1,
                    "chargingProfilePurpose": "TxProfile",
                    "chargingProfileKind": "Absolute",
                    "chargingSchedule": {
                        "chargingRateUnit": "W",
                        "chargingSchedulePeriod": [{"startPeriod": 0, "limit": 6000.0}]
                    }
                }
            }),
        )
        .unwrap();

        let clear = registry["ClearChargingProfile"];
        let first = clear(&mut context, serde_json::json!({"id": 7})).unwrap();
        let second = clear(&mut context, serde_json::json!({"id": 7})).unwrap();
        assert_eq!(first["status"], "Accepted");
        assert_eq!(second["status"], "Unknown");
    }
}
