//! Physics & metering engine — advances SoC/energy once per tick,
//! consulting the SCP ceiling, the vehicle's charging curve, and the
//! station's own maxima.

use chrono_tz::Tz;

use crate::scp::ScpStore;
use crate::session::record::{Session, VehicleProfile};
use crate::utils::IntegerEnergy;

const POWER_EPSILON_W: f64 = 10.0;

#[derive(Debug, Clone, Copy)]
pub enum ChargingOutcome {
    Charging { power_kw: f64 },
    Suspended,
    TargetReached,
}

/// One tick of the physics model. Mutates `session`'s energy register,
/// current SoC, and applied power in place; returns the outcome so the
/// supervisor can drive any resulting state transition.
pub fn tick(
    session: &mut Session,
    vehicle: &VehicleProfile,
    scp: &ScpStore,
    tz: Tz,
    station_max_kw: f64,
    delta_seconds: f64,
) -> ChargingOutcome {
    let now = chrono::Utc::now();
    let dc = session.is_dc();

    let p_scp_kw = scp.instantaneous_limit_w(now, tz, station_max_kw * 1000.0) / 1000.0;
    let p_vehicle_kw = vehicle.power_at_soc_kw(session.current_soc_percent, dc);
    let p_station_kw = session.max_power_kw.min(station_max_kw);

    let p_kw = p_scp_kw.min(p_vehicle_kw).min(p_station_kw).max(0.0);
    let p_w = p_kw * 1000.0;

    if p_w <= POWER_EPSILON_W {
        session.applied_power_kw = 0.0;
        session.applied_current_a = 0.0;
        return ChargingOutcome::Suspended;
    }

    let eta = vehicle.efficiency(dc);
    let mut energy = IntegerEnergy::from_watt_hours(session.energy_register_wh as f64);
    energy.accumulate(p_w * eta, delta_seconds);
    session.energy_register_wh = energy.to_wh_rounded();

    let delta_energy_wh = p_w * eta * delta_seconds / 3600.0;
    let delta_soc = (delta_energy_wh / 1000.0) / vehicle.battery_capacity_kwh * 100.0;
    let ceiling_soc = session.target_soc_percent.min(100.0);
    session.current_soc_percent = (session.current_soc_percent + delta_soc).min(ceiling_soc);

    session.applied_power_kw = p_kw;
    session.applied_current_a = if session.nominal_phase_count > 0 {
        p_w / (230.0 * session.nominal_phase_count as f64)
    } else {
        p_w / 400.0
    };

    if session.current_soc_percent >= session.target_soc_percent - f64::EPSILON {
        ChargingOutcome::TargetReached
    } else {
        ChargingOutcome::Charging { power_kw: p_kw }
    }
}
