//! Smart-Charging-Profile store and composite-schedule resolution.
//!
//! Held per session, single-writer (mutated only from inbound handlers
//! running on that session's own task), so a flat `Vec`/`Option` sweep is
//! enough — no concurrent access, no recursion.

use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::ConfigurationError;
use crate::ocpp::messages::{
    ChargingProfile, ChargingProfileKindType, ChargingProfilePurpose, ChargingRateUnit,
    ChargingSchedule, ChargingSchedulePeriod, RecurrencyKind,
};

const NOMINAL_VOLTAGE_V: f64 = 230.0;

fn limit_to_watts(unit: ChargingRateUnit, limit: f64, phases: u8) -> f64 {
    match unit {
        ChargingRateUnit::W => limit,
        ChargingRateUnit::A => limit * NOMINAL_VOLTAGE_V * phases.max(1) as f64,
    }
}

/// Per-session store holding at most one profile per purpose slot (a
/// `Vec` for TxDefaultProfile since several stack levels may coexist).
#[derive(Debug, Default, Clone)]
pub struct ScpStore {
    charge_point_max: Option<ChargingProfile>,
    tx_default: Vec<ChargingProfile>,
    tx_profile: Option<ChargingProfile>,
}

impl ScpStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a profile, replacing any existing one with the same
    /// (purpose, stackLevel, chargingProfileId). Rejects a TxProfile when
    /// there is no active transaction to attach it to.
    pub fn install(
        &mut self,
        profile: ChargingProfile,
        active_transaction_id: Option<i64>,
    ) -> Result<(), ConfigurationError> {
        match profile.charging_profile_purpose {
            ChargingProfilePurpose::ChargePointMaxProfile => {
                self.charge_point_max = Some(profile);
            }
            ChargingProfilePurpose::TxDefaultProfile => {
                self.tx_default.retain(|p| {
                    !(p.stack_level == profile.stack_level
                        && p.charging_profile_id == profile.charging_profile_id)
                });
                self.tx_default.push(profile);
            }
            ChargingProfilePurpose::TxProfile => {
                if active_transaction_id.is_none() {
                    return Err(ConfigurationError::InvalidProfile(
                        "TxProfile requires an active transaction".to_string(),
                    ));
                }
                self.tx_profile = Some(profile);
            }
        }
        Ok(())
    }

    /// Clear profiles matching the given selector (any subset of fields).
    /// Returns how many were removed.
    pub fn clear(
        &mut self,
        id: Option<i32>,
        purpose: Option<ChargingProfilePurpose>,
        stack_level: Option<i32>,
    ) -> usize {
        let matches = |p: &ChargingProfile| {
            id.map_or(true, |v| v == p.charging_profile_id)
                && purpose.map_or(true, |v| v == p.charging_profile_purpose)
                && stack_level.map_or(true, |v| v == p.stack_level)
        };

        let mut removed = 0;
        if let Some(p) = &self.charge_point_max {
            if matches(p) {
                self.charge_point_max = None;
                removed += 1;
            }
        }
        if let Some(p) = &self.tx_profile {
            if matches(p) {
                self.tx_profile = None;
                removed += 1;
            }
        }
        let before = self.tx_default.len();
        self.tx_default.retain(|p| !matches(p));
        removed += before - self.tx_default.len();
        removed
    }

    fn active_window(profile: &ChargingProfile, t: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        if let Some(from) = profile.valid_from {
            if t < from {
                return None;
            }
        }
        if let Some(to) = profile.valid_to {
            if t > to {
                return None;
            }
        }
        match profile.charging_profile_kind {
            ChargingProfileKindType::Absolute | ChargingProfileKindType::Relative => {
                profile.charging_schedule.start_schedule.or(profile.valid_from)
            }
            ChargingProfileKindType::Recurring => {
                let local = t.with_timezone(&tz);
                let anchor_local = match profile.recurrency_kind {
                    Some(RecurrencyKind::Daily) | None => local
                        .date_naive()
                        .and_hms_opt(0, 0, 0)
                        .unwrap()
                        .and_local_timezone(tz)
                        .single(),
                    Some(RecurrencyKind::Weekly) => {
                        let days_since_monday = local.weekday().num_days_from_monday();
                        (local.date_naive() - chrono::Duration::days(days_since_monday as i64))
                            .and_hms_opt(0, 0, 0)
                            .unwrap()
                            .and_local_timezone(tz)
                            .single()
                    }
                };
                anchor_local.map(|a| a.with_timezone(&Utc))
            }
        }
    }

    /// The limit (in watts) a single schedule contributes at instant `t`,
    /// if its activation window covers `t` and it has a defined period.
    fn schedule_limit_w(
        profile: &ChargingProfile,
        t: DateTime<Utc>,
        tz: Tz,
    ) -> Option<f64> {
        let anchor = Self::active_window(profile, t, tz)?;
        let elapsed = (t - anchor).num_seconds();
        if elapsed < 0 {
            return None;
        }
        if let Some(duration) = profile.charging_schedule.duration {
            if elapsed > duration {
                return None;
            }
        }
        let periods = &profile.charging_schedule.charging_schedule_period;
        let mut applicable: Option<&ChargingSchedulePeriod> = None;
        for period in periods {
            if period.start_period <= elapsed {
                applicable = Some(period);
            }
        }
        applicable.map(|p| {
            limit_to_watts(
                profile.charging_schedule.charging_rate_unit,
                p.limit,
                p.number_phases.unwrap_or(3) as u8,
            )
        })
    }

    /// Resolve the effective ceiling (watts) at instant `t`, sweeping
    /// purposes most-specific to least, within a purpose taking the
    /// highest stack level whose window covers `t`.
    pub fn instantaneous_limit_w(&self, t: DateTime<Utc>, tz: Tz, station_max_w: f64) -> f64 {
        let mut ceiling = station_max_w;

        if let Some(p) = &self.tx_profile {
            if let Some(w) = Self::schedule_limit_w(p, t, tz) {
                ceiling = ceiling.min(w);
            }
        }

        if let Some(w) = self
            .tx_default
            .iter()
            .filter_map(|p| Self::schedule_limit_w(p, t, tz).map(|w| (p.stack_level, w)))
            .max_by_key(|(level, _)| *level)
            .map(|(_, w)| w)
        {
            ceiling = ceiling.min(w);
        }

        if let Some(p) = &self.charge_point_max {
            if let Some(w) = Self::schedule_limit_w(p, t, tz) {
                ceiling = ceiling.min(w);
            }
        }

        ceiling
    }

    /// Piecewise-constant composite schedule over `[now, now + duration_secs]`.
    pub fn composite_schedule(
        &self,
        now: DateTime<Utc>,
        duration_secs: i64,
        tz: Tz,
        station_max_w: f64,
        rate_unit: ChargingRateUnit,
    ) -> ChargingSchedule {
        // Sample at every period boundary that could change the ceiling,
        // plus t=0, to build a piecewise-constant schedule.
        let mut boundaries = vec![0i64];
        for profile in self
            .tx_profile
            .iter()
            .chain(self.tx_default.iter())
            .chain(self.charge_point_max.iter())
        {
            if let Some(anchor) = Self::active_window(profile, now, tz) {
                for period in &profile.charging_schedule.charging_schedule_period {
                    let offset = (anchor - now).num_seconds() + period.start_period;
                    if offset >= 0 && offset <= duration_secs {
                        boundaries.push(offset);
                    }
                }
            }
        }
        boundaries.sort_unstable();
        boundaries.dedup();

        let mut periods = Vec::new();
        let mut last_limit: Option<f64> = None;
        for offset in boundaries {
            let t = now + chrono::Duration::seconds(offset);
            let limit_w = self.instantaneous_limit_w(t, tz, station_max_w);
            if Some(limit_w) != last_limit {
                let limit = match rate_unit {
                    ChargingRateUnit::W => limit_w,
                    ChargingRateUnit::A => limit_w / NOMINAL_VOLTAGE_V / 3.0,
                };
                periods.push(ChargingSchedulePeriod {
                    start_period: offset,
                    limit,
                    number_phases: None,
                });
                last_limit = Some(limit_w);
            }
        }
        if periods.is_empty() {
            let limit_w = self.instantaneous_limit_w(now, tz, station_max_w);
            periods.push(ChargingSchedulePeriod {
                start_period: 0,
                limit: limit_w,
                number_phases: None,
            });
        }

        ChargingSchedule {
            duration: Some(duration_secs),
            start_schedule: Some(now),
            charging_rate_unit: rate_unit,
            charging_schedule_period: periods,
            min_charging_rate: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(
        id: i32,
        purpose: ChargingProfilePurpose,
        stack_level: i32,
        limit_w: f64,
    ) -> ChargingProfile {
        ChargingProfile {
            charging_profile_id: id,
            transaction_id: None,
            stack_level,
            charging_profile_purpose: purpose,
            charging_profile_kind: ChargingProfileKindType::Absolute,
            recurrency_kind: None,
            valid_from: None,
            valid_to: None,
            charging_schedule: ChargingSchedule {
                duration: None,
                start_schedule: Some(Utc::now() - chrono::Duration::seconds(1)),
                charging_rate_unit: ChargingRateUnit::W,
                charging_schedule_period: vec![ChargingSchedulePeriod {
                    start_period: 0,
                    limit: limit_w,
                    number_phases: None,
                }],
                min_charging_rate: None,
            },
        }
    }

    #[test]
    fn tx_profile_clamps_below_station_max() {
        let mut store = ScpStore::new();
        store
            .install(
                profile(1, ChargingProfilePurpose::TxProfile, 1, 6000.0),
                Some(7),
            )
            .unwrap();

        let limit = store.instantaneous_limit_w(Utc::now(), Tz::UTC, 11_000.0);
        assert!((limit - 6000.0).abs() < 10.0);
    }

    #[test]
    fn tx_profile_cannot_raise_the_limit_above_charge_point_max() {
        let mut store = ScpStore::new();
        store
            .install(
                profile(1, ChargingProfilePurpose::ChargePointMaxProfile, 0, 7_000.0),
                None,
            )
            .unwrap();
        store
            .install(
                profile(2, ChargingProfilePurpose::TxProfile, 1, 9_000.0),
                Some(7),
            )
            .unwrap();

        let limit = store.instantaneous_limit_w(Utc::now(), Tz::UTC, 11_000.0);
        assert!((limit - 7_000.0).abs() < 10.0);
    }

    #[test]
    fn tx_profile_without_transaction_is_rejected() {
        let mut store = ScpStore::new();
        let err = store.install(
            profile(1, ChargingProfilePurpose::TxProfile, 1, 6000.0),
            None,
        );
        assert!(err.is_err());
    }

    #[test]
    fn no_profile_falls_back_to_station_max() {
        let store = ScpStore::new();
        let limit = store.instantaneous_limit_w(Utc::now(), Tz::UTC, 11_000.0);
        assert_eq!(limit, 11_000.0);
    }

    #[test]
    fn clear_is_idempotent() {
        let mut store = ScpStore::new();
        store
            .install(
                profile(5, ChargingProfilePurpose::TxDefaultProfile, 0, 5000.0),
                None,
            )
            .unwrap();
        let first = store.clear(Some(5), None, None);
        let second = store.clear(Some(5), None, None);
        assert_eq!(first, 1);
        assert_eq!(second, 0);
    }

    #[test]
    fn higher_stack_level_wins_within_purpose() {
        let mut store = ScpStore::new();
        store
            .install(
                profile(1, ChargingProfilePurpose::TxDefaultProfile, 0, 8000.0),
                None,
            )
            .unwrap();
        store
            .install(
                profile(2, ChargingProfilePurpose::TxDefaultProfile, 5, 4000.0),
                None,
            )
            .unwrap();

        let limit = store.instantaneous_limit_w(Utc::now(), Tz::UTC, 11_000.0);
        assert!((limit - 4000.0).abs() < 10.0);
    }

    #[test]
    fn composite_schedule_matches_instantaneous_limit_at_every_period_boundary() {
        let mut store = ScpStore::new();
        store
            .install(
                profile(1, ChargingProfilePurpose::TxDefaultProfile, 0, 6000.0),
                None,
            )
            .unwrap();

        let now = Utc::now();
        let schedule = store.composite_schedule(now, 300, Tz::UTC, 11_000.0, ChargingRateUnit::W);

        for period in &schedule.charging_schedule_period {
            let t = now + chrono::Duration::seconds(period.start_period);
            let expected = store.instantaneous_limit_w(t, Tz::UTC, 11_000.0);
            assert!((period.limit - expected).abs() < 10.0);
        }
    }
}
