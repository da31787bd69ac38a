//! Sunrise/sunset computation and the per-day trigger cache.
//!
//! Event instants come from the standard sunrise equation evaluated in UTC;
//! no network service is involved. The scheduler caches one local calendar
//! day worth of instants and fires each event at most once per day.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate};

use crate::config::ControllerState;
use crate::types::SunStatus;

/// Unadjusted UTC event instants for one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SolarEvents {
    pub sunrise_epoch: i64,
    pub sunset_epoch: i64,
}

const UNIX_EPOCH_DAYS_FROM_CE: i64 = 719_163;
const JDN_UNIX_EPOCH: f64 = 2_440_588.0;
const J2000: f64 = 2_451_545.0;
const EARTH_OBLIQUITY_DEG: f64 = 23.4397;
const SUN_ALTITUDE_DEG: f64 = -0.833;

fn julian_to_epoch(julian: f64) -> i64 {
    ((julian - 2_440_587.5) * 86_400.0).round() as i64
}

/// Sunrise equation for the given date and coordinates. Returns `None` for
/// polar day and polar night, where the sun never crosses the horizon.
pub fn solar_events_utc(date: NaiveDate, latitude: f64, longitude: f64) -> Option<SolarEvents> {
    let days_since_epoch = i64::from(date.num_days_from_ce()) - UNIX_EPOCH_DAYS_FROM_CE;
    let jdn_noon = days_since_epoch as f64 + JDN_UNIX_EPOCH;

    let n = jdn_noon - J2000 + 0.0008;
    // East longitudes see solar noon earlier in UTC.
    let j_star = n - longitude / 360.0;

    let mean_anomaly = (357.5291 + 0.985_600_28 * j_star).rem_euclid(360.0);
    let m_rad = mean_anomaly.to_radians();
    let center =
        1.9148 * m_rad.sin() + 0.02 * (2.0 * m_rad).sin() + 0.0003 * (3.0 * m_rad).sin();
    let ecliptic_longitude = (mean_anomaly + center + 180.0 + 102.9372).rem_euclid(360.0);
    let lambda_rad = ecliptic_longitude.to_radians();

    let j_transit = J2000 + j_star + 0.0053 * m_rad.sin() - 0.0069 * (2.0 * lambda_rad).sin();

    let sin_declination = lambda_rad.sin() * EARTH_OBLIQUITY_DEG.to_radians().sin();
    let cos_declination = sin_declination.asin().cos();
    let phi = latitude.to_radians();

    let cos_hour_angle = (SUN_ALTITUDE_DEG.to_radians().sin() - phi.sin() * sin_declination)
        / (phi.cos() * cos_declination);
    if !(-1.0..=1.0).contains(&cos_hour_angle) {
        return None;
    }
    let hour_angle = cos_hour_angle.acos().to_degrees();

    Some(SolarEvents {
        sunrise_epoch: julian_to_epoch(j_transit - hour_angle / 360.0),
        sunset_epoch: julian_to_epoch(j_transit + hour_angle / 360.0),
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SunTriggers {
    pub sunrise: bool,
    pub sunset: bool,
}

impl SunTriggers {
    pub fn any(self) -> bool {
        self.sunrise || self.sunset
    }
}

/// Per-day cache of offset-adjusted event instants plus fired latches.
///
/// Recomputation happens at most once per local calendar day unless the
/// cache is explicitly invalidated. Fired latches are re-seeded from the
/// current time only when the cached day changes, so a boot or reconnect in
/// the middle of the day does not replay events that already passed, while
/// a same-day settings change cannot make an event fire twice.
pub struct SunScheduler {
    valid: bool,
    cached_year: i32,
    cached_ordinal: u32,
    events: Option<(i64, i64)>,
    sunrise_fired: bool,
    sunset_fired: bool,
}

impl SunScheduler {
    pub fn new() -> Self {
        Self {
            valid: false,
            cached_year: 0,
            cached_ordinal: 0,
            events: None,
            sunrise_fired: false,
            sunset_fired: false,
        }
    }

    /// Drops the cached instants. Called after any settings change that
    /// affects the schedule and after wall-clock sync is lost.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn status(&self, state: &ControllerState) -> SunStatus {
        SunStatus {
            enabled: state.sun_schedule_enabled,
            cache_valid: self.valid,
            events_available: self.events.is_some(),
            sunrise_epoch: self.events.map(|(sunrise, _)| sunrise),
            sunset_epoch: self.events.map(|(_, sunset)| sunset),
            sunrise_fired: self.sunrise_fired,
            sunset_fired: self.sunset_fired,
            sunrise_target_percent: state.sunrise_target_percent,
            sunset_target_percent: state.sunset_target_percent,
        }
    }

    /// Refreshes the cache if needed and reports which events crossed their
    /// instant since the last call. Both may fire in the same call when the
    /// controller was unable to evaluate for a long stretch.
    pub fn evaluate(
        &mut self,
        state: &ControllerState,
        wall: DateTime<FixedOffset>,
    ) -> SunTriggers {
        if !state.sun_schedule_enabled {
            return SunTriggers::default();
        }

        let date = wall.date_naive();
        let day_changed =
            self.cached_year != date.year() || self.cached_ordinal != date.ordinal();
        if !self.valid || day_changed {
            self.refresh(state, date, wall.timestamp(), day_changed);
        }

        let now = wall.timestamp();
        let mut triggers = SunTriggers::default();
        if let Some((sunrise_at, sunset_at)) = self.events {
            if !self.sunrise_fired && now >= sunrise_at {
                self.sunrise_fired = true;
                triggers.sunrise = true;
            }
            if !self.sunset_fired && now >= sunset_at {
                self.sunset_fired = true;
                triggers.sunset = true;
            }
        }
        triggers
    }

    fn refresh(&mut self, state: &ControllerState, date: NaiveDate, now: i64, day_changed: bool) {
        self.events = solar_events_utc(date, state.latitude, state.longitude).map(|events| {
            (
                events.sunrise_epoch + i64::from(state.sunrise_offset_minutes) * 60,
                events.sunset_epoch + i64::from(state.sunset_offset_minutes) * 60,
            )
        });
        if day_changed {
            // Events already in the past on a fresh day are treated as
            // missed, not replayed.
            match self.events {
                Some((sunrise_at, sunset_at)) => {
                    self.sunrise_fired = now >= sunrise_at;
                    self.sunset_fired = now >= sunset_at;
                }
                None => {
                    self.sunrise_fired = false;
                    self.sunset_fired = false;
                }
            }
        }
        self.cached_year = date.year();
        self.cached_ordinal = date.ordinal();
        self.valid = true;
    }
}

impl Default for SunScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike, Utc};

    fn utc_wall(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<FixedOffset> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap().fixed_offset()
    }

    fn equator_state() -> ControllerState {
        ControllerState {
            sun_schedule_enabled: true,
            calibrated: true,
            latitude: 0.0,
            longitude: 0.0,
            ..ControllerState::default()
        }
    }

    #[test]
    fn equator_equinox_is_close_to_six_and_eighteen_utc() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 20).unwrap();
        let events = solar_events_utc(date, 0.0, 0.0).unwrap();

        let sunrise = DateTime::from_timestamp(events.sunrise_epoch, 0).unwrap();
        let hour = sunrise.hour() as f64 + sunrise.minute() as f64 / 60.0;
        assert!(hour > 5.5 && hour < 6.5, "sunrise at {hour:.2}h UTC");

        let day_len_hours = (events.sunset_epoch - events.sunrise_epoch) as f64 / 3600.0;
        assert!(
            (12.0..12.4).contains(&day_len_hours),
            "day length {day_len_hours:.2}h"
        );
    }

    #[test]
    fn high_latitude_solstices_have_no_events() {
        let summer = NaiveDate::from_ymd_opt(2026, 6, 21).unwrap();
        assert!(solar_events_utc(summer, 78.0, 15.0).is_none());

        let winter = NaiveDate::from_ymd_opt(2026, 12, 21).unwrap();
        assert!(solar_events_utc(winter, 78.0, 15.0).is_none());
    }

    #[test]
    fn longitude_shifts_events_west() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 20).unwrap();
        let greenwich = solar_events_utc(date, 0.0, 0.0).unwrap();
        // 90 degrees west rises six hours later in UTC.
        let west = solar_events_utc(date, 0.0, -90.0).unwrap();
        let shift_hours = (west.sunrise_epoch - greenwich.sunrise_epoch) as f64 / 3600.0;
        assert!((5.8..6.2).contains(&shift_hours), "shift {shift_hours:.2}h");
    }

    #[test]
    fn moscow_midsummer_day_is_long() {
        let date = NaiveDate::from_ymd_opt(2026, 6, 21).unwrap();
        let events = solar_events_utc(date, 55.75, 37.62).unwrap();
        let day_len_hours = (events.sunset_epoch - events.sunrise_epoch) as f64 / 3600.0;
        assert!(
            (16.5..18.5).contains(&day_len_hours),
            "day length {day_len_hours:.2}h"
        );

        // Absolute UTC instants, not just the spread: sunrise around
        // 00:45 UTC (03:45 local) and transit around 09:30 UTC.
        let sunrise = DateTime::from_timestamp(events.sunrise_epoch, 0).unwrap();
        let sunrise_hour = sunrise.hour() as f64 + sunrise.minute() as f64 / 60.0;
        assert!(
            (0.25..1.25).contains(&sunrise_hour),
            "sunrise at {sunrise_hour:.2}h UTC"
        );

        let transit_hour =
            (events.sunrise_epoch + events.sunset_epoch) as f64 / 2.0 % 86_400.0 / 3600.0;
        assert!(
            (9.0..10.0).contains(&transit_hour),
            "transit at {transit_hour:.2}h UTC"
        );
    }

    #[test]
    fn each_event_fires_exactly_once_per_day() {
        let state = equator_state();
        let mut scheduler = SunScheduler::new();

        assert!(!scheduler.evaluate(&state, utc_wall(2026, 3, 20, 0, 10)).any());

        let midday = scheduler.evaluate(&state, utc_wall(2026, 3, 20, 12, 0));
        assert!(midday.sunrise);
        assert!(!midday.sunset);

        assert!(!scheduler.evaluate(&state, utc_wall(2026, 3, 20, 12, 1)).any());

        let evening = scheduler.evaluate(&state, utc_wall(2026, 3, 20, 23, 0));
        assert!(!evening.sunrise);
        assert!(evening.sunset);

        assert!(!scheduler.evaluate(&state, utc_wall(2026, 3, 20, 23, 30)).any());
    }

    #[test]
    fn both_events_fire_in_one_evaluation_after_a_gap() {
        let state = equator_state();
        let mut scheduler = SunScheduler::new();
        scheduler.evaluate(&state, utc_wall(2026, 3, 20, 0, 10));

        let late = scheduler.evaluate(&state, utc_wall(2026, 3, 20, 23, 0));
        assert!(late.sunrise);
        assert!(late.sunset);
    }

    #[test]
    fn first_evaluation_midday_does_not_replay_past_events() {
        let state = equator_state();
        let mut scheduler = SunScheduler::new();

        assert!(!scheduler.evaluate(&state, utc_wall(2026, 3, 20, 12, 0)).any());
        let status = scheduler.status(&state);
        assert!(status.sunrise_fired);
        assert!(!status.sunset_fired);

        assert!(scheduler.evaluate(&state, utc_wall(2026, 3, 20, 23, 0)).sunset);
    }

    #[test]
    fn same_day_invalidation_preserves_fired_latches() {
        let state = equator_state();
        let mut scheduler = SunScheduler::new();
        scheduler.evaluate(&state, utc_wall(2026, 3, 20, 0, 10));
        assert!(scheduler.evaluate(&state, utc_wall(2026, 3, 20, 12, 0)).sunrise);

        scheduler.invalidate();
        assert!(!scheduler.status(&state).cache_valid);

        assert!(!scheduler.evaluate(&state, utc_wall(2026, 3, 20, 12, 5)).any());
        assert!(scheduler.status(&state).cache_valid);
        assert!(scheduler.status(&state).sunrise_fired);
    }

    #[test]
    fn day_change_reseeds_latches() {
        let state = equator_state();
        let mut scheduler = SunScheduler::new();
        scheduler.evaluate(&state, utc_wall(2026, 3, 20, 23, 0));

        // Next day, first evaluation is after sunrise: seeded as missed.
        assert!(!scheduler.evaluate(&state, utc_wall(2026, 3, 21, 12, 0)).any());
        assert!(scheduler.evaluate(&state, utc_wall(2026, 3, 21, 23, 0)).sunset);
    }

    #[test]
    fn offsets_shift_the_cached_instants() {
        let base = equator_state();
        let mut shifted_state = equator_state();
        shifted_state.sunrise_offset_minutes = 60;
        shifted_state.sunset_offset_minutes = -30;

        let mut plain = SunScheduler::new();
        let mut shifted = SunScheduler::new();
        plain.evaluate(&base, utc_wall(2026, 3, 20, 0, 10));
        shifted.evaluate(&shifted_state, utc_wall(2026, 3, 20, 0, 10));

        let plain_status = plain.status(&base);
        let shifted_status = shifted.status(&shifted_state);
        assert_eq!(
            shifted_status.sunrise_epoch.unwrap(),
            plain_status.sunrise_epoch.unwrap() + 3600
        );
        assert_eq!(
            shifted_status.sunset_epoch.unwrap(),
            plain_status.sunset_epoch.unwrap() - 1800
        );
    }

    #[test]
    fn disabled_schedule_never_computes() {
        let mut state = equator_state();
        state.sun_schedule_enabled = false;
        let mut scheduler = SunScheduler::new();

        assert!(!scheduler.evaluate(&state, utc_wall(2026, 3, 20, 12, 0)).any());
        assert!(!scheduler.status(&state).cache_valid);
    }
}
