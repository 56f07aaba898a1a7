//! Market phase resolution and cycle cadence.
//!
//! Phase is derived from the US/Eastern wall clock plus a holiday
//! calendar. Cadence per phase comes from the parameter snapshot.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::America::New_York;
use std::collections::HashSet;
use std::time::Duration;

use crate::config::ParamSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketPhase {
    PreMarket,
    Regular,
    AfterHours,
    Closed,
}

impl MarketPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketPhase::PreMarket => "pre_market",
            MarketPhase::Regular => "regular",
            MarketPhase::AfterHours => "after_hours",
            MarketPhase::Closed => "closed",
        }
    }
}

/// Full-day US equity market holidays. Half-days are treated as regular
/// sessions; the cadence difference is not worth the calendar churn.
pub struct HolidayCalendar {
    days: HashSet<NaiveDate>,
}

impl HolidayCalendar {
    pub fn us_equities() -> Self {
        let mut days = HashSet::new();
        for (y, m, d) in [
            // 2025
            (2025, 1, 1),
            (2025, 1, 20),
            (2025, 2, 17),
            (2025, 4, 18),
            (2025, 5, 26),
            (2025, 6, 19),
            (2025, 7, 4),
            (2025, 9, 1),
            (2025, 11, 27),
            (2025, 12, 25),
            // 2026
            (2026, 1, 1),
            (2026, 1, 19),
            (2026, 2, 16),
            (2026, 4, 3),
            (2026, 5, 25),
            (2026, 6, 19),
            (2026, 7, 3),
            (2026, 9, 7),
            (2026, 11, 26),
            (2026, 12, 25),
        ] {
            if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
                days.insert(date);
            }
        }
        Self { days }
    }

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.days.contains(&date)
    }
}

/// Resolve the market phase for a UTC instant.
pub fn phase_at(now: DateTime<Utc>, calendar: &HolidayCalendar) -> MarketPhase {
    let eastern = now.with_timezone(&New_York);
    let date = eastern.date_naive();

    if matches!(eastern.weekday(), Weekday::Sat | Weekday::Sun) || calendar.is_holiday(date) {
        return MarketPhase::Closed;
    }

    let time = eastern.time();
    let pre_open = NaiveTime::from_hms_opt(4, 0, 0).unwrap();
    let open = NaiveTime::from_hms_opt(9, 30, 0).unwrap();
    let close = NaiveTime::from_hms_opt(16, 0, 0).unwrap();
    let late_close = NaiveTime::from_hms_opt(20, 0, 0).unwrap();

    if time >= pre_open && time < open {
        MarketPhase::PreMarket
    } else if time >= open && time < close {
        MarketPhase::Regular
    } else if time >= close && time < late_close {
        MarketPhase::AfterHours
    } else {
        MarketPhase::Closed
    }
}

/// Cycle cadence for a phase, from the live parameters.
pub fn cadence(params: &ParamSnapshot, phase: MarketPhase) -> Duration {
    Duration::from_secs(params.cycle_seconds(phase))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn weekday_session_phases() {
        let cal = HolidayCalendar::us_equities();
        // 2026-03-04 is a Wednesday; EST (UTC-5) still applies.
        assert_eq!(phase_at(utc(2026, 3, 4, 12, 0), &cal), MarketPhase::PreMarket); // 07:00 ET
        assert_eq!(phase_at(utc(2026, 3, 4, 15, 0), &cal), MarketPhase::Regular); // 10:00 ET
        assert_eq!(phase_at(utc(2026, 3, 4, 22, 0), &cal), MarketPhase::AfterHours); // 17:00 ET
        assert_eq!(phase_at(utc(2026, 3, 4, 2, 0), &cal), MarketPhase::Closed); // 21:00 ET prior day
    }

    #[test]
    fn phase_boundary_at_open() {
        let cal = HolidayCalendar::us_equities();
        // 09:29 vs 09:30 ET on a Wednesday (EST).
        assert_eq!(phase_at(utc(2026, 3, 4, 14, 29), &cal), MarketPhase::PreMarket);
        assert_eq!(phase_at(utc(2026, 3, 4, 14, 30), &cal), MarketPhase::Regular);
    }

    #[test]
    fn dst_shift_moves_utc_open() {
        let cal = HolidayCalendar::us_equities();
        // 2026-07-01 is a Wednesday; EDT (UTC-4): 13:30 UTC is the open.
        assert_eq!(phase_at(utc(2026, 7, 1, 13, 29), &cal), MarketPhase::PreMarket);
        assert_eq!(phase_at(utc(2026, 7, 1, 13, 30), &cal), MarketPhase::Regular);
    }

    #[test]
    fn weekend_and_holiday_closed() {
        let cal = HolidayCalendar::us_equities();
        // Saturday midday.
        assert_eq!(phase_at(utc(2026, 3, 7, 15, 0), &cal), MarketPhase::Closed);
        // 2026-07-03 (observed Independence Day), a Friday.
        assert_eq!(phase_at(utc(2026, 7, 3, 15, 0), &cal), MarketPhase::Closed);
    }

    #[test]
    fn cadence_follows_phase() {
        let params = ParamSnapshot::default();
        assert_eq!(cadence(&params, MarketPhase::PreMarket), Duration::from_secs(90));
        assert_eq!(cadence(&params, MarketPhase::Regular), Duration::from_secs(60));
        assert_eq!(cadence(&params, MarketPhase::AfterHours), Duration::from_secs(120));
        assert_eq!(cadence(&params, MarketPhase::Closed), Duration::from_secs(300));
    }
}
