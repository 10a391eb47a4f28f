use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

use crate::{error::AppError, models::WeekendRule};

const MIN_BILLING_DAY: u32 = 1;
const MAX_BILLING_DAY: u32 = 28;

pub fn parse_timezone(name: &str) -> Result<Tz, AppError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| AppError::InvalidArgument(format!("Unknown timezone '{}'.", name.trim())))
}

/// Timezone for a property, falling back to `default` when none is stored.
pub fn resolve_timezone(name: Option<&str>, default: Tz) -> Result<Tz, AppError> {
    match name.map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => parse_timezone(value),
        None => Ok(default),
    }
}

pub fn local_date(instant: DateTime<Utc>, tz: Tz) -> NaiveDate {
    instant.with_timezone(&tz).date_naive()
}

/// Billing period (`YYYYMM`) containing `instant` as observed in `tz`.
pub fn period_of(instant: DateTime<Utc>, tz: Tz) -> String {
    period_for_date(local_date(instant, tz))
}

pub fn period_for_date(date: NaiveDate) -> String {
    format!("{:04}{:02}", date.year(), date.month())
}

/// Whether the calendar date falls on a weekend in `tz`, read at local noon so
/// DST transitions near midnight cannot move it to a neighbouring day.
pub fn is_weekend(year: i32, month: u32, day: u32, tz: Tz) -> bool {
    let Some(date) = NaiveDate::from_ymd_opt(year, month, day) else {
        return false;
    };
    let noon = NaiveDateTime::new(date, NaiveTime::from_hms_opt(12, 0, 0).unwrap_or_default());
    let weekday = tz
        .from_local_datetime(&noon)
        .earliest()
        .map(|local| local.weekday())
        .unwrap_or_else(|| date.weekday());
    matches!(weekday, Weekday::Sat | Weekday::Sun)
}

pub fn scheduled_day_for(
    year: i32,
    month: u32,
    billing_day: i32,
    rule: WeekendRule,
    tz: Tz,
) -> u32 {
    let mut day = billing_day.clamp(MIN_BILLING_DAY as i32, MAX_BILLING_DAY as i32) as u32;
    match rule {
        WeekendRule::NoShift => day,
        WeekendRule::ShiftToPreviousBusinessDay => {
            while day > MIN_BILLING_DAY && is_weekend(year, month, day, tz) {
                day -= 1;
            }
            day
        }
        WeekendRule::ShiftToNextBusinessDay => {
            while day < MAX_BILLING_DAY && is_weekend(year, month, day, tz) {
                day += 1;
            }
            day
        }
    }
}

pub fn is_due_on(today: NaiveDate, billing_day: i32, rule: WeekendRule, tz: Tz) -> bool {
    today.day() == scheduled_day_for(today.year(), today.month(), billing_day, rule, tz)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn formats_period_in_local_time() {
        let instant = Utc.with_ymd_and_hms(2026, 2, 1, 3, 0, 0).unwrap();
        assert_eq!(period_of(instant, chrono_tz::UTC), "202602");
        // Still January 31st in Mexico City.
        assert_eq!(period_of(instant, chrono_tz::America::Mexico_City), "202601");
    }

    #[test]
    fn detects_weekends() {
        assert!(is_weekend(2026, 1, 3, chrono_tz::UTC));
        assert!(is_weekend(2026, 1, 4, chrono_tz::UTC));
        assert!(!is_weekend(2026, 1, 5, chrono_tz::UTC));
        assert!(!is_weekend(2026, 2, 30, chrono_tz::UTC));
    }

    #[test]
    fn shifts_saturday_forward_to_monday() {
        let day = scheduled_day_for(
            2026,
            1,
            3,
            WeekendRule::ShiftToNextBusinessDay,
            chrono_tz::UTC,
        );
        assert_eq!(day, 5);
    }

    #[test]
    fn shifts_saturday_backward_to_friday() {
        let day = scheduled_day_for(
            2026,
            1,
            3,
            WeekendRule::ShiftToPreviousBusinessDay,
            chrono_tz::UTC,
        );
        assert_eq!(day, 2);
    }

    #[test]
    fn no_shift_keeps_the_billing_day() {
        assert_eq!(
            scheduled_day_for(2026, 1, 3, WeekendRule::NoShift, chrono_tz::UTC),
            3
        );
    }

    #[test]
    fn clamps_billing_day_and_stops_at_bounds() {
        // 2026-02-28 is a Saturday; the forward walk may not leave day 28.
        assert_eq!(
            scheduled_day_for(2026, 2, 31, WeekendRule::ShiftToNextBusinessDay, chrono_tz::UTC),
            28
        );
        // 2026-03-01 is a Sunday; the backward walk may not go below day 1.
        assert_eq!(
            scheduled_day_for(2026, 3, 0, WeekendRule::ShiftToPreviousBusinessDay, chrono_tz::UTC),
            1
        );
    }

    #[test]
    fn due_only_on_the_shifted_day() {
        let rule = WeekendRule::ShiftToNextBusinessDay;
        let saturday = NaiveDate::from_ymd_opt(2026, 1, 3).unwrap();
        let monday = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        assert!(!is_due_on(saturday, 3, rule, chrono_tz::UTC));
        assert!(is_due_on(monday, 3, rule, chrono_tz::UTC));
    }

    #[test]
    fn rejects_unknown_timezones() {
        assert!(parse_timezone("Mars/Olympus").is_err());
        assert_eq!(
            resolve_timezone(None, chrono_tz::America::Mexico_City).unwrap(),
            chrono_tz::America::Mexico_City
        );
        assert_eq!(
            resolve_timezone(Some(" UTC "), chrono_tz::America::Mexico_City).unwrap(),
            chrono_tz::UTC
        );
    }
}
