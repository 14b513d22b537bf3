use chrono::{Datelike, NaiveDate, NaiveDateTime};

use crate::error::ConfigError;
use crate::models::PeriodType;

/// Half-open reporting interval: rows match when
/// `date_from <= value < date_to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportWindow {
    pub date_from: NaiveDateTime,
    pub date_to: NaiveDateTime,
}

impl ReportWindow {
    pub fn new(date_from: NaiveDateTime, date_to: NaiveDateTime) -> Result<Self, ConfigError> {
        if date_from >= date_to {
            return Err(ConfigError::InvalidValue {
                field: "date_from",
                reason: format!("{} is not before {}", date_from, date_to),
            });
        }
        Ok(Self { date_from, date_to })
    }
}

/// Resolve the reporting window for a run started at `now`.
///
/// - `D`: `date_to = trunc_day(now) - (period_back - period_number)` days,
///   `date_from = date_to - period_number` days.
/// - `W`: the day formula in units of 7 days.
/// - `M`: calendar months; `period_back = 0, period_number = 1` is the
///   current month, `period_back = k` starts `k` months before the current
///   month and spans `period_number` months.
pub fn resolve_window(
    now: NaiveDateTime,
    period_back: i64,
    period_number: i64,
    period_type: PeriodType,
) -> Result<ReportWindow, ConfigError> {
    if period_number < 1 {
        return Err(ConfigError::InvalidValue {
            field: "period_number",
            reason: format!("{} must be at least 1", period_number),
        });
    }
    if period_back < 0 {
        return Err(ConfigError::InvalidValue {
            field: "period_back",
            reason: format!("{} must not be negative", period_back),
        });
    }
    let today = now.date();
    match period_type {
        PeriodType::Day => {
            let date_to = today - chrono::Duration::days(period_back - period_number);
            let date_from = date_to - chrono::Duration::days(period_number);
            ReportWindow::new(at_midnight(date_from), at_midnight(date_to))
        }
        PeriodType::Week => {
            let date_to = today - chrono::Duration::days((period_back - period_number) * 7);
            let date_from = date_to - chrono::Duration::days(period_number * 7);
            ReportWindow::new(at_midnight(date_from), at_midnight(date_to))
        }
        PeriodType::Month => {
            let date_from = shift_months(month_start(today), -period_back as i32);
            let date_to = shift_months(date_from, period_number as i32);
            ReportWindow::new(at_midnight(date_from), at_midnight(date_to))
        }
    }
}

fn at_midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_opt(0, 0, 0).expect("midnight always exists")
}

fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).expect("day 1 always exists")
}

/// Move a first-of-month date by whole months.
fn shift_months(first: NaiveDate, months: i32) -> NaiveDate {
    let absolute = first.year() * 12 + first.month0() as i32 + months;
    let year = absolute.div_euclid(12);
    let month0 = absolute.rem_euclid(12);
    NaiveDate::from_ymd_opt(year, month0 as u32 + 1, 1).expect("valid month shift")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn test_day_window_yesterday() {
        let w = resolve_window(dt("2024-03-15 13:45:12"), 1, 1, PeriodType::Day).unwrap();
        assert_eq!(w.date_from, dt("2024-03-14 00:00:00"));
        assert_eq!(w.date_to, dt("2024-03-15 00:00:00"));
    }

    #[test]
    fn test_day_window_three_day_span() {
        // Three days ending two days ago.
        let w = resolve_window(dt("2024-03-15 01:00:00"), 5, 3, PeriodType::Day).unwrap();
        assert_eq!(w.date_from, dt("2024-03-10 00:00:00"));
        assert_eq!(w.date_to, dt("2024-03-13 00:00:00"));
    }

    #[test]
    fn test_week_window() {
        let w = resolve_window(dt("2024-03-15 09:30:00"), 1, 1, PeriodType::Week).unwrap();
        assert_eq!(w.date_from, dt("2024-03-08 00:00:00"));
        assert_eq!(w.date_to, dt("2024-03-15 00:00:00"));
    }

    #[test]
    fn test_month_window_current() {
        let w = resolve_window(dt("2024-03-15 10:00:00"), 0, 1, PeriodType::Month).unwrap();
        assert_eq!(w.date_from, dt("2024-03-01 00:00:00"));
        assert_eq!(w.date_to, dt("2024-04-01 00:00:00"));
    }

    #[test]
    fn test_month_window_previous_across_year() {
        let w = resolve_window(dt("2024-01-20 10:00:00"), 1, 1, PeriodType::Month).unwrap();
        assert_eq!(w.date_from, dt("2023-12-01 00:00:00"));
        assert_eq!(w.date_to, dt("2024-01-01 00:00:00"));
    }

    #[test]
    fn test_month_window_multi_month_span() {
        let w = resolve_window(dt("2024-05-02 00:00:00"), 3, 2, PeriodType::Month).unwrap();
        assert_eq!(w.date_from, dt("2024-02-01 00:00:00"));
        assert_eq!(w.date_to, dt("2024-04-01 00:00:00"));
    }

    #[test]
    fn test_rejects_zero_period_number() {
        assert!(resolve_window(dt("2024-03-15 00:00:00"), 1, 0, PeriodType::Day).is_err());
    }

    #[test]
    fn test_rejects_negative_period_back() {
        assert!(resolve_window(dt("2024-03-15 00:00:00"), -1, 1, PeriodType::Day).is_err());
    }

    #[test]
    fn test_leap_february_span() {
        let w = resolve_window(dt("2024-03-10 00:00:00"), 1, 1, PeriodType::Month).unwrap();
        assert_eq!(w.date_from, dt("2024-02-01 00:00:00"));
        assert_eq!(w.date_to, dt("2024-03-01 00:00:00"));
    }
}
