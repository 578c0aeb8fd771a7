//! Calendar and duration features from signup and purchase timestamps.

use chrono::{Datelike, NaiveDateTime, TimeDelta, Timelike};
use serde::{Deserialize, Serialize};

const MICROS_PER_HOUR: f64 = 3_600_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeFeatures {
    pub hour_of_day: u32,
    /// Monday = 0 .. Sunday = 6.
    pub day_of_week: u32,
    /// Signed; negative when the purchase precedes the signup.
    pub elapsed_hours: f64,
}

/// Both inputs are taken in the same calendar reference; nothing is converted.
pub fn derive_time_features(
    signup_time: NaiveDateTime,
    purchase_time: NaiveDateTime,
) -> TimeFeatures {
    let elapsed = purchase_time.signed_duration_since(signup_time);
    TimeFeatures {
        hour_of_day: purchase_time.hour(),
        day_of_week: purchase_time.weekday().num_days_from_monday(),
        elapsed_hours: elapsed_hours(elapsed),
    }
}

/// Microsecond precision; spans too wide for microseconds fall back to milliseconds.
fn elapsed_hours(elapsed: TimeDelta) -> f64 {
    match elapsed.num_microseconds() {
        Some(micros) => micros as f64 / MICROS_PER_HOUR,
        None => elapsed.num_milliseconds() as f64 / (MICROS_PER_HOUR / 1_000.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn two_hours_after_signup_on_a_sunday() {
        let features = derive_time_features(ts(2023, 1, 1, 10, 0), ts(2023, 1, 1, 12, 0));
        assert_eq!(features.hour_of_day, 12);
        assert_eq!(features.day_of_week, 6);
        assert_eq!(features.elapsed_hours, 2.0);
    }

    #[test]
    fn elapsed_hours_is_signed_and_fractional() {
        let features = derive_time_features(ts(2023, 1, 2, 10, 30), ts(2023, 1, 2, 9, 0));
        assert_eq!(features.elapsed_hours, -1.5);
        assert_eq!(features.day_of_week, 0);
        assert_eq!(features.hour_of_day, 9);
    }

    #[test]
    fn sub_millisecond_gaps_are_kept() {
        let signup = ts(2023, 1, 2, 10, 0);
        let purchase = signup + TimeDelta::microseconds(900);
        let features = derive_time_features(signup, purchase);
        assert!(features.elapsed_hours > 0.0);
        assert_eq!(features.elapsed_hours, 900.0 / 3_600_000_000.0);

        let purchase = signup + TimeDelta::milliseconds(1_500);
        assert_eq!(
            derive_time_features(signup, purchase).elapsed_hours,
            1.5 / 3_600.0
        );
    }

    #[test]
    fn spans_multiple_days() {
        let features = derive_time_features(ts(2015, 2, 24, 22, 0), ts(2015, 4, 18, 2, 0));
        assert_eq!(features.elapsed_hours, 52.0 * 24.0 + 4.0);
        assert_eq!(features.day_of_week, 5);
    }
}
