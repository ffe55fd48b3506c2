//! Business-day arithmetic for ticket validity windows.

use chrono::{DateTime, Datelike, Duration, Utc, Weekday};

pub fn is_business_day(at: DateTime<Utc>) -> bool {
    !matches!(at.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Moves `start` forward by `days` business days, keeping the time of day.
///
/// Weekends are skipped; a start on a weekend counts from the next Monday.
pub fn add_business_days(start: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    let mut at = start;
    let mut remaining = days;
    while remaining > 0 {
        at += Duration::days(1);
        if is_business_day(at) {
            remaining -= 1;
        }
    }
    at
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 18, 30, 0).unwrap()
    }

    #[test]
    fn test_zero_days_is_identity() {
        assert_eq!(add_business_days(at(2026, 3, 7), 0), at(2026, 3, 7));
    }

    #[test]
    fn test_skips_weekend() {
        // Friday + 1 → Monday
        assert_eq!(add_business_days(at(2026, 3, 6), 1), at(2026, 3, 9));
        // Monday + 5 → next Monday
        assert_eq!(add_business_days(at(2026, 3, 2), 5), at(2026, 3, 9));
    }

    #[test]
    fn test_weekend_start() {
        // Saturday + 1 → Monday
        assert_eq!(add_business_days(at(2026, 3, 7), 1), at(2026, 3, 9));
        // Sunday + 2 → Tuesday
        assert_eq!(add_business_days(at(2026, 3, 8), 2), at(2026, 3, 10));
    }

    #[test]
    fn test_forty_eight_business_days() {
        // Monday 2 March 2026 + 48 business days: 9 full weeks (45) + 3 → Thursday 7 May.
        let expires = add_business_days(at(2026, 3, 2), 48);
        assert_eq!(expires, at(2026, 5, 7));
        assert!(is_business_day(expires));
        assert!(expires - at(2026, 3, 2) > Duration::days(48));
    }
}
