//! Work-item generation for the discovery stage.

use chrono::{Days, NaiveDate, Utc};
use serde::Serialize;

pub const DEFAULT_LOOKBACK_DAYS: u32 = 5;
pub const DEFAULT_PLATFORMS: &[&str] = &["S2A", "S2B", "S2C"];

/// One unit of discovery work: query one platform for one publication day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryDatePlatform {
    pub query_date: String,
    pub platform: String,
}

/// Generate the ordered `(date, platform)` work list driving the link
/// fetcher.
///
/// Covers `{today-1 .. today-lookback_days}` crossed with `platforms`,
/// newest day first, platforms in the given order within each day. Pure
/// function of its inputs.
pub fn query_dates_platforms(
    today: NaiveDate,
    lookback_days: u32,
    platforms: &[String],
) -> Vec<QueryDatePlatform> {
    (1..=u64::from(lookback_days))
        .filter_map(|offset| today.checked_sub_days(Days::new(offset)))
        .flat_map(|date| {
            platforms.iter().map(move |platform| QueryDatePlatform {
                query_date: date.format("%Y-%m-%d").to_string(),
                platform: platform.clone(),
            })
        })
        .collect()
}

/// Today's UTC date, the default anchor for the work list.
pub fn today_utc() -> NaiveDate {
    Utc::now().date_naive()
}

pub fn default_platforms() -> Vec<String> {
    DEFAULT_PLATFORMS.iter().map(|p| p.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_inputs_yield_fifteen_pairs() {
        let today = NaiveDate::from_ymd_opt(2025, 1, 29).unwrap();
        let pairs = query_dates_platforms(today, DEFAULT_LOOKBACK_DAYS, &default_platforms());

        assert_eq!(pairs.len(), 15);
        assert_eq!(
            pairs[0],
            QueryDatePlatform {
                query_date: "2025-01-28".to_string(),
                platform: "S2A".to_string()
            }
        );
        assert_eq!(pairs[1].platform, "S2B");
        assert_eq!(pairs[2].platform, "S2C");
        assert_eq!(pairs[3].query_date, "2025-01-27");
        assert_eq!(pairs[14].query_date, "2025-01-24");
        assert_eq!(pairs[14].platform, "S2C");
    }

    #[test]
    fn test_dates_are_newest_first_within_each_platform() {
        let today = NaiveDate::from_ymd_opt(2025, 1, 29).unwrap();
        let pairs = query_dates_platforms(today, 3, &default_platforms());

        for platform in DEFAULT_PLATFORMS {
            let dates: Vec<&str> = pairs
                .iter()
                .filter(|p| p.platform == *platform)
                .map(|p| p.query_date.as_str())
                .collect();
            assert_eq!(dates, vec!["2025-01-28", "2025-01-27", "2025-01-26"]);
        }
    }

    #[test]
    fn test_zero_lookback_yields_nothing() {
        let today = NaiveDate::from_ymd_opt(2025, 1, 29).unwrap();
        assert!(query_dates_platforms(today, 0, &default_platforms()).is_empty());
    }

    #[test]
    fn test_single_platform() {
        let today = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        let pairs = query_dates_platforms(today, 2, &["S2A".to_string()]);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].query_date, "2025-02-28");
        assert_eq!(pairs[1].query_date, "2025-02-27");
    }
}
