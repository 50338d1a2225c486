//! Interval and Family-Time Arithmetic
//!
//! The storage layer partitions time twice: a *segment* is the coarse unit
//! (day / month / year depending on the configured interval), and a *family*
//! is the fine unit inside a segment (hour / day / month). A row belongs to
//! the family whose half-open window contains its timestamp; all rows of one
//! (shard, family) share a write channel.
//!
//! The rollup ladder follows the usual TSDB layout:
//!
//! | interval        | segment | family |
//! |-----------------|---------|--------|
//! | ≤ 2 minutes     | day     | hour   |
//! | ≤ 30 minutes    | month   | day    |
//! | larger          | year    | month  |

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const ONE_SECOND_MS: i64 = 1_000;
pub const ONE_MINUTE_MS: i64 = 60 * ONE_SECOND_MS;
pub const ONE_HOUR_MS: i64 = 60 * ONE_MINUTE_MS;
pub const ONE_DAY_MS: i64 = 24 * ONE_HOUR_MS;

/// Current wall clock in epoch milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as i64
}

/// A configured storage interval (milliseconds between points after rollup).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Interval(pub i64);

impl Default for Interval {
    fn default() -> Self {
        Interval(10 * ONE_SECOND_MS)
    }
}

/// Time-partition granularity derived from an interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalType {
    /// day segment, hour families
    Day,
    /// month segment, day families
    Month,
    /// year segment, month families
    Year,
}

impl Interval {
    pub fn interval_type(&self) -> IntervalType {
        if self.0 <= 2 * ONE_MINUTE_MS {
            IntervalType::Day
        } else if self.0 <= 30 * ONE_MINUTE_MS {
            IntervalType::Month
        } else {
            IntervalType::Year
        }
    }

    pub fn calculator(&self) -> IntervalCalculator {
        IntervalCalculator {
            interval_type: self.interval_type(),
        }
    }
}

/// Half-open `[start, end)` window in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start && ts < self.end
    }
}

/// Maps timestamps to segment and family windows for one interval type.
#[derive(Debug, Clone, Copy)]
pub struct IntervalCalculator {
    interval_type: IntervalType,
}

impl IntervalCalculator {
    /// Start of the segment containing `ts`.
    pub fn calc_segment_time(&self, ts: i64) -> i64 {
        let dt = utc(ts);
        match self.interval_type {
            IntervalType::Day => ts - ts.rem_euclid(ONE_DAY_MS),
            IntervalType::Month => ymd_start(dt.year(), dt.month(), 1),
            IntervalType::Year => ymd_start(dt.year(), 1, 1),
        }
    }

    /// Family index of `ts` within its segment.
    pub fn calc_family(&self, ts: i64, segment_time: i64) -> i64 {
        match self.interval_type {
            IntervalType::Day => (ts - segment_time) / ONE_HOUR_MS,
            IntervalType::Month => (ts - segment_time) / ONE_DAY_MS,
            IntervalType::Year => {
                let dt = utc(ts);
                (dt.month() - 1) as i64
            }
        }
    }

    /// Start of the family window `(segment_time, family)`.
    pub fn calc_family_start_time(&self, segment_time: i64, family: i64) -> i64 {
        match self.interval_type {
            IntervalType::Day => segment_time + family * ONE_HOUR_MS,
            IntervalType::Month => segment_time + family * ONE_DAY_MS,
            IntervalType::Year => {
                let dt = utc(segment_time);
                ymd_start(dt.year(), family as u32 + 1, 1)
            }
        }
    }

    /// Exclusive end of the family window starting at `family_start`.
    pub fn calc_family_end_time(&self, family_start: i64) -> i64 {
        match self.interval_type {
            IntervalType::Day => family_start + ONE_HOUR_MS,
            IntervalType::Month => family_start + ONE_DAY_MS,
            IntervalType::Year => {
                let dt = utc(family_start);
                if dt.month() == 12 {
                    ymd_start(dt.year() + 1, 1, 1)
                } else {
                    ymd_start(dt.year(), dt.month() + 1, 1)
                }
            }
        }
    }

    /// Family start time of `ts`, composing the three steps above.
    pub fn family_time_of(&self, ts: i64) -> i64 {
        let segment_time = self.calc_segment_time(ts);
        let family = self.calc_family(ts, segment_time);
        self.calc_family_start_time(segment_time, family)
    }

    /// Full family window containing `ts`.
    pub fn time_range_of(&self, ts: i64) -> TimeRange {
        let start = self.family_time_of(ts);
        TimeRange {
            start,
            end: self.calc_family_end_time(start),
        }
    }
}

fn utc(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ts)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn ymd_start(year: i32, month: u32, day: u32) -> i64 {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0)
        .single()
        .map(|dt| dt.timestamp_millis())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2023-11-14T22:13:20.000Z
    const TS: i64 = 1_700_000_000_000;

    #[test]
    fn test_interval_type_ladder() {
        assert_eq!(Interval(10 * ONE_SECOND_MS).interval_type(), IntervalType::Day);
        assert_eq!(Interval(5 * ONE_MINUTE_MS).interval_type(), IntervalType::Month);
        assert_eq!(Interval(ONE_HOUR_MS).interval_type(), IntervalType::Year);
    }

    #[test]
    fn test_day_family_is_hour_window() {
        let calc = Interval::default().calculator();
        let segment = calc.calc_segment_time(TS);
        assert_eq!(segment % ONE_DAY_MS, 0);

        let family = calc.calc_family(TS, segment);
        assert_eq!(family, 22);

        let start = calc.calc_family_start_time(segment, family);
        let range = calc.time_range_of(TS);
        assert_eq!(range.start, start);
        assert_eq!(range.end, start + ONE_HOUR_MS);
        assert!(range.contains(TS));
        assert!(!range.contains(range.end));
    }

    #[test]
    fn test_family_time_of_is_window_aligned() {
        let calc = Interval::default().calculator();
        let family_time = calc.family_time_of(TS);
        assert_eq!(family_time % ONE_HOUR_MS, 0);
        assert!(family_time <= TS && TS < family_time + ONE_HOUR_MS);
    }

    #[test]
    fn test_same_hour_maps_to_same_family() {
        let calc = Interval::default().calculator();
        assert_eq!(calc.family_time_of(TS), calc.family_time_of(TS + ONE_MINUTE_MS));
        assert_ne!(calc.family_time_of(TS), calc.family_time_of(TS + ONE_HOUR_MS));
    }

    #[test]
    fn test_month_family_is_day_window() {
        let calc = Interval(5 * ONE_MINUTE_MS).calculator();
        let segment = calc.calc_segment_time(TS);
        // 2023-11-01T00:00:00Z
        assert_eq!(segment, 1_698_796_800_000);
        let family = calc.calc_family(TS, segment);
        assert_eq!(family, 13); // 14th of the month, zero-based

        let range = calc.time_range_of(TS);
        assert_eq!(range.end - range.start, ONE_DAY_MS);
        assert!(range.contains(TS));
    }

    #[test]
    fn test_year_family_is_month_window() {
        let calc = Interval(ONE_HOUR_MS).calculator();
        let segment = calc.calc_segment_time(TS);
        // 2023-01-01T00:00:00Z
        assert_eq!(segment, 1_672_531_200_000);
        let family = calc.calc_family(TS, segment);
        assert_eq!(family, 10); // November, zero-based

        let range = calc.time_range_of(TS);
        // November has 30 days
        assert_eq!(range.end - range.start, 30 * ONE_DAY_MS);
        assert!(range.contains(TS));
    }

    #[test]
    fn test_year_family_december_rolls_over() {
        let calc = Interval(ONE_HOUR_MS).calculator();
        // 2023-12-15T00:00:00Z
        let ts = ymd_start(2023, 12, 15);
        let range = calc.time_range_of(ts);
        assert_eq!(range.start, ymd_start(2023, 12, 1));
        assert_eq!(range.end, ymd_start(2024, 1, 1));
    }

    #[test]
    fn test_family_boundary_is_exclusive() {
        let calc = Interval::default().calculator();
        let start = calc.family_time_of(TS);
        let end = calc.calc_family_end_time(start);
        assert_eq!(calc.family_time_of(end), end);
        assert_ne!(calc.family_time_of(end - 1), end);
    }

    #[test]
    fn test_now_ms_is_positive() {
        assert!(now_ms() > 1_600_000_000_000);
    }
}
