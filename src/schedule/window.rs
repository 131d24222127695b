//! Choosing which slice of history a run covers.
//!
//! A monthly cycle is split into three bands. The band for a run depends
//! only on the calendar day, so a skipped run simply means the next run
//! picks up whatever band today belongs to; nothing drifts.
//!
//! | Days of month | Band       | Messages aged        |
//! |---------------|------------|----------------------|
//! | 1–10          | `VeryOld`  | over 365 days        |
//! | 11–20         | `MidRange` | 180 to 365 days      |
//! | 21–31         | `Recent`   | 30 to 180 days       |

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A historical age range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    VeryOld,
    MidRange,
    Recent,
}

impl Band {
    pub const ALL: [Band; 3] = [Band::VeryOld, Band::MidRange, Band::Recent];

    /// Lower age bound in days (records must be at least this old).
    pub fn older_than_days(self) -> u32 {
        match self {
            Band::VeryOld => 365,
            Band::MidRange => 180,
            Band::Recent => 30,
        }
    }

    /// Upper age bound in days, if any.
    pub fn newer_than_days(self) -> Option<u32> {
        match self {
            Band::VeryOld => None,
            Band::MidRange => Some(365),
            Band::Recent => Some(180),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Band::VeryOld => "very-old",
            Band::MidRange => "mid-range",
            Band::Recent => "recent",
        }
    }
}

impl std::fmt::Display for Band {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Map a 1-based position in the monthly cycle to its band.
///
/// Positions past 31 (or 0) are clamped into range.
pub fn band_for_position(day_of_cycle: u32) -> Band {
    match day_of_cycle.clamp(1, 31) {
        1..=10 => Band::VeryOld,
        11..=20 => Band::MidRange,
        _ => Band::Recent,
    }
}

/// Bookmark left by the previous run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCursor {
    pub last_window: Option<Band>,
    /// Timestamp of the last record the run finished with (archived or
    /// confirmed duplicate).
    pub last_record_timestamp: Option<DateTime<Utc>>,
    /// `false` when the run stopped on its time budget.
    pub completed: bool,
    pub updated_at: DateTime<Utc>,
}

/// Inputs to window selection.
#[derive(Debug, Clone)]
pub struct CycleState {
    pub today: NaiveDate,
    pub cursor: Option<RunCursor>,
}

/// The slice of history a run covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub band: Band,
    pub older_than_days: u32,
    pub newer_than_days: Option<u32>,
    /// Continue an interrupted run of the same band from this instant (inclusive).
    pub resume_from: Option<DateTime<Utc>>,
}

impl Window {
    /// A fresh window covering the whole band.
    pub fn for_band(band: Band) -> Self {
        Self {
            band,
            older_than_days: band.older_than_days(),
            newer_than_days: band.newer_than_days(),
            resume_from: None,
        }
    }

    pub fn older_than(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.older_than_days))
    }

    pub fn newer_than(&self) -> Option<chrono::Duration> {
        self.newer_than_days
            .map(|d| chrono::Duration::days(i64::from(d)))
    }
}

/// Pick today's window.
///
/// When the stored cursor belongs to an unfinished run of today's band, the
/// window resumes at the cursor's last timestamp instead of starting over.
pub fn select_window(state: &CycleState) -> Window {
    let band = band_for_position(state.today.day());
    let mut window = Window::for_band(band);

    window.resume_from = state
        .cursor
        .as_ref()
        .filter(|c| !c.completed && c.last_window == Some(band))
        .and_then(|c| c.last_record_timestamp);

    window
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn cursor(band: Band, completed: bool) -> RunCursor {
        RunCursor {
            last_window: Some(band),
            last_record_timestamp: Some(
                DateTime::parse_from_rfc3339("2022-02-02T02:02:02Z")
                    .unwrap()
                    .with_timezone(&Utc),
            ),
            completed,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_band_for_position() {
        assert_eq!(band_for_position(1), Band::VeryOld);
        assert_eq!(band_for_position(10), Band::VeryOld);
        assert_eq!(band_for_position(11), Band::MidRange);
        assert_eq!(band_for_position(20), Band::MidRange);
        assert_eq!(band_for_position(21), Band::Recent);
        assert_eq!(band_for_position(31), Band::Recent);
        assert_eq!(band_for_position(0), Band::VeryOld);
        assert_eq!(band_for_position(99), Band::Recent);
    }

    #[test]
    fn test_every_band_visited_each_month() {
        for month in 1..=12 {
            let mut seen = std::collections::HashSet::new();
            let mut d = day(2023, month, 1);
            while d.month() == month {
                seen.insert(band_for_position(d.day()));
                d = d.succ_opt().unwrap();
            }
            assert_eq!(seen.len(), Band::ALL.len(), "month {month}");
        }
    }

    #[test]
    fn test_band_bounds_are_contiguous() {
        assert_eq!(Band::MidRange.newer_than_days(), Some(Band::VeryOld.older_than_days()));
        assert_eq!(Band::Recent.newer_than_days(), Some(Band::MidRange.older_than_days()));
    }

    #[test]
    fn test_select_window_fresh() {
        let w = select_window(&CycleState {
            today: day(2024, 3, 15),
            cursor: None,
        });
        assert_eq!(w.band, Band::MidRange);
        assert_eq!(w.older_than_days, 180);
        assert_eq!(w.newer_than_days, Some(365));
        assert!(w.resume_from.is_none());
    }

    #[test]
    fn test_select_window_resumes_same_band() {
        let w = select_window(&CycleState {
            today: day(2024, 3, 3),
            cursor: Some(cursor(Band::VeryOld, false)),
        });
        assert_eq!(w.band, Band::VeryOld);
        assert!(w.resume_from.is_some());
    }

    #[test]
    fn test_select_window_ignores_other_or_completed_cursor() {
        let w = select_window(&CycleState {
            today: day(2024, 3, 25),
            cursor: Some(cursor(Band::VeryOld, false)),
        });
        assert_eq!(w.band, Band::Recent);
        assert!(w.resume_from.is_none());

        let w = select_window(&CycleState {
            today: day(2024, 3, 3),
            cursor: Some(cursor(Band::VeryOld, true)),
        });
        assert!(w.resume_from.is_none());
    }
}
