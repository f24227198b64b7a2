use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// Record categories exposed by the record query interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordCategory {
    Recovery,
    Sleep,
    Workout,
    Cycle,
}

impl RecordCategory {
    pub const ALL: [RecordCategory; 4] = [
        RecordCategory::Recovery,
        RecordCategory::Sleep,
        RecordCategory::Workout,
        RecordCategory::Cycle,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordCategory::Recovery => "recovery",
            RecordCategory::Sleep => "sleep",
            RecordCategory::Workout => "workout",
            RecordCategory::Cycle => "cycle",
        }
    }
}

impl fmt::Display for RecordCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Daily recovery measurement, scored from the preceding night
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub id: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,

    /// 0-100 readiness score
    pub recovery_score: Option<f64>,

    /// HRV (RMSSD) in milliseconds
    pub hrv_rmssd_milli: Option<f64>,

    /// Resting heart rate in bpm
    pub resting_heart_rate: Option<f64>,

    pub spo2_percentage: Option<f64>,
    pub skin_temp_celsius: Option<f64>,
}

/// One sleep session. Stage durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SleepRecord {
    pub id: String,
    pub user_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,

    /// Naps never contribute to nightly features
    #[serde(default)]
    pub nap: bool,

    pub efficiency: Option<f64>,
    pub consistency: Option<f64>,
    /// Sleep performance percentage (sleep obtained vs sleep needed)
    pub performance: Option<f64>,
    pub respiratory_rate: Option<f64>,
    pub in_bed_milli: Option<f64>,
    pub awake_milli: Option<f64>,
    pub rem_milli: Option<f64>,
    pub slow_wave_milli: Option<f64>,
    pub light_milli: Option<f64>,
    pub disturbance_count: Option<f64>,
}

impl SleepRecord {
    /// Time asleep: time in bed minus time awake
    pub fn sleep_hours(&self) -> Option<f64> {
        let in_bed = self.in_bed_milli?;
        Some((in_bed - self.awake_milli.unwrap_or(0.0)) / MILLIS_PER_HOUR)
    }

    pub fn in_bed_hours(&self) -> Option<f64> {
        self.in_bed_milli.map(|ms| ms / MILLIS_PER_HOUR)
    }

    pub fn rem_hours(&self) -> Option<f64> {
        self.rem_milli.map(|ms| ms / MILLIS_PER_HOUR)
    }

    pub fn deep_hours(&self) -> Option<f64> {
        self.slow_wave_milli.map(|ms| ms / MILLIS_PER_HOUR)
    }

    pub fn light_hours(&self) -> Option<f64> {
        self.light_milli.map(|ms| ms / MILLIS_PER_HOUR)
    }

    pub fn awake_hours(&self) -> Option<f64> {
        self.awake_milli.map(|ms| ms / MILLIS_PER_HOUR)
    }
}

/// A single workout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutRecord {
    pub id: String,
    pub user_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub strain: Option<f64>,
    pub kilojoule: Option<f64>,
    pub avg_hr: Option<f64>,
    pub max_hr: Option<f64>,
}

/// A physiological day (wake to wake) with its accumulated load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub id: String,
    pub user_id: String,
    pub start: DateTime<Utc>,
    pub strain: Option<f64>,
    pub kilojoule: Option<f64>,
    pub avg_hr: Option<f64>,
    pub max_hr: Option<f64>,
}

/// Any record the query interface can return
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum PhysiologicalRecord {
    Recovery(RecoveryRecord),
    Sleep(SleepRecord),
    Workout(WorkoutRecord),
    Cycle(CycleRecord),
}

impl PhysiologicalRecord {
    pub fn category(&self) -> RecordCategory {
        match self {
            PhysiologicalRecord::Recovery(_) => RecordCategory::Recovery,
            PhysiologicalRecord::Sleep(_) => RecordCategory::Sleep,
            PhysiologicalRecord::Workout(_) => RecordCategory::Workout,
            PhysiologicalRecord::Cycle(_) => RecordCategory::Cycle,
        }
    }

    /// Calendar date the record is attributed to.
    ///
    /// Sleep belongs to the day you wake up on; workouts and cycles to the
    /// day they start.
    pub fn date(&self) -> NaiveDate {
        match self {
            PhysiologicalRecord::Recovery(r) => r.timestamp.date_naive(),
            PhysiologicalRecord::Sleep(s) => s.end.date_naive(),
            PhysiologicalRecord::Workout(w) => w.start.date_naive(),
            PhysiologicalRecord::Cycle(c) => c.start.date_naive(),
        }
    }

    /// Instant used to order records within a category
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            PhysiologicalRecord::Recovery(r) => r.timestamp,
            PhysiologicalRecord::Sleep(s) => s.end,
            PhysiologicalRecord::Workout(w) => w.start,
            PhysiologicalRecord::Cycle(c) => c.start,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            PhysiologicalRecord::Recovery(r) => &r.user_id,
            PhysiologicalRecord::Sleep(s) => &s.user_id,
            PhysiologicalRecord::Workout(w) => &w.user_id,
            PhysiologicalRecord::Cycle(c) => &c.user_id,
        }
    }
}

/// Inclusive calendar date range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// The `days` calendar days ending on `as_of` (inclusive)
    pub fn lookback(as_of: NaiveDate, days: u32) -> Self {
        let span = i64::from(days.max(1)) - 1;
        Self {
            start: as_of - chrono::Duration::days(span),
            end: as_of,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn create_test_sleep() -> SleepRecord {
        SleepRecord {
            id: "s1".to_string(),
            user_id: "u1".to_string(),
            start: Utc.with_ymd_and_hms(2024, 1, 1, 23, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 1, 2, 7, 0, 0).unwrap(),
            nap: false,
            efficiency: Some(92.0),
            consistency: Some(80.0),
            performance: Some(88.0),
            respiratory_rate: Some(14.5),
            in_bed_milli: Some(8.0 * 3_600_000.0),
            awake_milli: Some(0.5 * 3_600_000.0),
            rem_milli: Some(1.75 * 3_600_000.0),
            slow_wave_milli: Some(1.5 * 3_600_000.0),
            light_milli: Some(4.25 * 3_600_000.0),
            disturbance_count: Some(6.0),
        }
    }

    #[test]
    fn test_sleep_durations() {
        let sleep = create_test_sleep();
        assert!((sleep.sleep_hours().unwrap() - 7.5).abs() < 1e-9);
        assert!((sleep.in_bed_hours().unwrap() - 8.0).abs() < 1e-9);
        assert!((sleep.rem_hours().unwrap() - 1.75).abs() < 1e-9);
        assert!((sleep.deep_hours().unwrap() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_sleep_dated_by_wake_up() {
        let record = PhysiologicalRecord::Sleep(create_test_sleep());
        assert_eq!(record.date(), NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(record.category(), RecordCategory::Sleep);
    }

    #[test]
    fn test_lookback_range() {
        let as_of = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
        let range = DateRange::lookback(as_of, 30);
        assert_eq!(range.days(), 30);
        assert_eq!(range.start, NaiveDate::from_ymd_opt(2024, 3, 2).unwrap());
        assert!(range.contains(as_of));
        assert!(!range.contains(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()));
    }

    #[test]
    fn test_record_serde_tag() {
        let record = PhysiologicalRecord::Cycle(CycleRecord {
            id: "c1".to_string(),
            user_id: "u1".to_string(),
            start: Utc.with_ymd_and_hms(2024, 1, 2, 6, 0, 0).unwrap(),
            strain: Some(12.3),
            kilojoule: Some(9000.0),
            avg_hr: Some(70.0),
            max_hr: Some(165.0),
        });
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["category"], "cycle");
        let back: PhysiologicalRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
