//! Data preparation: date-aligned, engineered feature tables
//!
//! Every record category is pulled through the [`RecordSource`] and outer
//! joined on calendar date. Duplicate dates are aggregated per column (see
//! [`Aggregation`]), derived columns are computed from observed values only,
//! and a declared [`FillRule`] resolves every missing cell before the table
//! leaves this module. Cells keep an observed bit so later stages can tell a
//! real measurement from a filled default.

use chrono::{Datelike, Duration, NaiveDate, Timelike};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::error::{AnalysisError, Result};
use crate::models::{DateRange, PhysiologicalRecord, RecordCategory};
use crate::source::RecordSource;

/// Number of columns in a [`FeatureRow`]
pub const FEATURE_COUNT: usize = 37;

/// Variance at or below this is treated as a constant column
const DEGENERATE_VARIANCE: f64 = 1e-12;

/// Static FeatureRow schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    // Recovery
    RecoveryScore,
    HrvRmssdMilli,
    RestingHeartRate,
    Spo2Percentage,
    SkinTempCelsius,
    // Sleep
    SleepHours,
    TimeInBedHours,
    RemSleepHours,
    SlowWaveSleepHours,
    LightSleepHours,
    AwakeTimeHours,
    SleepEfficiencyPercentage,
    SleepConsistencyPercentage,
    SleepPerformancePercentage,
    RespiratoryRate,
    DisturbanceCount,
    SleepQualityScore,
    BedtimeHour,
    // Cycle
    Strain,
    Kilojoule,
    AverageHeartRate,
    MaxHeartRate,
    // Workout
    WorkoutStrain,
    WorkoutCount,
    HadWorkout,
    MorningWorkout,
    EveningWorkout,
    // Lags
    PrevStrain,
    PrevRecoveryScore,
    PrevHrv,
    // Rolling windows
    #[serde(rename = "strain_rolling_7d")]
    StrainRolling7d,
    #[serde(rename = "hrv_rolling_7d")]
    HrvRolling7d,
    #[serde(rename = "rhr_rolling_7d")]
    RhrRolling7d,
    #[serde(rename = "sleep_hours_rolling_7d")]
    SleepHoursRolling7d,
    #[serde(rename = "strain_3d_sum")]
    Strain3dSum,
    // Calendar
    DayOfWeek,
    IsWeekend,
}

/// How a missing cell is resolved after the join
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillRule {
    /// Missing means none: load, counts and flags
    Zero,
    /// Missing means unmeasured: replaced by the column's observed mean
    ColumnMean,
}

/// How several records landing on the same date are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Mean,
    Sum,
    Max,
}

impl Feature {
    pub const ALL: [Feature; FEATURE_COUNT] = [
        Feature::RecoveryScore,
        Feature::HrvRmssdMilli,
        Feature::RestingHeartRate,
        Feature::Spo2Percentage,
        Feature::SkinTempCelsius,
        Feature::SleepHours,
        Feature::TimeInBedHours,
        Feature::RemSleepHours,
        Feature::SlowWaveSleepHours,
        Feature::LightSleepHours,
        Feature::AwakeTimeHours,
        Feature::SleepEfficiencyPercentage,
        Feature::SleepConsistencyPercentage,
        Feature::SleepPerformancePercentage,
        Feature::RespiratoryRate,
        Feature::DisturbanceCount,
        Feature::SleepQualityScore,
        Feature::BedtimeHour,
        Feature::Strain,
        Feature::Kilojoule,
        Feature::AverageHeartRate,
        Feature::MaxHeartRate,
        Feature::WorkoutStrain,
        Feature::WorkoutCount,
        Feature::HadWorkout,
        Feature::MorningWorkout,
        Feature::EveningWorkout,
        Feature::PrevStrain,
        Feature::PrevRecoveryScore,
        Feature::PrevHrv,
        Feature::StrainRolling7d,
        Feature::HrvRolling7d,
        Feature::RhrRolling7d,
        Feature::SleepHoursRolling7d,
        Feature::Strain3dSum,
        Feature::DayOfWeek,
        Feature::IsWeekend,
    ];

    /// Column position inside a [`FeatureRow`]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Machine name, identical to the serialized form
    pub fn name(self) -> &'static str {
        match self {
            Feature::RecoveryScore => "recovery_score",
            Feature::HrvRmssdMilli => "hrv_rmssd_milli",
            Feature::RestingHeartRate => "resting_heart_rate",
            Feature::Spo2Percentage => "spo2_percentage",
            Feature::SkinTempCelsius => "skin_temp_celsius",
            Feature::SleepHours => "sleep_hours",
            Feature::TimeInBedHours => "time_in_bed_hours",
            Feature::RemSleepHours => "rem_sleep_hours",
            Feature::SlowWaveSleepHours => "slow_wave_sleep_hours",
            Feature::LightSleepHours => "light_sleep_hours",
            Feature::AwakeTimeHours => "awake_time_hours",
            Feature::SleepEfficiencyPercentage => "sleep_efficiency_percentage",
            Feature::SleepConsistencyPercentage => "sleep_consistency_percentage",
            Feature::SleepPerformancePercentage => "sleep_performance_percentage",
            Feature::RespiratoryRate => "respiratory_rate",
            Feature::DisturbanceCount => "disturbance_count",
            Feature::SleepQualityScore => "sleep_quality_score",
            Feature::BedtimeHour => "bedtime_hour",
            Feature::Strain => "strain",
            Feature::Kilojoule => "kilojoule",
            Feature::AverageHeartRate => "average_heart_rate",
            Feature::MaxHeartRate => "max_heart_rate",
            Feature::WorkoutStrain => "workout_strain",
            Feature::WorkoutCount => "workout_count",
            Feature::HadWorkout => "had_workout",
            Feature::MorningWorkout => "morning_workout",
            Feature::EveningWorkout => "evening_workout",
            Feature::PrevStrain => "prev_strain",
            Feature::PrevRecoveryScore => "prev_recovery_score",
            Feature::PrevHrv => "prev_hrv",
            Feature::StrainRolling7d => "strain_rolling_7d",
            Feature::HrvRolling7d => "hrv_rolling_7d",
            Feature::RhrRolling7d => "rhr_rolling_7d",
            Feature::SleepHoursRolling7d => "sleep_hours_rolling_7d",
            Feature::Strain3dSum => "strain_3d_sum",
            Feature::DayOfWeek => "day_of_week",
            Feature::IsWeekend => "is_weekend",
        }
    }

    /// Human-friendly label used in explanations
    pub fn label(self) -> &'static str {
        match self {
            Feature::RecoveryScore => "Recovery Score",
            Feature::HrvRmssdMilli => "Heart Rate Variability (HRV)",
            Feature::RestingHeartRate => "Resting Heart Rate",
            Feature::Spo2Percentage => "Blood Oxygen (SpO2)",
            Feature::SkinTempCelsius => "Skin Temperature",
            Feature::SleepHours => "Sleep Duration",
            Feature::TimeInBedHours => "Time in Bed",
            Feature::RemSleepHours => "REM Sleep",
            Feature::SlowWaveSleepHours => "Deep Sleep",
            Feature::LightSleepHours => "Light Sleep",
            Feature::AwakeTimeHours => "Awake Time",
            Feature::SleepEfficiencyPercentage => "Sleep Efficiency",
            Feature::SleepConsistencyPercentage => "Sleep Consistency",
            Feature::SleepPerformancePercentage => "Sleep Performance",
            Feature::RespiratoryRate => "Respiratory Rate",
            Feature::DisturbanceCount => "Sleep Disturbances",
            Feature::SleepQualityScore => "Overall Sleep Quality",
            Feature::BedtimeHour => "Bedtime",
            Feature::Strain => "Strain Level",
            Feature::Kilojoule => "Energy Expenditure",
            Feature::AverageHeartRate => "Average Heart Rate",
            Feature::MaxHeartRate => "Max Heart Rate",
            Feature::WorkoutStrain => "Workout Strain",
            Feature::WorkoutCount => "Workouts",
            Feature::HadWorkout => "Had Workout",
            Feature::MorningWorkout => "Morning Workout",
            Feature::EveningWorkout => "Evening Workout",
            Feature::PrevStrain => "Previous Day Strain",
            Feature::PrevRecoveryScore => "Previous Day Recovery",
            Feature::PrevHrv => "Previous Day HRV",
            Feature::StrainRolling7d => "7-Day Average Strain",
            Feature::HrvRolling7d => "7-Day Average HRV",
            Feature::RhrRolling7d => "7-Day Average Resting HR",
            Feature::SleepHoursRolling7d => "7-Day Average Sleep",
            Feature::Strain3dSum => "3-Day Strain Total",
            Feature::DayOfWeek => "Day of Week",
            Feature::IsWeekend => "Weekend",
        }
    }

    /// Unit suffix for thresholds ("" when unitless)
    pub fn unit(self) -> &'static str {
        match self {
            Feature::HrvRmssdMilli | Feature::PrevHrv | Feature::HrvRolling7d => "ms",
            Feature::RestingHeartRate
            | Feature::AverageHeartRate
            | Feature::MaxHeartRate
            | Feature::RhrRolling7d => "bpm",
            Feature::RecoveryScore
            | Feature::PrevRecoveryScore
            | Feature::Spo2Percentage
            | Feature::SleepEfficiencyPercentage
            | Feature::SleepConsistencyPercentage
            | Feature::SleepPerformancePercentage => "%",
            Feature::SkinTempCelsius => "°C",
            Feature::SleepHours
            | Feature::TimeInBedHours
            | Feature::RemSleepHours
            | Feature::SlowWaveSleepHours
            | Feature::LightSleepHours
            | Feature::AwakeTimeHours
            | Feature::SleepHoursRolling7d => "hours",
            Feature::RespiratoryRate => "breaths/min",
            Feature::Kilojoule => "kJ",
            _ => "",
        }
    }

    pub fn category(self) -> Option<RecordCategory> {
        match self {
            Feature::RecoveryScore
            | Feature::HrvRmssdMilli
            | Feature::RestingHeartRate
            | Feature::Spo2Percentage
            | Feature::SkinTempCelsius => Some(RecordCategory::Recovery),
            Feature::SleepHours
            | Feature::TimeInBedHours
            | Feature::RemSleepHours
            | Feature::SlowWaveSleepHours
            | Feature::LightSleepHours
            | Feature::AwakeTimeHours
            | Feature::SleepEfficiencyPercentage
            | Feature::SleepConsistencyPercentage
            | Feature::SleepPerformancePercentage
            | Feature::RespiratoryRate
            | Feature::DisturbanceCount
            | Feature::SleepQualityScore
            | Feature::BedtimeHour => Some(RecordCategory::Sleep),
            Feature::Strain
            | Feature::Kilojoule
            | Feature::AverageHeartRate
            | Feature::MaxHeartRate => Some(RecordCategory::Cycle),
            Feature::WorkoutStrain
            | Feature::WorkoutCount
            | Feature::HadWorkout
            | Feature::MorningWorkout
            | Feature::EveningWorkout => Some(RecordCategory::Workout),
            // Derived from several days or from the calendar
            _ => None,
        }
    }

    pub fn fill_rule(self) -> FillRule {
        match self {
            Feature::Strain
            | Feature::Kilojoule
            | Feature::WorkoutStrain
            | Feature::WorkoutCount
            | Feature::HadWorkout
            | Feature::MorningWorkout
            | Feature::EveningWorkout
            | Feature::PrevStrain
            | Feature::StrainRolling7d
            | Feature::Strain3dSum
            | Feature::DisturbanceCount => FillRule::Zero,
            _ => FillRule::ColumnMean,
        }
    }

    pub fn aggregation(self) -> Aggregation {
        match self {
            Feature::WorkoutStrain | Feature::WorkoutCount => Aggregation::Sum,
            Feature::HadWorkout | Feature::MorningWorkout | Feature::EveningWorkout => {
                Aggregation::Max
            }
            _ => Aggregation::Mean,
        }
    }

    /// Underlying signal this column is derived from.
    ///
    /// Two columns with the same base are near-tautologically related and are
    /// not worth reporting as a correlation.
    pub fn base(self) -> Feature {
        match self {
            Feature::PrevRecoveryScore => Feature::RecoveryScore,
            Feature::PrevHrv | Feature::HrvRolling7d => Feature::HrvRmssdMilli,
            Feature::RhrRolling7d => Feature::RestingHeartRate,
            Feature::TimeInBedHours | Feature::SleepHoursRolling7d => Feature::SleepHours,
            Feature::PrevStrain | Feature::StrainRolling7d | Feature::Strain3dSum => {
                Feature::Strain
            }
            Feature::HadWorkout => Feature::WorkoutCount,
            Feature::IsWeekend => Feature::DayOfWeek,
            other => other,
        }
    }

    pub fn same_family(self, other: Feature) -> bool {
        self.base() == other.base()
    }

    /// Format a value of this column with its unit
    pub fn format_value(self, value: f64) -> String {
        match self {
            Feature::BedtimeHour => format_clock(value),
            _ => match self.unit() {
                "" => format!("{:.1}", value),
                "%" => format!("{:.0}%", value),
                "ms" | "bpm" => format!("{:.0}{}", value, self.unit()),
                unit => format!("{:.1} {}", value, unit),
            },
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Feature {
    type Err = AnalysisError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Feature::ALL
            .iter()
            .copied()
            .find(|f| f.name() == s)
            .ok_or_else(|| AnalysisError::UnknownFeature {
                name: s.to_string(),
            })
    }
}

/// Bedtimes are stored as hours after the previous noon so that 23:30 and
/// 00:30 stay adjacent; render them back on a 24h clock.
pub fn format_clock(hours: f64) -> String {
    let wrapped = hours.rem_euclid(24.0);
    let total_minutes = (wrapped * 60.0).round() as i64 % (24 * 60);
    format!("{:02}:{:02}", total_minutes / 60, total_minutes % 60)
}

fn bedtime_hours(start: chrono::DateTime<chrono::Utc>) -> f64 {
    let hours = start.hour() as f64 + start.minute() as f64 / 60.0;
    if hours < 12.0 {
        hours + 24.0
    } else {
        hours
    }
}

/// One engineered row per calendar date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub date: NaiveDate,
    values: Vec<f64>,
    /// Bit `i` is set when column `i` holds a measured value
    observed: u64,
}

impl FeatureRow {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            values: vec![0.0; FEATURE_COUNT],
            observed: 0,
        }
    }

    /// Record a measured value. Non-finite input is treated as missing.
    pub fn set(&mut self, feature: Feature, value: f64) {
        if value.is_finite() {
            self.values[feature.index()] = value;
            self.observed |= 1 << feature.index();
        }
    }

    pub fn with(mut self, feature: Feature, value: f64) -> Self {
        self.set(feature, value);
        self
    }

    pub fn get(&self, feature: Feature) -> f64 {
        self.values[feature.index()]
    }

    pub fn is_observed(&self, feature: Feature) -> bool {
        self.observed & (1 << feature.index()) != 0
    }

    pub fn observed_value(&self, feature: Feature) -> Option<f64> {
        self.is_observed(feature).then(|| self.get(feature))
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    fn fill(&mut self, feature: Feature, value: f64) {
        if !self.is_observed(feature) {
            self.values[feature.index()] = value;
        }
    }
}

/// Data-integrity findings that do not by themselves fail preparation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum IntegrityIssue {
    /// The category returned no records at all in the window
    MissingCategory { category: RecordCategory },
    /// The category has records, but none share a date with a kept row
    Unjoined {
        category: RecordCategory,
        records: usize,
    },
}

impl fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityIssue::MissingCategory { category } => {
                write!(f, "no {} records in the analysis window", category)
            }
            IntegrityIssue::Unjoined { category, records } => write!(
                f,
                "{} {} records never matched a day with a target value",
                records, category
            ),
        }
    }
}

/// Date-indexed feature table with every cell resolved to a finite value
#[derive(Debug, Clone)]
pub struct FeatureTable {
    target: Option<Feature>,
    window: DateRange,
    rows: Vec<FeatureRow>,
    degenerate: Vec<Feature>,
    integrity_issues: Vec<IntegrityIssue>,
    dropped_without_target: usize,
}

impl FeatureTable {
    /// Build a table from rows holding observed values only: applies the
    /// fill pass and flags degenerate columns.
    pub fn from_rows(
        target: Option<Feature>,
        window: DateRange,
        mut rows: Vec<FeatureRow>,
    ) -> Self {
        rows.sort_by_key(|r| r.date);
        let mut rows = merge_same_day(rows);

        for feature in Feature::ALL {
            let fill_value = match feature.fill_rule() {
                FillRule::Zero => 0.0,
                FillRule::ColumnMean => {
                    let (sum, count) = rows
                        .iter()
                        .filter_map(|r| r.observed_value(feature))
                        .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
                    if count == 0 {
                        0.0
                    } else {
                        sum / count as f64
                    }
                }
            };
            for row in rows.iter_mut() {
                row.fill(feature, fill_value);
            }
        }

        let degenerate = Feature::ALL
            .iter()
            .copied()
            .filter(|&f| {
                let column: Vec<f64> = rows.iter().map(|r| r.get(f)).collect();
                crate::stats::variance(&column).map_or(true, |v| v <= DEGENERATE_VARIANCE)
            })
            .collect();

        Self {
            target,
            window,
            rows,
            degenerate,
            integrity_issues: Vec::new(),
            dropped_without_target: 0,
        }
    }

    pub fn target(&self) -> Option<Feature> {
        self.target
    }

    pub fn window(&self) -> DateRange {
        self.window
    }

    pub fn rows(&self) -> &[FeatureRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        self.rows.iter().map(|r| r.date).collect()
    }

    /// Filled column values, one per row
    pub fn column(&self, feature: Feature) -> Vec<f64> {
        self.rows.iter().map(|r| r.get(feature)).collect()
    }

    /// Measured (date, value) pairs only, in date order
    pub fn observed_series(&self, feature: Feature) -> Vec<(NaiveDate, f64)> {
        self.rows
            .iter()
            .filter_map(|r| r.observed_value(feature).map(|v| (r.date, v)))
            .collect()
    }

    pub fn observed_count(&self, feature: Feature) -> usize {
        self.rows.iter().filter(|r| r.is_observed(feature)).count()
    }

    /// Columns with zero variance after the fill pass
    pub fn degenerate_columns(&self) -> &[Feature] {
        &self.degenerate
    }

    pub fn is_degenerate(&self, feature: Feature) -> bool {
        self.degenerate.contains(&feature)
    }

    pub fn integrity_issues(&self) -> &[IntegrityIssue] {
        &self.integrity_issues
    }

    pub fn dropped_without_target(&self) -> usize {
        self.dropped_without_target
    }

    /// Row-major design matrix over `features`
    pub fn matrix(&self, features: &[Feature]) -> Vec<Vec<f64>> {
        self.rows
            .iter()
            .map(|r| features.iter().map(|&f| r.get(f)).collect())
            .collect()
    }

    /// Minimum-rows gate shared by every component
    pub fn require_rows(
        &self,
        min: usize,
        component: &str,
    ) -> std::result::Result<(), AnalysisError> {
        if self.rows.len() < min {
            return Err(AnalysisError::insufficient(component, min, self.rows.len()));
        }
        Ok(())
    }

    /// SHA-256 over the table contents, hex encoded
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.target.map_or("none", Feature::name).as_bytes());
        hasher.update(self.window.start.to_string().as_bytes());
        hasher.update(self.window.end.to_string().as_bytes());
        for row in &self.rows {
            hasher.update(row.date.to_string().as_bytes());
            hasher.update(row.observed.to_le_bytes());
            for value in &row.values {
                hasher.update(value.to_bits().to_le_bytes());
            }
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Join specification: which categories to pull and how much history to
/// fetch before the window so lags and rolling columns are defined on its
/// first days.
#[derive(Debug, Clone)]
pub struct JoinSpec {
    pub categories: Vec<RecordCategory>,
    pub history_padding_days: i64,
    pub rolling_days: i64,
}

impl Default for JoinSpec {
    fn default() -> Self {
        Self {
            categories: RecordCategory::ALL.to_vec(),
            history_padding_days: 7,
            rolling_days: 7,
        }
    }
}

/// Running per-column aggregate for one date
#[derive(Debug, Clone)]
struct DayAccumulator {
    sums: [f64; FEATURE_COUNT],
    counts: [u32; FEATURE_COUNT],
    maxima: [f64; FEATURE_COUNT],
}

impl DayAccumulator {
    fn new() -> Self {
        Self {
            sums: [0.0; FEATURE_COUNT],
            counts: [0; FEATURE_COUNT],
            maxima: [f64::NEG_INFINITY; FEATURE_COUNT],
        }
    }

    fn add(&mut self, feature: Feature, value: Option<f64>) {
        if let Some(v) = value.filter(|v| v.is_finite()) {
            let i = feature.index();
            self.sums[i] += v;
            self.counts[i] += 1;
            self.maxima[i] = self.maxima[i].max(v);
        }
    }

    fn value(&self, feature: Feature) -> Option<f64> {
        let i = feature.index();
        if self.counts[i] == 0 {
            return None;
        }
        Some(match feature.aggregation() {
            Aggregation::Mean => self.sums[i] / self.counts[i] as f64,
            Aggregation::Sum => self.sums[i],
            Aggregation::Max => self.maxima[i],
        })
    }
}

/// Collapse rows sharing a date into one, aggregating each column over its
/// observed values. `rows` must be sorted by date.
fn merge_same_day(rows: Vec<FeatureRow>) -> Vec<FeatureRow> {
    let mut merged: Vec<FeatureRow> = Vec::with_capacity(rows.len());
    let mut group: Vec<FeatureRow> = Vec::new();

    for row in rows {
        if group.first().is_some_and(|g| g.date != row.date) {
            merged.push(collapse(std::mem::take(&mut group)));
        }
        group.push(row);
    }
    if !group.is_empty() {
        merged.push(collapse(group));
    }
    merged
}

fn collapse(mut group: Vec<FeatureRow>) -> FeatureRow {
    if group.len() == 1 {
        return group.remove(0);
    }
    let mut day = DayAccumulator::new();
    for row in &group {
        for feature in Feature::ALL {
            day.add(feature, row.observed_value(feature));
        }
    }
    let mut row = FeatureRow::new(group[0].date);
    for feature in Feature::ALL {
        if let Some(v) = day.value(feature) {
            row.set(feature, v);
        }
    }
    row
}

/// Builds [`FeatureTable`]s from a [`RecordSource`]
#[derive(Debug, Clone, Default)]
pub struct DataPreparation {
    join: JoinSpec,
}

impl DataPreparation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_join_spec(join: JoinSpec) -> Self {
        Self { join }
    }

    /// Table for a supervised analysis: dates without a measured `target`
    /// are dropped.
    pub fn prepare(
        &self,
        source: &dyn RecordSource,
        user_id: &str,
        window: DateRange,
        target: Feature,
    ) -> Result<FeatureTable> {
        self.build(source, user_id, window, Some(target))
    }

    /// Table keeping every joined date, used for trend series
    pub fn prepare_all(
        &self,
        source: &dyn RecordSource,
        user_id: &str,
        window: DateRange,
    ) -> Result<FeatureTable> {
        self.build(source, user_id, window, None)
    }

    fn build(
        &self,
        source: &dyn RecordSource,
        user_id: &str,
        window: DateRange,
        target: Option<Feature>,
    ) -> Result<FeatureTable> {
        let padded = DateRange::new(
            window.start - Duration::days(self.join.history_padding_days),
            window.end,
        );

        let mut days: BTreeMap<NaiveDate, DayAccumulator> = BTreeMap::new();
        let mut in_window: Vec<(RecordCategory, Vec<NaiveDate>)> = Vec::new();
        let mut workout_days: Vec<NaiveDate> = Vec::new();
        let mut workouts_present = false;

        for &category in &self.join.categories {
            let records = source.fetch(category, padded, user_id)?;
            debug!(
                category = %category,
                records = records.len(),
                source = source.name(),
                "Fetched records"
            );

            let mut dates = Vec::new();
            for record in &records {
                let date = record.date();
                if !padded.contains(date) {
                    continue;
                }
                if window.contains(date) {
                    dates.push(date);
                }
                if let PhysiologicalRecord::Sleep(s) = record {
                    if s.nap {
                        continue;
                    }
                }
                if let PhysiologicalRecord::Workout(_) = record {
                    workouts_present = true;
                    workout_days.push(date);
                }
                accumulate(days.entry(date).or_insert_with(DayAccumulator::new), record);
            }
            in_window.push((category, dates));
        }

        // Derived columns see the padded history; rows outside the window are
        // discarded afterwards.
        let raw: BTreeMap<NaiveDate, Vec<Option<f64>>> = days
            .iter()
            .map(|(date, acc)| {
                (
                    *date,
                    Feature::ALL.iter().map(|&f| acc.value(f)).collect(),
                )
            })
            .collect();

        let mut rows = Vec::new();
        let mut dropped = 0usize;
        for (&date, values) in raw.range(window.start..=window.end) {
            let mut row = FeatureRow::new(date);
            for feature in Feature::ALL {
                if let Some(v) = values[feature.index()] {
                    row.set(feature, v);
                }
            }
            if workouts_present && !row.is_observed(Feature::WorkoutCount) {
                row.set(Feature::WorkoutCount, 0.0);
                row.set(Feature::HadWorkout, 0.0);
                row.set(Feature::MorningWorkout, 0.0);
                row.set(Feature::EveningWorkout, 0.0);
            }
            self.derive(&mut row, &raw);

            if let Some(t) = target {
                if !row.is_observed(t) {
                    dropped += 1;
                    continue;
                }
            }
            rows.push(row);
        }

        let mut table = FeatureTable::from_rows(target, window, rows);
        table.dropped_without_target = dropped;
        table.integrity_issues = integrity_issues(&in_window, &table);

        for issue in &table.integrity_issues {
            warn!(issue = %issue, "Data integrity issue");
        }
        info!(
            target = target.map_or("none", Feature::name),
            rows = table.len(),
            dropped_without_target = dropped,
            degenerate = table.degenerate.len(),
            "Feature table prepared"
        );

        Ok(table)
    }

    fn derive(&self, row: &mut FeatureRow, raw: &BTreeMap<NaiveDate, Vec<Option<f64>>>) {
        let date = row.date;
        let observed = |day: NaiveDate, f: Feature| -> Option<f64> {
            raw.get(&day).and_then(|values| values[f.index()])
        };
        let trailing = |f: Feature, span: i64| -> Vec<f64> {
            let start = date - Duration::days(span - 1);
            raw.range(start..=date)
                .filter_map(|(_, values)| values[f.index()])
                .collect()
        };
        let mean = |values: &[f64]| -> Option<f64> {
            (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
        };

        let yesterday = date - Duration::days(1);
        if let Some(v) = observed(yesterday, Feature::Strain) {
            row.set(Feature::PrevStrain, v);
        }
        if let Some(v) = observed(yesterday, Feature::RecoveryScore) {
            row.set(Feature::PrevRecoveryScore, v);
        }
        if let Some(v) = observed(yesterday, Feature::HrvRmssdMilli) {
            row.set(Feature::PrevHrv, v);
        }

        let span = self.join.rolling_days;
        for (rolled, base) in [
            (Feature::StrainRolling7d, Feature::Strain),
            (Feature::HrvRolling7d, Feature::HrvRmssdMilli),
            (Feature::RhrRolling7d, Feature::RestingHeartRate),
            (Feature::SleepHoursRolling7d, Feature::SleepHours),
        ] {
            if let Some(v) = mean(&trailing(base, span)) {
                row.set(rolled, v);
            }
        }

        let recent_strain = trailing(Feature::Strain, 3);
        if !recent_strain.is_empty() {
            row.set(Feature::Strain3dSum, recent_strain.iter().sum());
        }

        if let (Some(eff), Some(rem), Some(deep)) = (
            row.observed_value(Feature::SleepEfficiencyPercentage),
            row.observed_value(Feature::RemSleepHours),
            row.observed_value(Feature::SlowWaveSleepHours),
        ) {
            row.set(Feature::SleepQualityScore, eff * 0.4 + rem * 10.0 + deep * 10.0);
        }

        let weekday = date.weekday().num_days_from_monday();
        row.set(Feature::DayOfWeek, weekday as f64);
        row.set(Feature::IsWeekend, if weekday >= 5 { 1.0 } else { 0.0 });
    }
}

fn accumulate(acc: &mut DayAccumulator, record: &PhysiologicalRecord) {
    match record {
        PhysiologicalRecord::Recovery(r) => {
            acc.add(Feature::RecoveryScore, r.recovery_score);
            acc.add(Feature::HrvRmssdMilli, r.hrv_rmssd_milli);
            acc.add(Feature::RestingHeartRate, r.resting_heart_rate);
            acc.add(Feature::Spo2Percentage, r.spo2_percentage);
            acc.add(Feature::SkinTempCelsius, r.skin_temp_celsius);
        }
        PhysiologicalRecord::Sleep(s) => {
            acc.add(Feature::SleepHours, s.sleep_hours());
            acc.add(Feature::TimeInBedHours, s.in_bed_hours());
            acc.add(Feature::RemSleepHours, s.rem_hours());
            acc.add(Feature::SlowWaveSleepHours, s.deep_hours());
            acc.add(Feature::LightSleepHours, s.light_hours());
            acc.add(Feature::AwakeTimeHours, s.awake_hours());
            acc.add(Feature::SleepEfficiencyPercentage, s.efficiency);
            acc.add(Feature::SleepConsistencyPercentage, s.consistency);
            acc.add(Feature::SleepPerformancePercentage, s.performance);
            acc.add(Feature::RespiratoryRate, s.respiratory_rate);
            acc.add(Feature::DisturbanceCount, s.disturbance_count);
            acc.add(Feature::BedtimeHour, Some(bedtime_hours(s.start)));
        }
        PhysiologicalRecord::Cycle(c) => {
            acc.add(Feature::Strain, c.strain);
            acc.add(Feature::Kilojoule, c.kilojoule);
            acc.add(Feature::AverageHeartRate, c.avg_hr);
            acc.add(Feature::MaxHeartRate, c.max_hr);
        }
        PhysiologicalRecord::Workout(w) => {
            let hour = w.start.hour();
            acc.add(Feature::WorkoutStrain, w.strain);
            acc.add(Feature::WorkoutCount, Some(1.0));
            acc.add(Feature::HadWorkout, Some(1.0));
            acc.add(
                Feature::MorningWorkout,
                Some(if (4..12).contains(&hour) { 1.0 } else { 0.0 }),
            );
            acc.add(
                Feature::EveningWorkout,
                Some(if hour >= 17 { 1.0 } else { 0.0 }),
            );
        }
    }
}

fn integrity_issues(
    in_window: &[(RecordCategory, Vec<NaiveDate>)],
    table: &FeatureTable,
) -> Vec<IntegrityIssue> {
    let kept: std::collections::BTreeSet<NaiveDate> = table.rows.iter().map(|r| r.date).collect();
    let mut issues = Vec::new();
    for (category, dates) in in_window {
        if dates.is_empty() {
            issues.push(IntegrityIssue::MissingCategory {
                category: *category,
            });
        } else if !table.rows.is_empty() && !dates.iter().any(|d| kept.contains(d)) {
            issues.push(IntegrityIssue::Unjoined {
                category: *category,
                records: dates.len(),
            });
        }
    }
    issues
}
