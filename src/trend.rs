//! Trend and anomaly detection over a single metric
//!
//! Works on measured values only; filled-in column means would flatten the
//! trend and hide anomalies.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

use crate::config::{AnalyticsConfig, TrendSettings};
use crate::error::AnalysisError;
use crate::features::{Feature, FeatureTable};
use crate::models::DateRange;
use crate::sanitize::{Sanitize, Sanitizer};
use crate::stats;

/// Rolling deviations below this fraction of the rolling mean are floored
const SD_FLOOR_FRACTION: f64 = 0.01;

/// Previous points needed before a point can be judged anomalous
const MIN_HISTORY: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendMetric {
    Recovery,
    Hrv,
    Rhr,
    Sleep,
    Strain,
}

impl TrendMetric {
    pub const ALL: [TrendMetric; 5] = [
        TrendMetric::Recovery,
        TrendMetric::Hrv,
        TrendMetric::Rhr,
        TrendMetric::Sleep,
        TrendMetric::Strain,
    ];

    pub fn feature(self) -> Feature {
        match self {
            TrendMetric::Recovery => Feature::RecoveryScore,
            TrendMetric::Hrv => Feature::HrvRmssdMilli,
            TrendMetric::Rhr => Feature::RestingHeartRate,
            TrendMetric::Sleep => Feature::SleepHours,
            TrendMetric::Strain => Feature::Strain,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TrendMetric::Recovery => "recovery",
            TrendMetric::Hrv => "hrv",
            TrendMetric::Rhr => "rhr",
            TrendMetric::Sleep => "sleep",
            TrendMetric::Strain => "strain",
        }
    }

    /// Whether an upward move is good news. Strain is neutral and reported
    /// as if higher were better.
    pub fn higher_is_better(self) -> bool {
        !matches!(self, TrendMetric::Rhr)
    }
}

impl fmt::Display for TrendMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TrendMetric {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TrendMetric::ALL
            .iter()
            .copied()
            .find(|m| m.name() == s.to_lowercase())
            .ok_or_else(|| AnalysisError::UnknownFeature {
                name: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Up,
    Down,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub date: NaiveDate,
    pub value: f64,
    pub annotation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub date: NaiveDate,
    pub value: f64,
    pub rolling_mean: f64,
    /// Deviation from the rolling mean in rolling standard deviations
    pub deviation: f64,
    pub annotation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendResult {
    pub metric: TrendMetric,
    pub direction: TrendDirection,
    pub change_percentage: f64,
    /// Means of the earliest and most recent thirds of the window
    pub baseline_mean: f64,
    pub recent_mean: f64,
    pub data_points: Vec<DataPoint>,
    pub anomalies: Vec<Anomaly>,
    pub description: String,
    pub window_days: u32,
    pub computed_at: DateTime<Utc>,
}

impl TrendResult {
    /// Whether the move is good news for this metric
    pub fn is_improving(&self) -> bool {
        match self.direction {
            TrendDirection::Stable => false,
            TrendDirection::Up => self.metric.higher_is_better(),
            TrendDirection::Down => !self.metric.higher_is_better(),
        }
    }

    /// Mean of the last `days` points
    pub fn recent_average(&self, days: usize) -> Option<f64> {
        let start = self.data_points.len().saturating_sub(days);
        let values: Vec<f64> = self.data_points[start..].iter().map(|p| p.value).collect();
        stats::mean(&values)
    }
}

impl Sanitize for TrendResult {
    fn sanitize(&mut self, s: &mut Sanitizer) {
        s.magnitude("change_percentage", &mut self.change_percentage);
        s.magnitude("baseline_mean", &mut self.baseline_mean);
        s.magnitude("recent_mean", &mut self.recent_mean);
        for point in &mut self.data_points {
            s.magnitude("trend_value", &mut point.value);
        }
        for anomaly in &mut self.anomalies {
            s.magnitude("anomaly_value", &mut anomaly.value);
            s.magnitude("anomaly_rolling_mean", &mut anomaly.rolling_mean);
            s.magnitude("anomaly_deviation", &mut anomaly.deviation);
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrendDetector {
    settings: TrendSettings,
    min_points: usize,
}

impl Default for TrendDetector {
    fn default() -> Self {
        Self::new(&AnalyticsConfig::default())
    }
}

impl TrendDetector {
    pub fn new(config: &AnalyticsConfig) -> Self {
        Self {
            settings: config.trend.clone(),
            min_points: config.gates.trend_min_points,
        }
    }

    /// Trend over the last `window_days` of the table's window
    pub fn analyze(
        &self,
        table: &FeatureTable,
        metric: TrendMetric,
        computed_at: DateTime<Utc>,
    ) -> Result<TrendResult, AnalysisError> {
        let range = DateRange::lookback(table.window().end, self.settings.window_days);
        let series: Vec<(NaiveDate, f64)> = table
            .observed_series(metric.feature())
            .into_iter()
            .filter(|(date, _)| range.contains(*date))
            .collect();
        self.analyze_series(metric, &series, computed_at)
    }

    /// Trend over an explicit date-ordered series
    pub fn analyze_series(
        &self,
        metric: TrendMetric,
        series: &[(NaiveDate, f64)],
        computed_at: DateTime<Utc>,
    ) -> Result<TrendResult, AnalysisError> {
        let component = format!("{} trend", metric);
        if series.len() < self.min_points {
            return Err(AnalysisError::insufficient(component, self.min_points, series.len()));
        }

        let values: Vec<f64> = series.iter().map(|(_, v)| *v).collect();
        let (baseline_mean, recent_mean) = third_means(&values);
        let change_percentage = third_change(&values);
        let direction = if change_percentage.abs() < self.settings.stable_band_pct {
            TrendDirection::Stable
        } else if change_percentage > 0.0 {
            TrendDirection::Up
        } else {
            TrendDirection::Down
        };

        let days = self.settings.window_days;
        let label = metric.name().to_uppercase();
        let description = match direction {
            TrendDirection::Stable => format!("{} is stable over the past {} days", label, days),
            TrendDirection::Up => format!(
                "{} trending up {:.0}% over the past {} days",
                label, change_percentage, days
            ),
            TrendDirection::Down => format!(
                "{} trending down {:.0}% over the past {} days",
                label,
                change_percentage.abs(),
                days
            ),
        };

        let anomalies = self.detect_anomalies(metric, series);
        let data_points = series
            .iter()
            .map(|&(date, value)| DataPoint {
                date,
                value,
                annotation: anomalies
                    .iter()
                    .find(|a| a.date == date)
                    .map(|a| a.annotation.clone()),
            })
            .collect();

        info!(
            metric = metric.name(),
            points = series.len(),
            ?direction,
            change = change_percentage,
            anomalies = anomalies.len(),
            "Trend computed"
        );

        Ok(TrendResult {
            metric,
            direction,
            change_percentage,
            baseline_mean,
            recent_mean,
            data_points,
            anomalies,
            description,
            window_days: days,
            computed_at,
        })
    }

    /// Flag points far from the trailing rolling mean of the points before
    /// them. The series itself is left untouched.
    fn detect_anomalies(&self, metric: TrendMetric, series: &[(NaiveDate, f64)]) -> Vec<Anomaly> {
        let window = self.settings.rolling_window.max(MIN_HISTORY);
        let k = self.settings.anomaly_std_multiplier;
        let mut anomalies = Vec::new();

        for i in MIN_HISTORY..series.len() {
            let history: Vec<f64> = series[i.saturating_sub(window)..i]
                .iter()
                .map(|(_, v)| *v)
                .collect();
            let (Some(mean), Some(sd)) = (stats::mean(&history), stats::std_dev(&history)) else {
                continue;
            };
            let sd = sd.max(SD_FLOOR_FRACTION * mean.abs()).max(f64::EPSILON);

            let (date, value) = series[i];
            let deviation = (value - mean) / sd;
            if deviation.abs() > k {
                debug!(metric = metric.name(), %date, value, deviation, "Anomaly detected");
                anomalies.push(Anomaly {
                    date,
                    value,
                    rolling_mean: mean,
                    deviation,
                    annotation: format!(
                        "{}: Unusual {} value ({:.1})",
                        date,
                        metric.name(),
                        value
                    ),
                });
            }
        }
        anomalies
    }
}

/// Means of the earliest and most recent thirds (at least one point each)
fn third_means(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let third = (values.len() / 3).max(1);
    let first = stats::mean(&values[..third]).unwrap_or(0.0);
    let last = stats::mean(&values[values.len() - third..]).unwrap_or(0.0);
    (first, last)
}

/// Percentage change from the earliest third to the most recent third.
/// Zero when the earliest third averages zero.
pub fn third_change(values: &[f64]) -> f64 {
    let (first, last) = third_means(values);
    if first == 0.0 {
        0.0
    } else {
        (last - first) / first * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureRow;
    use chrono::Duration;

    fn series(values: &[f64]) -> Vec<(NaiveDate, f64)> {
        let start = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| (start + Duration::days(i as i64), *v))
            .collect()
    }

    #[test]
    fn test_third_change() {
        assert_eq!(third_change(&[10.0, 10.0, 10.0, 12.0, 12.0, 12.0]), 20.0);
        assert_eq!(third_change(&[0.0, 5.0, 10.0]), 0.0);
    }

    #[test]
    fn test_directions() {
        let detector = TrendDetector::default();
        let up: Vec<f64> = (0..30).map(|i| 50.0 + i as f64).collect();
        let result = detector
            .analyze_series(TrendMetric::Recovery, &series(&up), Utc::now())
            .unwrap();
        assert_eq!(result.direction, TrendDirection::Up);
        assert!(result.description.starts_with("RECOVERY trending up"));
        assert!(result.is_improving());

        let rhr_up: Vec<f64> = (0..30).map(|i| 50.0 + i as f64 * 0.5).collect();
        let result = detector
            .analyze_series(TrendMetric::Rhr, &series(&rhr_up), Utc::now())
            .unwrap();
        assert_eq!(result.direction, TrendDirection::Up);
        assert!(!result.is_improving());

        let flat = vec![60.0, 61.0, 60.0, 59.0, 60.0, 61.0, 60.0, 59.0, 60.0];
        let result = detector
            .analyze_series(TrendMetric::Hrv, &series(&flat), Utc::now())
            .unwrap();
        assert_eq!(result.direction, TrendDirection::Stable);
        assert_eq!(result.description, "HRV is stable over the past 30 days");
    }

    #[test]
    fn test_single_spike_is_the_only_anomaly() {
        let mut values: Vec<f64> = (0..30).map(|i| 60.0 + (i % 3) as f64 - 1.0).collect();
        values[15] = 60.0 + 5.0 * 10.0;
        let points = series(&values);

        let result = TrendDetector::default()
            .analyze_series(TrendMetric::Recovery, &points, Utc::now())
            .unwrap();

        assert_eq!(result.anomalies.len(), 1);
        assert_eq!(result.anomalies[0].date, points[15].0);
        assert_eq!(result.direction, TrendDirection::Stable);
        // Annotated, not removed
        assert_eq!(result.data_points.len(), 30);
        assert_eq!(result.data_points[15].value, 110.0);
        assert!(result.data_points[15]
            .annotation
            .as_deref()
            .unwrap()
            .contains("Unusual recovery value (110.0)"));
    }

    #[test]
    fn test_minimum_points() {
        let detector = TrendDetector::default();
        let err = detector
            .analyze_series(TrendMetric::Sleep, &series(&[7.0; 6]), Utc::now())
            .unwrap_err();
        assert_eq!(err, AnalysisError::insufficient("sleep trend", 7, 6));
        assert!(detector
            .analyze_series(TrendMetric::Sleep, &series(&[7.0; 7]), Utc::now())
            .is_ok());
    }

    #[test]
    fn test_analyze_uses_observed_values_in_window() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let rows: Vec<FeatureRow> = (0..60)
            .map(|i| {
                let row = FeatureRow::new(start + Duration::days(i));
                // Sleep is only measured on even days
                if i % 2 == 0 {
                    row.with(Feature::SleepHours, 7.0 + (i % 4) as f64 * 0.1)
                } else {
                    row.with(Feature::RecoveryScore, 50.0)
                }
            })
            .collect();
        let table = FeatureTable::from_rows(
            None,
            DateRange::new(start, start + Duration::days(59)),
            rows,
        );

        let result = TrendDetector::default()
            .analyze(&table, TrendMetric::Sleep, Utc::now())
            .unwrap();
        assert_eq!(result.data_points.len(), 15);
        assert!(result.data_points.iter().all(|p| p.value >= 7.0));
    }

    #[test]
    fn test_metric_parsing() {
        assert_eq!("HRV".parse::<TrendMetric>().unwrap(), TrendMetric::Hrv);
        assert!("steps".parse::<TrendMetric>().is_err());
    }
}
