//! Correlation engine
//!
//! Pairwise Pearson correlation over every informative column of a
//! [`FeatureTable`], filtered by significance and magnitude, with a concrete
//! example drawn from the user's own data for the strongest pairs.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

use crate::config::{AnalyticsConfig, CorrelationSettings};
use crate::error::AnalysisError;
use crate::features::{Feature, FeatureTable};
use crate::sanitize::{Sanitize, Sanitizer};
use crate::stats::{self, Correlation};

const TERCILE: f64 = 1.0 / 3.0;

/// Strength label for a surfaced pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strength {
    Weak,
    Moderate,
    Strong,
}

impl Strength {
    /// `None` below the weakest reportable magnitude
    pub fn classify(r: f64, min_abs: f64) -> Option<Self> {
        let abs = r.abs();
        if abs >= 0.7 {
            Some(Strength::Strong)
        } else if abs >= 0.5 {
            Some(Strength::Moderate)
        } else if abs >= min_abs {
            Some(Strength::Weak)
        } else {
            None
        }
    }
}

impl fmt::Display for Strength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Strength::Weak => "weak",
            Strength::Moderate => "moderate",
            Strength::Strong => "strong",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationPair {
    pub metric_1: Feature,
    pub metric_2: Feature,
    pub metric_1_name: String,
    pub metric_2_name: String,
    pub correlation: f64,
    pub p_value: f64,
    pub n: usize,
    pub significance: Strength,
    pub explanation: String,
    /// Only the top-K pairs carry an example
    pub example: Option<String>,
}

/// Full correlation matrix, for heatmap consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationMatrix {
    pub features: Vec<Feature>,
    /// `values[i][j]` is r between `features[i]` and `features[j]`; entries
    /// involving a constant column are 0
    pub values: Vec<Vec<f64>>,
}

impl CorrelationMatrix {
    pub fn get(&self, a: Feature, b: Feature) -> Option<f64> {
        let i = self.features.iter().position(|&f| f == a)?;
        let j = self.features.iter().position(|&f| f == b)?;
        Some(self.values[i][j])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationResult {
    pub correlations: Vec<CorrelationPair>,
    pub summary: String,
    pub matrix: CorrelationMatrix,
    /// Constant columns left out of the pairwise search
    pub excluded_degenerate: Vec<Feature>,
    pub significance_threshold: f64,
    pub rows_used: usize,
    pub min_rows_required: usize,
    pub computed_at: DateTime<Utc>,
}

impl CorrelationResult {
    pub fn strongest(&self) -> Option<&CorrelationPair> {
        self.correlations.first()
    }

    /// Surfaced pairs that involve `feature`
    pub fn involving(&self, feature: Feature) -> impl Iterator<Item = &CorrelationPair> {
        self.correlations
            .iter()
            .filter(move |p| p.metric_1 == feature || p.metric_2 == feature)
    }
}

impl Sanitize for CorrelationPair {
    fn sanitize(&mut self, s: &mut Sanitizer) {
        s.correlation("correlation", &mut self.correlation);
        s.p_value("correlation_p_value", &mut self.p_value);
    }
}

impl Sanitize for CorrelationResult {
    fn sanitize(&mut self, s: &mut Sanitizer) {
        self.correlations.sanitize(s);
        for row in &mut self.matrix.values {
            for value in row.iter_mut() {
                s.correlation("correlation_matrix", value);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CorrelationEngine {
    settings: CorrelationSettings,
    min_rows: usize,
}

impl Default for CorrelationEngine {
    fn default() -> Self {
        Self::new(&AnalyticsConfig::default())
    }
}

impl CorrelationEngine {
    pub fn new(config: &AnalyticsConfig) -> Self {
        Self {
            settings: config.correlation.clone(),
            min_rows: config.gates.correlation_min_rows,
        }
    }

    pub fn min_rows(&self) -> usize {
        self.min_rows
    }

    /// Correlate every column of the table
    pub fn analyze(
        &self,
        table: &FeatureTable,
        computed_at: DateTime<Utc>,
    ) -> Result<CorrelationResult, AnalysisError> {
        self.analyze_columns(table, &Feature::ALL, computed_at)
    }

    pub fn analyze_columns(
        &self,
        table: &FeatureTable,
        columns: &[Feature],
        computed_at: DateTime<Utc>,
    ) -> Result<CorrelationResult, AnalysisError> {
        table.require_rows(self.min_rows, "correlation")?;

        let (informative, excluded_degenerate): (Vec<Feature>, Vec<Feature>) =
            columns.iter().copied().partition(|&f| !table.is_degenerate(f));
        let data: Vec<Vec<f64>> = columns.iter().map(|&f| table.column(f)).collect();

        let pairs: Vec<(usize, usize)> = (0..columns.len())
            .flat_map(|i| (i + 1..columns.len()).map(move |j| (i, j)))
            .collect();

        // Constant columns have no defined r; they read as 0 in the matrix
        let computed: Vec<Option<Correlation>> = pairs
            .par_iter()
            .map(|&(i, j)| {
                if table.is_degenerate(columns[i]) || table.is_degenerate(columns[j]) {
                    None
                } else {
                    stats::pearson(&data[i], &data[j])
                }
            })
            .collect();

        let mut values = vec![vec![0.0; columns.len()]; columns.len()];
        for (i, &feature) in columns.iter().enumerate() {
            if !table.is_degenerate(feature) {
                values[i][i] = 1.0;
            }
        }

        let mut correlations = Vec::new();
        for (&(i, j), corr) in pairs.iter().zip(&computed) {
            let Some(corr) = corr else { continue };
            values[i][j] = corr.r;
            values[j][i] = corr.r;

            let (a, b) = (columns[i], columns[j]);
            if self.settings.exclude_same_family && a.same_family(b) {
                continue;
            }
            if corr.p_value >= self.settings.significance_threshold {
                continue;
            }
            let Some(strength) = Strength::classify(corr.r, self.settings.min_abs_correlation)
            else {
                continue;
            };

            correlations.push(CorrelationPair {
                metric_1: a,
                metric_2: b,
                metric_1_name: a.label().to_string(),
                metric_2_name: b.label().to_string(),
                correlation: corr.r,
                p_value: corr.p_value,
                n: corr.n,
                significance: strength,
                explanation: explain(a, b, corr.r, strength),
                example: None,
            });
        }

        correlations.sort_by(|x, y| {
            y.correlation
                .abs()
                .total_cmp(&x.correlation.abs())
                .then(x.metric_1.cmp(&y.metric_1))
                .then(x.metric_2.cmp(&y.metric_2))
        });

        for pair in correlations.iter_mut().take(self.settings.example_top_k) {
            let first = &data[column_index(columns, pair.metric_1)];
            let second = &data[column_index(columns, pair.metric_2)];
            pair.example = example(pair.metric_1, pair.metric_2, first, second, pair.correlation);
        }

        let summary = match correlations.first() {
            Some(top) => format!(
                "Strongest relationship: {} and {} ({:.2} correlation)",
                top.metric_1_name, top.metric_2_name, top.correlation
            ),
            None => "No significant correlations found in your data".to_string(),
        };

        debug!(
            columns = informative.len(),
            excluded = excluded_degenerate.len(),
            pairs = pairs.len(),
            "Correlation matrix computed"
        );
        info!(
            rows = table.len(),
            significant = correlations.len(),
            "Correlation analysis completed"
        );

        Ok(CorrelationResult {
            correlations,
            summary,
            matrix: CorrelationMatrix {
                features: columns.to_vec(),
                values,
            },
            excluded_degenerate,
            significance_threshold: self.settings.significance_threshold,
            rows_used: table.len(),
            min_rows_required: self.min_rows,
            computed_at,
        })
    }
}

fn column_index(columns: &[Feature], feature: Feature) -> usize {
    columns.iter().position(|&f| f == feature).unwrap_or(0)
}

fn explain(a: Feature, b: Feature, r: f64, strength: Strength) -> String {
    let (name1, name2) = (a.label(), b.label());
    let positive = r > 0.0;
    match (strength, positive) {
        (Strength::Strong, true) => format!(
            "Strong positive relationship ({:.2}) - when {} increases, {} tends to increase significantly",
            r, name1, name2
        ),
        (Strength::Strong, false) => format!(
            "Strong negative relationship ({:.2}) - when {} increases, {} tends to decrease significantly",
            r, name1, name2
        ),
        (Strength::Moderate, true) => format!(
            "Moderate positive relationship ({:.2}) - {} and {} tend to move together",
            r, name1, name2
        ),
        (Strength::Moderate, false) => format!(
            "Moderate negative relationship ({:.2}) - {} and {} tend to move in opposite directions",
            r, name1, name2
        ),
        (Strength::Weak, true) => format!(
            "Weak positive relationship ({:.2}) - slight tendency for {} and {} to move together",
            r, name1, name2
        ),
        (Strength::Weak, false) => format!(
            "Weak negative relationship ({:.2}) - slight tendency for {} and {} to move oppositely",
            r, name1, name2
        ),
    }
}

/// Mean of the second metric on the first metric's top vs bottom tercile
fn example(a: Feature, b: Feature, first: &[f64], second: &[f64], r: f64) -> Option<String> {
    let (high, low) = stats::extreme_group_means(first, second, TERCILE)?;
    let text = if r > 0.0 {
        format!(
            "Your highest {} days show {} averaging {} vs {} on lowest {} days",
            a.label(),
            b.label(),
            b.format_value(high),
            b.format_value(low),
            a.label()
        )
    } else {
        format!(
            "When {} is high, {} averages {} vs {} when it is low (inverse relationship)",
            a.label(),
            b.label(),
            b.format_value(high),
            b.format_value(low)
        )
    };
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureRow;
    use crate::models::DateRange;
    use chrono::{Duration, NaiveDate};
    use proptest::prelude::*;

    fn table_from(
        days: usize,
        f: impl Fn(usize, FeatureRow) -> FeatureRow,
    ) -> FeatureTable {
        let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let rows = (0..days)
            .map(|i| f(i, FeatureRow::new(start + Duration::days(i as i64))))
            .collect();
        FeatureTable::from_rows(
            None,
            DateRange::new(start, start + Duration::days(days as i64)),
            rows,
        )
    }

    #[test]
    fn test_strong_pair_surfaces() {
        let table = table_from(40, |i, row| {
            let sleep = 5.0 + (i % 8) as f64 * 0.4;
            row.with(Feature::SleepHours, sleep)
                .with(Feature::RecoveryScore, 20.0 + sleep * 9.0 + (i % 3) as f64)
                .with(Feature::Strain, 10.0 + ((i * 7) % 5) as f64)
        });

        let result = CorrelationEngine::default().analyze(&table, Utc::now()).unwrap();
        let top = result.strongest().unwrap();
        assert_eq!(
            (top.metric_1, top.metric_2),
            (Feature::RecoveryScore, Feature::SleepHours)
        );
        assert_eq!(top.significance, Strength::Strong);
        assert!(top.p_value < 0.001);
        assert!(top.example.as_deref().unwrap().starts_with("Your highest"));
        assert!(result
            .summary
            .starts_with("Strongest relationship: Recovery Score and Sleep Duration"));
    }

    #[test]
    fn test_degenerate_columns_excluded() {
        let table = table_from(35, |i, row| {
            row.with(Feature::SleepHours, 6.0 + (i % 4) as f64)
                .with(Feature::RecoveryScore, 50.0 + (i % 4) as f64 * 5.0)
                .with(Feature::WorkoutCount, 0.0)
        });

        let result = CorrelationEngine::default().analyze(&table, Utc::now()).unwrap();
        assert!(result.excluded_degenerate.contains(&Feature::WorkoutCount));
        assert!(result.involving(Feature::WorkoutCount).next().is_none());
        assert_eq!(
            result.matrix.get(Feature::WorkoutCount, Feature::SleepHours),
            Some(0.0)
        );
        assert_eq!(
            result.matrix.get(Feature::SleepHours, Feature::SleepHours),
            Some(1.0)
        );
    }

    #[test]
    fn test_same_family_pairs_skipped() {
        let table = table_from(40, |i, row| {
            let hrv = 40.0 + (i % 9) as f64 * 3.0;
            row.with(Feature::HrvRmssdMilli, hrv)
                .with(Feature::PrevHrv, hrv + 0.5)
        });

        let result = CorrelationEngine::default().analyze(&table, Utc::now()).unwrap();
        assert!(result.correlations.is_empty());
        assert_eq!(result.summary, "No significant correlations found in your data");
    }

    #[test]
    fn test_minimum_rows() {
        let build = |days| {
            table_from(days, |i, row| {
                row.with(Feature::SleepHours, (i % 5) as f64)
                    .with(Feature::RecoveryScore, (i % 7) as f64)
            })
        };
        let engine = CorrelationEngine::default();
        assert!(engine.analyze(&build(30), Utc::now()).is_ok());
        assert_eq!(
            engine.analyze(&build(29), Utc::now()).unwrap_err(),
            AnalysisError::insufficient("correlation", 30, 29)
        );
    }

    #[test]
    fn test_strength_classification() {
        assert_eq!(Strength::classify(0.75, 0.3), Some(Strength::Strong));
        assert_eq!(Strength::classify(-0.55, 0.3), Some(Strength::Moderate));
        assert_eq!(Strength::classify(0.31, 0.3), Some(Strength::Weak));
        assert_eq!(Strength::classify(0.29, 0.3), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_reported_pairs_are_bounded(
            a in prop::collection::vec(0.0f64..100.0, 30..60),
            b in prop::collection::vec(0.0f64..100.0, 60),
            c in prop::collection::vec(0.0f64..10.0, 60),
        ) {
            let table = table_from(a.len(), |i, row| {
                row.with(Feature::RecoveryScore, a[i])
                    .with(Feature::SleepHours, b[i])
                    .with(Feature::Strain, c[i] + a[i] * 0.05)
            });
            let result = CorrelationEngine::default().analyze(&table, Utc::now()).unwrap();
            for pair in &result.correlations {
                prop_assert!((-1.0..=1.0).contains(&pair.correlation));
                prop_assert!((0.0..=1.0).contains(&pair.p_value));
                prop_assert!(pair.p_value < 0.05);
                prop_assert!(pair.correlation.abs() >= 0.3);
            }
        }
    }
}
