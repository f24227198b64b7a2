//! Multiple linear regression explainer
//!
//! Standardized OLS of a target on a curated predictor set. Reports per
//! predictor coefficients (per 1 SD), standard errors, t and p values, 95 %
//! intervals and the partial correlation with the target, which isolates each
//! predictor's contribution after controlling for the others.
//!
//! Constant and collinear predictors are kept in the output with neutral
//! values and flagged, so the remaining coefficients are exactly those of the
//! model fitted without them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::AnalyticsConfig;
use crate::error::{AnalysisError, ErrorKind};
use crate::features::{Feature, FeatureTable};
use crate::sanitize::{Sanitize, Sanitizer};
use crate::stats;

/// Recovery score drivers
pub const RECOVERY_PREDICTORS: &[Feature] = &[
    Feature::SlowWaveSleepHours,
    Feature::RemSleepHours,
    Feature::HrvRmssdMilli,
    Feature::MaxHeartRate,
    Feature::Strain,
    Feature::HadWorkout,
];

/// HRV drivers that are always included
pub const HRV_CORE_PREDICTORS: &[Feature] = &[
    Feature::SlowWaveSleepHours,
    Feature::RemSleepHours,
    Feature::SleepHours,
    Feature::SleepEfficiencyPercentage,
    Feature::RestingHeartRate,
    Feature::RespiratoryRate,
    Feature::WorkoutStrain,
    Feature::Strain,
];

/// HRV drivers included only when measured often enough
pub const HRV_OPTIONAL_PREDICTORS: &[Feature] = &[
    Feature::Spo2Percentage,
    Feature::SkinTempCelsius,
    Feature::DisturbanceCount,
];

const SIGNIFICANCE: f64 = 0.05;

/// A named target plus predictor set
#[derive(Debug, Clone, PartialEq)]
pub struct RegressionPreset {
    pub target: Feature,
    pub core: Vec<Feature>,
    pub optional: Vec<Feature>,
}

impl RegressionPreset {
    pub fn recovery() -> Self {
        Self {
            target: Feature::RecoveryScore,
            core: RECOVERY_PREDICTORS.to_vec(),
            optional: Vec::new(),
        }
    }

    pub fn hrv() -> Self {
        Self {
            target: Feature::HrvRmssdMilli,
            core: HRV_CORE_PREDICTORS.to_vec(),
            optional: HRV_OPTIONAL_PREDICTORS.to_vec(),
        }
    }

    /// Core predictors plus the optional ones measured on at least
    /// `min_observed` rows
    pub fn resolve(
        &self,
        table: &FeatureTable,
        min_observed: usize,
    ) -> (Vec<Feature>, Vec<Feature>) {
        let included: Vec<Feature> = self
            .optional
            .iter()
            .copied()
            .filter(|&f| table.observed_count(f) >= min_observed)
            .collect();
        let predictors = self.core.iter().chain(&included).copied().collect();
        (predictors, included)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictorStatus {
    Fitted,
    /// Zero variance over the window
    Constant,
    /// Linear combination of earlier predictors
    Collinear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefficientRow {
    /// `None` for the intercept
    pub feature: Option<Feature>,
    pub name: String,
    pub coefficient: f64,
    pub std_error: f64,
    pub t_value: f64,
    pub p_value: f64,
    pub significant: bool,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub status: PredictorStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialCorrelation {
    pub feature: Feature,
    pub name: String,
    pub partial_correlation: f64,
}

/// A predictor that could not be estimated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictorIssue {
    pub feature: Feature,
    pub status: PredictorStatus,
    pub kind: ErrorKind,
    pub reason: String,
}

impl PredictorIssue {
    pub fn to_error(&self) -> AnalysisError {
        AnalysisError::DegenerateInput {
            column: self.feature.name().to_string(),
            reason: self.reason.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionResult {
    pub target: Feature,
    /// Intercept first, then one row per predictor in input order
    pub coefficients: Vec<CoefficientRow>,
    pub partial_correlations: Vec<PartialCorrelation>,
    pub r_squared: f64,
    pub adj_r_squared: f64,
    pub n_observations: usize,
    pub dropped_predictors: Vec<PredictorIssue>,
    /// Optional predictors that had enough data to be included
    pub optional_included: Vec<Feature>,
    pub computed_at: DateTime<Utc>,
}

impl RegressionResult {
    pub fn coefficient(&self, feature: Feature) -> Option<&CoefficientRow> {
        self.coefficients.iter().find(|c| c.feature == Some(feature))
    }

    pub fn partial(&self, feature: Feature) -> Option<f64> {
        self.partial_correlations
            .iter()
            .find(|p| p.feature == feature)
            .map(|p| p.partial_correlation)
    }

    /// `DegenerateInput` errors for every flagged predictor
    pub fn degenerate_errors(&self) -> Vec<AnalysisError> {
        self.dropped_predictors.iter().map(PredictorIssue::to_error).collect()
    }

    /// Significant predictor with the largest |partial r|
    pub fn strongest_driver(&self) -> Option<&PartialCorrelation> {
        self.partial_correlations
            .iter()
            .filter(|p| {
                self.coefficient(p.feature)
                    .map_or(false, |c| c.significant)
            })
            .max_by(|a, b| {
                a.partial_correlation
                    .abs()
                    .total_cmp(&b.partial_correlation.abs())
                    .then(b.feature.cmp(&a.feature))
            })
    }
}

impl Sanitize for RegressionResult {
    fn sanitize(&mut self, s: &mut Sanitizer) {
        for row in &mut self.coefficients {
            s.magnitude("coefficient", &mut row.coefficient);
            s.magnitude("std_error", &mut row.std_error);
            s.magnitude("t_value", &mut row.t_value);
            s.p_value("regression_p_value", &mut row.p_value);
            s.magnitude("ci_lower", &mut row.ci_lower);
            s.magnitude("ci_upper", &mut row.ci_upper);
        }
        for partial in &mut self.partial_correlations {
            s.correlation("partial_correlation", &mut partial.partial_correlation);
        }
        s.magnitude("r_squared", &mut self.r_squared);
        s.magnitude("adj_r_squared", &mut self.adj_r_squared);
    }
}

#[derive(Debug, Clone)]
pub struct RegressionExplainer {
    min_rows: usize,
}

impl Default for RegressionExplainer {
    fn default() -> Self {
        Self::new(&AnalyticsConfig::default())
    }
}

impl RegressionExplainer {
    pub fn new(config: &AnalyticsConfig) -> Self {
        Self {
            min_rows: config.gates.regression_min_rows,
        }
    }

    pub fn analyze_preset(
        &self,
        table: &FeatureTable,
        preset: &RegressionPreset,
        computed_at: DateTime<Utc>,
    ) -> Result<RegressionResult, AnalysisError> {
        let (predictors, included) = preset.resolve(table, self.min_rows);
        let mut result = self.analyze(table, preset.target, &predictors, computed_at)?;
        result.optional_included = included;
        Ok(result)
    }

    pub fn analyze(
        &self,
        table: &FeatureTable,
        target: Feature,
        predictors: &[Feature],
        computed_at: DateTime<Utc>,
    ) -> Result<RegressionResult, AnalysisError> {
        let required = (predictors.len() + 2).max(self.min_rows);
        table.require_rows(required, "regression")?;

        let y = table.column(target);
        let n = y.len();

        let mut status = vec![PredictorStatus::Fitted; predictors.len()];
        let mut standardized: Vec<(usize, Vec<f64>)> = Vec::new();
        for (i, &feature) in predictors.iter().enumerate() {
            match stats::standardize(&table.column(feature)) {
                Some(z) => standardized.push((i, z)),
                None => status[i] = PredictorStatus::Constant,
            }
        }

        let candidate: Vec<Vec<f64>> = (0..n)
            .map(|r| standardized.iter().map(|(_, z)| z[r]).collect())
            .collect();
        let independent = stats::independent_columns(&candidate);
        let kept: Vec<usize> = independent.iter().map(|&k| standardized[k].0).collect();
        for (k, (i, _)) in standardized.iter().enumerate() {
            if !independent.contains(&k) {
                status[*i] = PredictorStatus::Collinear;
            }
        }

        let design: Vec<Vec<f64>> = (0..n)
            .map(|r| independent.iter().map(|&k| standardized[k].1[r]).collect())
            .collect();
        let fit = stats::ols(&design, &y).ok_or_else(|| AnalysisError::DegenerateInput {
            column: "predictors".to_string(),
            reason: "singular design matrix".to_string(),
        })?;

        let df = fit.residual_df as f64;
        let t_crit = stats::t_critical(SIGNIFICANCE, df);

        let fitted_row = |feature: Option<Feature>, name: String, k: usize| {
            let coefficient = fit.coefficients[k];
            let std_error = fit.standard_errors[k];
            let (ci_lower, ci_upper) = confidence_interval(coefficient, std_error, t_crit);
            CoefficientRow {
                feature,
                name,
                coefficient,
                std_error,
                t_value: fit.t_values[k],
                p_value: fit.p_values[k],
                significant: fit.p_values[k] < SIGNIFICANCE,
                ci_lower,
                ci_upper,
                status: PredictorStatus::Fitted,
            }
        };

        let mut coefficients = vec![fitted_row(None, "Intercept".to_string(), 0)];
        let mut partial_correlations = Vec::with_capacity(predictors.len());
        let mut dropped_predictors = Vec::new();

        for (i, &feature) in predictors.iter().enumerate() {
            let name = feature.label().to_string();
            match kept.iter().position(|&j| j == i) {
                Some(k) => {
                    let row = fitted_row(Some(feature), name.clone(), k + 1);
                    partial_correlations.push(PartialCorrelation {
                        feature,
                        name,
                        partial_correlation: partial_from_t(row.t_value, df),
                    });
                    coefficients.push(row);
                }
                None => {
                    let reason = match status[i] {
                        PredictorStatus::Constant => "zero variance over the window",
                        _ => "linear combination of other predictors",
                    };
                    warn!(
                        predictor = feature.name(),
                        reason, "Predictor excluded from regression"
                    );
                    dropped_predictors.push(PredictorIssue {
                        feature,
                        status: status[i],
                        kind: ErrorKind::DegenerateInput,
                        reason: reason.to_string(),
                    });
                    coefficients.push(CoefficientRow {
                        feature: Some(feature),
                        name: name.clone(),
                        coefficient: 0.0,
                        std_error: 0.0,
                        t_value: 0.0,
                        p_value: 1.0,
                        significant: false,
                        ci_lower: 0.0,
                        ci_upper: 0.0,
                        status: status[i],
                    });
                    partial_correlations.push(PartialCorrelation {
                        feature,
                        name,
                        partial_correlation: 0.0,
                    });
                }
            }
        }

        info!(
            target = target.name(),
            n,
            predictors = predictors.len(),
            dropped = dropped_predictors.len(),
            r_squared = fit.r_squared,
            "Regression fitted"
        );

        Ok(RegressionResult {
            target,
            coefficients,
            partial_correlations,
            r_squared: fit.r_squared,
            adj_r_squared: fit.adj_r_squared,
            n_observations: n,
            dropped_predictors,
            optional_included: Vec::new(),
            computed_at,
        })
    }
}

/// Partial correlation from a coefficient's t statistic
fn partial_from_t(t: f64, residual_df: f64) -> f64 {
    if t.is_infinite() {
        return t.signum();
    }
    t / (t * t + residual_df).sqrt()
}

/// Two-sided interval around a coefficient; collapses to the estimate when
/// no critical value exists
fn confidence_interval(coefficient: f64, std_error: f64, t_crit: Option<f64>) -> (f64, f64) {
    match t_crit {
        Some(t) if (t * std_error).is_finite() => {
            (coefficient - t * std_error, coefficient + t * std_error)
        }
        _ => (coefficient, coefficient),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureRow;
    use crate::models::DateRange;
    use crate::sanitize::sanitize;
    use chrono::{Duration, NaiveDate};
    use proptest::prelude::*;

    fn build_table(days: usize, extra: impl Fn(usize, FeatureRow) -> FeatureRow) -> FeatureTable {
        let start = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let rows = (0..days)
            .map(|i| {
                let deep = 1.0 + (i % 5) as f64 * 0.3;
                let rem = 1.5 + ((i * 3) % 7) as f64 * 0.2;
                let strain = 6.0 + ((i * 5) % 11) as f64;
                let noise = ((i * 7) % 13) as f64 * 0.4;
                let recovery = 30.0 + deep * 12.0 + rem * 6.0 - strain * 1.2 + noise;
                let row = FeatureRow::new(start + Duration::days(i as i64))
                    .with(Feature::RecoveryScore, recovery)
                    .with(Feature::SlowWaveSleepHours, deep)
                    .with(Feature::RemSleepHours, rem)
                    .with(Feature::Strain, strain);
                extra(i, row)
            })
            .collect();
        FeatureTable::from_rows(
            Some(Feature::RecoveryScore),
            DateRange::new(start, start + Duration::days(days as i64)),
            rows,
        )
    }

    #[test]
    fn test_confidence_interval_collapses_without_critical_value() {
        assert_eq!(confidence_interval(2.5, 0.4, None), (2.5, 2.5));
        assert_eq!(confidence_interval(2.5, f64::INFINITY, Some(2.0)), (2.5, 2.5));

        let (lower, upper) = confidence_interval(2.5, 0.5, Some(2.0));
        assert!((lower - 1.5).abs() < 1e-12);
        assert!((upper - 3.5).abs() < 1e-12);
    }

    const PREDICTORS: &[Feature] = &[
        Feature::SlowWaveSleepHours,
        Feature::RemSleepHours,
        Feature::Strain,
    ];

    #[test]
    fn test_recovers_signs_and_partials() {
        let table = build_table(60, |_, row| row);
        let result = RegressionExplainer::default()
            .analyze(&table, Feature::RecoveryScore, PREDICTORS, Utc::now())
            .unwrap();

        assert_eq!(result.coefficients.len(), 4);
        assert_eq!(result.coefficients[0].name, "Intercept");
        assert!(result.coefficient(Feature::SlowWaveSleepHours).unwrap().coefficient > 0.0);
        assert!(result.coefficient(Feature::Strain).unwrap().coefficient < 0.0);
        assert!(result.partial(Feature::SlowWaveSleepHours).unwrap() > 0.5);
        assert!(result.partial(Feature::Strain).unwrap() < -0.5);
        assert!(result.r_squared > 0.8 && result.r_squared <= 1.0);
        assert!(result.dropped_predictors.is_empty());

        for row in &result.coefficients {
            assert!(row.ci_lower <= row.coefficient && row.coefficient <= row.ci_upper);
        }
    }

    #[test]
    fn test_constant_predictor_is_flagged_without_changing_others() {
        let baseline = RegressionExplainer::default()
            .analyze(
                &build_table(40, |_, row| row),
                Feature::RecoveryScore,
                PREDICTORS,
                Utc::now(),
            )
            .unwrap();

        let table = build_table(40, |_, row| row.with(Feature::HadWorkout, 0.0));
        let mut predictors = PREDICTORS.to_vec();
        predictors.push(Feature::HadWorkout);
        let result = RegressionExplainer::default()
            .analyze(&table, Feature::RecoveryScore, &predictors, Utc::now())
            .unwrap();

        assert_eq!(result.partial(Feature::HadWorkout), Some(0.0));
        let row = result.coefficient(Feature::HadWorkout).unwrap();
        assert_eq!((row.coefficient, row.p_value), (0.0, 1.0));
        assert_eq!(row.status, PredictorStatus::Constant);
        assert!(matches!(
            result.degenerate_errors().as_slice(),
            [AnalysisError::DegenerateInput { column, .. }] if column == "had_workout"
        ));

        for &feature in PREDICTORS {
            assert_eq!(
                result.coefficient(feature).unwrap().coefficient,
                baseline.coefficient(feature).unwrap().coefficient
            );
        }
    }

    #[test]
    fn test_collinear_predictor_is_flagged() {
        let table = build_table(40, |i, row| {
            let deep = 1.0 + (i % 5) as f64 * 0.3;
            row.with(Feature::LightSleepHours, deep * 2.0 + 1.0)
        });
        let mut predictors = PREDICTORS.to_vec();
        predictors.push(Feature::LightSleepHours);
        let result = sanitize(
            RegressionExplainer::default()
                .analyze(&table, Feature::RecoveryScore, &predictors, Utc::now())
                .unwrap(),
        );

        assert_eq!(result.replaced(), 0);
        assert_eq!(
            result.coefficient(Feature::LightSleepHours).unwrap().status,
            PredictorStatus::Collinear
        );
        assert_eq!(result.partial(Feature::LightSleepHours), Some(0.0));
    }

    #[test]
    fn test_minimum_observations() {
        let explainer = RegressionExplainer::default();
        // Floor of 10 dominates predictors + 2 = 5
        let err = explainer
            .analyze(&build_table(9, |_, r| r), Feature::RecoveryScore, PREDICTORS, Utc::now())
            .unwrap_err();
        assert_eq!(err, AnalysisError::insufficient("regression", 10, 9));
        assert!(explainer
            .analyze(&build_table(10, |_, r| r), Feature::RecoveryScore, PREDICTORS, Utc::now())
            .is_ok());

        let mut config = AnalyticsConfig::default();
        config.gates.regression_min_rows = 0;
        let err = RegressionExplainer::new(&config)
            .analyze(&build_table(4, |_, r| r), Feature::RecoveryScore, PREDICTORS, Utc::now())
            .unwrap_err();
        assert_eq!(err, AnalysisError::insufficient("regression", 5, 4));
    }

    #[test]
    fn test_hrv_preset_optional_predictors() {
        let table = build_table(30, |i, row| {
            let row = row.with(Feature::HrvRmssdMilli, 40.0 + (i % 6) as f64 * 2.0);
            if i < 20 {
                row.with(Feature::Spo2Percentage, 95.0 + (i % 3) as f64)
            } else {
                row
            }
        });
        let result = RegressionExplainer::default()
            .analyze_preset(&table, &RegressionPreset::hrv(), Utc::now())
            .unwrap();

        assert_eq!(result.optional_included, vec![Feature::Spo2Percentage]);
        assert_eq!(result.coefficients.len(), 1 + HRV_CORE_PREDICTORS.len() + 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_sanitized_result_is_finite(
            targets in prop::collection::vec(0.0f64..100.0, 15..40),
            constant in 0.0f64..5.0,
        ) {
            let table = build_table(targets.len(), |i, row| {
                row.with(Feature::RecoveryScore, targets[i])
                    .with(Feature::HadWorkout, constant)
            });
            let mut predictors = PREDICTORS.to_vec();
            predictors.push(Feature::HadWorkout);
            let result = sanitize(
                RegressionExplainer::default()
                    .analyze(&table, Feature::RecoveryScore, &predictors, Utc::now())
                    .unwrap(),
            );
            for row in &result.coefficients {
                prop_assert!(row.coefficient.is_finite());
                prop_assert!(row.t_value.is_finite());
                prop_assert!((0.0..=1.0).contains(&row.p_value));
            }
            for partial in &result.partial_correlations {
                prop_assert!((-1.0..=1.0).contains(&partial.partial_correlation));
            }
        }
    }
}
