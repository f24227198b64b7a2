//! Factor importance analysis
//!
//! Trains a random forest to predict a target metric, turns its normalized
//! importances into a ranked list of factors, and attaches a direction, a
//! concrete threshold and a plain-language explanation to each one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::AnalyticsConfig;
use crate::error::AnalysisError;
use crate::features::{Feature, FeatureRow, FeatureTable};
use crate::forest::{RandomForestModel, RandomForestRegressor};
use crate::regressor::{FittedModel, ModelArtifact, ModelRegistry, Prediction, Regressor};
use crate::sanitize::{Sanitize, Sanitizer};
use crate::stats;

/// Candidate drivers of the daily recovery score
pub const RECOVERY_FACTORS: &[Feature] = &[
    Feature::HrvRmssdMilli,
    Feature::RestingHeartRate,
    Feature::SleepHours,
    Feature::SleepEfficiencyPercentage,
    Feature::RemSleepHours,
    Feature::SlowWaveSleepHours,
    Feature::Strain,
    Feature::SleepQualityScore,
    Feature::SleepConsistencyPercentage,
    Feature::BedtimeHour,
    Feature::PrevStrain,
];

/// Candidate drivers of sleep performance
pub const SLEEP_QUALITY_FACTORS: &[Feature] = &[
    Feature::SleepHours,
    Feature::RemSleepHours,
    Feature::SlowWaveSleepHours,
    Feature::AwakeTimeHours,
    Feature::BedtimeHour,
    Feature::DayOfWeek,
    Feature::RespiratoryRate,
    Feature::PrevStrain,
    Feature::PrevRecoveryScore,
    Feature::DisturbanceCount,
];

const QUARTILE: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Positive,
    Negative,
    /// No linear association, or none could be measured
    Neutral,
}

impl Direction {
    fn from_correlation(r: Option<f64>) -> Self {
        match r {
            Some(r) if r > 0.0 => Direction::Positive,
            Some(r) if r < 0.0 => Direction::Negative,
            _ => Direction::Neutral,
        }
    }
}

/// Validation accuracy, or why it could not be computed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ModelAccuracy {
    Available {
        /// Validation R², clamped to [0, 1]
        r_squared: f64,
        validation_rows: usize,
    },
    Unavailable {
        reason: String,
    },
}

impl ModelAccuracy {
    pub fn r_squared(&self) -> Option<f64> {
        match self {
            ModelAccuracy::Available { r_squared, .. } => Some(*r_squared),
            ModelAccuracy::Unavailable { .. } => None,
        }
    }
}

/// One ranked factor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Factor {
    pub feature: Feature,
    pub factor_name: String,
    /// Share of the model's importance, in percent (one decimal)
    pub importance_percentage: f64,
    pub direction: Direction,
    /// Pearson r between factor and target over the whole window
    pub correlation: f64,
    pub explanation: String,
    pub actionable_threshold: Option<String>,
    /// Factor mean on the best / worst 25 % of target days
    pub top_quartile_avg: f64,
    pub bottom_quartile_avg: f64,
    /// Target mean on the days this factor was highest / lowest
    pub target_when_factor_high: f64,
    pub target_when_factor_low: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorResult {
    pub target: Feature,
    pub factors: Vec<Factor>,
    pub top_lever: Option<String>,
    pub model_accuracy: ModelAccuracy,
    pub explanation: String,
    /// Candidate columns that were constant in this window
    pub uninformative_features: Vec<Feature>,
    pub min_rows_required: usize,
    pub rows_used: usize,
    pub training_rows: usize,
    pub computed_at: DateTime<Utc>,
}

impl Sanitize for Factor {
    fn sanitize(&mut self, s: &mut Sanitizer) {
        s.magnitude("importance_percentage", &mut self.importance_percentage);
        s.correlation("factor_correlation", &mut self.correlation);
        s.magnitude("top_quartile_avg", &mut self.top_quartile_avg);
        s.magnitude("bottom_quartile_avg", &mut self.bottom_quartile_avg);
        s.magnitude("target_when_factor_high", &mut self.target_when_factor_high);
        s.magnitude("target_when_factor_low", &mut self.target_when_factor_low);
    }
}

impl Sanitize for FactorResult {
    fn sanitize(&mut self, s: &mut Sanitizer) {
        self.factors.sanitize(s);
        if let ModelAccuracy::Available { r_squared, .. } = &mut self.model_accuracy {
            s.magnitude("model_r_squared", r_squared);
            *r_squared = r_squared.clamp(0.0, 1.0);
        }
    }
}

/// Result of a fit: the report plus the artifact to predict with
#[derive(Debug, Clone)]
pub struct FactorAnalysis {
    pub result: FactorResult,
    pub artifact: ModelArtifact<RandomForestModel>,
}

/// A prediction for one day with the factors that carry the most weight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorPrediction {
    pub target: Feature,
    pub prediction: Prediction,
    pub contributing_factors: Vec<ContributingFactor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributingFactor {
    pub feature: Feature,
    pub importance_percentage: f64,
    pub value: f64,
}

/// Factor importance analyzer
#[derive(Debug, Clone)]
pub struct FactorAnalyzer {
    forest: RandomForestRegressor,
    min_rows: usize,
    validation_fraction: f64,
}

impl Default for FactorAnalyzer {
    fn default() -> Self {
        Self::new(&AnalyticsConfig::default())
    }
}

/// Number of leading (oldest) rows used for training when the most recent
/// `validation_fraction` of `n` rows is held out. Both sides keep at least
/// one row whenever `n >= 2`.
pub fn chronological_split(n: usize, validation_fraction: f64) -> usize {
    if n < 2 {
        return n;
    }
    let validation_rows = ((n as f64 * validation_fraction).round() as usize).clamp(1, n - 1);
    n - validation_rows
}

impl FactorAnalyzer {
    pub fn new(config: &AnalyticsConfig) -> Self {
        Self {
            forest: RandomForestRegressor::from_settings(&config.forest),
            min_rows: config.gates.factor_min_rows,
            validation_fraction: config.forest.validation_fraction,
        }
    }

    pub fn with_forest(mut self, forest: RandomForestRegressor) -> Self {
        self.forest = forest;
        self
    }

    pub fn min_rows(&self) -> usize {
        self.min_rows
    }

    /// Model name under which artifacts for `target` are registered
    pub fn model_name(target: Feature) -> String {
        format!("{}_factors", target.name())
    }

    pub fn analyze(
        &self,
        table: &FeatureTable,
        target: Feature,
        candidates: &[Feature],
        computed_at: DateTime<Utc>,
    ) -> Result<FactorAnalysis, AnalysisError> {
        table.require_rows(self.min_rows, "factor importance")?;

        let (features, uninformative): (Vec<Feature>, Vec<Feature>) = candidates
            .iter()
            .copied()
            .filter(|&f| f != target)
            .partition(|&f| !table.is_degenerate(f));
        if features.is_empty() {
            return Err(AnalysisError::DegenerateInput {
                column: "all candidate factors".to_string(),
                reason: "every candidate column is constant in this window".to_string(),
            });
        }

        let x = table.matrix(&features);
        let y = table.column(target);
        let n = y.len();
        let training_rows = chronological_split(n, self.validation_fraction);
        let validation_rows = n - training_rows;

        // Chronological split: validate on the most recent days
        let model = self.forest.fit(&x[..training_rows], &y[..training_rows])?;
        let model_accuracy = match model.score(&x[training_rows..], &y[training_rows..]) {
            Some(r2) => ModelAccuracy::Available {
                r_squared: r2.clamp(0.0, 1.0),
                validation_rows,
            },
            None => ModelAccuracy::Unavailable {
                reason: format!(
                    "{} is constant across the {} validation days",
                    target.label(),
                    validation_rows
                ),
            },
        };

        let percentages = importance_percentages(&model.importances());
        let mut ranked: Vec<(Feature, f64)> =
            features.iter().copied().zip(percentages).collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let learned_something = ranked.iter().any(|(_, pct)| *pct > 0.0);
        let factors: Vec<Factor> = if learned_something {
            ranked
                .iter()
                .map(|&(feature, pct)| explain_factor(table, target, feature, pct))
                .collect()
        } else {
            Vec::new()
        };

        let top_lever = factors.first().map(|f| top_lever(f, target));
        let explanation = overall_explanation(&model_accuracy, target);

        info!(
            target = target.name(),
            rows = n,
            training_rows,
            factors = factors.len(),
            r_squared = ?model_accuracy.r_squared(),
            "Factor importance computed"
        );
        if !uninformative.is_empty() {
            debug!(?uninformative, "Constant candidate factors skipped");
        }

        let artifact = ModelArtifact::new(
            Self::model_name(target),
            features,
            target,
            computed_at,
            model_accuracy.r_squared(),
            training_rows,
            model,
        );

        Ok(FactorAnalysis {
            result: FactorResult {
                target,
                factors,
                top_lever,
                model_accuracy,
                explanation,
                uninformative_features: uninformative,
                min_rows_required: self.min_rows,
                rows_used: n,
                training_rows,
                computed_at,
            },
            artifact,
        })
    }

    /// Predict the target for one day from a registered artifact
    pub fn predict(
        registry: &ModelRegistry<RandomForestModel>,
        target: Feature,
        row: &FeatureRow,
    ) -> Result<FactorPrediction, AnalysisError> {
        let artifact = registry.get(&Self::model_name(target))?;
        let prediction = artifact.predict_features(|f| row.get(f), 0.95);

        let contributing_factors = artifact
            .ranked_importances()
            .into_iter()
            .take(3)
            .map(|(feature, importance)| ContributingFactor {
                feature,
                importance_percentage: importance * 100.0,
                value: row.get(feature),
            })
            .collect();

        Ok(FactorPrediction {
            target,
            prediction,
            contributing_factors,
        })
    }
}

/// Convert importances to percentages with one decimal that sum to exactly
/// 100.0 (largest-remainder rounding). All-zero input stays all zero.
pub fn importance_percentages(importances: &[f64]) -> Vec<f64> {
    let total: f64 = importances.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        return vec![0.0; importances.len()];
    }

    const UNITS: i64 = 1000;
    let exact: Vec<f64> = importances
        .iter()
        .map(|v| v / total * UNITS as f64)
        .collect();
    let mut units: Vec<i64> = exact.iter().map(|v| v.floor() as i64).collect();
    let mut remaining = UNITS - units.iter().sum::<i64>();

    let mut by_remainder: Vec<usize> = (0..exact.len()).collect();
    by_remainder.sort_by(|&a, &b| {
        let ra = exact[a] - exact[a].floor();
        let rb = exact[b] - exact[b].floor();
        rb.total_cmp(&ra).then(a.cmp(&b))
    });
    for &i in by_remainder.iter().cycle().take(exact.len() * 2) {
        if remaining <= 0 {
            break;
        }
        units[i] += 1;
        remaining -= 1;
    }

    units.into_iter().map(|u| u as f64 / 10.0).collect()
}

fn target_noun(target: Feature) -> &'static str {
    match target {
        Feature::RecoveryScore => "recovery",
        Feature::SleepPerformancePercentage => "sleep performance",
        Feature::HrvRmssdMilli => "HRV",
        _ => "target",
    }
}

/// Flags and calendar columns get no threshold
fn has_threshold(feature: Feature) -> bool {
    !matches!(
        feature,
        Feature::DayOfWeek
            | Feature::IsWeekend
            | Feature::HadWorkout
            | Feature::MorningWorkout
            | Feature::EveningWorkout
    )
}

fn explain_factor(table: &FeatureTable, target: Feature, feature: Feature, pct: f64) -> Factor {
    let x = table.column(feature);
    let y = table.column(target);

    let r = stats::pearson(&x, &y).map(|c| c.r).filter(|r| r.is_finite());
    let direction = Direction::from_correlation(r);
    let correlation = r.unwrap_or(0.0);
    let (top_avg, bottom_avg) = stats::extreme_group_means(&y, &x, QUARTILE).unwrap_or((0.0, 0.0));
    let (target_high, target_low) =
        stats::extreme_group_means(&x, &y, QUARTILE).unwrap_or((0.0, 0.0));

    let noun = target_noun(target);
    let explanation = match feature {
        Feature::SleepHours => format!(
            "Sleep duration accounts for {:.1}% of your {} variation. Your best days average {:.1} hours of sleep.",
            pct, noun, top_avg
        ),
        Feature::SleepEfficiencyPercentage => format!(
            "Sleep efficiency accounts for {:.1}% of your {}. Your best days have {:.0}% efficiency.",
            pct, noun, top_avg
        ),
        Feature::HrvRmssdMilli if direction != Direction::Neutral => format!(
            "HRV accounts for {:.1}% of {} variation. {} HRV ({:.0}ms) goes with better {}.",
            pct,
            noun,
            if direction == Direction::Positive { "Higher" } else { "Lower" },
            top_avg,
            noun
        ),
        Feature::RestingHeartRate if direction != Direction::Neutral => format!(
            "Resting heart rate accounts for {:.1}% of {}. {} RHR ({:.0}bpm) indicates better {}.",
            pct,
            noun,
            if direction == Direction::Negative { "Lower" } else { "Higher" },
            top_avg,
            noun
        ),
        Feature::Strain | Feature::PrevStrain => format!(
            "{} accounts for {:.1}% of {}. Days averaging {:.1} strain lead to your best {}.",
            feature.label(),
            pct,
            noun,
            top_avg,
            noun
        ),
        _ => format!(
            "{} accounts for {:.1}% of your {} variation.",
            feature.label(),
            pct,
            noun
        ),
    };

    let actionable_threshold = match direction {
        _ if !has_threshold(feature) => None,
        Direction::Positive => Some(format!(">= {}", feature.format_value(top_avg))),
        Direction::Negative => Some(format!("<= {}", feature.format_value(top_avg))),
        Direction::Neutral => None,
    };

    Factor {
        feature,
        factor_name: feature.label().to_string(),
        importance_percentage: pct,
        direction,
        correlation,
        explanation,
        actionable_threshold,
        top_quartile_avg: top_avg,
        bottom_quartile_avg: bottom_avg,
        target_when_factor_high: target_high,
        target_when_factor_low: target_low,
    }
}

fn top_lever(factor: &Factor, target: Feature) -> String {
    let noun = target_noun(target);
    let pct = factor.importance_percentage;
    match factor.feature {
        Feature::SleepHours => format!(
            "Sleep duration is your biggest lever ({:.0}% of {}) - aim for {:.1}+ hours",
            pct, noun, factor.top_quartile_avg
        ),
        Feature::SleepEfficiencyPercentage => format!(
            "Sleep efficiency is your biggest lever ({:.0}% of {}) - target {:.0}%+ efficiency",
            pct, noun, factor.top_quartile_avg
        ),
        Feature::HrvRmssdMilli if factor.direction != Direction::Neutral => format!(
            "HRV is your biggest {} driver ({:.0}%) - focus on stress management and recovery practices",
            noun, pct
        ),
        feature => format!(
            "{} is your biggest {} driver at {:.0}%",
            feature.label(),
            noun,
            pct
        ),
    }
}

fn overall_explanation(accuracy: &ModelAccuracy, target: Feature) -> String {
    let noun = target_noun(target);
    match accuracy {
        ModelAccuracy::Available { r_squared, .. } => {
            let pct = r_squared * 100.0;
            if *r_squared >= 0.7 {
                format!(
                    "This model explains {:.0}% of your {} variation with high accuracy - predictions are reliable",
                    pct, noun
                )
            } else if *r_squared >= 0.5 {
                format!(
                    "This model explains {:.0}% of your {} variation with moderate accuracy",
                    pct, noun
                )
            } else {
                format!(
                    "This model explains {:.0}% of {} variation - other unmeasured factors may be important",
                    pct, noun
                )
            }
        }
        ModelAccuracy::Unavailable { reason } => {
            format!("Model accuracy unavailable: {}", reason)
        }
    }
}
