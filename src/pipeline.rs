//! Batch analytics pipeline
//!
//! One run prepares the feature tables, runs the independent analyses in
//! parallel, sanitizes and persists each result as soon as it is ready, then
//! synthesizes insights and a dashboard summary from whatever succeeded.
//! Component failures become [`AnalysisOutcome::Unavailable`] values; only an
//! invalid configuration aborts a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

use crate::config::AnalyticsConfig;
use crate::correlation::{CorrelationEngine, CorrelationPair, CorrelationResult};
use crate::error::{AnalysisError, ErrorKind, ErrorSeverity, Result, VitalRsError};
use crate::factors::{
    Factor, FactorAnalyzer, FactorResult, RECOVERY_FACTORS, SLEEP_QUALITY_FACTORS,
};
use crate::features::{DataPreparation, Feature, FeatureTable};
use crate::forest::RandomForestModel;
use crate::insights::{InsightInputs, InsightReport, InsightSynthesizer};
use crate::logging::{DiagnosticReport, StageRecord};
use crate::models::DateRange;
use crate::regression::{RegressionExplainer, RegressionPreset, RegressionResult};
use crate::regressor::{ModelArtifact, ModelRegistry};
use crate::sanitize::{sanitize, Sanitize, Sanitizer};
use crate::source::RecordSource;
use crate::store::{AnalysisType, ResultStore, StoredResult};
use crate::trend::{TrendDetector, TrendMetric, TrendResult};

/// Number of correlations carried into the dashboard summary
const SUMMARY_CORRELATIONS: usize = 7;
const SUMMARY_FACTORS: usize = 5;

/// Why a stage produced no result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unavailable {
    pub kind: ErrorKind,
    pub reason: String,
}

impl From<&VitalRsError> for Unavailable {
    fn from(err: &VitalRsError) -> Self {
        Self {
            kind: err.kind(),
            reason: err.user_message(),
        }
    }
}

impl From<AnalysisError> for Unavailable {
    fn from(err: AnalysisError) -> Self {
        Self::from(&VitalRsError::from(err))
    }
}

/// A component result, or the reason it could not be produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum AnalysisOutcome<T> {
    Available(T),
    Unavailable(Unavailable),
}

impl<T> AnalysisOutcome<T> {
    pub fn available(&self) -> Option<&T> {
        match self {
            AnalysisOutcome::Available(value) => Some(value),
            AnalysisOutcome::Unavailable(_) => None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.available().is_some()
    }

    pub fn unavailable(&self) -> Option<&Unavailable> {
        match self {
            AnalysisOutcome::Available(_) => None,
            AnalysisOutcome::Unavailable(u) => Some(u),
        }
    }
}

impl<T> From<std::result::Result<T, AnalysisError>> for AnalysisOutcome<T> {
    fn from(result: std::result::Result<T, AnalysisError>) -> Self {
        match result {
            Ok(value) => AnalysisOutcome::Available(value),
            Err(err) => AnalysisOutcome::Unavailable(err.into()),
        }
    }
}

impl<T: Sanitize> Sanitize for AnalysisOutcome<T> {
    fn sanitize(&mut self, s: &mut Sanitizer) {
        if let AnalysisOutcome::Available(value) = self {
            value.sanitize(s);
        }
    }
}

/// Trend outcome for one metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricTrend {
    pub metric: TrendMetric,
    pub outcome: AnalysisOutcome<TrendResult>,
}

impl Sanitize for MetricTrend {
    fn sanitize(&mut self, s: &mut Sanitizer) {
        self.outcome.sanitize(s);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendsReport {
    pub trends: Vec<MetricTrend>,
}

impl TrendsReport {
    pub fn get(&self, metric: TrendMetric) -> Option<&TrendResult> {
        self.trends
            .iter()
            .find(|t| t.metric == metric)
            .and_then(|t| t.outcome.available())
    }

    pub fn available(&self) -> Vec<TrendResult> {
        self.trends
            .iter()
            .filter_map(|t| t.outcome.available().cloned())
            .collect()
    }
}

impl Sanitize for TrendsReport {
    fn sanitize(&mut self, s: &mut Sanitizer) {
        self.trends.sanitize(s);
    }
}

/// Compact view for dashboard consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardSummary {
    pub top_factors: Vec<Factor>,
    pub model_accuracy: Option<f64>,
    pub top_correlations: Vec<CorrelationPair>,
    pub recovery_trend: Option<TrendResult>,
    pub hrv_trend: Option<TrendResult>,
    pub insight_summary: String,
    /// Analysis types that degraded, with their reasons
    pub unavailable: Vec<(AnalysisType, Unavailable)>,
    pub computed_at: DateTime<Utc>,
}

impl Sanitize for DashboardSummary {
    fn sanitize(&mut self, s: &mut Sanitizer) {
        self.top_factors.sanitize(s);
        s.optional("model_accuracy", &mut self.model_accuracy);
        self.top_correlations.sanitize(s);
        self.recovery_trend.sanitize(s);
        self.hrv_trend.sanitize(s);
    }
}

/// Everything one run produced
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub computed_at: DateTime<Utc>,
    pub window: DateRange,
    pub factors: AnalysisOutcome<FactorResult>,
    pub sleep_factors: AnalysisOutcome<FactorResult>,
    pub correlations: AnalysisOutcome<CorrelationResult>,
    pub regression: AnalysisOutcome<RegressionResult>,
    pub hrv_regression: AnalysisOutcome<RegressionResult>,
    pub trends: AnalysisOutcome<TrendsReport>,
    pub insights: InsightReport,
    pub summary: DashboardSummary,
    /// Trained factor models, for predictions
    pub models: ModelRegistry<RandomForestModel>,
    pub report: DiagnosticReport,
}

type Prepared = std::result::Result<FeatureTable, Unavailable>;

struct StageOutput<T, E> {
    outcome: AnalysisOutcome<T>,
    extra: Option<E>,
    record: StageRecord,
    warning: Option<String>,
}

/// Per-run values shared by every stage
struct RunContext<'a> {
    run_id: Uuid,
    computed_at: DateTime<Utc>,
    lookback_days: u32,
    store: &'a dyn ResultStore,
}

impl RunContext<'_> {
    /// Sanitize, persist and wrap one stage's outcome
    fn run_stage<T, E, F>(
        &self,
        analysis_type: AnalysisType,
        input: &Prepared,
        compute: F,
    ) -> StageOutput<T, E>
    where
        T: Sanitize + Serialize,
        F: FnOnce(&FeatureTable) -> std::result::Result<(T, E), AnalysisError>,
    {
        let span = info_span!("stage", analysis = %analysis_type);
        let _enter = span.enter();
        let started = Instant::now();

        let (outcome, extra, fingerprint) = match input {
            Ok(table) => match compute(table) {
                Ok((value, extra)) => (
                    AnalysisOutcome::Available(value),
                    Some(extra),
                    Some(table.fingerprint()),
                ),
                Err(err) => {
                    warn!(error = %err, kind = %err.kind(), "Stage degraded");
                    (AnalysisOutcome::Unavailable(err.into()), None, Some(table.fingerprint()))
                }
            },
            Err(unavailable) => (AnalysisOutcome::Unavailable(unavailable.clone()), None, None),
        };

        let clean = sanitize(outcome);
        let warning = self.persist(analysis_type, fingerprint, &clean);
        let outcome = clean.into_inner();

        let record = StageRecord {
            stage: analysis_type.as_str().to_string(),
            available: outcome.is_available(),
            error_kind: outcome.unavailable().map(|u| u.kind),
            reason: outcome.unavailable().map(|u| u.reason.clone()),
            duration: started.elapsed(),
        };
        info!(
            available = record.available,
            elapsed_ms = record.duration.as_millis() as u64,
            "Stage finished"
        );

        StageOutput {
            outcome,
            extra,
            record,
            warning,
        }
    }

    /// Store a sanitized value; a failure is reported, never fatal
    fn persist<T: Serialize>(
        &self,
        analysis_type: AnalysisType,
        fingerprint: Option<String>,
        value: &crate::sanitize::Sanitized<T>,
    ) -> Option<String> {
        let stored = StoredResult::new(
            self.run_id,
            analysis_type,
            self.computed_at,
            self.lookback_days,
            fingerprint,
            value,
        )
        .and_then(|entry| self.store.save(&entry));

        match stored {
            Ok(()) => None,
            Err(err) => {
                warn!(analysis = %analysis_type, error = %err, "Failed to persist result");
                Some(format!("{} not persisted: {}", analysis_type, err))
            }
        }
    }
}

/// Runs every analysis for one user over the configured window
pub struct AnalyticsPipeline<'a> {
    config: AnalyticsConfig,
    source: &'a dyn RecordSource,
    store: &'a dyn ResultStore,
    preparation: DataPreparation,
    computed_at: Option<DateTime<Utc>>,
}

impl<'a> AnalyticsPipeline<'a> {
    pub fn new(
        config: AnalyticsConfig,
        source: &'a dyn RecordSource,
        store: &'a dyn ResultStore,
    ) -> Self {
        Self {
            config,
            source,
            store,
            preparation: DataPreparation::new(),
            computed_at: None,
        }
    }

    /// Pin the timestamp stamped on every result, for reproducible output
    pub fn with_computed_at(mut self, computed_at: DateTime<Utc>) -> Self {
        self.computed_at = Some(computed_at);
        self
    }

    pub fn with_preparation(mut self, preparation: DataPreparation) -> Self {
        self.preparation = preparation;
        self
    }

    pub fn config(&self) -> &AnalyticsConfig {
        &self.config
    }

    fn prepare(
        &self,
        user_id: &str,
        window: DateRange,
        target: Option<Feature>,
        report: &mut DiagnosticReport,
    ) -> Prepared {
        let label = target.map_or("all", Feature::name);
        let prepared = match target {
            Some(target) => self.preparation.prepare(self.source, user_id, window, target),
            None => self.preparation.prepare_all(self.source, user_id, window),
        };

        match prepared {
            Ok(table) => {
                for issue in table.integrity_issues() {
                    report.add_warning(format!("{} table: {}", label, issue));
                }
                Ok(table)
            }
            Err(err) => {
                match err.severity() {
                    ErrorSeverity::Error => {
                        error!(table = label, error = %err, "Data preparation failed")
                    }
                    ErrorSeverity::Warning => {
                        warn!(table = label, error = %err, "Data preparation failed")
                    }
                    ErrorSeverity::Info => {
                        info!(table = label, error = %err, "Data preparation failed")
                    }
                }
                report.add_warning(format!("{} table: {}", label, err));
                Err(Unavailable::from(&err))
            }
        }
    }

    pub fn run(&self, user_id: &str) -> Result<PipelineRun> {
        self.config.validate()?;

        let started = Instant::now();
        let run_id = Uuid::new_v4();
        let computed_at = self.computed_at.unwrap_or_else(Utc::now);
        let window = DateRange::lookback(self.config.as_of(), self.config.window.lookback_days);

        let span = info_span!("pipeline", %run_id, user_id);
        let _enter = span.enter();
        info!(start = %window.start, end = %window.end, "Starting analytics run");

        let mut report = DiagnosticReport::new("analytics_run");
        report.add_context("run_id", run_id.to_string());
        report.add_context("user_id", user_id);
        report.add_context("window", format!("{} to {}", window.start, window.end));

        let recovery_table =
            self.prepare(user_id, window, Some(Feature::RecoveryScore), &mut report);
        let sleep_table = self.prepare(
            user_id,
            window,
            Some(Feature::SleepPerformancePercentage),
            &mut report,
        );
        let hrv_table = self.prepare(user_id, window, Some(Feature::HrvRmssdMilli), &mut report);
        let all_table = self.prepare(user_id, window, None, &mut report);

        let ctx = RunContext {
            run_id,
            computed_at,
            lookback_days: self.config.window.lookback_days,
            store: self.store,
        };
        let factor_analyzer = FactorAnalyzer::new(&self.config);
        let correlation_engine = CorrelationEngine::new(&self.config);
        let regression = RegressionExplainer::new(&self.config);
        let trend_detector = TrendDetector::new(&self.config);

        let factors_stage = || {
            ctx.run_stage(AnalysisType::FactorImportance, &recovery_table, |t| {
                factor_analyzer
                    .analyze(t, Feature::RecoveryScore, RECOVERY_FACTORS, computed_at)
                    .map(|a| (a.result, a.artifact))
            })
        };
        let sleep_stage = || {
            ctx.run_stage(AnalysisType::SleepQualityFactors, &sleep_table, |t| {
                factor_analyzer
                    .analyze(
                        t,
                        Feature::SleepPerformancePercentage,
                        SLEEP_QUALITY_FACTORS,
                        computed_at,
                    )
                    .map(|a| (a.result, a.artifact))
            })
        };
        let correlation_stage = || {
            ctx.run_stage(AnalysisType::Correlations, &recovery_table, |t| {
                correlation_engine.analyze(t, computed_at).map(|r| (r, ()))
            })
        };
        let regression_stage = || {
            ctx.run_stage(AnalysisType::Regression, &recovery_table, |t| {
                regression
                    .analyze_preset(t, &RegressionPreset::recovery(), computed_at)
                    .map(|r| (r, ()))
            })
        };
        let hrv_stage = || {
            ctx.run_stage(AnalysisType::HrvRegression, &hrv_table, |t| {
                regression
                    .analyze_preset(t, &RegressionPreset::hrv(), computed_at)
                    .map(|r| (r, ()))
            })
        };
        let trends_stage = || {
            ctx.run_stage(AnalysisType::Trends, &all_table, |t| {
                let trends = TrendMetric::ALL
                    .iter()
                    .map(|&metric| MetricTrend {
                        metric,
                        outcome: trend_detector.analyze(t, metric, computed_at).into(),
                    })
                    .collect();
                Ok((TrendsReport { trends }, ()))
            })
        };

        // The analyses share nothing mutable; each persists its own result
        let (
            (mut factors, mut sleep_factors),
            ((correlations, regression_out), (hrv_regression, trends)),
        ) = rayon::join(
            || rayon::join(factors_stage, sleep_stage),
            || {
                rayon::join(
                    || rayon::join(correlation_stage, regression_stage),
                    || rayon::join(hrv_stage, trends_stage),
                )
            },
        );

        let mut models = ModelRegistry::new();
        for artifact in [factors.extra.take(), sleep_factors.extra.take()].into_iter().flatten() {
            register(&mut models, artifact);
        }
        record(&mut report, &factors);
        record(&mut report, &sleep_factors);
        record(&mut report, &correlations);
        record(&mut report, &regression_out);
        record(&mut report, &hrv_regression);
        record(&mut report, &trends);

        let available_trends = trends
            .outcome
            .available()
            .map(TrendsReport::available)
            .unwrap_or_default();
        let inputs = InsightInputs {
            factors: factors.outcome.available(),
            correlations: correlations.outcome.available(),
            regression: regression_out.outcome.available(),
            trends: &available_trends,
        };
        let insights =
            sanitize(InsightSynthesizer::new(&self.config).synthesize(&inputs, computed_at));
        if let Some(warning) = ctx.persist(AnalysisType::Insights, None, &insights) {
            report.add_warning(warning);
        }
        let insights = insights.into_inner();

        let mut unavailable = Vec::new();
        for (analysis_type, outcome) in [
            (AnalysisType::FactorImportance, factors.outcome.unavailable()),
            (AnalysisType::SleepQualityFactors, sleep_factors.outcome.unavailable()),
            (AnalysisType::Correlations, correlations.outcome.unavailable()),
            (AnalysisType::Regression, regression_out.outcome.unavailable()),
            (AnalysisType::HrvRegression, hrv_regression.outcome.unavailable()),
            (AnalysisType::Trends, trends.outcome.unavailable()),
        ] {
            if let Some(reason) = outcome {
                unavailable.push((analysis_type, reason.clone()));
            }
        }

        let summary = sanitize(DashboardSummary {
            top_factors: factors
                .outcome
                .available()
                .map(|f| f.factors.iter().take(SUMMARY_FACTORS).cloned().collect())
                .unwrap_or_default(),
            model_accuracy: factors
                .outcome
                .available()
                .and_then(|f| f.model_accuracy.r_squared()),
            top_correlations: correlations
                .outcome
                .available()
                .map(|c| c.correlations.iter().take(SUMMARY_CORRELATIONS).cloned().collect())
                .unwrap_or_default(),
            recovery_trend: trends
                .outcome
                .available()
                .and_then(|t| t.get(TrendMetric::Recovery).cloned()),
            hrv_trend: trends
                .outcome
                .available()
                .and_then(|t| t.get(TrendMetric::Hrv).cloned()),
            insight_summary: insights.summary.clone(),
            unavailable,
            computed_at,
        });
        if let Some(warning) = ctx.persist(AnalysisType::Summary, None, &summary) {
            report.add_warning(warning);
        }
        let summary = summary.into_inner();

        let elapsed: Duration = started.elapsed();
        report.set_duration(elapsed);
        report.set_success(true);
        info!(
            degraded = report.degraded_stages(),
            insights = insights.insights.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Analytics run completed"
        );

        Ok(PipelineRun {
            run_id,
            computed_at,
            window,
            factors: factors.outcome,
            sleep_factors: sleep_factors.outcome,
            correlations: correlations.outcome,
            regression: regression_out.outcome,
            hrv_regression: hrv_regression.outcome,
            trends: trends.outcome,
            insights,
            summary,
            models,
            report,
        })
    }
}

fn register(
    models: &mut ModelRegistry<RandomForestModel>,
    artifact: ModelArtifact<RandomForestModel>,
) {
    if let Some(previous) = models.register(artifact) {
        warn!(model = %previous.model_name, "Replaced model trained earlier in this run");
    }
}

fn record<T, E>(report: &mut DiagnosticReport, stage: &StageOutput<T, E>) {
    report.record_stage(stage.record.clone());
    if let Some(warning) = &stage.warning {
        report.add_warning(warning.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_from_error_carries_reason() {
        let outcome: AnalysisOutcome<f64> =
            Err(AnalysisError::insufficient("factor importance", 50, 12)).into();
        let reason = outcome.unavailable().unwrap();
        assert_eq!(reason.kind, ErrorKind::InsufficientData);
        assert_eq!(reason.reason, "need at least 50 records, have 12");
    }

    #[test]
    fn test_outcome_serialization_is_tagged() {
        let outcome: AnalysisOutcome<u32> = AnalysisOutcome::Unavailable(Unavailable {
            kind: ErrorKind::ModelNotTrained,
            reason: "analytics not yet computed".to_string(),
        });
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "unavailable");
        assert_eq!(json["data"]["kind"], "model_not_trained");

        let available = serde_json::to_value(AnalysisOutcome::Available(3u32)).unwrap();
        assert_eq!(available["status"], "available");
        assert_eq!(available["data"], 3);
    }

    #[test]
    fn test_summary_sanitizes_nested_factors_and_pairs() {
        let factor = Factor {
            feature: Feature::SleepHours,
            factor_name: "Sleep Duration".to_string(),
            importance_percentage: f64::NAN,
            direction: crate::factors::Direction::Positive,
            correlation: f64::INFINITY,
            explanation: String::new(),
            actionable_threshold: None,
            top_quartile_avg: 7.8,
            bottom_quartile_avg: 6.1,
            target_when_factor_high: 72.0,
            target_when_factor_low: 48.0,
        };
        let pair = CorrelationPair {
            metric_1: Feature::RecoveryScore,
            metric_2: Feature::SleepHours,
            metric_1_name: "Recovery".to_string(),
            metric_2_name: "Sleep Duration".to_string(),
            correlation: 0.8,
            p_value: f64::NAN,
            n: 60,
            significance: crate::correlation::Strength::Strong,
            explanation: String::new(),
            example: None,
        };
        let summary = DashboardSummary {
            top_factors: vec![factor],
            model_accuracy: Some(f64::NAN),
            top_correlations: vec![pair],
            recovery_trend: None,
            hrv_trend: None,
            insight_summary: String::new(),
            unavailable: Vec::new(),
            computed_at: Utc::now(),
        };

        let clean = sanitize(summary);
        assert_eq!(clean.replaced(), 4);
        assert_eq!(clean.top_factors[0].importance_percentage, 0.0);
        assert_eq!(clean.top_factors[0].correlation, 0.0);
        assert_eq!(clean.top_factors[0].top_quartile_avg, 7.8);
        assert_eq!(clean.model_accuracy, Some(0.0));
        assert_eq!(clean.top_correlations[0].p_value, 1.0);
    }
}
