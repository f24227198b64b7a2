//! Batch pipeline tests: degradation, persistence and reproducibility

mod common;

use common::{computed_at, config, SyntheticHistory, USER};
use vitalrs::error::{ErrorKind, VitalRsError};
use vitalrs::insights::InsightSource;
use vitalrs::pipeline::{AnalysisOutcome, AnalyticsPipeline, DashboardSummary};
use vitalrs::source::InMemoryRecordSource;
use vitalrs::store::{AnalysisType, InMemoryResultStore, ResultStore, SqliteResultStore};
use vitalrs::trend::TrendMetric;

#[test]
fn test_full_history_runs_every_analysis() {
    let source = SyntheticHistory::new(90).source();
    let store = InMemoryResultStore::new();

    let run = AnalyticsPipeline::new(config(90), &source, &store)
        .with_computed_at(computed_at())
        .run(USER)
        .unwrap();

    assert!(run.factors.is_available());
    assert!(run.sleep_factors.is_available());
    assert!(run.correlations.is_available());
    assert!(run.regression.is_available());
    assert!(run.hrv_regression.is_available());
    let trends = run.trends.available().unwrap();
    assert!(trends.get(TrendMetric::Recovery).is_some());
    assert!(trends.get(TrendMetric::Hrv).is_some());

    // Six stages, insights and the summary
    assert_eq!(store.len(), 8);
    for analysis_type in AnalysisType::ALL {
        let stored = store.latest(analysis_type).unwrap().unwrap();
        assert_eq!(stored.computed_at, computed_at());
        assert_eq!(stored.run_id, run.run_id);
        assert_eq!(stored.lookback_days, 90);
    }

    assert_eq!(run.models.len(), 2);
    assert_eq!(run.report.stages.len(), 6);
    assert_eq!(run.report.degraded_stages(), 0);
    assert!(run.report.success);

    assert!(!run.insights.insights.is_empty());
    assert!(run.insights.insights.len() <= 5);
    for (i, insight) in run.insights.insights.iter().enumerate() {
        assert_eq!(insight.priority, i + 1);
    }

    assert!(run.summary.top_correlations.len() <= 7);
    assert!(run.summary.top_factors.len() <= 5);
    assert!(run.summary.unavailable.is_empty());
    assert!(run.summary.recovery_trend.is_some());
}

#[test]
fn test_short_history_degrades_without_failing() {
    let source = SyntheticHistory::new(10).source();
    let store = InMemoryResultStore::new();

    let run = AnalyticsPipeline::new(config(10), &source, &store)
        .with_computed_at(computed_at())
        .run(USER)
        .unwrap();

    let unavailable = run.correlations.unavailable().unwrap();
    assert_eq!(unavailable.kind, ErrorKind::InsufficientData);
    assert_eq!(unavailable.reason, "need at least 30 records, have 10");
    assert!(!run.factors.is_available());
    assert!(!run.sleep_factors.is_available());

    assert!(run.report.degraded_stages() >= 3);
    assert!(run
        .insights
        .insights
        .iter()
        .all(|i| !matches!(i.source, InsightSource::Factors | InsightSource::Correlation)));

    let degraded: Vec<AnalysisType> = run.summary.unavailable.iter().map(|(t, _)| *t).collect();
    assert!(degraded.contains(&AnalysisType::FactorImportance));
    assert!(degraded.contains(&AnalysisType::Correlations));

    // Degraded stages are persisted with their reason
    let stored = store.latest(AnalysisType::Correlations).unwrap().unwrap();
    assert_eq!(stored.payload()["status"], "unavailable");
    assert_eq!(stored.payload()["data"]["kind"], "insufficient_data");
}

#[test]
fn test_no_records_yields_availability_insight() {
    let source = InMemoryRecordSource::default();
    let store = InMemoryResultStore::new();

    let run = AnalyticsPipeline::new(config(30), &source, &store)
        .with_computed_at(computed_at())
        .run(USER)
        .unwrap();

    assert!(!run.factors.is_available());
    assert!(!run.correlations.is_available());
    assert!(!run.regression.is_available());
    assert_eq!(run.insights.insights.len(), 1);
    assert_eq!(run.insights.insights[0].source, InsightSource::Availability);
    assert_eq!(run.insights.summary, "Insufficient data for weekly insights");
    assert!(!run.report.warnings.is_empty());
    assert!(run.models.is_empty());
}

#[test]
fn test_invalid_config_aborts_run() {
    let source = SyntheticHistory::new(10).source();
    let store = InMemoryResultStore::new();
    let mut config = config(10);
    config.correlation.significance_threshold = 0.0;

    let result = AnalyticsPipeline::new(config, &source, &store).run(USER);
    assert!(matches!(result, Err(VitalRsError::Configuration(_))));
    assert!(store.is_empty());
}

#[test]
fn test_repeated_runs_are_identical_and_replace_stored_results() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteResultStore::open(dir.path().join("results.db")).unwrap();
    let source = SyntheticHistory::new(60).seed(3).source();

    let pipeline =
        AnalyticsPipeline::new(config(60), &source, &store).with_computed_at(computed_at());
    let first = pipeline.run(USER).unwrap();
    let payloads: Vec<serde_json::Value> = AnalysisType::ALL
        .iter()
        .map(|&t| store.latest(t).unwrap().unwrap().payload().clone())
        .collect();

    let second = pipeline.run(USER).unwrap();
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(store.count().unwrap(), AnalysisType::ALL.len());

    for (&analysis_type, before) in AnalysisType::ALL.iter().zip(&payloads) {
        let after = store.latest(analysis_type).unwrap().unwrap();
        assert_eq!(after.payload(), before, "{} changed between runs", analysis_type);
        assert_eq!(after.run_id, second.run_id);
    }
    assert_eq!(first.insights, second.insights);
}

#[test]
fn test_stored_summary_decodes() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteResultStore::open(dir.path().join("results.db")).unwrap();
    let source = SyntheticHistory::new(60).source();

    let run = AnalyticsPipeline::new(config(60), &source, &store)
        .with_computed_at(computed_at())
        .run(USER)
        .unwrap();

    let summary: DashboardSummary = store
        .latest(AnalysisType::Summary)
        .unwrap()
        .unwrap()
        .decode()
        .unwrap();
    assert_eq!(summary.insight_summary, run.summary.insight_summary);
    assert_eq!(summary.top_factors.len(), run.summary.top_factors.len());
    assert_eq!(summary.computed_at, computed_at());

    let factors: AnalysisOutcome<vitalrs::FactorResult> = store
        .latest(AnalysisType::FactorImportance)
        .unwrap()
        .unwrap()
        .decode()
        .unwrap();
    let decoded: Vec<_> = factors.available().unwrap().factors.iter().map(|f| f.feature).collect();
    let original: Vec<_> = run
        .factors
        .available()
        .unwrap()
        .factors
        .iter()
        .map(|f| f.feature)
        .collect();
    assert_eq!(decoded, original);
}
