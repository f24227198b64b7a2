use chrono::{Duration, NaiveDate, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use vitalrs::config::AnalyticsConfig;
use vitalrs::correlation::CorrelationEngine;
use vitalrs::factors::{FactorAnalyzer, RECOVERY_FACTORS};
use vitalrs::features::{Feature, FeatureRow, FeatureTable};
use vitalrs::forest::RandomForestRegressor;
use vitalrs::models::DateRange;
use vitalrs::regressor::Regressor;
use vitalrs::trend::{TrendDetector, TrendMetric};

/// Performance benchmarks for the analytics core
///
/// Each benchmark runs over seeded synthetic feature tables of increasing
/// length so regressions in the per-row cost show up as slope changes.

fn create_feature_table(days: usize) -> FeatureTable {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let start = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();

    let rows = (0..days)
        .map(|i| {
            let mut row = FeatureRow::new(start + Duration::days(i as i64));
            for feature in Feature::ALL {
                row.set(feature, rng.gen_range(0.0..10.0));
            }
            let sleep = rng.gen_range(5.0..9.0);
            let strain = rng.gen_range(4.0..20.0);
            row.set(Feature::SleepHours, sleep);
            row.set(Feature::Strain, strain);
            row.set(
                Feature::RecoveryScore,
                40.0 + 8.0 * sleep - strain + rng.gen_range(-5.0..5.0),
            );
            row
        })
        .collect();

    let window = DateRange::new(start, start + Duration::days(days as i64 - 1));
    FeatureTable::from_rows(Some(Feature::RecoveryScore), window, rows)
}

fn bench_forest_fit(c: &mut Criterion) {
    let mut group = c.benchmark_group("Random Forest Fit");
    group.sample_size(10);

    let forest = RandomForestRegressor::default();
    for &days in &[60, 180, 365] {
        let table = create_feature_table(days);
        let x = table.matrix(RECOVERY_FACTORS);
        let y = table.column(Feature::RecoveryScore);

        group.throughput(Throughput::Elements(days as u64));
        group.bench_with_input(BenchmarkId::new("fit", days), &(x, y), |b, (x, y)| {
            b.iter(|| forest.fit(black_box(x), black_box(y)));
        });
    }

    group.finish();
}

fn bench_factor_analysis(c: &mut Criterion) {
    let mut group = c.benchmark_group("Factor Analysis");
    group.sample_size(10);

    let analyzer = FactorAnalyzer::new(&AnalyticsConfig::default());
    let computed_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    for &days in &[90, 365] {
        let table = create_feature_table(days);
        group.bench_with_input(BenchmarkId::new("analyze", days), &table, |b, table| {
            b.iter(|| {
                analyzer.analyze(
                    black_box(table),
                    Feature::RecoveryScore,
                    RECOVERY_FACTORS,
                    computed_at,
                )
            });
        });
    }

    group.finish();
}

fn bench_correlation(c: &mut Criterion) {
    let mut group = c.benchmark_group("Correlation Engine");

    let engine = CorrelationEngine::new(&AnalyticsConfig::default());
    let computed_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    for &days in &[30, 90, 365, 1000] {
        let table = create_feature_table(days);

        group.throughput(Throughput::Elements(days as u64));
        group.bench_with_input(BenchmarkId::new("analyze", days), &table, |b, table| {
            b.iter(|| engine.analyze(black_box(table), computed_at));
        });
    }

    group.finish();
}

fn bench_trend_detection(c: &mut Criterion) {
    let mut group = c.benchmark_group("Trend Detection");

    let detector = TrendDetector::new(&AnalyticsConfig::default());
    let computed_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let start = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
    for &points in &[30, 365, 3650] {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let series: Vec<(NaiveDate, f64)> = (0..points)
            .map(|i| (start + Duration::days(i as i64), 60.0 + rng.gen_range(-10.0..10.0)))
            .collect();

        group.throughput(Throughput::Elements(points as u64));
        group.bench_with_input(BenchmarkId::new("analyze_series", points), &series, |b, series| {
            b.iter(|| {
                detector.analyze_series(TrendMetric::Recovery, black_box(series), computed_at)
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_forest_fit,
    bench_factor_analysis,
    bench_correlation,
    bench_trend_detection
);
criterion_main!(benches);
