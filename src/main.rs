use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tabled::{settings::Style, Table, Tabled};

use vitalrs::correlation::CorrelationResult;
use vitalrs::export::{export_feature_table, FeatureExportOptions};
use vitalrs::factors::FactorResult;
use vitalrs::insights::{InsightCategory, InsightReport};
use vitalrs::logging::{init_logging, LogLevel};
use vitalrs::pipeline::{AnalysisOutcome, DashboardSummary, PipelineRun, TrendsReport};
use vitalrs::regression::RegressionResult;
use vitalrs::store::{AnalysisType, ResultStore, SqliteResultStore, StoredResult};
use vitalrs::{
    AnalyticsConfig, AnalyticsPipeline, DataPreparation, DateRange, Feature, JsonRecordSource,
};

/// VitalRS - Physiological Analytics CLI
///
/// Turns daily recovery, sleep and workout records into ranked recovery
/// factors, metric correlations, regression explanations, trends and
/// weekly insights.
#[derive(Parser)]
#[command(name = "vitalrs")]
#[command(author = "VitalRS Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Physiological Analytics CLI", long_about = None)]
struct Cli {
    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase verbosity of output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every analysis over a records export and store the results
    Analyze {
        /// JSON records export
        #[arg(short, long)]
        records: PathBuf,

        /// User whose records are analyzed
        #[arg(short, long, default_value = "default")]
        user: String,

        /// Results database (overrides config)
        #[arg(short, long)]
        database: Option<PathBuf>,

        /// Last day of the lookback window (YYYY-MM-DD)
        #[arg(long)]
        as_of: Option<NaiveDate>,

        /// Lookback window in days (overrides config)
        #[arg(short, long)]
        lookback: Option<u32>,

        /// Write the diagnostic report to this file (degraded runs are
        /// otherwise reported under the local data directory)
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Print the latest stored result of an analysis
    Show {
        /// factor_importance, sleep_quality_factors, correlations, regression,
        /// hrv_regression, trends, insights or summary
        analysis: AnalysisType,

        /// Results database (overrides config)
        #[arg(short, long)]
        database: Option<PathBuf>,

        /// Print the raw JSON payload
        #[arg(long)]
        json: bool,

        /// List the timestamps of the last N stored results instead
        #[arg(long)]
        history: Option<usize>,
    },

    /// Export the engineered feature table as CSV
    ExportFeatures {
        /// JSON records export
        #[arg(short, long)]
        records: PathBuf,

        /// Output file path
        #[arg(short, long)]
        output: PathBuf,

        /// User whose records are exported
        #[arg(short, long, default_value = "default")]
        user: String,

        /// Target column; rows without it are dropped
        #[arg(short, long)]
        target: Option<String>,

        /// Last day of the window (YYYY-MM-DD)
        #[arg(long)]
        as_of: Option<NaiveDate>,

        /// Leave unobserved cells empty instead of filled
        #[arg(long)]
        raw: bool,
    },

    /// Show or initialize configuration
    Config {
        /// Write a default config file if none exists
        #[arg(long)]
        init: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(AnalyticsConfig::default_config_path);
    let mut config = if config_path.exists() {
        AnalyticsConfig::load_from_file(&config_path)?
    } else {
        AnalyticsConfig::default()
    };

    // Set up logging based on verbosity
    if cli.verbose > 0 {
        config.logging.level = match cli.verbose {
            1 => LogLevel::Info,
            2 => LogLevel::Debug,
            _ => LogLevel::Trace,
        };
    } else {
        config.logging.level = LogLevel::Warn;
    }
    init_logging(&config.logging)?;

    match cli.command {
        Commands::Analyze {
            records,
            user,
            database,
            as_of,
            lookback,
            report,
        } => {
            if let Some(date) = as_of {
                config.window.as_of = Some(date);
            }
            if let Some(days) = lookback {
                config.window.lookback_days = days;
            }
            let database = database.unwrap_or_else(|| config.store.database_path.clone());
            run_analyze(config, &records, &user, &database, report)?;
        }

        Commands::Show {
            analysis,
            database,
            json,
            history,
        } => {
            let database = database.unwrap_or_else(|| config.store.database_path.clone());
            let store = SqliteResultStore::open(&database).with_context(|| {
                format!("Failed to open results database {}", database.display())
            })?;

            if let Some(limit) = history {
                show_history(&store, analysis, limit)?;
            } else {
                match store.latest(analysis)? {
                    Some(stored) if json => {
                        println!("{}", serde_json::to_string_pretty(stored.payload())?);
                    }
                    Some(stored) => show_result(&stored)?,
                    None => println!("{}", format!("No {} results stored yet", analysis).yellow()),
                }
            }
        }

        Commands::ExportFeatures {
            records,
            output,
            user,
            target,
            as_of,
            raw,
        } => {
            if let Some(date) = as_of {
                config.window.as_of = Some(date);
            }
            let source = JsonRecordSource::open(&records)?;
            let window = DateRange::lookback(config.as_of(), config.window.lookback_days);
            let preparation = DataPreparation::new();
            let table = match target.as_deref().map(parse_feature).transpose()? {
                Some(feature) => preparation.prepare(&source, &user, window, feature)?,
                None => preparation.prepare_all(&source, &user, window)?,
            };

            let options = FeatureExportOptions {
                validation_fraction: config.forest.validation_fraction,
                leave_unobserved_empty: raw,
                ..Default::default()
            };
            let rows = export_feature_table(&table, &options, &output)?;
            println!(
                "{}",
                format!("✓ Exported {} rows to {}", rows, output.display()).green()
            );
        }

        Commands::Config { init } => {
            if init && !config_path.exists() {
                let mut fresh = AnalyticsConfig::default();
                fresh.save_to_file(&config_path)?;
                println!(
                    "{}",
                    format!("✓ Wrote default config to {}", config_path.display()).green()
                );
            }
            println!("{}", "Configuration".blue().bold());
            println!("  File: {}", config_path.display().to_string().dimmed());
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn parse_feature(name: &str) -> Result<Feature> {
    match Feature::ALL.iter().find(|f| f.name() == name) {
        Some(feature) => Ok(*feature),
        None => bail!("Unknown feature column '{}'", name),
    }
}

fn run_analyze(
    config: AnalyticsConfig,
    records: &Path,
    user: &str,
    database: &Path,
    report_path: Option<PathBuf>,
) -> Result<()> {
    let source = JsonRecordSource::open(records)?;
    let store = SqliteResultStore::open(database)
        .with_context(|| format!("Failed to open results database {}", database.display()))?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?,
    );
    spinner.set_message(format!("Analyzing {} records...", source.len()));
    spinner.enable_steady_tick(Duration::from_millis(100));

    let run = AnalyticsPipeline::new(config, &source, &store).run(user);
    spinner.finish_and_clear();
    let run = run?;

    print_run(&run);

    // Degraded runs keep a report even when no path was given
    let saved = match report_path {
        Some(path) => {
            run.report.save_to_file(&path)?;
            Some(path)
        }
        None if run.report.degraded_stages() > 0 || !run.report.warnings.is_empty() => {
            Some(run.report.save_default()?)
        }
        None => None,
    };
    if let Some(path) = saved {
        println!("  Diagnostic report: {}", path.display().to_string().dimmed());
    }
    Ok(())
}

#[derive(Tabled)]
struct StageRow {
    #[tabled(rename = "Analysis")]
    analysis: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

fn stage_row<T>(
    analysis: AnalysisType,
    outcome: &AnalysisOutcome<T>,
    detail: impl Fn(&T) -> String,
) -> StageRow {
    match outcome {
        AnalysisOutcome::Available(value) => StageRow {
            analysis: analysis.to_string(),
            status: "available".to_string(),
            detail: detail(value),
        },
        AnalysisOutcome::Unavailable(u) => StageRow {
            analysis: analysis.to_string(),
            status: format!("unavailable ({})", u.kind),
            detail: u.reason.clone(),
        },
    }
}

fn print_run(run: &PipelineRun) {
    println!("{}", "Analytics run completed".green().bold());
    println!("  Run: {}", run.run_id.to_string().dimmed());
    println!("  Window: {} to {}", run.window.start, run.window.end);
    println!();

    let rows = vec![
        stage_row(AnalysisType::FactorImportance, &run.factors, |f| {
            format!(
                "{} factors, top lever: {}",
                f.factors.len(),
                f.top_lever.as_deref().unwrap_or("-")
            )
        }),
        stage_row(AnalysisType::SleepQualityFactors, &run.sleep_factors, |f| {
            format!("{} factors", f.factors.len())
        }),
        stage_row(AnalysisType::Correlations, &run.correlations, |c| {
            format!("{} significant pairs", c.correlations.len())
        }),
        stage_row(AnalysisType::Regression, &run.regression, |r| {
            format!("R² {:.2} over {} days", r.r_squared, r.n_observations)
        }),
        stage_row(AnalysisType::HrvRegression, &run.hrv_regression, |r| {
            format!("R² {:.2} over {} days", r.r_squared, r.n_observations)
        }),
        stage_row(AnalysisType::Trends, &run.trends, |t| {
            format!("{} of {} metrics", t.available().len(), t.trends.len())
        }),
    ];
    println!("{}", Table::new(rows).with(Style::rounded()));
    println!();

    print_insights(&run.insights);

    for warning in &run.report.warnings {
        println!("  {} {}", "warning:".yellow(), warning);
    }
}

fn print_insights(report: &InsightReport) {
    println!("{}", "Weekly insights".blue().bold());
    for insight in &report.insights {
        let text = format!("{}. {} {}", insight.priority, insight.emoji, insight.insight_text);
        let line = match insight.category {
            InsightCategory::Alert => text.red(),
            InsightCategory::Success => text.green(),
            InsightCategory::Opportunity => text.cyan(),
        };
        println!("  {}", line);
    }
    println!("  {}", report.summary.dimmed());
}

fn show_history(store: &SqliteResultStore, analysis: AnalysisType, limit: usize) -> Result<()> {
    #[derive(Tabled)]
    struct HistoryRow {
        #[tabled(rename = "Computed at")]
        computed_at: String,
        #[tabled(rename = "Lookback days")]
        lookback_days: u32,
        #[tabled(rename = "Run")]
        run_id: String,
    }

    let rows: Vec<HistoryRow> = store
        .history(analysis, limit)?
        .into_iter()
        .map(|r| HistoryRow {
            computed_at: r.computed_at.to_rfc3339(),
            lookback_days: r.lookback_days,
            run_id: r.run_id.to_string(),
        })
        .collect();

    if rows.is_empty() {
        println!("{}", format!("No {} results stored yet", analysis).yellow());
    } else {
        println!("{}", Table::new(rows).with(Style::rounded()));
    }
    Ok(())
}

fn print_unavailable<T>(outcome: AnalysisOutcome<T>) -> Option<T> {
    match outcome {
        AnalysisOutcome::Available(value) => Some(value),
        AnalysisOutcome::Unavailable(u) => {
            println!("{} {}", "Unavailable:".yellow().bold(), u.reason);
            None
        }
    }
}

fn show_result(stored: &StoredResult) -> Result<()> {
    println!(
        "{} {}",
        stored.analysis_type.to_string().blue().bold(),
        format!("computed {}", stored.computed_at.to_rfc3339()).dimmed()
    );

    match stored.analysis_type {
        AnalysisType::FactorImportance | AnalysisType::SleepQualityFactors => {
            let outcome = stored.decode::<AnalysisOutcome<FactorResult>>()?;
            if let Some(result) = print_unavailable(outcome) {
                show_factors(&result);
            }
        }
        AnalysisType::Correlations => {
            let outcome = stored.decode::<AnalysisOutcome<CorrelationResult>>()?;
            if let Some(result) = print_unavailable(outcome) {
                show_correlations(&result);
            }
        }
        AnalysisType::Regression | AnalysisType::HrvRegression => {
            let outcome = stored.decode::<AnalysisOutcome<RegressionResult>>()?;
            if let Some(result) = print_unavailable(outcome) {
                show_regression(&result);
            }
        }
        AnalysisType::Trends => {
            let outcome = stored.decode::<AnalysisOutcome<TrendsReport>>()?;
            if let Some(result) = print_unavailable(outcome) {
                for trend in result.available() {
                    println!("  {}", trend.description);
                }
            }
        }
        AnalysisType::Insights => print_insights(&stored.decode::<InsightReport>()?),
        AnalysisType::Summary => {
            let summary: DashboardSummary = stored.decode()?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }
    Ok(())
}

fn show_factors(result: &FactorResult) {
    #[derive(Tabled)]
    struct FactorRow {
        #[tabled(rename = "Factor")]
        name: String,
        #[tabled(rename = "Importance %")]
        importance: String,
        #[tabled(rename = "r")]
        correlation: String,
        #[tabled(rename = "Explanation")]
        explanation: String,
    }

    let rows: Vec<FactorRow> = result
        .factors
        .iter()
        .map(|f| FactorRow {
            name: f.factor_name.clone(),
            importance: format!("{:.1}", f.importance_percentage),
            correlation: format!("{:+.2}", f.correlation),
            explanation: f.explanation.clone(),
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
    println!("  {}", result.explanation);
}

fn show_correlations(result: &CorrelationResult) {
    #[derive(Tabled)]
    struct PairRow {
        #[tabled(rename = "Metric")]
        metric_1: String,
        #[tabled(rename = "Metric")]
        metric_2: String,
        #[tabled(rename = "r")]
        r: String,
        #[tabled(rename = "p")]
        p: String,
        #[tabled(rename = "Strength")]
        strength: String,
    }

    let rows: Vec<PairRow> = result
        .correlations
        .iter()
        .map(|c| PairRow {
            metric_1: c.metric_1_name.clone(),
            metric_2: c.metric_2_name.clone(),
            r: format!("{:+.2}", c.correlation),
            p: format!("{:.4}", c.p_value),
            strength: format!("{:?}", c.significance).to_lowercase(),
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
    println!("  {}", result.summary);
}

fn show_regression(result: &RegressionResult) {
    #[derive(Tabled)]
    struct CoefficientTableRow {
        #[tabled(rename = "Term")]
        name: String,
        #[tabled(rename = "Coef")]
        coefficient: String,
        #[tabled(rename = "p")]
        p_value: String,
        #[tabled(rename = "95% CI")]
        interval: String,
        #[tabled(rename = "Status")]
        status: String,
    }

    let rows: Vec<CoefficientTableRow> = result
        .coefficients
        .iter()
        .map(|c| CoefficientTableRow {
            name: c.name.clone(),
            coefficient: format!("{:+.3}", c.coefficient),
            p_value: format!("{:.4}", c.p_value),
            interval: format!("[{:+.3}, {:+.3}]", c.ci_lower, c.ci_upper),
            status: format!("{:?}", c.status).to_lowercase(),
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
    println!(
        "  R² {:.3} (adjusted {:.3}) over {} days",
        result.r_squared, result.adj_r_squared, result.n_observations
    );
}
