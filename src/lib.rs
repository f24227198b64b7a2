// Library interface for VitalRS modules
// This allows the CLI, integration tests and benchmarks to share the analytics core

pub mod config;
pub mod correlation;
pub mod error;
pub mod export;
pub mod factors;
pub mod features;
pub mod forest;
pub mod insights;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod regression;
pub mod regressor;
pub mod sanitize;
pub mod source;
pub mod stats;
pub mod store;
pub mod trend;

// Re-export commonly used types for convenience
pub use models::*;
pub use config::AnalyticsConfig;
pub use correlation::{CorrelationEngine, CorrelationPair, CorrelationResult};
pub use error::{AnalysisError, ErrorKind, Result, VitalRsError};
pub use factors::{Factor, FactorAnalyzer, FactorResult, ModelAccuracy};
pub use features::{DataPreparation, Feature, FeatureRow, FeatureTable};
pub use forest::{RandomForestModel, RandomForestRegressor};
pub use insights::{Insight, InsightCategory, InsightReport, InsightSynthesizer};
pub use logging::{DiagnosticReport, LogConfig, LogFormat, LogLevel};
pub use pipeline::{AnalysisOutcome, AnalyticsPipeline, PipelineRun};
pub use regression::{RegressionExplainer, RegressionPreset, RegressionResult};
pub use regressor::{FittedModel, ModelArtifact, ModelRegistry, Regressor};
pub use sanitize::{sanitize, Sanitize, Sanitized};
pub use source::{InMemoryRecordSource, JsonRecordSource, RecordSource};
pub use store::{AnalysisType, InMemoryResultStore, ResultStore, SqliteResultStore, StoredResult};
pub use trend::{TrendDetector, TrendDirection, TrendMetric, TrendResult};
