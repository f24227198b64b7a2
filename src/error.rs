//! Unified error hierarchy for VitalRS
//!
//! Provides the analysis error taxonomy, store and source errors, and the
//! helpers that turn any of them into a degraded-but-well-typed result.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Top-level error type for all VitalRS operations
#[derive(Debug, Error)]
pub enum VitalRsError {
    /// Analysis component errors
    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    /// Result store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Record source errors
    #[error("Record source error: {0}")]
    Source(#[from] SourceError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised by the analysis components
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalysisError {
    /// Fewer rows or points than the component needs
    #[error("Insufficient data for {component}: need at least {required} records, have {actual}")]
    InsufficientData {
        component: String,
        required: usize,
        actual: usize,
    },

    /// Constant or collinear column
    #[error("Degenerate input column {column}: {reason}")]
    DegenerateInput { column: String, reason: String },

    /// NaN/Inf detected after a fit
    #[error("Numeric instability in {field}")]
    NumericInstability { field: String },

    /// Prediction or explanation requested before any successful fit
    #[error("Model not trained: {model}")]
    ModelNotTrained { model: String },

    /// Requested column is unknown to the feature schema
    #[error("Unknown feature: {name}")]
    UnknownFeature { name: String },
}

/// Record query errors
#[derive(Debug, Error)]
pub enum SourceError {
    /// Export file could not be read
    #[error("Failed to read records from {path}: {reason}")]
    Unreadable { path: String, reason: String },

    /// Export file content is not a record list
    #[error("Malformed record data: {reason}")]
    Malformed { reason: String },
}

/// Result store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Store lock was poisoned by a panicking writer
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Unknown analysis type name in a stored row
    #[error("Unknown analysis type: {0}")]
    UnknownAnalysisType(String),
}

/// Result type alias for VitalRS operations
pub type Result<T> = std::result::Result<T, VitalRsError>;

/// Serializable error tag carried by degraded results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InsufficientData,
    DegenerateInput,
    NumericInstability,
    ModelNotTrained,
    DataIntegrity,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::InsufficientData => "insufficient_data",
            ErrorKind::DegenerateInput => "degenerate_input",
            ErrorKind::NumericInstability => "numeric_instability",
            ErrorKind::ModelNotTrained => "model_not_trained",
            ErrorKind::DataIntegrity => "data_integrity",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", label)
    }
}

impl AnalysisError {
    /// Shorthand for the minimum-rows gate
    pub fn insufficient(component: impl Into<String>, required: usize, actual: usize) -> Self {
        AnalysisError::InsufficientData {
            component: component.into(),
            required,
            actual,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AnalysisError::InsufficientData { .. } => ErrorKind::InsufficientData,
            AnalysisError::DegenerateInput { .. } => ErrorKind::DegenerateInput,
            AnalysisError::NumericInstability { .. } => ErrorKind::NumericInstability,
            AnalysisError::ModelNotTrained { .. } => ErrorKind::ModelNotTrained,
            AnalysisError::UnknownFeature { .. } => ErrorKind::Internal,
        }
    }
}

impl VitalRsError {
    /// Error tag used when the error is folded into a degraded result
    pub fn kind(&self) -> ErrorKind {
        match self {
            VitalRsError::Analysis(err) => err.kind(),
            VitalRsError::Source(_) => ErrorKind::DataIntegrity,
            _ => ErrorKind::Internal,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            VitalRsError::Analysis(AnalysisError::ModelNotTrained { .. }) => ErrorSeverity::Info,
            VitalRsError::Analysis(AnalysisError::UnknownFeature { .. }) => ErrorSeverity::Error,
            VitalRsError::Analysis(_) => ErrorSeverity::Warning,
            VitalRsError::Source(SourceError::Malformed { .. }) => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            VitalRsError::Analysis(AnalysisError::InsufficientData {
                required, actual, ..
            }) => {
                format!("need at least {} records, have {}", required, actual)
            }
            VitalRsError::Analysis(AnalysisError::ModelNotTrained { .. }) => {
                "analytics not yet computed".to_string()
            }
            VitalRsError::Analysis(AnalysisError::DegenerateInput { column, .. }) => {
                format!("{} is present but carries no information in this window", column)
            }
            VitalRsError::Source(SourceError::Unreadable { path, .. }) => {
                format!("Could not read records file: {}", path)
            }
            VitalRsError::Store(StoreError::Sqlite(_)) => {
                "Unable to access the results database. Please check your configuration.".to_string()
            }
            _ => self.to_string(),
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Error that prevents operation but system can continue
    Error,
    /// Warning that doesn't prevent operation
    Warning,
    /// Informational message
    Info,
}

impl ErrorSeverity {
    /// Convert to tracing level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            ErrorSeverity::Error => tracing::Level::ERROR,
            ErrorSeverity::Warning => tracing::Level::WARN,
            ErrorSeverity::Info => tracing::Level::INFO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_severity() {
        let err: VitalRsError = AnalysisError::insufficient("factor importance", 50, 12).into();
        assert_eq!(err.severity(), ErrorSeverity::Warning);
        assert_eq!(err.severity().to_tracing_level(), tracing::Level::WARN);

        let err = VitalRsError::Configuration("bad threshold".to_string());
        assert_eq!(err.severity(), ErrorSeverity::Error);
    }

    #[test]
    fn test_user_messages() {
        let err: VitalRsError = AnalysisError::insufficient("factor importance", 50, 12).into();
        assert_eq!(err.user_message(), "need at least 50 records, have 12");

        let err: VitalRsError = AnalysisError::ModelNotTrained {
            model: "recovery_predictor".to_string(),
        }
        .into();
        assert_eq!(err.user_message(), "analytics not yet computed");
    }

    #[test]
    fn test_error_kind_tags() {
        let err: VitalRsError = AnalysisError::DegenerateInput {
            column: "had_workout".to_string(),
            reason: "zero variance".to_string(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::DegenerateInput);
        assert_eq!(ErrorKind::InsufficientData.to_string(), "insufficient_data");
    }
}
