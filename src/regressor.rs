//! Regressor capability interface and versioned model artifacts
//!
//! Any algorithm that can be fitted on a dense feature matrix implements
//! [`Regressor`]; the fitted result implements [`FittedModel`]. Trained
//! models are wrapped in a [`ModelArtifact`] and passed by reference to
//! whoever needs predictions. There is no process-wide model cache: callers
//! that want reuse keep a [`ModelRegistry`].

use chrono::{DateTime, Utc};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use crate::error::{AnalysisError, Result, VitalRsError};
use crate::features::Feature;
use crate::stats;

/// Row-major feature matrix
pub type Matrix = [Vec<f64>];

/// Artifact format version; bump when a model's serialized layout changes
pub const ARTIFACT_VERSION: u32 = 1;

/// Point prediction with an interval
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub value: f64,
    pub lower: f64,
    pub upper: f64,
}

/// A trained model
pub trait FittedModel: Send + Sync {
    fn predict(&self, row: &[f64]) -> f64;

    /// Prediction with a two-sided interval at `confidence` (e.g. 0.95).
    /// Models without a spread estimate return a degenerate interval.
    fn predict_with_interval(&self, row: &[f64], _confidence: f64) -> Prediction {
        let value = self.predict(row);
        Prediction {
            value,
            lower: value,
            upper: value,
        }
    }

    /// Per-feature importance, non-negative and summing to 1 (all zeros when
    /// the model learned nothing)
    fn importances(&self) -> Vec<f64>;

    fn n_features(&self) -> usize;

    /// R² on (x, y); `None` when y has zero variance
    fn score(&self, x: &Matrix, y: &[f64]) -> Option<f64> {
        let predicted: Vec<f64> = x.iter().map(|row| self.predict(row)).collect();
        stats::r_squared(y, &predicted)
    }
}

/// An algorithm that produces a [`FittedModel`]
pub trait Regressor {
    type Model: FittedModel;

    fn fit(&self, x: &Matrix, y: &[f64]) -> std::result::Result<Self::Model, AnalysisError>;

    fn name(&self) -> &'static str;
}

/// Shared input checks for every regressor
pub(crate) fn check_training_data(
    model: &str,
    x: &Matrix,
    y: &[f64],
) -> std::result::Result<usize, AnalysisError> {
    if x.is_empty() || x.len() != y.len() {
        return Err(AnalysisError::insufficient(model, 2, x.len().min(y.len())));
    }
    let width = x[0].len();
    if width == 0 || x.iter().any(|row| row.len() != width) {
        return Err(AnalysisError::DegenerateInput {
            column: "features".to_string(),
            reason: "ragged or empty feature matrix".to_string(),
        });
    }
    if let Some(bad) = x
        .iter()
        .flatten()
        .chain(y.iter())
        .find(|v| !v.is_finite())
    {
        return Err(AnalysisError::NumericInstability {
            field: format!("training input ({})", bad),
        });
    }
    Ok(width)
}

/// Ordinary least squares as a [`Regressor`]
#[derive(Debug, Clone, Default)]
pub struct LinearRegressor;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearModel {
    intercept: f64,
    coefficients: Vec<f64>,
    /// Column standard deviations, for scale-free importances
    scales: Vec<f64>,
}

impl LinearModel {
    pub fn intercept(&self) -> f64 {
        self.intercept
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }
}

impl Regressor for LinearRegressor {
    type Model = LinearModel;

    fn fit(&self, x: &Matrix, y: &[f64]) -> std::result::Result<LinearModel, AnalysisError> {
        let width = check_training_data(self.name(), x, y)?;
        if x.len() < width + 2 {
            return Err(AnalysisError::insufficient(self.name(), width + 2, x.len()));
        }

        let kept = stats::independent_columns(x);
        let reduced: Vec<Vec<f64>> = x
            .iter()
            .map(|row| kept.iter().map(|&j| row[j]).collect())
            .collect();
        let fit = stats::ols(&reduced, y).ok_or_else(|| AnalysisError::DegenerateInput {
            column: "features".to_string(),
            reason: "singular design matrix".to_string(),
        })?;

        let mut coefficients = vec![0.0; width];
        for (k, &j) in kept.iter().enumerate() {
            coefficients[j] = fit.coefficients[k + 1];
        }
        let scales = (0..width)
            .map(|j| {
                let column: Vec<f64> = x.iter().map(|row| row[j]).collect();
                stats::std_dev(&column).unwrap_or(0.0)
            })
            .collect();

        Ok(LinearModel {
            intercept: fit.coefficients[0],
            coefficients,
            scales,
        })
    }

    fn name(&self) -> &'static str {
        "linear_regression"
    }
}

impl FittedModel for LinearModel {
    fn predict(&self, row: &[f64]) -> f64 {
        self.intercept
            + self
                .coefficients
                .iter()
                .zip(row)
                .map(|(b, x)| b * x)
                .sum::<f64>()
    }

    fn importances(&self) -> Vec<f64> {
        let raw: Vec<f64> = self
            .coefficients
            .iter()
            .zip(&self.scales)
            .map(|(b, s)| (b * s).abs())
            .collect();
        normalize(raw)
    }

    fn n_features(&self) -> usize {
        self.coefficients.len()
    }
}

/// Scale non-negative weights to sum to 1; all zeros stay all zeros
pub(crate) fn normalize(mut weights: Vec<f64>) -> Vec<f64> {
    let total: f64 = weights.iter().filter(|w| w.is_finite()).sum();
    if total > 0.0 {
        for w in weights.iter_mut() {
            *w = if w.is_finite() { *w / total } else { 0.0 };
        }
    } else {
        weights.iter_mut().for_each(|w| *w = 0.0);
    }
    weights
}

/// A trained model plus everything needed to use it safely later
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact<M> {
    pub version: u32,
    pub model_name: String,
    /// Column order the model expects
    pub feature_names: Vec<Feature>,
    pub target: Feature,
    pub trained_at: DateTime<Utc>,
    /// Validation R², when defined
    pub accuracy: Option<f64>,
    pub training_rows: usize,
    pub model: M,
}

impl<M: FittedModel> ModelArtifact<M> {
    pub fn new(
        model_name: impl Into<String>,
        feature_names: Vec<Feature>,
        target: Feature,
        trained_at: DateTime<Utc>,
        accuracy: Option<f64>,
        training_rows: usize,
        model: M,
    ) -> Self {
        Self {
            version: ARTIFACT_VERSION,
            model_name: model_name.into(),
            feature_names,
            target,
            trained_at,
            accuracy,
            training_rows,
            model,
        }
    }

    /// Predict from a named-feature lookup, in the artifact's column order
    pub fn predict_features(
        &self,
        value_of: impl Fn(Feature) -> f64,
        confidence: f64,
    ) -> Prediction {
        let row: Vec<f64> = self.feature_names.iter().map(|&f| value_of(f)).collect();
        self.model.predict_with_interval(&row, confidence)
    }

    /// (feature, importance) pairs, most important first
    pub fn ranked_importances(&self) -> Vec<(Feature, f64)> {
        let mut ranked: Vec<(Feature, f64)> = self
            .feature_names
            .iter()
            .copied()
            .zip(self.model.importances())
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked
    }
}

impl<M: Serialize + DeserializeOwned> ModelArtifact<M> {
    /// Write as gzip-compressed bincode
    pub fn save(&self, path: &Path) -> Result<()> {
        let serialized =
            bincode::serialize(self).map_err(|e| VitalRsError::Serialization(e.to_string()))?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&serialized)?;
        let compressed = encoder.finish()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, compressed)?;
        tracing::info!(
            path = %path.display(),
            model = %self.model_name,
            bytes = serialized.len(),
            "Model artifact saved"
        );
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let compressed = fs::read(path)?;
        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed)?;

        let artifact: Self = bincode::deserialize(&decompressed)
            .map_err(|e| VitalRsError::Serialization(e.to_string()))?;

        if artifact.version != ARTIFACT_VERSION {
            return Err(VitalRsError::Serialization(format!(
                "unsupported artifact version {} (expected {})",
                artifact.version, ARTIFACT_VERSION
            )));
        }
        Ok(artifact)
    }
}

/// Explicit holder for trained artifacts, keyed by model name
#[derive(Debug, Clone)]
pub struct ModelRegistry<M> {
    artifacts: BTreeMap<String, ModelArtifact<M>>,
}

impl<M> Default for ModelRegistry<M> {
    fn default() -> Self {
        Self {
            artifacts: BTreeMap::new(),
        }
    }
}

impl<M> ModelRegistry<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; returns the previous artifact
    pub fn register(&mut self, artifact: ModelArtifact<M>) -> Option<ModelArtifact<M>> {
        self.artifacts.insert(artifact.model_name.clone(), artifact)
    }

    pub fn get(&self, model_name: &str) -> std::result::Result<&ModelArtifact<M>, AnalysisError> {
        self.artifacts
            .get(model_name)
            .ok_or_else(|| AnalysisError::ModelNotTrained {
                model: model_name.to_string(),
            })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.artifacts.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}
