//! Sanitize-before-serialize boundary
//!
//! Every result type implements [`Sanitize`] by visiting its numeric leaves
//! through a [`Sanitizer`]. Non-finite values are replaced with the field's
//! sentinel (0 for magnitudes, 1.0 for p-values) and each replacement is
//! logged as a numeric-instability signal. Only a [`Sanitized`] value can be
//! handed to a result store.

use serde::Serialize;
use std::ops::Deref;
use tracing::warn;

use crate::error::AnalysisError;

/// Replacement value for a non-finite leaf
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sentinel {
    /// Coefficients, correlations, importances and other magnitudes
    Zero,
    /// p-values: "no evidence"
    NoEvidence,
}

impl Sentinel {
    pub fn value(self) -> f64 {
        match self {
            Sentinel::Zero => 0.0,
            Sentinel::NoEvidence => 1.0,
        }
    }
}

/// A single replaced leaf
#[derive(Debug, Clone, PartialEq)]
pub struct Replacement {
    pub field: String,
    pub original: f64,
    pub sentinel: Sentinel,
}

/// Visitor handed to [`Sanitize::sanitize`]
#[derive(Debug, Default)]
pub struct Sanitizer {
    replacements: Vec<Replacement>,
}

impl Sanitizer {
    pub fn new() -> Self {
        Self::default()
    }

    fn replace(&mut self, field: &str, value: &mut f64, sentinel: Sentinel) {
        if !value.is_finite() {
            self.replacements.push(Replacement {
                field: field.to_string(),
                original: *value,
                sentinel,
            });
            *value = sentinel.value();
        }
    }

    /// Coefficients, t-values and other unbounded magnitudes
    pub fn magnitude(&mut self, field: &str, value: &mut f64) {
        self.replace(field, value, Sentinel::Zero);
    }

    /// Correlation-like values, also clamped to [-1, 1]
    pub fn correlation(&mut self, field: &str, value: &mut f64) {
        self.replace(field, value, Sentinel::Zero);
        *value = value.clamp(-1.0, 1.0);
    }

    /// p-values, also clamped to [0, 1]
    pub fn p_value(&mut self, field: &str, value: &mut f64) {
        self.replace(field, value, Sentinel::NoEvidence);
        *value = value.clamp(0.0, 1.0);
    }

    pub fn optional(&mut self, field: &str, value: &mut Option<f64>) {
        if let Some(v) = value {
            self.magnitude(field, v);
        }
    }

    pub fn replacements(&self) -> &[Replacement] {
        &self.replacements
    }
}

/// Implemented by every result object that can cross a serialization boundary
pub trait Sanitize {
    fn sanitize(&mut self, sanitizer: &mut Sanitizer);
}

impl<T: Sanitize> Sanitize for Vec<T> {
    fn sanitize(&mut self, sanitizer: &mut Sanitizer) {
        for item in self.iter_mut() {
            item.sanitize(sanitizer);
        }
    }
}

impl<T: Sanitize> Sanitize for Option<T> {
    fn sanitize(&mut self, sanitizer: &mut Sanitizer) {
        if let Some(inner) = self {
            inner.sanitize(sanitizer);
        }
    }
}

/// A value whose numeric leaves are all finite
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct Sanitized<T> {
    inner: T,
    #[serde(skip)]
    replaced: usize,
}

impl<T> Sanitized<T> {
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// How many leaves had to be replaced
    pub fn replaced(&self) -> usize {
        self.replaced
    }
}

impl<T: Serialize> Sanitized<T> {
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(&self.inner)
    }
}

impl<T> Deref for Sanitized<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

/// The single sanitization boundary
pub fn sanitize<T: Sanitize>(mut value: T) -> Sanitized<T> {
    let mut sanitizer = Sanitizer::new();
    value.sanitize(&mut sanitizer);

    for replacement in sanitizer.replacements() {
        let signal = AnalysisError::NumericInstability {
            field: replacement.field.clone(),
        };
        warn!(
            field = %replacement.field,
            original = %replacement.original,
            sentinel = replacement.sentinel.value(),
            "{}", signal
        );
    }

    Sanitized {
        replaced: sanitizer.replacements().len(),
        inner: value,
    }
}
