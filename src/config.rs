use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::VitalRsError;
use crate::logging::LogConfig;

/// Main analytics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    /// Configuration metadata
    pub metadata: ConfigMetadata,

    /// Lookback window
    pub window: WindowSettings,

    /// Minimum-row gates per component
    pub gates: GateSettings,

    /// Correlation engine settings
    pub correlation: CorrelationSettings,

    /// Tree ensemble hyperparameters
    pub forest: ForestSettings,

    /// Trend and anomaly settings
    pub trend: TrendSettings,

    /// Insight synthesis settings
    pub insights: InsightSettings,

    /// Result store location
    pub store: StoreSettings,

    /// Logging
    #[serde(default)]
    pub logging: LogConfig,
}

/// Configuration metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigMetadata {
    /// Configuration format version
    pub version: String,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowSettings {
    /// Days of history fed to the factor, correlation and regression stages
    pub lookback_days: u32,

    /// Fixed "today" for reproducible runs; defaults to the current date
    pub as_of: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateSettings {
    pub factor_min_rows: usize,
    pub correlation_min_rows: usize,
    /// Regression always needs predictors + 2 rows; this is an extra floor
    pub regression_min_rows: usize,
    pub trend_min_points: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationSettings {
    /// Maximum p-value for a reported pair
    pub significance_threshold: f64,
    /// Pairs with |r| below this are never reported
    pub min_abs_correlation: f64,
    /// How many surfaced pairs get an illustrative example
    pub example_top_k: usize,
    /// Skip pairs derived from the same base signal (e.g. HRV vs 7-day HRV)
    pub exclude_same_family: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestSettings {
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Trailing fraction of rows held out for validation R²
    pub validation_fraction: f64,
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendSettings {
    pub window_days: u32,
    /// Changes within ±this percentage are reported as stable
    pub stable_band_pct: f64,
    pub rolling_window: usize,
    pub anomaly_std_multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightSettings {
    pub max_insights: usize,
    pub high_strain_threshold: f64,
    pub low_strain_threshold: f64,
    /// Days considered "recent" for strain and trend-comparison insights
    pub recent_days: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// SQLite results database
    pub database_path: PathBuf,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        let now = Utc::now();

        AnalyticsConfig {
            metadata: ConfigMetadata {
                version: "1.0".to_string(),
                created_at: now,
                updated_at: now,
            },
            window: WindowSettings::default(),
            gates: GateSettings::default(),
            correlation: CorrelationSettings::default(),
            forest: ForestSettings::default(),
            trend: TrendSettings::default(),
            insights: InsightSettings::default(),
            store: StoreSettings::default(),
            logging: LogConfig::default(),
        }
    }
}

impl Default for WindowSettings {
    fn default() -> Self {
        WindowSettings {
            lookback_days: 365,
            as_of: None,
        }
    }
}

impl Default for GateSettings {
    fn default() -> Self {
        GateSettings {
            factor_min_rows: 50,
            correlation_min_rows: 30,
            regression_min_rows: 10,
            trend_min_points: 7,
        }
    }
}

impl Default for CorrelationSettings {
    fn default() -> Self {
        CorrelationSettings {
            significance_threshold: 0.05,
            min_abs_correlation: 0.3,
            example_top_k: 5,
            exclude_same_family: true,
        }
    }
}

impl Default for ForestSettings {
    fn default() -> Self {
        ForestSettings {
            n_trees: 200,
            max_depth: 15,
            min_samples_split: 5,
            min_samples_leaf: 2,
            validation_fraction: 0.2,
            seed: 42,
        }
    }
}

impl Default for TrendSettings {
    fn default() -> Self {
        TrendSettings {
            window_days: 30,
            stable_band_pct: 2.0,
            rolling_window: 7,
            anomaly_std_multiplier: 2.0,
        }
    }
}

impl Default for InsightSettings {
    fn default() -> Self {
        InsightSettings {
            max_insights: 5,
            high_strain_threshold: 15.0,
            low_strain_threshold: 8.0,
            recent_days: 7,
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings {
            database_path: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("vitalrs")
                .join("analytics.db"),
        }
    }
}

impl AnalyticsConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AnalyticsConfig =
            toml::from_str(&content).with_context(|| "Failed to parse TOML configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.metadata.updated_at = Utc::now();

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml_content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize configuration to TOML")?;

        fs::write(&path, toml_content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Get default configuration file path
    pub fn default_config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".vitalrs")
            .join("config.toml")
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default() -> Self {
        let config_path = Self::default_config_path();

        match Self::load_from_file(&config_path) {
            Ok(config) => config,
            Err(err) => {
                tracing::debug!(
                    path = %config_path.display(),
                    error = %err,
                    "Config file not usable, using defaults"
                );
                Self::default()
            }
        }
    }

    /// Reject values no component can work with
    pub fn validate(&self) -> std::result::Result<(), VitalRsError> {
        let invalid = |msg: String| Err(VitalRsError::Configuration(msg));

        if self.window.lookback_days == 0 {
            return invalid("window.lookback_days must be positive".to_string());
        }
        let p = self.correlation.significance_threshold;
        if !(p > 0.0 && p <= 1.0) {
            return invalid(format!(
                "correlation.significance_threshold must be in (0, 1], got {}",
                p
            ));
        }
        let r = self.correlation.min_abs_correlation;
        if !(0.0..=1.0).contains(&r) {
            return invalid(format!(
                "correlation.min_abs_correlation must be in [0, 1], got {}",
                r
            ));
        }
        if self.forest.n_trees == 0 {
            return invalid("forest.n_trees must be positive".to_string());
        }
        if self.forest.max_depth == 0 {
            return invalid("forest.max_depth must be positive".to_string());
        }
        if self.forest.min_samples_leaf == 0 || self.forest.min_samples_split < 2 {
            return invalid(
                "forest.min_samples_leaf must be >= 1 and min_samples_split >= 2".to_string(),
            );
        }
        let v = self.forest.validation_fraction;
        if !(v > 0.0 && v < 1.0) {
            return invalid(format!(
                "forest.validation_fraction must be in (0, 1), got {}",
                v
            ));
        }
        if self.gates.trend_min_points < 3 {
            return invalid("gates.trend_min_points must be at least 3".to_string());
        }
        if self.gates.correlation_min_rows < 3 {
            return invalid("gates.correlation_min_rows must be at least 3".to_string());
        }
        if self.trend.rolling_window < 2 {
            return invalid("trend.rolling_window must be at least 2".to_string());
        }
        if !(self.trend.anomaly_std_multiplier > 0.0) {
            return invalid("trend.anomaly_std_multiplier must be positive".to_string());
        }
        if self.trend.stable_band_pct < 0.0 {
            return invalid("trend.stable_band_pct must not be negative".to_string());
        }
        if self.insights.low_strain_threshold > self.insights.high_strain_threshold {
            return invalid(
                "insights.low_strain_threshold must not exceed high_strain_threshold".to_string(),
            );
        }
        if self.insights.max_insights == 0 {
            return invalid("insights.max_insights must be positive".to_string());
        }
        if self.insights.recent_days == 0 {
            return invalid("insights.recent_days must be positive".to_string());
        }

        Ok(())
    }

    /// The date the lookback window ends on
    pub fn as_of(&self) -> NaiveDate {
        self.window
            .as_of
            .unwrap_or_else(|| Utc::now().date_naive())
    }
}
