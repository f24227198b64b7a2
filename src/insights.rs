//! Insight synthesis
//!
//! Turns whatever analysis results are available into a short, ranked list
//! of plain-language insights. Never fails: missing inputs are skipped, and
//! when nothing at all is available a single "insufficient data" insight is
//! returned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::debug;

use crate::config::{AnalyticsConfig, InsightSettings};
use crate::correlation::CorrelationResult;
use crate::factors::FactorResult;
use crate::features::{format_clock, Feature};
use crate::regression::RegressionResult;
use crate::sanitize::{Sanitize, Sanitizer};
use crate::trend::{TrendDirection, TrendMetric, TrendResult};

/// HRV moves smaller than this are not worth an insight
const HRV_CHANGE_THRESHOLD: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsightCategory {
    Success,
    Alert,
    Opportunity,
}

impl InsightCategory {
    /// Lower sorts first
    fn urgency(self) -> u8 {
        match self {
            InsightCategory::Alert => 0,
            InsightCategory::Success => 1,
            InsightCategory::Opportunity => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightSource {
    Trend,
    Strain,
    Factors,
    Correlation,
    Regression,
    Availability,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub insight_text: String,
    pub category: InsightCategory,
    /// 1 is the most important
    pub priority: usize,
    pub emoji: String,
    /// Size of the underlying statistic, on a percentage scale
    pub magnitude: f64,
    pub source: InsightSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightReport {
    pub insights: Vec<Insight>,
    pub summary: String,
    pub computed_at: DateTime<Utc>,
}

impl Sanitize for InsightReport {
    fn sanitize(&mut self, s: &mut Sanitizer) {
        for insight in &mut self.insights {
            s.magnitude("insight_magnitude", &mut insight.magnitude);
        }
    }
}

/// Results the synthesizer reads from; anything unavailable is `None`
#[derive(Debug, Clone, Copy, Default)]
pub struct InsightInputs<'a> {
    pub factors: Option<&'a FactorResult>,
    pub correlations: Option<&'a CorrelationResult>,
    pub regression: Option<&'a RegressionResult>,
    pub trends: &'a [TrendResult],
}

impl InsightInputs<'_> {
    fn is_empty(&self) -> bool {
        self.factors.is_none()
            && self.correlations.is_none()
            && self.regression.is_none()
            && self.trends.is_empty()
    }

    fn trend(&self, metric: TrendMetric) -> Option<&TrendResult> {
        self.trends.iter().find(|t| t.metric == metric)
    }
}

#[derive(Debug, Clone)]
pub struct InsightSynthesizer {
    settings: InsightSettings,
}

impl Default for InsightSynthesizer {
    fn default() -> Self {
        Self::new(&AnalyticsConfig::default())
    }
}

impl InsightSynthesizer {
    pub fn new(config: &AnalyticsConfig) -> Self {
        Self {
            settings: config.insights.clone(),
        }
    }

    pub fn synthesize(
        &self,
        inputs: &InsightInputs<'_>,
        computed_at: DateTime<Utc>,
    ) -> InsightReport {
        if inputs.is_empty() {
            return InsightReport {
                insights: vec![Insight {
                    insight_text: "📊 Not enough data yet for personalized insights - keep tracking to build your history"
                        .to_string(),
                    category: InsightCategory::Opportunity,
                    priority: 1,
                    emoji: "📊".to_string(),
                    magnitude: 0.0,
                    source: InsightSource::Availability,
                }],
                summary: "Insufficient data for weekly insights".to_string(),
                computed_at,
            };
        }

        let mut candidates: Vec<Insight> = [
            self.recovery_trend(inputs),
            self.hrv_trend(inputs),
            self.rhr_trend(inputs),
            self.strain_load(inputs),
            self.sleep_pattern(inputs),
            self.bedtime_pattern(inputs),
            self.top_lever(inputs),
            self.strongest_correlation(inputs),
            self.regression_driver(inputs),
        ]
        .into_iter()
        .flatten()
        .collect();

        candidates.sort_by(|a, b| {
            a.category
                .urgency()
                .cmp(&b.category.urgency())
                .then(b.magnitude.total_cmp(&a.magnitude))
                .then_with(|| a.insight_text.cmp(&b.insight_text))
        });
        candidates.truncate(self.settings.max_insights);
        for (rank, insight) in candidates.iter_mut().enumerate() {
            insight.priority = rank + 1;
        }

        let summary = self.summary(&candidates);
        debug!(insights = candidates.len(), %summary, "Insights synthesized");

        InsightReport {
            insights: candidates,
            summary,
            computed_at,
        }
    }

    fn summary(&self, insights: &[Insight]) -> String {
        let weeks = (self.settings.recent_days / 7).max(1);
        let count = |category| insights.iter().filter(|i| i.category == category).count();
        let alerts = count(InsightCategory::Alert);
        let successes = count(InsightCategory::Success);

        if insights.is_empty() {
            format!("Past {} week(s): Stable metrics, no major changes detected", weeks)
        } else if alerts > 0 {
            format!(
                "Past {} week(s): {} area(s) need attention - prioritize recovery and sleep",
                weeks, alerts
            )
        } else if successes > 0 {
            format!(
                "Past {} week(s): Strong performance - {} positive trend(s) detected",
                weeks, successes
            )
        } else {
            format!(
                "Past {} week(s): Stable performance, opportunities for optimization",
                weeks
            )
        }
    }

    fn recovery_trend(&self, inputs: &InsightInputs<'_>) -> Option<Insight> {
        let trend = inputs.trend(TrendMetric::Recovery)?;
        let change = trend.change_percentage;
        match trend.direction {
            TrendDirection::Up => Some(insight(
                InsightCategory::Success,
                "📈",
                format!(
                    "Recovery up {:.0}% - {:.0}% avg recently vs {:.0}% before. Keep it up!",
                    change, trend.recent_mean, trend.baseline_mean
                ),
                change.abs(),
                InsightSource::Trend,
            )),
            TrendDirection::Down => Some(insight(
                InsightCategory::Alert,
                "📉",
                format!(
                    "Recovery down {:.0}% - consider more rest or lighter training",
                    change.abs()
                ),
                change.abs(),
                InsightSource::Trend,
            )),
            TrendDirection::Stable => None,
        }
    }

    fn hrv_trend(&self, inputs: &InsightInputs<'_>) -> Option<Insight> {
        let change = inputs.trend(TrendMetric::Hrv)?.change_percentage;
        if change > HRV_CHANGE_THRESHOLD {
            Some(insight(
                InsightCategory::Success,
                "🎯",
                format!(
                    "HRV trending up {:.0}% - sign of improving fitness and recovery",
                    change
                ),
                change,
                InsightSource::Trend,
            ))
        } else if change < -HRV_CHANGE_THRESHOLD {
            Some(insight(
                InsightCategory::Alert,
                "📊",
                format!(
                    "HRV down {:.0}% - may indicate fatigue or stress. Prioritize recovery.",
                    change.abs()
                ),
                change.abs(),
                InsightSource::Trend,
            ))
        } else {
            None
        }
    }

    fn rhr_trend(&self, inputs: &InsightInputs<'_>) -> Option<Insight> {
        let trend = inputs.trend(TrendMetric::Rhr)?;
        let change = trend.change_percentage.abs();
        match trend.direction {
            TrendDirection::Up => Some(insight(
                InsightCategory::Alert,
                "⚠️",
                format!(
                    "Resting heart rate up {:.0}% ({:.0}bpm vs {:.0}bpm) - watch for illness or overreaching",
                    change, trend.recent_mean, trend.baseline_mean
                ),
                change,
                InsightSource::Trend,
            )),
            TrendDirection::Down => Some(insight(
                InsightCategory::Success,
                "📈",
                format!(
                    "Resting heart rate down {:.0}% - your cardiovascular fitness is improving",
                    change
                ),
                change,
                InsightSource::Trend,
            )),
            TrendDirection::Stable => None,
        }
    }

    fn strain_load(&self, inputs: &InsightInputs<'_>) -> Option<Insight> {
        let avg = inputs
            .trend(TrendMetric::Strain)?
            .recent_average(self.settings.recent_days)?;
        if avg == 0.0 {
            return None;
        }
        if avg > self.settings.high_strain_threshold {
            Some(insight(
                InsightCategory::Alert,
                "⚠️",
                format!(
                    "High strain week (avg {:.1}) - schedule recovery days to optimize performance",
                    avg
                ),
                (avg - self.settings.high_strain_threshold) / self.settings.high_strain_threshold
                    * 100.0,
                InsightSource::Strain,
            ))
        } else if avg < self.settings.low_strain_threshold {
            Some(insight(
                InsightCategory::Opportunity,
                "💡",
                format!(
                    "Light training week (avg strain {:.1}) - opportunity to increase activity",
                    avg
                ),
                (self.settings.low_strain_threshold - avg) / self.settings.low_strain_threshold
                    * 100.0,
                InsightSource::Strain,
            ))
        } else {
            None
        }
    }

    fn sleep_pattern(&self, inputs: &InsightInputs<'_>) -> Option<Insight> {
        let factors = inputs.factors?;
        let sleep = factors.factors.iter().find(|f| f.feature == Feature::SleepHours)?;
        let text = match factors
            .factors
            .iter()
            .find(|f| f.feature == Feature::SleepEfficiencyPercentage)
        {
            Some(efficiency) => format!(
                "Your best recoveries: {:.1}+ hours sleep with {:.0}%+ efficiency",
                sleep.top_quartile_avg, efficiency.top_quartile_avg
            ),
            None => format!(
                "Your best recoveries: {:.1}+ hours sleep",
                sleep.top_quartile_avg
            ),
        };
        Some(insight(
            InsightCategory::Success,
            "💤",
            text,
            sleep.importance_percentage,
            InsightSource::Factors,
        ))
    }

    fn bedtime_pattern(&self, inputs: &InsightInputs<'_>) -> Option<Insight> {
        let bedtime = inputs
            .factors?
            .factors
            .iter()
            .find(|f| f.feature == Feature::BedtimeHour)?;
        Some(insight(
            InsightCategory::Success,
            "🌙",
            format!(
                "Your top recoveries: bedtime around {} - consistency matters",
                format_clock(bedtime.top_quartile_avg)
            ),
            bedtime.importance_percentage,
            InsightSource::Factors,
        ))
    }

    fn top_lever(&self, inputs: &InsightInputs<'_>) -> Option<Insight> {
        let factors = inputs.factors?;
        let lever = factors.top_lever.as_ref()?;
        let top = factors.factors.first()?;
        Some(insight(
            InsightCategory::Opportunity,
            "💡",
            lever.clone(),
            top.importance_percentage,
            InsightSource::Factors,
        ))
    }

    fn strongest_correlation(&self, inputs: &InsightInputs<'_>) -> Option<Insight> {
        let pair = inputs.correlations?.strongest()?;
        let text = match &pair.example {
            Some(example) => format!("{}. {}", pair.explanation, example),
            None => pair.explanation.clone(),
        };
        Some(insight(
            InsightCategory::Opportunity,
            "📊",
            text,
            pair.correlation.abs() * 100.0,
            InsightSource::Correlation,
        ))
    }

    fn regression_driver(&self, inputs: &InsightInputs<'_>) -> Option<Insight> {
        let regression = inputs.regression?;
        let driver = regression.strongest_driver()?;
        let verb = match driver.partial_correlation.partial_cmp(&0.0) {
            Some(Ordering::Less) => "lowers",
            _ => "raises",
        };
        Some(insight(
            InsightCategory::Opportunity,
            "🎯",
            format!(
                "{} has the strongest independent effect on your {}: more of it {} it (partial r = {:.2})",
                driver.name,
                regression.target.label(),
                verb,
                driver.partial_correlation
            ),
            driver.partial_correlation.abs() * 100.0,
            InsightSource::Regression,
        ))
    }
}

fn insight(
    category: InsightCategory,
    emoji: &str,
    text: String,
    magnitude: f64,
    source: InsightSource,
) -> Insight {
    Insight {
        insight_text: format!("{} {}", emoji, text),
        category,
        priority: 0,
        emoji: emoji.to_string(),
        magnitude,
        source,
    }
}
