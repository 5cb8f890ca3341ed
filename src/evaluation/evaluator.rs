//! Dimension scoring
//!
//! Scores are recomputed from the metric store on every call and never
//! cached, so evaluating the same window twice gives the same answer.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::dimension::Dimension;
use crate::error::{CoordinatorError, Result};
use crate::metrics::MetricStore;
use crate::types::TimeRange;

/// Default band inside which a score change counts as stable
pub const DEFAULT_TREND_TOLERANCE: f64 = 0.05;

/// One metric's share of a score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricContribution {
    pub metric: String,
    pub weight: f64,
    /// Mean of the metric's values in the window, if it had any
    pub mean: Option<f64>,
    pub count: usize,
}

/// Evaluated value of one dimension over one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub dimension: String,
    /// Weighted mean over metrics that had data; `None` when no metric did
    pub value: Option<f64>,
    /// Observations that contributed across all metrics
    pub observation_count: usize,
    /// Fewer observations than the caller asked for
    pub low_confidence: bool,
    pub contributions: Vec<MetricContribution>,
    pub window: TimeRange,
}

/// Direction of a score relative to the preceding window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    /// Nothing to compare against
    Initial,
    Improving,
    Declining,
    Stable,
}

impl Trend {
    pub fn classify(previous: Option<f64>, current: Option<f64>, tolerance: f64) -> Self {
        match (previous, current) {
            (Some(prev), Some(cur)) if cur > prev + tolerance => Trend::Improving,
            (Some(prev), Some(cur)) if cur < prev - tolerance => Trend::Declining,
            (Some(_), Some(_)) => Trend::Stable,
            _ => Trend::Initial,
        }
    }
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trend::Initial => write!(f, "initial"),
            Trend::Improving => write!(f, "improving"),
            Trend::Declining => write!(f, "declining"),
            Trend::Stable => write!(f, "stable"),
        }
    }
}

/// Holds dimension definitions and scores them against the metric store
pub struct DimensionEvaluator {
    store: Arc<MetricStore>,
    dimensions: RwLock<HashMap<String, Dimension>>,
    trend_tolerance: f64,
}

impl DimensionEvaluator {
    pub fn new(store: Arc<MetricStore>) -> Self {
        Self {
            store,
            dimensions: RwLock::new(HashMap::new()),
            trend_tolerance: DEFAULT_TREND_TOLERANCE,
        }
    }

    pub fn with_trend_tolerance(mut self, tolerance: f64) -> Self {
        self.trend_tolerance = tolerance.abs();
        self
    }

    pub fn store(&self) -> &Arc<MetricStore> {
        &self.store
    }

    /// Define or overwrite a dimension
    pub async fn define_dimension<I, S>(&self, name: &str, weighted_metrics: I) -> Result<Dimension>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let dimension = Dimension::new(name, weighted_metrics)?;
        let mut dimensions = self.dimensions.write().await;
        let replaced = dimensions.insert(name.to_string(), dimension.clone()).is_some();
        if replaced {
            info!("Redefined dimension '{}'", name);
        } else {
            info!("Defined dimension '{}' over {} metrics", name, dimension.metrics.len());
        }
        Ok(dimension)
    }

    /// Remove a dimension without checking who references it.
    /// Only the trigger registry calls this, holding its own write lock.
    pub(crate) async fn remove_dimension(&self, name: &str) -> Option<Dimension> {
        self.dimensions.write().await.remove(name)
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.dimensions.read().await.contains_key(name)
    }

    pub async fn dimension(&self, name: &str) -> Option<Dimension> {
        self.dimensions.read().await.get(name).cloned()
    }

    /// All dimensions sorted by name
    pub async fn dimensions(&self) -> Vec<Dimension> {
        let mut all: Vec<Dimension> = self.dimensions.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Score a dimension over `range`
    pub async fn evaluate(
        &self,
        dimension_name: &str,
        range: TimeRange,
        min_observations: usize,
    ) -> Result<Score> {
        let dimension = self
            .dimension(dimension_name)
            .await
            .ok_or_else(|| CoordinatorError::UnknownDimension(dimension_name.to_string()))?;

        let mut contributions = Vec::with_capacity(dimension.metrics.len());
        let mut weighted_sum = 0.0;
        let mut weight_sum = 0.0;
        let mut observation_count = 0;

        for (metric, weight) in &dimension.metrics {
            let series = self.store.query(metric, range, None).await;
            let (sum, count) = series
                .values()
                .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));

            let mean = if count > 0 { Some(sum / count as f64) } else { None };
            if let Some(mean) = mean {
                weighted_sum += weight * mean;
                weight_sum += weight;
            }
            observation_count += count;

            contributions.push(MetricContribution {
                metric: metric.clone(),
                weight: *weight,
                mean,
                count,
            });
        }

        let value = if weight_sum > 0.0 {
            Some(weighted_sum / weight_sum)
        } else {
            None
        };
        let low_confidence = observation_count == 0 || observation_count < min_observations;

        debug!(
            "Evaluated '{}': value={:?} observations={} low_confidence={}",
            dimension_name, value, observation_count, low_confidence
        );

        Ok(Score {
            dimension: dimension_name.to_string(),
            value,
            observation_count,
            low_confidence,
            contributions,
            window: range,
        })
    }

    /// Score `range` and classify it against the window of equal length before it.
    /// Open-ended windows have no predecessor and report [`Trend::Initial`].
    pub async fn evaluate_with_trend(
        &self,
        dimension_name: &str,
        range: TimeRange,
        min_observations: usize,
    ) -> Result<(Score, Trend)> {
        let current = self.evaluate(dimension_name, range, min_observations).await?;
        let trend = match range.preceding() {
            Some(previous_range) => {
                let previous = self
                    .evaluate(dimension_name, previous_range, min_observations)
                    .await?;
                Trend::classify(previous.value, current.value, self.trend_tolerance)
            }
            None => Trend::Initial,
        };
        Ok((current, trend))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewObservation;
    use chrono::{Duration, Utc};

    async fn evaluator_with_store() -> (DimensionEvaluator, Arc<MetricStore>) {
        let store = Arc::new(MetricStore::new());
        (DimensionEvaluator::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_single_metric_mean() {
        let (evaluator, store) = evaluator_with_store().await;
        evaluator.define_dimension("load", [("cpu", 1.0)]).await.unwrap();

        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(5);
        store.record(NewObservation::new("cpu", 90.0).at(t0)).await.unwrap();
        store.record(NewObservation::new("cpu", 95.0).at(t1)).await.unwrap();

        let score = evaluator
            .evaluate("load", TimeRange::between(t0, t1).unwrap(), 1)
            .await
            .unwrap();
        assert_eq!(score.value, Some(92.5));
        assert_eq!(score.observation_count, 2);
        assert!(!score.low_confidence);
    }

    #[tokio::test]
    async fn test_weighted_combination_with_booleans() {
        let (evaluator, store) = evaluator_with_store().await;
        evaluator
            .define_dimension(
                "user_satisfaction",
                [("response_rating", 3.0), ("completion_flag", 1.0)],
            )
            .await
            .unwrap();

        store.record_value("response_rating", 0.8).await.unwrap();
        store.record_value("response_rating", 0.6).await.unwrap();
        store.record_value("completion_flag", true).await.unwrap();
        store.record_value("completion_flag", false).await.unwrap();

        let score = evaluator
            .evaluate("user_satisfaction", TimeRange::all(), 1)
            .await
            .unwrap();
        // (3 * 0.7 + 1 * 0.5) / 4
        let value = score.value.unwrap();
        assert!((value - 0.65).abs() < 1e-12);
        assert_eq!(score.observation_count, 4);
        assert_eq!(score.contributions.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_metric_is_excluded_from_weights() {
        let (evaluator, store) = evaluator_with_store().await;
        evaluator
            .define_dimension("health", [("uptime", 1.0), ("error_rate", 1.0)])
            .await
            .unwrap();
        store.record_value("uptime", 0.9).await.unwrap();

        let score = evaluator.evaluate("health", TimeRange::all(), 1).await.unwrap();
        assert_eq!(score.value, Some(0.9));
        let missing = score
            .contributions
            .iter()
            .find(|c| c.metric == "error_rate")
            .unwrap();
        assert_eq!(missing.mean, None);
        assert_eq!(missing.count, 0);
    }

    #[tokio::test]
    async fn test_low_confidence_is_flagged_not_raised() {
        let (evaluator, store) = evaluator_with_store().await;
        evaluator.define_dimension("load", [("cpu", 1.0)]).await.unwrap();
        store.record_value("cpu", 50.0).await.unwrap();

        let score = evaluator.evaluate("load", TimeRange::all(), 5).await.unwrap();
        assert!(score.low_confidence);
        assert_eq!(score.value, Some(50.0));

        store.purge(None, None).await;
        let empty = evaluator.evaluate("load", TimeRange::all(), 0).await.unwrap();
        assert!(empty.low_confidence);
        assert_eq!(empty.value, None);
    }

    #[tokio::test]
    async fn test_unknown_dimension() {
        let (evaluator, _) = evaluator_with_store().await;
        let err = evaluator.evaluate("nope", TimeRange::all(), 1).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::UnknownDimension(name) if name == "nope"));
    }

    #[tokio::test]
    async fn test_evaluate_is_idempotent() {
        let (evaluator, store) = evaluator_with_store().await;
        evaluator.define_dimension("load", [("cpu", 2.0), ("mem", 1.0)]).await.unwrap();
        store.record_value("cpu", 40.0).await.unwrap();
        store.record_value("mem", 70.0).await.unwrap();

        let first = evaluator.evaluate("load", TimeRange::all(), 1).await.unwrap();
        let second = evaluator.evaluate("load", TimeRange::all(), 1).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_redefinition_overwrites() {
        let (evaluator, store) = evaluator_with_store().await;
        store.record_value("cpu", 10.0).await.unwrap();
        store.record_value("mem", 30.0).await.unwrap();

        evaluator.define_dimension("load", [("cpu", 1.0)]).await.unwrap();
        let before = evaluator.evaluate("load", TimeRange::all(), 1).await.unwrap();

        evaluator.define_dimension("load", [("mem", 1.0)]).await.unwrap();
        let after = evaluator.evaluate("load", TimeRange::all(), 1).await.unwrap();

        // The earlier score is a value, untouched by redefinition
        assert_eq!(before.value, Some(10.0));
        assert_eq!(after.value, Some(30.0));
    }

    #[tokio::test]
    async fn test_trend_against_previous_window() {
        let (evaluator, store) = evaluator_with_store().await;
        evaluator.define_dimension("quality", [("rating", 1.0)]).await.unwrap();

        let now = Utc::now();
        store
            .record(NewObservation::new("rating", 0.9).at(now - Duration::minutes(90)))
            .await
            .unwrap();
        store
            .record(NewObservation::new("rating", 0.6).at(now - Duration::minutes(30)))
            .await
            .unwrap();

        let window = TimeRange::trailing(now, Duration::hours(1)).unwrap();
        let (score, trend) = evaluator.evaluate_with_trend("quality", window, 1).await.unwrap();
        assert_eq!(score.value, Some(0.6));
        assert_eq!(trend, Trend::Declining);

        let (_, open_trend) = evaluator
            .evaluate_with_trend("quality", TimeRange::all(), 1)
            .await
            .unwrap();
        assert_eq!(open_trend, Trend::Initial);
    }

    #[test]
    fn test_trend_classification() {
        assert_eq!(Trend::classify(None, Some(0.5), 0.05), Trend::Initial);
        assert_eq!(Trend::classify(Some(0.5), Some(0.56), 0.05), Trend::Improving);
        assert_eq!(Trend::classify(Some(0.5), Some(0.44), 0.05), Trend::Declining);
        assert_eq!(Trend::classify(Some(0.5), Some(0.53), 0.05), Trend::Stable);
        assert_eq!(Trend::classify(Some(0.5), None, 0.05), Trend::Initial);
    }
}
