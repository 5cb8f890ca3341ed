//! Observation storage
//!
//! Append-only time series keyed by metric name. Writers never sort;
//! every query takes a timestamp-ordered snapshot of one metric and
//! filters it lazily, so concurrent producers need no ordering between them.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::clock::{system_clock, SharedClock};
use crate::error::{self, CoordinatorError};
use crate::types::{NewObservation, Observation, ObservationValue, TimeRange};

/// JSON payload accepted from producers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationPayload {
    pub metric_name: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub context: Option<HashMap<String, serde_json::Value>>,
}

/// Result of a query: a sorted snapshot plus the filter to apply to it.
///
/// Iteration is lazy and can be repeated; each call to [`ObservationSeries::iter`]
/// yields the same observations.
#[derive(Debug, Clone)]
pub struct ObservationSeries {
    metric_name: String,
    snapshot: Arc<[Observation]>,
    range: TimeRange,
    limit: Option<usize>,
}

impl ObservationSeries {
    fn empty(metric_name: &str, range: TimeRange, limit: Option<usize>) -> Self {
        Self {
            metric_name: metric_name.to_string(),
            snapshot: Arc::from(Vec::new()),
            range,
            limit,
        }
    }

    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }

    /// Observations in timestamp order
    pub fn iter(&self) -> impl Iterator<Item = &Observation> + '_ {
        // Snapshot is sorted, so skip straight to the first candidate
        let first = match self.range.start {
            Some(start) => self.snapshot.partition_point(|o| o.timestamp < start),
            None => 0,
        };
        let end = self.range.end;
        self.snapshot[first..]
            .iter()
            .take_while(move |o| end.map_or(true, |e| o.timestamp <= e))
            .take(self.limit.unwrap_or(usize::MAX))
    }

    /// Numeric values in timestamp order (booleans as 0/1)
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.iter().map(|o| o.value.as_f64())
    }

    pub fn count(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn to_vec(&self) -> Vec<Observation> {
        self.iter().cloned().collect()
    }
}

impl<'a> IntoIterator for &'a ObservationSeries {
    type Item = &'a Observation;
    type IntoIter = Box<dyn Iterator<Item = &'a Observation> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

/// On-disk snapshot format
#[derive(Debug, Serialize, Deserialize)]
struct StoreSnapshot {
    saved_at: DateTime<Utc>,
    observations: Vec<Observation>,
}

/// Concurrent observation store
pub struct MetricStore {
    /// Observations per metric, in arrival order
    series: Arc<RwLock<HashMap<String, Vec<Observation>>>>,
    clock: SharedClock,
}

impl MetricStore {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            series: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    /// Append an observation, stamping it with the store clock if it has no timestamp
    pub async fn record(&self, observation: NewObservation) -> error::Result<Observation> {
        if observation.metric_name.trim().is_empty() {
            return Err(CoordinatorError::InvalidValue {
                metric: observation.metric_name,
                reason: "metric name is empty".to_string(),
            });
        }
        if !observation.value.is_finite() {
            return Err(CoordinatorError::InvalidValue {
                metric: observation.metric_name,
                reason: "value is not finite".to_string(),
            });
        }

        let stored = Observation {
            id: uuid::Uuid::new_v4().to_string(),
            metric_name: observation.metric_name,
            value: observation.value,
            timestamp: observation.timestamp.unwrap_or_else(|| self.clock.now()),
            context: observation.context,
        };

        let mut series = self.series.write().await;
        series
            .entry(stored.metric_name.clone())
            .or_default()
            .push(stored.clone());

        debug!("Recorded observation for '{}' at {}", stored.metric_name, stored.timestamp);
        Ok(stored)
    }

    /// Convenience wrapper for a value recorded "now"
    pub async fn record_value(
        &self,
        metric_name: &str,
        value: impl Into<ObservationValue>,
    ) -> error::Result<Observation> {
        self.record(NewObservation::new(metric_name, value)).await
    }

    /// Validate and record a producer payload
    pub async fn record_json(&self, payload: ObservationPayload) -> error::Result<Observation> {
        let value = ObservationValue::from_json(&payload.metric_name, &payload.value)?;
        let observation = NewObservation {
            metric_name: payload.metric_name,
            value,
            timestamp: payload.timestamp,
            context: payload.context.unwrap_or_default(),
        };
        self.record(observation).await
    }

    /// Observations for one metric within `range`, oldest first
    pub async fn query(
        &self,
        metric_name: &str,
        range: TimeRange,
        limit: Option<usize>,
    ) -> ObservationSeries {
        let series = self.series.read().await;
        let Some(observations) = series.get(metric_name) else {
            return ObservationSeries::empty(metric_name, range, limit);
        };

        let mut snapshot = observations.clone();
        drop(series);

        // Stable: equal timestamps keep arrival order
        snapshot.sort_by_key(|o| o.timestamp);

        ObservationSeries {
            metric_name: metric_name.to_string(),
            snapshot: Arc::from(snapshot),
            range,
            limit,
        }
    }

    /// Delete observations matching both filters; returns how many were removed.
    /// `older_than` is exclusive: an observation stamped exactly at the cutoff is kept.
    pub async fn purge(&self, metric_name: Option<&str>, older_than: Option<DateTime<Utc>>) -> usize {
        let mut series = self.series.write().await;
        let mut removed = 0;

        let keep = |o: &Observation| older_than.map_or(false, |cutoff| o.timestamp >= cutoff);

        match metric_name {
            Some(name) => {
                if let Some(observations) = series.get_mut(name) {
                    let before = observations.len();
                    observations.retain(|o| keep(o));
                    removed = before - observations.len();
                    if observations.is_empty() {
                        series.remove(name);
                    }
                }
            }
            None => {
                for observations in series.values_mut() {
                    let before = observations.len();
                    observations.retain(|o| keep(o));
                    removed += before - observations.len();
                }
                series.retain(|_, observations| !observations.is_empty());
            }
        }

        if removed > 0 {
            info!("Purged {} observations", removed);
        }
        removed
    }

    /// Names of all metrics with at least one observation, sorted
    pub async fn metric_names(&self) -> Vec<String> {
        let series = self.series.read().await;
        let mut names: Vec<String> = series.keys().cloned().collect();
        names.sort();
        names
    }

    /// Total number of stored observations
    pub async fn len(&self) -> usize {
        self.series.read().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Write every observation to a JSON snapshot
    pub async fn save(&self, path: &Path) -> Result<()> {
        let snapshot = {
            let series = self.series.read().await;
            let mut observations: Vec<Observation> =
                series.values().flat_map(|v| v.iter().cloned()).collect();
            observations.sort_by_key(|o| o.timestamp);
            StoreSnapshot {
                saved_at: self.clock.now(),
                observations,
            }
        };

        let json = serde_json::to_string_pretty(&snapshot)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create snapshot directory")?;
        }
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write snapshot {:?}", path))?;
        info!("Saved {} observations to {:?}", snapshot.observations.len(), path);
        Ok(())
    }

    /// Replace the store contents with a JSON snapshot; returns the number loaded
    pub async fn load(&self, path: &Path) -> Result<usize> {
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read snapshot {:?}", path))?;
        let snapshot: StoreSnapshot =
            serde_json::from_str(&json).context("Failed to parse observation snapshot")?;

        let count = snapshot.observations.len();
        let mut loaded: HashMap<String, Vec<Observation>> = HashMap::new();
        for observation in snapshot.observations {
            if !observation.value.is_finite() {
                anyhow::bail!(
                    "Snapshot contains a non-finite value for '{}'",
                    observation.metric_name
                );
            }
            loaded
                .entry(observation.metric_name.clone())
                .or_default()
                .push(observation);
        }

        *self.series.write().await = loaded;
        info!("Loaded {} observations from {:?}", count, path);
        Ok(count)
    }
}

impl Default for MetricStore {
    fn default() -> Self {
        Self::new()
    }
}
