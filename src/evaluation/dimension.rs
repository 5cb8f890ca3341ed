//! Dimension definitions
//!
//! A dimension folds several metrics into one comparable number.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{CoordinatorError, Result};

/// A named weighted combination of metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    /// metric name -> weight (> 0). Ordered so evaluation is deterministic.
    pub metrics: BTreeMap<String, f64>,
}

impl Dimension {
    /// Build a validated dimension
    pub fn new<I, S>(name: &str, weighted_metrics: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let mut metrics = BTreeMap::new();
        for (metric, weight) in weighted_metrics {
            let metric = metric.into();
            if metric.trim().is_empty() {
                return Err(invalid(name, "metric name is empty".to_string()));
            }
            if !weight.is_finite() || weight <= 0.0 {
                return Err(invalid(
                    name,
                    format!("weight for '{}' must be a positive number, got {}", metric, weight),
                ));
            }
            metrics.insert(metric, weight);
        }

        if metrics.is_empty() {
            return Err(invalid(name, "at least one weighted metric is required".to_string()));
        }
        if name.trim().is_empty() {
            return Err(invalid(name, "dimension name is empty".to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            metrics,
        })
    }

    pub fn total_weight(&self) -> f64 {
        self.metrics.values().sum()
    }
}

fn invalid(dimension: &str, reason: String) -> CoordinatorError {
    CoordinatorError::InvalidWeight {
        dimension: dimension.to_string(),
        reason,
    }
}
