//! Cycle reports and cancellation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::dispatch::ActivationRecord;
use crate::evaluation::{Score, Trend};
use crate::triggers::FiredTrigger;
use crate::types::TimeRange;

/// Everything one evaluate → check → dispatch pass produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub window: TimeRange,
    pub scores: BTreeMap<String, Score>,
    /// Only present for windows bounded on both sides
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub trends: BTreeMap<String, Trend>,
    pub fired_triggers: Vec<FiredTrigger>,
    pub activation_records: Vec<ActivationRecord>,
}

impl CycleReport {
    pub fn failed_activations(&self) -> usize {
        self.activation_records.iter().filter(|r| !r.succeeded()).count()
    }
}

/// Cooperative cancellation flag checked between cycle stages
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Counts for the status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorStatus {
    pub version: String,
    pub observations: usize,
    pub metrics: usize,
    pub dimensions: usize,
    pub triggers: usize,
    pub actions: Vec<String>,
    pub activations: usize,
}
