//! Trigger registry
//!
//! Owns every trigger's mutable `last_fired` state. `check` only reads;
//! the dispatcher claims a firing through `try_mark_fired`, which is a
//! compare-and-set under the write lock so overlapping cycles cannot both
//! fire the same trigger inside one cooldown window.
//!
//! Registration and dimension removal both decide under the registry write
//! lock, taken before the evaluator's, so no trigger can outlive its dimension.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::trigger::{FiredTrigger, Trigger, TriggerSpec};
use crate::clock::{system_clock, SharedClock};
use crate::error::{CoordinatorError, Result};
use crate::evaluation::{DimensionEvaluator, Score};

/// What to do with triggers that still reference a dimension being removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemovalPolicy {
    /// Refuse with [`CoordinatorError::DimensionInUse`]
    #[default]
    Restrict,
    /// Unregister the referencing triggers first
    Cascade,
}

#[derive(Default)]
struct RegistryState {
    /// Registration order
    triggers: Vec<Trigger>,
    next_sequence: u64,
}

pub struct TriggerRegistry {
    evaluator: Arc<DimensionEvaluator>,
    state: RwLock<RegistryState>,
    clock: SharedClock,
}

impl TriggerRegistry {
    pub fn new(evaluator: Arc<DimensionEvaluator>) -> Self {
        Self::with_clock(evaluator, system_clock())
    }

    pub fn with_clock(evaluator: Arc<DimensionEvaluator>, clock: SharedClock) -> Self {
        Self {
            evaluator,
            state: RwLock::new(RegistryState::default()),
            clock,
        }
    }

    /// Register a trigger. Its dimension must already be defined.
    pub async fn register(&self, spec: TriggerSpec) -> Result<Trigger> {
        if !spec.threshold.is_finite() {
            return Err(CoordinatorError::InvalidThreshold {
                trigger: spec.id,
                reason: "threshold must be finite".to_string(),
            });
        }

        let mut state = self.state.write().await;
        if !self.evaluator.contains(&spec.dimension).await {
            return Err(CoordinatorError::UnknownDimension(spec.dimension));
        }
        if state.triggers.iter().any(|t| t.id == spec.id) {
            return Err(CoordinatorError::DuplicateTrigger(spec.id));
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let trigger = Trigger::from_spec(spec, sequence);
        state.triggers.push(trigger.clone());

        info!(
            "Registered trigger '{}': {} {} {} -> {}",
            trigger.id, trigger.dimension, trigger.comparator, trigger.threshold, trigger.action_id
        );
        Ok(trigger)
    }

    /// Remove a trigger; absent ids are ignored
    pub async fn unregister(&self, trigger_id: &str) -> bool {
        let mut state = self.state.write().await;
        let before = state.triggers.len();
        state.triggers.retain(|t| t.id != trigger_id);
        let removed = state.triggers.len() < before;
        if removed {
            debug!("Unregistered trigger '{}'", trigger_id);
        }
        removed
    }

    /// Remove a dimension from the evaluator, refusing or cascading over the
    /// triggers that reference it. Returns the ids of cascaded triggers.
    pub async fn remove_dimension(&self, name: &str, policy: RemovalPolicy) -> Result<Vec<String>> {
        let mut state = self.state.write().await;
        if !self.evaluator.contains(name).await {
            return Err(CoordinatorError::UnknownDimension(name.to_string()));
        }

        let referencing: Vec<String> = state
            .triggers
            .iter()
            .filter(|t| t.dimension == name)
            .map(|t| t.id.clone())
            .collect();
        if !referencing.is_empty() {
            if policy == RemovalPolicy::Restrict {
                return Err(CoordinatorError::DimensionInUse {
                    dimension: name.to_string(),
                    triggers: referencing,
                });
            }
            state.triggers.retain(|t| t.dimension != name);
        }

        self.evaluator.remove_dimension(name).await;
        info!("Removed dimension '{}' ({} triggers cascaded)", name, referencing.len());
        Ok(referencing)
    }

    /// Triggers whose condition holds and whose cooldown has elapsed, in
    /// registration order. Triggers for dimensions absent from `scores` are skipped.
    pub async fn check(&self, scores: &BTreeMap<String, Score>) -> Vec<FiredTrigger> {
        let now = self.clock.now();
        let state = self.state.read().await;

        let mut fired = Vec::new();
        for trigger in &state.triggers {
            let Some(score) = scores.get(&trigger.dimension) else {
                continue;
            };
            if !trigger.condition_holds(score) {
                continue;
            }
            if !trigger.cooldown_elapsed(now) {
                debug!("Trigger '{}' holds but is cooling down", trigger.id);
                continue;
            }
            fired.push(FiredTrigger::new(trigger, score));
        }
        fired
    }

    /// Unconditionally set a trigger's last firing time
    pub async fn mark_fired(&self, trigger_id: &str, timestamp: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        let trigger = state
            .triggers
            .iter_mut()
            .find(|t| t.id == trigger_id)
            .ok_or_else(|| CoordinatorError::UnknownTrigger(trigger_id.to_string()))?;
        trigger.last_fired = Some(timestamp);
        Ok(())
    }

    /// Claim a firing decided by `check`. Succeeds only if nobody else fired the
    /// trigger since that check and the cooldown still permits firing at `timestamp`.
    pub async fn try_mark_fired(&self, fired: &FiredTrigger, timestamp: DateTime<Utc>) -> bool {
        let mut state = self.state.write().await;
        let Some(trigger) = state.triggers.iter_mut().find(|t| t.id == fired.trigger_id) else {
            return false;
        };
        if trigger.last_fired != fired.observed_last_fired || !trigger.cooldown_elapsed(timestamp) {
            return false;
        }
        trigger.last_fired = Some(timestamp);
        true
    }

    pub async fn get(&self, trigger_id: &str) -> Option<Trigger> {
        let state = self.state.read().await;
        state.triggers.iter().find(|t| t.id == trigger_id).cloned()
    }

    /// All triggers in registration order
    pub async fn list(&self) -> Vec<Trigger> {
        self.state.read().await.triggers.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.triggers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
