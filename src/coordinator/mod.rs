//! Cycle coordinator
//!
//! Sequences one cycle: evaluate the requested dimensions, check triggers
//! against the resulting scores, dispatch whatever fired. The coordinator owns
//! no mutable state of its own; the store, registry and dispatcher do.

pub mod report;

use anyhow::Context;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

pub use crate::triggers::RemovalPolicy;
pub use report::{CancelToken, CoordinatorStatus, CycleReport};

use crate::clock::{system_clock, SharedClock};
use crate::config::{ActionKind, Config, EngineConfig};
use crate::dispatch::{ActionDispatcher, ActionHandler, ActivationRecord, LogAction, WebhookAction};
use crate::error::{CoordinatorError, CycleStage, Result};
use crate::evaluation::{Dimension, DimensionEvaluator};
use crate::metrics::MetricStore;
use crate::triggers::{FiredTrigger, Trigger, TriggerRegistry, TriggerSpec};
use crate::types::TimeRange;

pub struct Coordinator {
    store: Arc<MetricStore>,
    evaluator: Arc<DimensionEvaluator>,
    registry: Arc<TriggerRegistry>,
    dispatcher: Arc<ActionDispatcher>,
    clock: SharedClock,
    min_observations: usize,
}

impl Coordinator {
    pub fn new(engine: &EngineConfig) -> Self {
        Self::with_clock(engine, system_clock())
    }

    /// Build all four components sharing one clock
    pub fn with_clock(engine: &EngineConfig, clock: SharedClock) -> Self {
        let store = Arc::new(MetricStore::with_clock(clock.clone()));
        let evaluator = Arc::new(
            DimensionEvaluator::new(store.clone()).with_trend_tolerance(engine.trend_tolerance),
        );
        let registry = Arc::new(TriggerRegistry::with_clock(evaluator.clone(), clock.clone()));
        let dispatcher = Arc::new(
            ActionDispatcher::with_clock(registry.clone(), clock.clone())
                .with_handler_timeout(engine.handler_timeout())
                .with_max_history(engine.max_history),
        );

        Self {
            store,
            evaluator,
            registry,
            dispatcher,
            clock,
            min_observations: engine.min_observations,
        }
    }

    /// Validate `config` and build a coordinator loaded with its dimensions,
    /// actions and triggers
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::from_config_with_clock(config, system_clock()).await
    }

    pub async fn from_config_with_clock(config: &Config, clock: SharedClock) -> anyhow::Result<Self> {
        config.validate()?;
        let coordinator = Self::with_clock(&config.engine, clock);
        coordinator.apply_config(config).await?;
        Ok(coordinator)
    }

    /// Load the declarative dimension, action and trigger set. Dimensions go
    /// first because triggers are checked against them on registration.
    pub async fn apply_config(&self, config: &Config) -> anyhow::Result<()> {
        for dimension in &config.dimensions {
            self.define_dimension(&dimension.name, dimension.metrics.clone())
                .await
                .with_context(|| format!("Failed to define dimension '{}'", dimension.name))?;
        }

        for action in &config.actions {
            let handler: Arc<dyn ActionHandler> = match action.kind {
                ActionKind::Log => Arc::new(LogAction),
                ActionKind::Webhook => {
                    let url = action
                        .url
                        .as_deref()
                        .with_context(|| format!("Webhook action '{}' has no url", action.id))?;
                    Arc::new(WebhookAction::new(url)?)
                }
            };
            self.register_handler(&action.id, handler).await;
        }

        for trigger in &config.triggers {
            self.register_trigger(trigger.to_spec())
                .await
                .with_context(|| format!("Failed to register trigger '{}'", trigger.id))?;
        }

        info!(
            "Applied config: {} dimensions, {} actions, {} triggers",
            config.dimensions.len(),
            config.actions.len(),
            config.triggers.len()
        );
        Ok(())
    }

    pub fn store(&self) -> &Arc<MetricStore> {
        &self.store
    }

    pub fn evaluator(&self) -> &Arc<DimensionEvaluator> {
        &self.evaluator
    }

    pub fn registry(&self) -> &Arc<TriggerRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<ActionDispatcher> {
        &self.dispatcher
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn min_observations(&self) -> usize {
        self.min_observations
    }

    pub async fn define_dimension<I, S>(&self, name: &str, weighted_metrics: I) -> Result<Dimension>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        self.evaluator.define_dimension(name, weighted_metrics).await
    }

    /// Remove a dimension. Returns the ids of triggers removed along with it.
    pub async fn remove_dimension(&self, name: &str, policy: RemovalPolicy) -> Result<Vec<String>> {
        self.registry.remove_dimension(name, policy).await
    }

    pub async fn register_trigger(&self, spec: TriggerSpec) -> Result<Trigger> {
        self.registry.register(spec).await
    }

    pub async fn unregister_trigger(&self, trigger_id: &str) -> bool {
        self.registry.unregister(trigger_id).await
    }

    pub async fn register_handler(&self, action_id: &str, handler: Arc<dyn ActionHandler>) {
        self.dispatcher.register_handler(action_id, handler).await;
    }

    /// Run one cycle over the named dimensions
    pub async fn run_cycle<S: AsRef<str>>(
        &self,
        dimension_names: &[S],
        window: TimeRange,
    ) -> Result<CycleReport> {
        self.run_cycle_with_cancel(dimension_names, window, &CancelToken::new())
            .await
    }

    /// Run one cycle over every defined dimension
    pub async fn run_cycle_all(&self, window: TimeRange) -> Result<CycleReport> {
        let names: Vec<String> = self
            .evaluator
            .dimensions()
            .await
            .into_iter()
            .map(|d| d.name)
            .collect();
        self.run_cycle(names.as_slice(), window).await
    }

    /// Run one cycle, checking `cancel` before each stage. A dispatch that
    /// has started always runs to completion.
    pub async fn run_cycle_with_cancel<S: AsRef<str>>(
        &self,
        dimension_names: &[S],
        window: TimeRange,
        cancel: &CancelToken,
    ) -> Result<CycleReport> {
        let cycle_id = uuid::Uuid::new_v4().to_string();
        let started_at = self.clock.now();

        ensure_running(cancel, CycleStage::Evaluate)?;

        let mut seen = HashSet::new();
        let mut scores = BTreeMap::new();
        let mut trends = BTreeMap::new();
        for name in dimension_names.iter().map(AsRef::as_ref) {
            if !seen.insert(name) {
                continue;
            }
            if window.is_bounded() {
                let (score, trend) = self
                    .evaluator
                    .evaluate_with_trend(name, window, self.min_observations)
                    .await?;
                trends.insert(name.to_string(), trend);
                scores.insert(name.to_string(), score);
            } else {
                let score = self
                    .evaluator
                    .evaluate(name, window, self.min_observations)
                    .await?;
                scores.insert(name.to_string(), score);
            }
        }

        ensure_running(cancel, CycleStage::Check)?;
        let eligible = self.registry.check(&scores).await;
        debug!("Cycle {}: {} triggers eligible", cycle_id, eligible.len());

        ensure_running(cancel, CycleStage::Dispatch)?;
        let (fired_triggers, activation_records) = self.dispatch_claimed(eligible).await;

        let report = CycleReport {
            cycle_id,
            started_at,
            completed_at: self.clock.now(),
            window,
            scores,
            trends,
            fired_triggers,
            activation_records,
        };

        info!(
            "Cycle {} complete: {} dimensions, {} fired, {} activations ({} failed)",
            report.cycle_id,
            report.scores.len(),
            report.fired_triggers.len(),
            report.activation_records.len(),
            report.failed_activations()
        );
        Ok(report)
    }

    /// Dispatch and keep only the triggers this cycle actually claimed.
    /// Claims lost to an overlapping cycle leave no record and are dropped.
    async fn dispatch_claimed(
        &self,
        mut fired: Vec<FiredTrigger>,
    ) -> (Vec<FiredTrigger>, Vec<ActivationRecord>) {
        let records = self.dispatcher.dispatch(&fired).await;
        let claimed: HashSet<&str> = records.iter().map(|r| r.trigger_id.as_str()).collect();
        fired.retain(|f| claimed.contains(f.trigger_id.as_str()));
        (fired, records)
    }

    pub async fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            version: crate::VERSION.to_string(),
            observations: self.store.len().await,
            metrics: self.store.metric_names().await.len(),
            dimensions: self.evaluator.dimensions().await.len(),
            triggers: self.registry.len().await,
            actions: self.dispatcher.actions().await,
            activations: self
                .dispatcher
                .history(None, TimeRange::all())
                .await
                .len(),
        }
    }
}

fn ensure_running(cancel: &CancelToken, stage: CycleStage) -> Result<()> {
    if cancel.is_cancelled() {
        debug!("Cycle cancelled before {} stage", stage);
        return Err(CoordinatorError::Cancelled { stage });
    }
    Ok(())
}
