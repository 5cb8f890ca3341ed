//! Action dispatch and activation history
//!
//! Each fired trigger is claimed in the registry, then its handler runs in
//! its own task under a timeout. A failing, panicking or slow handler turns
//! into a failed [`ActivationRecord`]; it never stops the triggers after it.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::handler::{ActionContext, ActionHandler};
use crate::clock::{system_clock, SharedClock};
use crate::error::CoordinatorError;
use crate::triggers::{FiredTrigger, TriggerRegistry};
use crate::types::{Priority, TimeRange};

pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_HISTORY: usize = 10_000;

/// Why an activation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No handler registered for the action id
    UnknownAction,
    /// The handler returned an error
    HandlerError,
    /// The handler did not finish within the timeout
    Timeout,
    /// The handler panicked
    Panicked,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::UnknownAction => write!(f, "UnknownActionError"),
            FailureKind::HandlerError => write!(f, "HandlerError"),
            FailureKind::Timeout => write!(f, "Timeout"),
            FailureKind::Panicked => write!(f, "Panicked"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ActionOutcome {
    Success { detail: String },
    Failure { kind: FailureKind, detail: String },
}

/// Immutable log entry for one dispatched trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationRecord {
    pub id: String,
    pub trigger_id: String,
    pub action_id: String,
    pub dimension: String,
    /// Dimension score at the time of firing
    pub score: f64,
    pub priority: Priority,
    pub fired_at: DateTime<Utc>,
    /// Wall time spent in the handler
    pub duration_ms: u64,
    pub outcome: ActionOutcome,
}

impl ActivationRecord {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, ActionOutcome::Success { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.outcome {
            ActionOutcome::Failure { kind, .. } => Some(*kind),
            ActionOutcome::Success { .. } => None,
        }
    }
}

pub struct ActionDispatcher {
    registry: Arc<TriggerRegistry>,
    handlers: RwLock<HashMap<String, Arc<dyn ActionHandler>>>,
    /// Oldest first, capped at `max_history`
    history: RwLock<VecDeque<ActivationRecord>>,
    handler_timeout: Duration,
    max_history: usize,
    clock: SharedClock,
}

impl ActionDispatcher {
    pub fn new(registry: Arc<TriggerRegistry>) -> Self {
        Self::with_clock(registry, system_clock())
    }

    pub fn with_clock(registry: Arc<TriggerRegistry>, clock: SharedClock) -> Self {
        Self {
            registry,
            handlers: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            max_history: DEFAULT_MAX_HISTORY,
            clock,
        }
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history.max(1);
        self
    }

    /// Register the handler for an action id, replacing any previous one
    pub async fn register_handler(&self, action_id: &str, handler: Arc<dyn ActionHandler>) {
        let replaced = self
            .handlers
            .write()
            .await
            .insert(action_id.to_string(), handler)
            .is_some();
        debug!(
            "{} handler for action '{}'",
            if replaced { "Replaced" } else { "Registered" },
            action_id
        );
    }

    pub async fn has_handler(&self, action_id: &str) -> bool {
        self.handlers.read().await.contains_key(action_id)
    }

    /// Registered action ids, sorted
    pub async fn actions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Run the handler for each fired trigger in order
    pub async fn dispatch(&self, fired: &[FiredTrigger]) -> Vec<ActivationRecord> {
        let mut records = Vec::with_capacity(fired.len());

        for trigger in fired {
            let fired_at = self.clock.now();
            if !self.registry.try_mark_fired(trigger, fired_at).await {
                debug!(
                    "Trigger '{}' was fired elsewhere or removed since check, skipping",
                    trigger.trigger_id
                );
                continue;
            }

            let context = ActionContext {
                trigger_id: trigger.trigger_id.clone(),
                action_id: trigger.action_id.clone(),
                dimension: trigger.dimension.clone(),
                priority: trigger.priority,
                score: trigger.score.clone(),
                fired_at,
            };

            let started = Instant::now();
            let outcome = self.invoke(context).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            if let ActionOutcome::Failure { kind, detail } = &outcome {
                warn!(
                    "Action '{}' for trigger '{}' failed ({}): {}",
                    trigger.action_id, trigger.trigger_id, kind, detail
                );
            } else {
                info!(
                    "Action '{}' for trigger '{}' completed",
                    trigger.action_id, trigger.trigger_id
                );
            }

            records.push(ActivationRecord {
                id: uuid::Uuid::new_v4().to_string(),
                trigger_id: trigger.trigger_id.clone(),
                action_id: trigger.action_id.clone(),
                dimension: trigger.dimension.clone(),
                score: trigger.value(),
                priority: trigger.priority,
                fired_at,
                duration_ms,
                outcome,
            });
        }

        self.append_history(&records).await;
        records
    }

    async fn invoke(&self, context: ActionContext) -> ActionOutcome {
        let handler = self.handlers.read().await.get(&context.action_id).cloned();
        let Some(handler) = handler else {
            return ActionOutcome::Failure {
                kind: FailureKind::UnknownAction,
                detail: CoordinatorError::UnknownAction(context.action_id.clone()).to_string(),
            };
        };

        let task = tokio::spawn(async move { handler.handle(&context).await });
        let abort = task.abort_handle();

        match tokio::time::timeout(self.handler_timeout, task).await {
            Ok(Ok(Ok(detail))) => ActionOutcome::Success { detail },
            Ok(Ok(Err(e))) => ActionOutcome::Failure {
                kind: FailureKind::HandlerError,
                detail: format!("{:#}", e),
            },
            Ok(Err(join_error)) => ActionOutcome::Failure {
                kind: FailureKind::Panicked,
                detail: join_error.to_string(),
            },
            Err(_) => {
                abort.abort();
                ActionOutcome::Failure {
                    kind: FailureKind::Timeout,
                    detail: format!("handler exceeded {:?}", self.handler_timeout),
                }
            }
        }
    }

    async fn append_history(&self, records: &[ActivationRecord]) {
        if records.is_empty() {
            return;
        }
        let mut history = self.history.write().await;
        history.extend(records.iter().cloned());
        while history.len() > self.max_history {
            history.pop_front();
        }
    }

    /// Activation records, oldest first, optionally filtered by trigger and time
    pub async fn history(&self, trigger_id: Option<&str>, range: TimeRange) -> Vec<ActivationRecord> {
        let history = self.history.read().await;
        history
            .iter()
            .filter(|r| trigger_id.map_or(true, |id| r.trigger_id == id))
            .filter(|r| range.contains(r.fired_at))
            .cloned()
            .collect()
    }

    /// Write the activation history to a JSON file
    pub async fn save_history(&self, path: &Path) -> Result<()> {
        let records: Vec<ActivationRecord> = self.history.read().await.iter().cloned().collect();
        let json = serde_json::to_string_pretty(&records)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create history directory")?;
        }
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write history {:?}", path))?;
        info!("Saved {} activation records to {:?}", records.len(), path);
        Ok(())
    }

    /// Replace the history with the contents of a JSON file
    pub async fn load_history(&self, path: &Path) -> Result<usize> {
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read history {:?}", path))?;
        let mut records: Vec<ActivationRecord> =
            serde_json::from_str(&json).context("Failed to parse activation history")?;
        records.sort_by_key(|r| r.fired_at);

        let count = records.len();
        let mut history = self.history.write().await;
        *history = records.into();
        while history.len() > self.max_history {
            history.pop_front();
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::dispatch::handler::handler_fn;
    use crate::evaluation::{DimensionEvaluator, Score};
    use crate::metrics::MetricStore;
    use crate::triggers::TriggerSpec;
    use crate::types::Comparator;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        registry: Arc<TriggerRegistry>,
        dispatcher: ActionDispatcher,
        clock: ManualClock,
    }

    async fn harness(triggers: &[(&str, &str)]) -> Harness {
        let clock = ManualClock::new(Utc::now());
        let shared: SharedClock = Arc::new(clock.clone());
        let store = Arc::new(MetricStore::with_clock(shared.clone()));
        let evaluator = Arc::new(DimensionEvaluator::new(store));
        evaluator.define_dimension("load", [("cpu", 1.0)]).await.unwrap();

        let registry = Arc::new(TriggerRegistry::with_clock(evaluator, shared.clone()));
        for (id, action) in triggers {
            registry
                .register(
                    TriggerSpec::new(id, "load", Comparator::Gt, 90.0, action)
                        .cooldown(Duration::from_secs(60)),
                )
                .await
                .unwrap();
        }

        let dispatcher = ActionDispatcher::with_clock(registry.clone(), shared)
            .with_handler_timeout(Duration::from_millis(200));
        Harness {
            registry,
            dispatcher,
            clock,
        }
    }

    fn load_scores(value: f64) -> BTreeMap<String, Score> {
        BTreeMap::from([(
            "load".to_string(),
            Score {
                dimension: "load".to_string(),
                value: Some(value),
                observation_count: 2,
                low_confidence: false,
                contributions: Vec::new(),
                window: TimeRange::all(),
            },
        )])
    }

    #[tokio::test]
    async fn test_successful_dispatch_marks_fired() {
        let h = harness(&[("overload", "alert")]).await;
        h.dispatcher
            .register_handler("alert", handler_fn(|ctx| Ok(format!("paged for {}", ctx.trigger_id))))
            .await;

        let fired = h.registry.check(&load_scores(92.5)).await;
        let records = h.dispatcher.dispatch(&fired).await;

        assert_eq!(records.len(), 1);
        assert!(records[0].succeeded());
        assert_eq!(records[0].score, 92.5);
        assert_eq!(
            records[0].outcome,
            ActionOutcome::Success {
                detail: "paged for overload".to_string()
            }
        );
        assert_eq!(
            h.registry.get("overload").await.unwrap().last_fired,
            Some(h.clock.now())
        );
    }

    #[tokio::test]
    async fn test_missing_handler_records_failure_and_marks_fired() {
        let h = harness(&[("overload", "alert")]).await;

        let fired = h.registry.check(&load_scores(92.5)).await;
        let records = h.dispatcher.dispatch(&fired).await;

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].failure_kind(), Some(FailureKind::UnknownAction));
        assert_eq!(FailureKind::UnknownAction.to_string(), "UnknownActionError");
        assert!(h.registry.get("overload").await.unwrap().last_fired.is_some());
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let h = harness(&[("first", "broken"), ("second", "panics"), ("third", "ok")]).await;
        let calls = Arc::new(AtomicUsize::new(0));

        h.dispatcher
            .register_handler("broken", handler_fn(|_| anyhow::bail!("disk full")))
            .await;
        h.dispatcher
            .register_handler("panics", handler_fn(|_| panic!("handler bug")))
            .await;
        let counter = calls.clone();
        h.dispatcher
            .register_handler(
                "ok",
                handler_fn(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok("done".to_string())
                }),
            )
            .await;

        let fired = h.registry.check(&load_scores(95.0)).await;
        let records = h.dispatcher.dispatch(&fired).await;

        let kinds: Vec<_> = records.iter().map(|r| r.failure_kind()).collect();
        assert_eq!(
            kinds,
            vec![Some(FailureKind::HandlerError), Some(FailureKind::Panicked), None]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for id in ["first", "second", "third"] {
            assert!(h.registry.get(id).await.unwrap().last_fired.is_some());
        }
    }

    struct SlowHandler;

    #[async_trait::async_trait]
    impl ActionHandler for SlowHandler {
        async fn handle(&self, _context: &ActionContext) -> anyhow::Result<String> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok("too late".to_string())
        }
    }

    #[tokio::test]
    async fn test_timeout_is_a_failure() {
        let h = harness(&[("slow", "sleep"), ("fast", "ok")]).await;
        h.dispatcher.register_handler("sleep", Arc::new(SlowHandler)).await;
        h.dispatcher
            .register_handler("ok", handler_fn(|_| Ok("done".to_string())))
            .await;

        let fired = h.registry.check(&load_scores(95.0)).await;
        let records = h.dispatcher.dispatch(&fired).await;

        assert_eq!(records[0].failure_kind(), Some(FailureKind::Timeout));
        assert!(records[1].succeeded());
    }

    #[tokio::test]
    async fn test_stale_fired_trigger_is_skipped() {
        let h = harness(&[("overload", "alert")]).await;
        h.dispatcher
            .register_handler("alert", handler_fn(|_| Ok("sent".to_string())))
            .await;

        let first = h.registry.check(&load_scores(95.0)).await;
        let second = h.registry.check(&load_scores(95.0)).await;

        assert_eq!(h.dispatcher.dispatch(&first).await.len(), 1);
        assert!(h.dispatcher.dispatch(&second).await.is_empty());
        assert_eq!(h.dispatcher.history(Some("overload"), TimeRange::all()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_history_filters_and_cap() {
        let mut h = harness(&[("a", "ok"), ("b", "ok")]).await;
        h.dispatcher = h.dispatcher.with_max_history(3);
        h.dispatcher
            .register_handler("ok", handler_fn(|_| Ok("done".to_string())))
            .await;

        let t0 = h.clock.now();
        let fired = h.registry.check(&load_scores(95.0)).await;
        h.dispatcher.dispatch(&fired).await;

        h.clock.advance(chrono::Duration::seconds(120));
        let fired = h.registry.check(&load_scores(95.0)).await;
        h.dispatcher.dispatch(&fired).await;

        // Four activations, capped to the newest three
        let all = h.dispatcher.history(None, TimeRange::all()).await;
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].trigger_id, "b");

        let only_a = h.dispatcher.history(Some("a"), TimeRange::all()).await;
        assert_eq!(only_a.len(), 1);

        let early = h.dispatcher.history(None, TimeRange::until(t0)).await;
        assert_eq!(early.len(), 1);
    }

    #[tokio::test]
    async fn test_save_and_load_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");

        let h = harness(&[("overload", "alert")]).await;
        let fired = h.registry.check(&load_scores(95.0)).await;
        h.dispatcher.dispatch(&fired).await;
        h.dispatcher.save_history(&path).await.unwrap();

        let other = harness(&[]).await;
        assert_eq!(other.dispatcher.load_history(&path).await.unwrap(), 1);
        let restored = other.dispatcher.history(None, TimeRange::all()).await;
        assert_eq!(restored[0].failure_kind(), Some(FailureKind::UnknownAction));
    }
}
