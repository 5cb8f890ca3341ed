//! Cycle scheduler
//!
//! Drives `run_cycle` on a fixed interval over a trailing window. Failed
//! cycles back off exponentially until one succeeds again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info};

use crate::config::SchedulerConfig;
use crate::coordinator::{CancelToken, Coordinator, CycleReport};
use crate::error::CoordinatorError;
use crate::types::TimeRange;

/// Result of a single scheduled cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CycleOutcome {
    Completed {
        cycle_id: String,
        fired: usize,
        failed: usize,
    },
    Cancelled,
    Error {
        message: String,
    },
}

impl std::fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleOutcome::Completed {
                cycle_id,
                fired,
                failed,
            } => write!(f, "Cycle {}: {} fired, {} failed", cycle_id, fired, failed),
            CycleOutcome::Cancelled => write!(f, "Cancelled"),
            CycleOutcome::Error { message } => write!(f, "Error: {}", message),
        }
    }
}

/// Shared view of what the scheduler has done so far
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerState {
    pub cycles_run: u64,
    pub consecutive_errors: u32,
    pub last_run: Option<DateTime<Utc>>,
    pub last_outcome: Option<CycleOutcome>,
}

pub struct CycleScheduler {
    coordinator: Arc<Coordinator>,
    config: SchedulerConfig,
    state: Arc<RwLock<SchedulerState>>,
    cancel: CancelToken,
}

impl CycleScheduler {
    pub fn new(coordinator: Arc<Coordinator>, config: SchedulerConfig) -> Self {
        Self {
            coordinator,
            config,
            state: Arc::new(RwLock::new(SchedulerState::default())),
            cancel: CancelToken::new(),
        }
    }

    /// Handle for reading scheduler progress from elsewhere
    pub fn state(&self) -> Arc<RwLock<SchedulerState>> {
        self.state.clone()
    }

    /// `base · 2^errors`, capped at the configured maximum
    pub fn backoff_duration(&self, errors: u32) -> Duration {
        let secs = self
            .config
            .base_backoff_secs
            .saturating_mul(2u64.saturating_pow(errors));
        Duration::from_secs(secs.min(self.config.max_backoff_secs))
    }

    fn window(&self) -> Option<TimeRange> {
        let secs = i64::try_from(self.config.window_secs).ok()?;
        let length = chrono::Duration::try_seconds(secs)?;
        TimeRange::trailing(self.coordinator.clock().now(), length)
    }

    /// Run one cycle over the trailing window
    pub async fn tick(&self) -> CycleOutcome {
        let result = match self.window() {
            Some(window) => self.run_window(window).await,
            None => Err(CoordinatorError::InvalidTimeRange(format!(
                "trailing window of {}s is out of range",
                self.config.window_secs
            ))),
        };

        let outcome = match result {
            Ok(report) => CycleOutcome::Completed {
                fired: report.fired_triggers.len(),
                failed: report.failed_activations(),
                cycle_id: report.cycle_id,
            },
            Err(CoordinatorError::Cancelled { .. }) => CycleOutcome::Cancelled,
            Err(e) => CycleOutcome::Error {
                message: e.to_string(),
            },
        };

        let mut state = self.state.write().await;
        state.cycles_run += 1;
        state.last_run = Some(self.coordinator.clock().now());
        match &outcome {
            CycleOutcome::Error { .. } => state.consecutive_errors += 1,
            _ => state.consecutive_errors = 0,
        }
        state.last_outcome = Some(outcome.clone());
        outcome
    }

    async fn run_window(&self, window: TimeRange) -> crate::error::Result<CycleReport> {
        if self.config.dimensions.is_empty() {
            let names: Vec<String> = self
                .coordinator
                .evaluator()
                .dimensions()
                .await
                .into_iter()
                .map(|d| d.name)
                .collect();
            self.coordinator
                .run_cycle_with_cancel(names.as_slice(), window, &self.cancel)
                .await
        } else {
            self.coordinator
                .run_cycle_with_cancel(self.config.dimensions.as_slice(), window, &self.cancel)
                .await
        }
    }

    /// Run the cycle loop until shutdown signal
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "Cycle scheduler started (interval: {}s, window: {}s)",
            self.config.interval_secs, self.config.window_secs
        );

        // Stop an in-flight cycle between stages as soon as shutdown arrives
        let cancel = self.cancel.clone();
        let mut cancel_rx = shutdown_rx.resubscribe();
        let watcher = tokio::spawn(async move {
            let _ = cancel_rx.recv().await;
            cancel.cancel();
        });

        loop {
            let errors = self.state.read().await.consecutive_errors;
            let sleep_duration = if errors > 0 {
                self.backoff_duration(errors)
            } else {
                Duration::from_secs(self.config.interval_secs)
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep_duration) => {
                    match self.tick().await {
                        CycleOutcome::Completed { cycle_id, fired, failed } => {
                            debug!("Scheduled cycle {}: {} fired, {} failed", cycle_id, fired, failed)
                        }
                        CycleOutcome::Cancelled => {
                            info!("Scheduled cycle cancelled");
                            break;
                        }
                        CycleOutcome::Error { message } => error!("Scheduled cycle failed: {}", message),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Cycle scheduler shutting down");
                    self.cancel.cancel();
                    break;
                }
            }
        }

        watcher.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::EngineConfig;
    use crate::dispatch::handler_fn;
    use crate::triggers::TriggerSpec;
    use crate::types::Comparator;

    async fn scheduler(dimensions: &[&str]) -> (CycleScheduler, Arc<Coordinator>) {
        let clock = ManualClock::new(Utc::now());
        let coordinator = Arc::new(Coordinator::with_clock(
            &EngineConfig::default(),
            Arc::new(clock),
        ));
        coordinator.define_dimension("load", [("cpu", 1.0)]).await.unwrap();

        let config = SchedulerConfig {
            dimensions: dimensions.iter().map(|d| d.to_string()).collect(),
            ..Default::default()
        };
        (CycleScheduler::new(coordinator.clone(), config), coordinator)
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(CycleOutcome::Cancelled.to_string(), "Cancelled");
        let error = CycleOutcome::Error {
            message: "boom".to_string(),
        };
        assert_eq!(error.to_string(), "Error: boom");
    }

    #[tokio::test]
    async fn test_backoff_duration() {
        let (scheduler, _) = scheduler(&[]).await;
        assert_eq!(scheduler.backoff_duration(0).as_secs(), 30);
        assert_eq!(scheduler.backoff_duration(1).as_secs(), 60);
        assert_eq!(scheduler.backoff_duration(3).as_secs(), 240);
        assert_eq!(scheduler.backoff_duration(10).as_secs(), 1800);
        assert_eq!(scheduler.backoff_duration(u32::MAX).as_secs(), 1800);
    }

    #[tokio::test]
    async fn test_tick_fires_over_trailing_window() {
        let (scheduler, coordinator) = scheduler(&[]).await;
        coordinator
            .register_trigger(TriggerSpec::new("hot", "load", Comparator::Gt, 90.0, "alert"))
            .await
            .unwrap();
        coordinator
            .register_handler("alert", handler_fn(|_| Ok("sent".to_string())))
            .await;
        coordinator.store().record_value("cpu", 95.0).await.unwrap();

        let outcome = scheduler.tick().await;
        assert!(matches!(outcome, CycleOutcome::Completed { fired: 1, failed: 0, .. }));

        let state = scheduler.state();
        let state = state.read().await;
        assert_eq!(state.cycles_run, 1);
        assert_eq!(state.consecutive_errors, 0);
    }

    #[tokio::test]
    async fn test_errors_accumulate_and_reset() {
        let (scheduler, coordinator) = scheduler(&["load", "latency"]).await;

        assert!(matches!(scheduler.tick().await, CycleOutcome::Error { .. }));
        assert!(matches!(scheduler.tick().await, CycleOutcome::Error { .. }));
        assert_eq!(scheduler.state().read().await.consecutive_errors, 2);

        coordinator
            .define_dimension("latency", [("p99_ms", 1.0)])
            .await
            .unwrap();
        assert!(matches!(scheduler.tick().await, CycleOutcome::Completed { .. }));
        assert_eq!(scheduler.state().read().await.consecutive_errors, 0);
    }

    #[tokio::test]
    async fn test_oversized_window_is_an_error() {
        let (mut scheduler, _) = scheduler(&[]).await;
        scheduler.config.window_secs = u64::MAX;
        match scheduler.tick().await {
            CycleOutcome::Error { message } => assert!(message.contains("out of range")),
            other => panic!("unexpected outcome: {other}"),
        }

        scheduler.config.window_secs = i64::MAX as u64;
        assert!(matches!(scheduler.tick().await, CycleOutcome::Error { .. }));
        assert_eq!(scheduler.state().read().await.consecutive_errors, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_dispatch_stops_further_cycles() {
        let (scheduler, coordinator) = scheduler(&[]).await;
        let scheduler = Arc::new(scheduler);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        coordinator
            .register_trigger(TriggerSpec::new("hot", "load", Comparator::Gt, 90.0, "alert"))
            .await
            .unwrap();
        let signal = shutdown_tx.clone();
        coordinator
            .register_handler(
                "alert",
                handler_fn(move |_| {
                    let _ = signal.send(());
                    Ok("sent".to_string())
                }),
            )
            .await;
        coordinator.store().record_value("cpu", 95.0).await.unwrap();

        let runner = scheduler.clone();
        let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });
        tokio_test::assert_ok!(handle.await);

        // The in-flight cycle finished its dispatch before the loop stopped
        let state = scheduler.state();
        assert_eq!(state.read().await.cycles_run, 1);
        assert!(matches!(
            state.read().await.last_outcome,
            Some(CycleOutcome::Completed { fired: 1, .. })
        ));

        assert_eq!(scheduler.tick().await, CycleOutcome::Cancelled);
        assert_eq!(
            coordinator
                .dispatcher()
                .history(None, TimeRange::all())
                .await
                .len(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_shutdown() {
        let (scheduler, _) = scheduler(&[]).await;
        let scheduler = Arc::new(scheduler);
        let state = scheduler.state();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let runner = scheduler.clone();
        let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });

        // Paused time auto-advances through the 60s interval
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(state.read().await.cycles_run, 1);

        shutdown_tx.send(()).unwrap();
        tokio_test::assert_ok!(handle.await);
    }
}
