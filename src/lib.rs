//! Feedback Coordinator Library
//!
//! A trigger-coordination engine for agent feedback loops:
//! - Time-stamped observations from many independent producers
//! - Weighted per-dimension scores with confidence and trend
//! - Threshold triggers with per-trigger cooldowns
//! - Debounced, isolated action dispatch with an activation log
//!
//! # Example
//!
//! ```ignore
//! use feedback_coordinator::{handler_fn, Comparator, Coordinator, TimeRange, TriggerSpec};
//! use feedback_coordinator::config::EngineConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let coordinator = Coordinator::new(&EngineConfig::default());
//!     coordinator.define_dimension("load", [("cpu", 0.75), ("memory", 0.25)]).await?;
//!     coordinator
//!         .register_trigger(TriggerSpec::new("overload", "load", Comparator::Gt, 90.0, "alert"))
//!         .await?;
//!     coordinator
//!         .register_handler("alert", handler_fn(|ctx| Ok(format!("paged for {}", ctx.trigger_id))))
//!         .await;
//!
//!     coordinator.store().record_value("cpu", 95.0).await?;
//!     let report = coordinator.run_cycle(&["load"], TimeRange::all()).await?;
//!     println!("{} activations", report.activation_records.len());
//!     Ok(())
//! }
//! ```

// Core modules (leaves first)
pub mod error;
pub mod clock;
pub mod types;
pub mod metrics;
pub mod evaluation;
pub mod triggers;
pub mod dispatch;
pub mod coordinator;

// Service modules
pub mod config;
pub mod scheduler;
pub mod server;
pub mod daemon;
pub mod cli;

// Re-export commonly used types for convenience
pub use error::{CoordinatorError, CycleStage, Result};

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};

pub use types::{Comparator, NewObservation, Observation, ObservationValue, Priority, TimeRange};

pub use metrics::{MetricStore, ObservationPayload, ObservationSeries};

pub use evaluation::{Dimension, DimensionEvaluator, Score, Trend};

pub use triggers::{FiredTrigger, Trigger, TriggerRegistry, TriggerSpec};

pub use dispatch::{
    handler_fn, ActionContext, ActionDispatcher, ActionHandler, ActionOutcome, ActivationRecord,
    FailureKind,
};

pub use coordinator::{CancelToken, Coordinator, CycleReport, RemovalPolicy};

pub use config::Config;

pub use scheduler::CycleScheduler;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get the library info
pub fn info() -> String {
    format!("{} v{} - Feedback trigger coordination", NAME, VERSION)
}
