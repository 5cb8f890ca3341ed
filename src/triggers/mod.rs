//! Threshold triggers with per-trigger cooldowns

pub mod registry;
pub mod trigger;

pub use registry::{RemovalPolicy, TriggerRegistry};
pub use trigger::{FiredTrigger, Trigger, TriggerSpec};
