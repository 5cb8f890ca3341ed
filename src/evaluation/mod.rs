//! Dimension evaluation
//!
//! Turns windows of raw observations into weighted per-dimension scores.

pub mod dimension;
pub mod evaluator;

pub use dimension::Dimension;
pub use evaluator::{DimensionEvaluator, MetricContribution, Score, Trend, DEFAULT_TREND_TOLERANCE};
