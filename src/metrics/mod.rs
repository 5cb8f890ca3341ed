//! Metric collection
//!
//! Producers push named observations here; everything downstream reads
//! windows of them back out.

pub mod store;

pub use store::{MetricStore, ObservationPayload, ObservationSeries};
