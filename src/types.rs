//! Shared types used across modules
//!
//! Observations, time windows, comparators and priorities are used by the
//! store, the evaluator, the registry and the HTTP layer alike.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{CoordinatorError, Result};

/// Value carried by an observation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObservationValue {
    Bool(bool),
    Number(f64),
}

impl ObservationValue {
    /// Numeric view used for aggregation; booleans become 0/1
    pub fn as_f64(&self) -> f64 {
        match self {
            ObservationValue::Bool(true) => 1.0,
            ObservationValue::Bool(false) => 0.0,
            ObservationValue::Number(n) => *n,
        }
    }

    pub fn is_finite(&self) -> bool {
        match self {
            ObservationValue::Bool(_) => true,
            ObservationValue::Number(n) => n.is_finite(),
        }
    }

    /// Parse a producer-supplied JSON value
    pub fn from_json(metric: &str, value: &serde_json::Value) -> Result<Self> {
        let parsed = match value {
            serde_json::Value::Bool(b) => ObservationValue::Bool(*b),
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) => ObservationValue::Number(f),
                None => {
                    return Err(CoordinatorError::InvalidValue {
                        metric: metric.to_string(),
                        reason: format!("{} is not representable as f64", n),
                    })
                }
            },
            other => {
                return Err(CoordinatorError::InvalidValue {
                    metric: metric.to_string(),
                    reason: format!("expected number or boolean, got {}", json_kind(other)),
                })
            }
        };
        Ok(parsed)
    }
}

impl From<f64> for ObservationValue {
    fn from(value: f64) -> Self {
        ObservationValue::Number(value)
    }
}

impl From<i64> for ObservationValue {
    fn from(value: i64) -> Self {
        ObservationValue::Number(value as f64)
    }
}

impl From<bool> for ObservationValue {
    fn from(value: bool) -> Self {
        ObservationValue::Bool(value)
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// One observation from a producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Unique ID assigned at creation
    pub id: String,
    /// Name of the metric this observation belongs to
    pub metric_name: String,
    pub value: ObservationValue,
    /// When the observation was made (defaults to record time)
    pub timestamp: DateTime<Utc>,
    /// Free-form producer context
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

/// An observation before the store has accepted it
#[derive(Debug, Clone)]
pub struct NewObservation {
    pub metric_name: String,
    pub value: ObservationValue,
    pub timestamp: Option<DateTime<Utc>>,
    pub context: HashMap<String, serde_json::Value>,
}

impl NewObservation {
    pub fn new(metric_name: &str, value: impl Into<ObservationValue>) -> Self {
        Self {
            metric_name: metric_name.to_string(),
            value: value.into(),
            timestamp: None,
            context: HashMap::new(),
        }
    }

    /// Pin the observation to an explicit timestamp
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_context(mut self, key: &str, value: serde_json::Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }
}

/// Inclusive time window; an open side matches everything on that side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimeRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Result<Self> {
        if let (Some(s), Some(e)) = (start, end) {
            if s > e {
                return Err(CoordinatorError::InvalidTimeRange(format!(
                    "start {} is after end {}",
                    s.to_rfc3339(),
                    e.to_rfc3339()
                )));
            }
        }
        Ok(Self { start, end })
    }

    /// Closed window `[start, end]`
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        Self::new(Some(start), Some(end))
    }

    pub fn since(start: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }

    pub fn until(end: DateTime<Utc>) -> Self {
        Self {
            start: None,
            end: Some(end),
        }
    }

    /// Unbounded window
    pub fn all() -> Self {
        Self::default()
    }

    /// Trailing window of `length` ending at `now`; `None` if it would
    /// start before the earliest representable time
    pub fn trailing(now: DateTime<Utc>, length: Duration) -> Option<Self> {
        Some(Self {
            start: Some(now.checked_sub_signed(length)?),
            end: Some(now),
        })
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| ts >= s) && self.end.map_or(true, |e| ts <= e)
    }

    pub fn is_bounded(&self) -> bool {
        self.start.is_some() && self.end.is_some()
    }

    /// Window of equal length ending just before this one starts
    pub fn preceding(&self) -> Option<TimeRange> {
        let (start, end) = (self.start?, self.end?);
        let length = end - start;
        let prev_end = start.checked_sub_signed(Duration::nanoseconds(1))?;
        Some(TimeRange {
            start: Some(prev_end.checked_sub_signed(length)?),
            end: Some(prev_end),
        })
    }
}

/// Comparison between a score and a trigger threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub enum Comparator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
}

/// Relative tolerance used by `==`
const EQ_EPSILON: f64 = 1e-9;

impl Comparator {
    /// Whether `value <op> threshold` holds
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::Lt => value < threshold,
            Comparator::Le => value <= threshold,
            Comparator::Gt => value > threshold,
            Comparator::Ge => value >= threshold,
            Comparator::Eq => {
                let scale = value.abs().max(threshold.abs()).max(1.0);
                (value - threshold).abs() <= EQ_EPSILON * scale
            }
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Eq => "==",
        }
    }
}

impl std::fmt::Display for Comparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

impl std::str::FromStr for Comparator {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "<" | "lt" => Ok(Comparator::Lt),
            "<=" | "le" | "lte" => Ok(Comparator::Le),
            ">" | "gt" => Ok(Comparator::Gt),
            ">=" | "ge" | "gte" => Ok(Comparator::Ge),
            "==" | "=" | "eq" => Ok(Comparator::Eq),
            other => Err(format!("unknown comparator '{}'", other)),
        }
    }
}

impl TryFrom<String> for Comparator {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

/// Urgency attached to a trigger and its activations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Urgency banded from a score on a 0 to 1 scale: below 0.4 is critical,
    /// below 0.6 high, below 0.7 medium, anything else low
    pub fn from_score(value: f64) -> Self {
        if value < 0.4 {
            Priority::Critical
        } else if value < 0.6 {
            Priority::High
        } else if value < 0.7 {
            Priority::Medium
        } else {
            Priority::Low
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_from_json() {
        assert_eq!(
            ObservationValue::from_json("cpu", &serde_json::json!(90)).unwrap(),
            ObservationValue::Number(90.0)
        );
        assert_eq!(
            ObservationValue::from_json("done", &serde_json::json!(true)).unwrap(),
            ObservationValue::Bool(true)
        );

        let err = ObservationValue::from_json("cpu", &serde_json::json!("high")).unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidValue { .. }));
        assert!(ObservationValue::from_json("cpu", &serde_json::Value::Null).is_err());
    }

    #[test]
    fn test_value_untagged_serde() {
        let v: ObservationValue = serde_json::from_str("12.5").unwrap();
        assert_eq!(v, ObservationValue::Number(12.5));
        let v: ObservationValue = serde_json::from_str("false").unwrap();
        assert_eq!(v.as_f64(), 0.0);
    }

    #[test]
    fn test_time_range_bounds() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(10);
        let range = TimeRange::between(t0, t1).unwrap();
        assert!(range.contains(t0));
        assert!(range.contains(t1));
        assert!(!range.contains(t1 + Duration::milliseconds(1)));
        assert!(TimeRange::between(t1, t0).is_err());
        assert!(TimeRange::all().contains(t0));
    }

    #[test]
    fn test_preceding_window_does_not_overlap() {
        let t0 = Utc::now();
        let range = TimeRange::between(t0, t0 + Duration::seconds(60)).unwrap();
        let prev = range.preceding().unwrap();
        assert!(!prev.contains(t0));
        assert!(prev.contains(t0 - Duration::seconds(30)));
        assert!(TimeRange::since(t0).preceding().is_none());
    }

    #[test]
    fn test_windows_near_the_epoch_limit() {
        let earliest = DateTime::<Utc>::MIN_UTC;
        assert!(TimeRange::trailing(Utc::now(), Duration::MAX).is_none());

        let range = TimeRange::between(earliest, earliest + Duration::days(1)).unwrap();
        assert!(range.preceding().is_none());
    }

    #[test]
    fn test_comparators() {
        assert!(Comparator::Gt.holds(92.5, 90.0));
        assert!(!Comparator::Gt.holds(90.0, 90.0));
        assert!(Comparator::Ge.holds(90.0, 90.0));
        assert!(Comparator::Lt.holds(0.5, 0.7));
        assert!(Comparator::Le.holds(0.7, 0.7));
        assert!(Comparator::Eq.holds(0.1 + 0.2, 0.3));
        assert!(!Comparator::Eq.holds(0.31, 0.3));
    }

    #[test]
    fn test_comparator_parse_and_serde() {
        assert_eq!(">=".parse::<Comparator>().unwrap(), Comparator::Ge);
        assert_eq!("lt".parse::<Comparator>().unwrap(), Comparator::Lt);
        assert!("~".parse::<Comparator>().is_err());

        let json = serde_json::to_string(&Comparator::Le).unwrap();
        assert_eq!(json, "\"<=\"");

        // Deserialization goes through the same parser, aliases included
        let parsed: Comparator = serde_json::from_str("\"gte\"").unwrap();
        assert_eq!(parsed, Comparator::Ge);
        let parsed: Comparator = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, Comparator::Le);
        assert!(serde_json::from_str::<Comparator>("\"~\"").is_err());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert_eq!(Priority::default(), Priority::Medium);
    }

    #[test]
    fn test_priority_from_score_bands() {
        assert_eq!(Priority::from_score(0.1), Priority::Critical);
        assert_eq!(Priority::from_score(0.4), Priority::High);
        assert_eq!(Priority::from_score(0.65), Priority::Medium);
        assert_eq!(Priority::from_score(0.7), Priority::Low);
        assert_eq!(Priority::from_score(0.95), Priority::Low);
    }
}
