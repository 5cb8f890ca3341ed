//! Trigger definitions and the snapshots produced when they fire

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::time::Duration;

use crate::evaluation::Score;
use crate::types::{Comparator, Priority};

/// Registration input for a trigger
#[derive(Debug, Clone)]
pub struct TriggerSpec {
    pub id: String,
    pub dimension: String,
    pub comparator: Comparator,
    pub threshold: f64,
    pub action_id: String,
    pub cooldown: Duration,
    /// Never fire on a low-confidence score
    pub require_confidence: bool,
    pub priority: Priority,
    /// Band the priority from the firing score instead of using `priority`
    pub derive_priority: bool,
}

impl TriggerSpec {
    pub fn new(
        id: &str,
        dimension: &str,
        comparator: Comparator,
        threshold: f64,
        action_id: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            dimension: dimension.to_string(),
            comparator,
            threshold,
            action_id: action_id.to_string(),
            cooldown: Duration::ZERO,
            require_confidence: false,
            priority: Priority::default(),
            derive_priority: false,
        }
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn require_confidence(mut self, required: bool) -> Self {
        self.require_confidence = required;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn derive_priority(mut self, derive: bool) -> Self {
        self.derive_priority = derive;
        self
    }
}

/// A registered trigger
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trigger {
    pub id: String,
    pub dimension: String,
    pub comparator: Comparator,
    pub threshold: f64,
    pub action_id: String,
    #[serde(rename = "cooldown_secs", serialize_with = "serialize_secs")]
    pub cooldown: Duration,
    pub require_confidence: bool,
    pub priority: Priority,
    pub derive_priority: bool,
    pub last_fired: Option<DateTime<Utc>>,
    /// Position in registration order
    pub sequence: u64,
}

impl Trigger {
    pub(crate) fn from_spec(spec: TriggerSpec, sequence: u64) -> Self {
        Self {
            id: spec.id,
            dimension: spec.dimension,
            comparator: spec.comparator,
            threshold: spec.threshold,
            action_id: spec.action_id,
            cooldown: spec.cooldown,
            require_confidence: spec.require_confidence,
            priority: spec.priority,
            derive_priority: spec.derive_priority,
            last_fired: None,
            sequence,
        }
    }

    /// Whether the cooldown since the last firing has fully elapsed at `now`
    pub fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.last_fired {
            None => true,
            Some(last) => {
                let cooldown = chrono::Duration::from_std(self.cooldown)
                    .unwrap_or(chrono::Duration::MAX);
                now - last >= cooldown
            }
        }
    }

    /// Earliest time the trigger may fire again
    pub fn ready_at(&self) -> Option<DateTime<Utc>> {
        let last = self.last_fired?;
        let cooldown = chrono::Duration::from_std(self.cooldown).ok()?;
        last.checked_add_signed(cooldown)
    }

    /// Whether the threshold condition holds for `score`, ignoring cooldown
    pub fn condition_holds(&self, score: &Score) -> bool {
        if self.require_confidence && score.low_confidence {
            return false;
        }
        score
            .value
            .map_or(false, |value| self.comparator.holds(value, self.threshold))
    }
}

fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Snapshot of a trigger that `check` decided should fire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiredTrigger {
    pub trigger_id: String,
    pub dimension: String,
    pub action_id: String,
    pub comparator: Comparator,
    pub threshold: f64,
    pub priority: Priority,
    pub score: Score,
    /// `last_fired` as seen by `check`; dispatch only proceeds if it is unchanged
    pub observed_last_fired: Option<DateTime<Utc>>,
}

impl FiredTrigger {
    pub(crate) fn new(trigger: &Trigger, score: &Score) -> Self {
        let priority = match score.value {
            Some(value) if trigger.derive_priority => Priority::from_score(value),
            _ => trigger.priority,
        };
        Self {
            trigger_id: trigger.id.clone(),
            dimension: trigger.dimension.clone(),
            action_id: trigger.action_id.clone(),
            comparator: trigger.comparator,
            threshold: trigger.threshold,
            priority,
            score: score.clone(),
            observed_last_fired: trigger.last_fired,
        }
    }

    /// The score value that satisfied the threshold
    pub fn value(&self) -> f64 {
        self.score.value.unwrap_or(f64::NAN)
    }
}
