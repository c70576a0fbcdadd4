//! In-memory alert instance state and its durable projection.

use std::{
    collections::{BTreeMap, VecDeque},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{
    eval::{fingerprint, EvalState},
    rule::RuleKey,
};
use crate::images::ImageRef;

/// Identifies one alert instance: one series of one rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    /// The owning organization.
    pub org_id: i64,
    /// The owning rule.
    pub rule_uid: String,
    /// Fingerprint of the instance's label set.
    pub fingerprint: u64,
}

impl InstanceKey {
    /// The persisted, hex-encoded form of the fingerprint.
    pub fn labels_hash(&self) -> String {
        format!("{:016x}", self.fingerprint)
    }
}

/// One sample of the bounded evaluation history kept per instance.
#[derive(Debug, Clone, Copy)]
pub struct ResultSample {
    /// The raw evaluator state observed.
    pub state: EvalState,
    /// When it was observed.
    pub at: DateTime<Utc>,
}

/// The current state of one alert instance, as held in the state cache.
///
/// Exactly one entry exists per `(org_id, rule_uid, fingerprint)`. Once both
/// are set, `ends_at >= starts_at` always holds.
#[derive(Debug, Clone)]
pub struct AlertInstance {
    /// The owning organization.
    pub org_id: i64,
    /// The owning rule.
    pub rule_uid: String,
    /// The labels identifying this series (rule labels merged with instance
    /// labels).
    pub labels: BTreeMap<String, String>,
    /// The current cache state.
    pub state: EvalState,
    /// Why the cache state diverges from the raw evaluator output, when it
    /// does. `None` whenever the cache state matches the raw result, or the
    /// raw result was Normal/Alerting.
    pub state_reason: Option<String>,
    /// When the current state episode started.
    pub starts_at: DateTime<Utc>,
    /// When the current state episode is expected to end unless extended.
    pub ends_at: DateTime<Utc>,
    /// The last time this instance was evaluated.
    pub last_evaluation_time: DateTime<Utc>,
    /// How long the last evaluation took.
    pub evaluation_duration: Duration,
    /// Numeric values from the last evaluation.
    pub values: BTreeMap<String, f64>,
    /// Bounded ring of recent raw evaluator states, newest last.
    pub result_history: VecDeque<ResultSample>,
    /// True exactly in the cycle of an Alerting-to-Normal transition, never
    /// carried over to later cycles.
    pub resolved: bool,
    /// Annotations attached to this instance (from the rule definition).
    pub annotations: BTreeMap<String, String>,
    /// A captured image associated with the current alerting episode, if any.
    pub image: Option<ImageRef>,
}

impl AlertInstance {
    /// The identity key of this instance.
    pub fn key(&self) -> InstanceKey {
        InstanceKey {
            org_id: self.org_id,
            rule_uid: self.rule_uid.clone(),
            fingerprint: fingerprint(&self.labels),
        }
    }

    /// The owning rule's key.
    pub fn rule_key(&self) -> RuleKey {
        RuleKey::new(self.org_id, self.rule_uid.clone())
    }

    /// Records one raw evaluator state in the bounded history ring.
    pub fn push_result(&mut self, sample: ResultSample, capacity: usize) {
        if capacity == 0 {
            return;
        }
        while self.result_history.len() >= capacity {
            self.result_history.pop_front();
        }
        self.result_history.push_back(sample);
    }

    /// The durable projection of this instance.
    pub fn to_persisted(&self) -> PersistedInstance {
        PersistedInstance {
            org_id: self.org_id,
            rule_uid: self.rule_uid.clone(),
            labels_hash: self.key().labels_hash(),
            labels: serde_json::to_string(&self.labels).unwrap_or_else(|_| "{}".to_string()),
            current_state: self.state.to_string(),
            current_reason: self.state_reason.clone(),
            current_state_since: self.starts_at,
            current_state_end: self.ends_at,
            last_eval_time: self.last_evaluation_time,
        }
    }
}

/// The durable projection of an [`AlertInstance`], one row per
/// `(org_id, rule_uid, labels_hash)`.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct PersistedInstance {
    /// The owning organization.
    pub org_id: i64,
    /// The owning rule.
    pub rule_uid: String,
    /// Hex-encoded label-set fingerprint.
    pub labels_hash: String,
    /// JSON-encoded label set.
    pub labels: String,
    /// The cache state at the time of the write.
    pub current_state: String,
    /// The state reason at the time of the write, if any.
    pub current_reason: Option<String>,
    /// `starts_at` of the current state episode.
    pub current_state_since: DateTime<Utc>,
    /// `ends_at` of the current state episode.
    pub current_state_end: DateTime<Utc>,
    /// Last evaluation time.
    pub last_eval_time: DateTime<Utc>,
}

impl PersistedInstance {
    /// Rebuilds an in-memory instance from its durable projection.
    ///
    /// Returns `None` when the stored state or label payload cannot be
    /// parsed; callers skip such rows and log.
    pub fn to_instance(&self) -> Option<AlertInstance> {
        let state = EvalState::parse(&self.current_state)?;
        let labels: BTreeMap<String, String> = serde_json::from_str(&self.labels).ok()?;
        Some(AlertInstance {
            org_id: self.org_id,
            rule_uid: self.rule_uid.clone(),
            labels,
            state,
            state_reason: self.current_reason.clone(),
            starts_at: self.current_state_since,
            ends_at: self.current_state_end,
            last_evaluation_time: self.last_eval_time,
            evaluation_duration: Duration::ZERO,
            values: BTreeMap::new(),
            result_history: VecDeque::new(),
            resolved: false,
            annotations: BTreeMap::new(),
            image: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> AlertInstance {
        let now = Utc::now();
        AlertInstance {
            org_id: 1,
            rule_uid: "r1".to_string(),
            labels: [("job".to_string(), "node".to_string())].into(),
            state: EvalState::Alerting,
            state_reason: None,
            starts_at: now,
            ends_at: now,
            last_evaluation_time: now,
            evaluation_duration: Duration::from_millis(5),
            values: BTreeMap::new(),
            result_history: VecDeque::new(),
            resolved: false,
            annotations: BTreeMap::new(),
            image: None,
        }
    }

    #[test]
    fn persisted_round_trip_preserves_identity_and_state() {
        let inst = instance();
        let restored = inst.to_persisted().to_instance().expect("row should parse");
        assert_eq!(restored.key(), inst.key());
        assert_eq!(restored.state, EvalState::Alerting);
        assert_eq!(restored.labels, inst.labels);
        assert!(!restored.resolved);
    }

    #[test]
    fn unparseable_state_is_rejected() {
        let mut row = instance().to_persisted();
        row.current_state = "Exploded".to_string();
        assert!(row.to_instance().is_none());
    }

    #[test]
    fn result_history_is_bounded() {
        let mut inst = instance();
        let now = Utc::now();
        for _ in 0..10 {
            inst.push_result(ResultSample { state: EvalState::Normal, at: now }, 4);
        }
        assert_eq!(inst.result_history.len(), 4);
    }
}
