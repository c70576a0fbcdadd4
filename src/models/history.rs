//! State-transition records handed to history backends.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{eval::EvalState, rule::SchedulableRule};

/// The slice of rule metadata history backends need to contextualize a
/// transition batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleMeta {
    /// The owning organization.
    pub org_id: i64,
    /// The rule's unique identifier.
    pub rule_uid: String,
    /// Human-readable rule title.
    pub title: String,
    /// Linked dashboard, if any.
    pub dashboard_uid: Option<String>,
    /// Linked panel, if any.
    pub panel_id: Option<i64>,
}

impl From<&SchedulableRule> for RuleMeta {
    fn from(rule: &SchedulableRule) -> Self {
        Self {
            org_id: rule.org_id,
            rule_uid: rule.rule_uid.clone(),
            title: rule.title.clone(),
            dashboard_uid: rule.dashboard_uid.clone(),
            panel_id: rule.panel_id,
        }
    }
}

/// One per-series state change produced by an evaluation cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    /// The labels identifying the series.
    pub labels: BTreeMap<String, String>,
    /// Fingerprint of the label set.
    pub fingerprint: u64,
    /// State before the cycle.
    pub previous_state: EvalState,
    /// State reason before the cycle, if any.
    pub previous_reason: Option<String>,
    /// State after the cycle.
    pub current_state: EvalState,
    /// State reason after the cycle, if any.
    pub current_reason: Option<String>,
    /// When the transition happened.
    pub at: DateTime<Utc>,
    /// Values from the evaluation that caused the transition.
    pub values: BTreeMap<String, f64>,
    /// Whether this cycle resolved a previously alerting instance.
    pub resolved: bool,
}

impl StateTransition {
    /// Whether the visible `(state, reason)` pair actually changed.
    pub fn changed(&self) -> bool {
        self.previous_state != self.current_state || self.previous_reason != self.current_reason
    }
}

/// A read query against the primary history backend.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    /// Restrict to this organization.
    pub org_id: i64,
    /// Restrict to one rule, if set.
    pub rule_uid: Option<String>,
    /// Only entries at or after this time, if set.
    pub from: Option<DateTime<Utc>>,
    /// Only entries at or before this time, if set.
    pub to: Option<DateTime<Utc>>,
}

/// One recorded transition as returned by a history backend query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// The rule the transition belongs to.
    pub rule: RuleMeta,
    /// The recorded transition.
    pub transition: StateTransition,
}
