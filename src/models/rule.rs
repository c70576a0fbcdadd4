//! Rule definitions and the snapshot registry the scheduler reconciles
//! against.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Uniquely identifies a rule across organizations.
///
/// Used as the map key everywhere: in the routine registry, the snapshot
/// registry and the per-rule state cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleKey {
    /// The owning organization.
    pub org_id: i64,
    /// The rule's unique identifier within the organization.
    pub rule_uid: String,
}

impl RuleKey {
    /// Creates a new rule key.
    pub fn new(org_id: i64, rule_uid: impl Into<String>) -> Self {
        Self { org_id, rule_uid: rule_uid.into() }
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{orgID: {}, UID: {}}}", self.org_id, self.rule_uid)
    }
}

/// What the engine does when a rule evaluation returns no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NoDataPolicy {
    /// Treat the absence of data as an alerting condition.
    Alerting,
    /// Surface the instance in the dedicated NoData state.
    #[default]
    NoData,
    /// Leave the instance in whatever state it already holds.
    KeepLast,
    /// Treat the absence of data as a normal condition.
    Normal,
}

/// What the engine does when a rule evaluation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ExecErrPolicy {
    /// Treat execution errors as an alerting condition.
    #[default]
    Alerting,
    /// Leave the instance in whatever state it already holds.
    KeepLast,
}

/// An immutable-per-version snapshot of a schedulable alerting rule.
///
/// The scheduler replaces these wholesale on every reconciliation pass; rule
/// routines re-read the latest snapshot from [`RuleSnapshots`] before each
/// evaluation cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulableRule {
    /// The owning organization.
    pub org_id: i64,
    /// The rule's unique identifier within the organization.
    pub rule_uid: String,
    /// Human-readable rule title, carried into annotations and history.
    pub title: String,
    /// Evaluation interval in seconds; expected to be a multiple of the
    /// scheduler's base interval.
    pub interval_seconds: i64,
    /// Monotonically increasing definition version.
    pub version: i64,
    /// Minimum continuous-alerting time, in seconds, before an instance
    /// promotes from Pending to Alerting. Zero means promote immediately.
    #[serde(default)]
    pub for_seconds: i64,
    /// Policy applied when an evaluation returns no data.
    #[serde(default)]
    pub no_data_policy: NoDataPolicy,
    /// Policy applied when an evaluation fails.
    #[serde(default)]
    pub exec_err_policy: ExecErrPolicy,
    /// Dashboard the rule is linked to, if any. Used for image capture.
    #[serde(default)]
    pub dashboard_uid: Option<String>,
    /// Panel within the linked dashboard, if any.
    #[serde(default)]
    pub panel_id: Option<i64>,
    /// Static labels attached to every instance produced by this rule.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Annotation templates attached to every instance produced by this rule.
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    /// Timestamp the rule definition was last updated.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl SchedulableRule {
    /// Returns the rule's identity key.
    pub fn key(&self) -> RuleKey {
        RuleKey::new(self.org_id, self.rule_uid.clone())
    }

    /// The "For" hysteresis window as a chrono duration.
    pub fn for_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.for_seconds.max(0))
    }

    /// The window used to extend `ends_at` and to decide staleness when no
    /// explicit "For" duration applies: twice the evaluation interval.
    pub fn resend_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.interval_seconds.max(1) * 2)
    }
}

/// The latest known set of schedulable rules, replaceable atomically.
///
/// Readers (the tick loop, rule routines) get a consistent point-in-time view
/// without holding any lock across an evaluation cycle.
#[derive(Debug, Default)]
pub struct RuleSnapshots {
    inner: ArcSwap<HashMap<RuleKey, Arc<SchedulableRule>>>,
}

impl RuleSnapshots {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole rule set with a fresh snapshot.
    pub fn replace(&self, rules: Vec<SchedulableRule>) {
        let map: HashMap<RuleKey, Arc<SchedulableRule>> =
            rules.into_iter().map(|r| (r.key(), Arc::new(r))).collect();
        self.inner.store(Arc::new(map));
    }

    /// Inserts or updates a single rule, keeping the rest of the snapshot.
    pub fn update(&self, rule: SchedulableRule) {
        let current = self.inner.load_full();
        let mut map = HashMap::clone(&current);
        map.insert(rule.key(), Arc::new(rule));
        self.inner.store(Arc::new(map));
    }

    /// Returns the current definition of a rule, if known.
    pub fn get(&self, key: &RuleKey) -> Option<Arc<SchedulableRule>> {
        self.inner.load().get(key).cloned()
    }

    /// Snapshot of all currently known rule keys, for reconciliation diffing.
    pub fn keys(&self) -> HashSet<RuleKey> {
        self.inner.load().keys().cloned().collect()
    }

    /// A point-in-time view of all rules.
    pub fn all(&self) -> Vec<Arc<SchedulableRule>> {
        self.inner.load().values().cloned().collect()
    }

    /// Number of rules currently known.
    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    /// Whether the registry holds no rules.
    pub fn is_empty(&self) -> bool {
        self.inner.load().is_empty()
    }
}
