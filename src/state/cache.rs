//! The in-memory map of current per-series alert state.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::models::{AlertInstance, RuleKey};

/// Holds exactly one entry per `(org_id, rule_uid, fingerprint)`.
///
/// Plain data structure; all locking is owned by the state manager.
#[derive(Debug, Default)]
pub(crate) struct Cache {
    states: HashMap<RuleKey, HashMap<u64, AlertInstance>>,
}

impl Cache {
    /// Returns the entry for `(rule, fingerprint)`, inserting the result of
    /// `create` when none exists.
    pub fn get_or_insert_with(
        &mut self,
        rule: RuleKey,
        fingerprint: u64,
        create: impl FnOnce() -> AlertInstance,
    ) -> &mut AlertInstance {
        self.states.entry(rule).or_default().entry(fingerprint).or_insert_with(create)
    }

    /// Returns a mutable entry, if present.
    pub fn get_mut(&mut self, rule: &RuleKey, fingerprint: u64) -> Option<&mut AlertInstance> {
        self.states.get_mut(rule)?.get_mut(&fingerprint)
    }

    /// All entries belonging to one organization.
    pub fn all_for_org(&self, org_id: i64) -> Vec<AlertInstance> {
        self.states
            .iter()
            .filter(|(key, _)| key.org_id == org_id)
            .flat_map(|(_, entries)| entries.values().cloned())
            .collect()
    }

    /// All entries belonging to one rule.
    pub fn states_for_rule(&self, rule: &RuleKey) -> Vec<AlertInstance> {
        self.states.get(rule).map(|entries| entries.values().cloned().collect()).unwrap_or_default()
    }

    /// Every entry in the cache.
    pub fn all(&self) -> Vec<AlertInstance> {
        self.states.values().flat_map(|entries| entries.values().cloned()).collect()
    }

    /// Removes and returns all entries of one rule.
    pub fn remove_rule(&mut self, rule: &RuleKey) -> Vec<AlertInstance> {
        self.states
            .remove(rule)
            .map(|entries| entries.into_values().collect())
            .unwrap_or_default()
    }

    /// Removes and returns the entries of `rule` that have gone stale.
    ///
    /// An entry is stale when its fingerprint was not reported in the
    /// current cycle (`seen`) and its last evaluation lies a full staleness
    /// window or more in the past.
    pub fn take_stale(
        &mut self,
        rule: &RuleKey,
        seen: &HashSet<u64>,
        evaluated_at: DateTime<Utc>,
        window: chrono::Duration,
    ) -> Vec<AlertInstance> {
        let Some(entries) = self.states.get_mut(rule) else {
            return Vec::new();
        };
        let stale_keys: Vec<u64> = entries
            .iter()
            .filter(|(fp, instance)| {
                !seen.contains(fp) && instance.last_evaluation_time + window <= evaluated_at
            })
            .map(|(fp, _)| *fp)
            .collect();
        let stale =
            stale_keys.into_iter().filter_map(|fp| entries.remove(&fp)).collect();
        if entries.is_empty() {
            self.states.remove(rule);
        }
        stale
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.states.clear();
    }
}
