//! The scheduler tick loop: refreshes the rule snapshot, reconciles the
//! routine registry against it and signals due rules to evaluate.

mod routine;

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{
    evaluation::RuleEvaluator,
    models::{RuleKey, RuleSnapshots, SchedulableRule},
    registry::{Evaluation, RoutineRegistry},
    rules::RuleReader,
    state::StateManager,
};

use routine::RuleRoutine;

/// The single periodic driver of all rule evaluation.
///
/// One logical loop ticks at a fixed base interval. Each tick refreshes the
/// rule snapshot from the [`RuleReader`], starts routines for new rules,
/// stops routines for deleted ones, and signals every due rule to evaluate.
/// The loop never blocks on a slow rule: signaling drops a stale pending
/// message rather than queueing behind it.
pub struct Scheduler {
    base_interval: Duration,
    rule_reader: Arc<dyn RuleReader>,
    evaluator: Arc<dyn RuleEvaluator>,
    state_manager: Arc<StateManager>,
    snapshots: Arc<RuleSnapshots>,
    registry: Arc<RoutineRegistry>,
    token: CancellationToken,
}

impl Scheduler {
    /// Creates a scheduler. Rule routines derive their cancellable scopes
    /// from `token`, so cancelling it cascades to every routine.
    pub fn new(
        base_interval: Duration,
        rule_reader: Arc<dyn RuleReader>,
        evaluator: Arc<dyn RuleEvaluator>,
        state_manager: Arc<StateManager>,
        token: CancellationToken,
    ) -> Self {
        Self {
            base_interval,
            rule_reader,
            evaluator,
            state_manager,
            snapshots: Arc::new(RuleSnapshots::new()),
            registry: Arc::new(RoutineRegistry::new(token.clone())),
            token,
        }
    }

    /// The scheduler's view of the current rule set.
    pub fn snapshots(&self) -> Arc<RuleSnapshots> {
        Arc::clone(&self.snapshots)
    }

    /// Number of live rule routines.
    pub fn active_routines(&self) -> usize {
        self.registry.len()
    }

    /// Runs the tick loop until the scheduler's token is cancelled.
    pub async fn run(self) {
        tracing::info!(base_interval_secs = self.base_interval.as_secs(), "Scheduler started.");
        let mut interval = tokio::time::interval(self.base_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tick_num: u64 = 0;

        loop {
            tokio::select! {
                biased;

                _ = self.token.cancelled() => {
                    tracing::info!("Scheduler cancellation signal received, shutting down...");
                    break;
                }

                _ = interval.tick() => {
                    let now = Utc::now();
                    self.tick(tick_num, now).await;
                    tick_num = tick_num.wrapping_add(1);
                }
            }
        }
        tracing::info!("Scheduler has shut down.");
    }

    /// One tick: refresh, reconcile, signal.
    async fn tick(&self, tick_num: u64, now: DateTime<Utc>) {
        self.refresh_rules().await;
        self.reconcile();
        self.signal_due(tick_num, now);
    }

    /// Polls the rule reader and replaces the snapshot wholesale.
    ///
    /// If any org read fails, the previous snapshot is kept whole: replacing
    /// it with a partial rule set would stop routines for rules that still
    /// exist.
    async fn refresh_rules(&self) {
        let org_ids = match self.rule_reader.org_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list orgs; keeping previous rule snapshot.");
                return;
            }
        };

        let mut rules: Vec<SchedulableRule> = Vec::new();
        for org_id in org_ids {
            match self.rule_reader.list_rules(org_id).await {
                Ok(org_rules) => rules.extend(org_rules),
                Err(e) => {
                    tracing::error!(org_id, error = %e, "Failed to list rules; keeping previous rule snapshot.");
                    return;
                }
            }
        }

        let previous: HashMap<RuleKey, i64> =
            self.snapshots.all().iter().map(|r| (r.key(), r.version)).collect();
        self.snapshots.replace(rules);

        // Tell routines whose definition version moved forward to re-read it.
        for rule in self.snapshots.all() {
            let key = rule.key();
            let bumped = previous.get(&key).is_some_and(|&v| v < rule.version);
            if !bumped {
                continue;
            }
            if let Ok(handle) = self.registry.get(&key) {
                if let Err(e) = handle.update_version(rule.version) {
                    tracing::debug!(rule = %key, error = %e, "Skipped version signal for stopped routine.");
                }
            }
        }
    }

    /// Diffs the routine registry against the snapshot: starts routines for
    /// new rules, stops routines for deleted ones.
    fn reconcile(&self) {
        let desired = self.snapshots.keys();
        let active = self.registry.keys();

        for key in desired.difference(&active) {
            let (handle, created) = self.registry.get_or_create(key.clone());
            if !created {
                continue;
            }
            tracing::info!(rule = %key, "Starting routine for new rule.");
            let routine = RuleRoutine::new(
                key.clone(),
                handle,
                Arc::clone(&self.snapshots),
                Arc::clone(&self.evaluator),
                Arc::clone(&self.state_manager),
            );
            tokio::spawn(routine.run());
        }

        for key in active.difference(&desired) {
            if let Some(handle) = self.registry.delete(key) {
                handle.stop();
                tracing::info!(rule = %key, "Stopped routine for deleted rule.");
                let state_manager = Arc::clone(&self.state_manager);
                let key = key.clone();
                tokio::spawn(async move { state_manager.delete_rule(&key).await });
            }
        }
    }

    /// Signals every rule whose interval divides the elapsed ticks.
    fn signal_due(&self, tick_num: u64, now: DateTime<Utc>) {
        let base_secs = self.base_interval.as_secs().max(1) as i64;
        for rule in self.snapshots.all() {
            let frequency = (rule.interval_seconds / base_secs).max(1) as u64;
            if tick_num % frequency != 0 {
                continue;
            }

            let key = rule.key();
            let handle = match self.registry.get(&key) {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::warn!(rule = %key, error = %e, "Due rule has no routine; will retry next tick.");
                    continue;
                }
            };

            match handle.evaluate(Evaluation { scheduled_at: now, version: rule.version }) {
                Ok(None) => {}
                Ok(Some(dropped)) => {
                    tracing::warn!(
                        rule = %key,
                        dropped_at = %dropped.scheduled_at,
                        scheduled_at = %now,
                        "Routine is falling behind; dropped a stale evaluation signal."
                    );
                }
                Err(e) => {
                    tracing::debug!(rule = %key, error = %e, "Skipped evaluation signal for stopped routine.");
                }
            }
        }
    }
}
