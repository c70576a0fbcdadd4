//! The state manager: applies the per-series transition algorithm to
//! evaluation results, maintains the state cache, persists instance
//! snapshots and forwards transitions to the historian fan-out.

mod cache;

use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};

use crate::{
    annotations::{self, AnnotationEvent, AnnotationSink},
    history::Historian,
    images::ImageCapturer,
    models::{
        fingerprint, AlertInstance, EvalState, EvaluationResult, ExecErrPolicy, InstanceKey,
        NoDataPolicy, PersistedInstance, RuleKey, RuleMeta, SchedulableRule, StateTransition,
    },
    models::instance::ResultSample,
    persistence::{InstanceQuery, InstanceStore},
};

use cache::Cache;

/// One processed result: the instance after the cycle plus what it looked
/// like before.
#[derive(Debug, Clone)]
struct Update {
    previous_state: EvalState,
    previous_reason: Option<String>,
    instance: AlertInstance,
}

impl Update {
    fn changed(&self) -> bool {
        self.previous_state != self.instance.state
            || self.previous_reason != self.instance.state_reason
    }

    fn needs_image(&self) -> bool {
        self.instance.resolved
            || (self.instance.state == EvalState::Alerting
                && (self.previous_state != EvalState::Alerting || self.instance.image.is_none()))
    }
}

/// Tracks current per-series alert state and decides state transitions.
///
/// The cache lock is never held across an await point; the instance store
/// and the historian are called with plain data snapshots.
pub struct StateManager {
    cache: Mutex<Cache>,
    store: Arc<dyn InstanceStore>,
    historian: Arc<Historian>,
    images: Arc<dyn ImageCapturer>,
    annotations: Arc<dyn AnnotationSink>,
    result_history_limit: usize,
}

impl StateManager {
    /// Creates a state manager over the given collaborators.
    pub fn new(
        store: Arc<dyn InstanceStore>,
        historian: Arc<Historian>,
        images: Arc<dyn ImageCapturer>,
        annotations: Arc<dyn AnnotationSink>,
        result_history_limit: usize,
    ) -> Self {
        Self {
            cache: Mutex::new(Cache::default()),
            store,
            historian,
            images,
            annotations,
            result_history_limit,
        }
    }

    /// Returns the cached entry for the result's series, creating a Normal
    /// entry when none exists yet.
    pub fn get_or_create(
        &self,
        rule: &SchedulableRule,
        result: &EvaluationResult,
    ) -> AlertInstance {
        let labels = merged_labels(rule, result);
        let fp = fingerprint(&labels);
        let mut cache = self.cache.lock().expect("state cache lock poisoned");
        cache
            .get_or_insert_with(rule.key(), fp, || new_instance(rule, labels, result.evaluated_at))
            .clone()
    }

    /// Applies one evaluation cycle's results for a rule.
    ///
    /// For each result this applies the transition algorithm, then removes
    /// entries of the rule that have gone stale, persists the updated and
    /// deleted rows, emits annotations for visible changes and forwards the
    /// cycle's transitions to the historian. Returns the updated states.
    pub async fn process_eval_results(
        &self,
        evaluated_at: DateTime<Utc>,
        rule: &SchedulableRule,
        results: Vec<EvaluationResult>,
    ) -> Vec<AlertInstance> {
        let rule_key = rule.key();
        let mut seen: HashSet<u64> = HashSet::with_capacity(results.len());
        let mut updates: Vec<Update> = Vec::with_capacity(results.len());

        let stale = {
            let mut cache = self.cache.lock().expect("state cache lock poisoned");
            for result in &results {
                let labels = merged_labels(rule, result);
                let fp = fingerprint(&labels);
                seen.insert(fp);

                let entry = cache.get_or_insert_with(rule_key.clone(), fp, || {
                    new_instance(rule, labels.clone(), evaluated_at)
                });
                let previous_state = entry.state;
                let previous_reason = entry.state_reason.clone();

                apply_transition(rule, entry, result.state, evaluated_at);

                entry.resolved =
                    previous_state == EvalState::Alerting && entry.state == EvalState::Normal;
                entry.state_reason = divergence_reason(entry.state, result.state);
                entry.labels = labels;
                entry.values = result.values.clone();
                entry.last_evaluation_time = evaluated_at;
                entry.evaluation_duration = result.evaluation_duration;
                entry.annotations =
                    rule.annotations.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                entry.push_result(
                    ResultSample { state: result.state, at: evaluated_at },
                    self.result_history_limit,
                );

                updates.push(Update {
                    previous_state,
                    previous_reason,
                    instance: entry.clone(),
                });
            }
            cache.take_stale(&rule_key, &seen, evaluated_at, rule.resend_window())
        };

        self.attach_images(rule, &mut updates).await;
        self.emit_annotations(rule, &updates, &stale, evaluated_at);
        self.persist(rule, &updates, &stale).await;
        self.record_history(rule, &updates, &stale, evaluated_at);

        updates.into_iter().map(|u| u.instance).collect()
    }

    /// Captures at most one image per cycle and attaches it to every updated
    /// entry whose transition warrants one. Failures never fail the cycle.
    async fn attach_images(&self, rule: &SchedulableRule, updates: &mut [Update]) {
        if !updates.iter().any(Update::needs_image) {
            return;
        }
        let image = match self.images.new_image(rule).await {
            Ok(image) => image,
            Err(e) if e.is_benign() => {
                tracing::trace!(rule_uid = %rule.rule_uid, reason = %e, "Skipping image capture.");
                return;
            }
            Err(e) => {
                tracing::warn!(rule_uid = %rule.rule_uid, error = %e, "Image capture failed.");
                return;
            }
        };

        let mut cache = self.cache.lock().expect("state cache lock poisoned");
        let rule_key = rule.key();
        for update in updates.iter_mut().filter(|u| u.needs_image()) {
            update.instance.image = Some(image.clone());
            let fp = fingerprint(&update.instance.labels);
            if let Some(entry) = cache.get_mut(&rule_key, fp) {
                entry.image = Some(image.clone());
            }
        }
    }

    /// Emits an annotation for every visible `(state, reason)` change, plus
    /// an explicit resolve for stale entries that were alerting. Saves run
    /// on background tasks and never block the cycle.
    fn emit_annotations(
        &self,
        rule: &SchedulableRule,
        updates: &[Update],
        stale: &[AlertInstance],
        evaluated_at: DateTime<Utc>,
    ) {
        for update in updates.iter().filter(|u| u.changed()) {
            annotations::spawn_save(
                Arc::clone(&self.annotations),
                annotation_event(
                    rule,
                    update.instance.labels.clone(),
                    update.previous_state,
                    update.previous_reason.clone(),
                    update.instance.state,
                    update.instance.state_reason.clone(),
                    evaluated_at,
                ),
            );
        }
        for instance in stale.iter().filter(|s| s.state == EvalState::Alerting) {
            annotations::spawn_save(
                Arc::clone(&self.annotations),
                annotation_event(
                    rule,
                    instance.labels.clone(),
                    instance.state,
                    instance.state_reason.clone(),
                    EvalState::Normal,
                    None,
                    evaluated_at,
                ),
            );
        }
    }

    /// Persists updated entries and deletes stale rows. Store failures are
    /// logged with counts and do not abort the cycle; the in-memory cache
    /// stays authoritative.
    async fn persist(&self, rule: &SchedulableRule, updates: &[Update], stale: &[AlertInstance]) {
        let batch: Vec<PersistedInstance> =
            updates.iter().map(|u| u.instance.to_persisted()).collect();
        let count = batch.len();
        if let Err(e) = self.store.save_instances(batch).await {
            tracing::error!(rule_uid = %rule.rule_uid, count, error = %e, "Failed to save alert instances.");
        }

        let keys: Vec<InstanceKey> = stale.iter().map(AlertInstance::key).collect();
        let count = keys.len();
        if !keys.is_empty() {
            if let Err(e) = self.store.delete_instances(keys).await {
                tracing::error!(rule_uid = %rule.rule_uid, count, error = %e, "Failed to delete stale alert instances.");
            }
        }
    }

    /// Forwards the cycle's visible transitions to the historian fan-out.
    /// The completion signal is consumed on a background task.
    fn record_history(
        &self,
        rule: &SchedulableRule,
        updates: &[Update],
        stale: &[AlertInstance],
        evaluated_at: DateTime<Utc>,
    ) {
        let mut transitions: Vec<StateTransition> = updates
            .iter()
            .filter(|u| u.changed())
            .map(|u| StateTransition {
                labels: u.instance.labels.clone(),
                fingerprint: fingerprint(&u.instance.labels),
                previous_state: u.previous_state,
                previous_reason: u.previous_reason.clone(),
                current_state: u.instance.state,
                current_reason: u.instance.state_reason.clone(),
                at: evaluated_at,
                values: u.instance.values.clone(),
                resolved: u.instance.resolved,
            })
            .collect();
        for instance in stale.iter().filter(|s| s.state == EvalState::Alerting) {
            transitions.push(StateTransition {
                labels: instance.labels.clone(),
                fingerprint: fingerprint(&instance.labels),
                previous_state: instance.state,
                previous_reason: instance.state_reason.clone(),
                current_state: EvalState::Normal,
                current_reason: None,
                at: evaluated_at,
                values: BTreeMap::new(),
                resolved: true,
            });
        }
        if transitions.is_empty() {
            return;
        }

        let signal = self.historian.record(RuleMeta::from(rule), transitions);
        let rule_uid = rule.rule_uid.clone();
        tokio::spawn(async move {
            match signal.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(rule_uid = %rule_uid, error = %e, "Recording state history failed.")
                }
                Err(_) => {
                    tracing::warn!(rule_uid = %rule_uid, "State history fan-out dropped its completion signal.")
                }
            }
        });
    }

    /// All cached states of one organization.
    pub fn get_all(&self, org_id: i64) -> Vec<AlertInstance> {
        self.cache.lock().expect("state cache lock poisoned").all_for_org(org_id)
    }

    /// All cached states of one rule.
    pub fn get_states_for_rule(&self, org_id: i64, rule_uid: &str) -> Vec<AlertInstance> {
        self.cache
            .lock()
            .expect("state cache lock poisoned")
            .states_for_rule(&RuleKey::new(org_id, rule_uid))
    }

    /// Removes all cached states of one rule, returning them.
    pub fn remove_by_rule(&self, key: &RuleKey) -> Vec<AlertInstance> {
        self.cache.lock().expect("state cache lock poisoned").remove_rule(key)
    }

    /// Removes a deleted rule's state from the cache and the instance store.
    pub async fn delete_rule(&self, key: &RuleKey) {
        let removed = self.remove_by_rule(key);
        tracing::debug!(rule = %key, count = removed.len(), "Removed state for deleted rule.");
        if let Err(e) = self.store.delete_instances_by_rule(key.clone()).await {
            tracing::error!(rule = %key, error = %e, "Failed to delete persisted instances for rule.");
        }
    }

    /// Drops every cached entry.
    pub fn reset_cache(&self) {
        self.cache.lock().expect("state cache lock poisoned").clear();
    }

    /// Rehydrates the cache from the instance store. Called once at startup;
    /// unparseable rows are skipped and logged.
    pub async fn warm(&self) {
        let org_ids = match self.store.fetch_org_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(error = %e, "Failed to fetch org ids while warming state cache.");
                return;
            }
        };

        let mut restored = 0usize;
        let mut skipped = 0usize;
        for org_id in org_ids {
            let rows = match self
                .store
                .list_instances(InstanceQuery { org_id, rule_uid: None })
                .await
            {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::error!(org_id, error = %e, "Failed to list instances while warming state cache.");
                    continue;
                }
            };

            let mut cache = self.cache.lock().expect("state cache lock poisoned");
            for row in rows {
                match row.to_instance() {
                    Some(instance) => {
                        let fp = fingerprint(&instance.labels);
                        let key = instance.rule_key();
                        *cache.get_or_insert_with(key, fp, || instance.clone()) = instance.clone();
                        restored += 1;
                    }
                    None => {
                        tracing::warn!(
                            org_id,
                            rule_uid = %row.rule_uid,
                            labels_hash = %row.labels_hash,
                            "Skipping unparseable persisted alert instance."
                        );
                        skipped += 1;
                    }
                }
            }
        }
        tracing::info!(restored, skipped, "State cache warmed from instance store.");
    }

    /// Best-effort full persist of the cache, used at shutdown.
    pub async fn flush(&self) {
        let batch: Vec<PersistedInstance> = {
            let cache = self.cache.lock().expect("state cache lock poisoned");
            cache.all().iter().map(AlertInstance::to_persisted).collect()
        };
        let count = batch.len();
        if let Err(e) = self.store.save_instances(batch).await {
            tracing::error!(count, error = %e, "Failed to flush state cache to instance store.");
        } else {
            tracing::info!(count, "State cache flushed to instance store.");
        }
    }
}

/// Merges the rule's static labels with a result's instance labels; instance
/// labels win on conflict.
fn merged_labels(rule: &SchedulableRule, result: &EvaluationResult) -> BTreeMap<String, String> {
    let mut labels: BTreeMap<String, String> =
        rule.labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    for (k, v) in &result.instance_labels {
        labels.insert(k.clone(), v.clone());
    }
    labels
}

/// A fresh Normal entry for a series seen for the first time.
fn new_instance(
    rule: &SchedulableRule,
    labels: BTreeMap<String, String>,
    evaluated_at: DateTime<Utc>,
) -> AlertInstance {
    AlertInstance {
        org_id: rule.org_id,
        rule_uid: rule.rule_uid.clone(),
        labels,
        state: EvalState::Normal,
        state_reason: None,
        starts_at: evaluated_at,
        ends_at: evaluated_at,
        last_evaluation_time: evaluated_at,
        evaluation_duration: Duration::ZERO,
        values: BTreeMap::new(),
        result_history: Default::default(),
        resolved: false,
        annotations: rule.annotations.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        image: None,
    }
}

/// The `ends_at` extension applied while a condition keeps firing: the "For"
/// duration when one is configured, twice the interval otherwise.
fn extended_ends_at(rule: &SchedulableRule, evaluated_at: DateTime<Utc>) -> DateTime<Utc> {
    if rule.for_seconds == 0 {
        evaluated_at + rule.resend_window()
    } else {
        evaluated_at + rule.for_duration()
    }
}

/// Applies one raw evaluator state to a cache entry.
fn apply_transition(
    rule: &SchedulableRule,
    instance: &mut AlertInstance,
    result_state: EvalState,
    evaluated_at: DateTime<Utc>,
) {
    match result_state {
        EvalState::Normal => to_normal(instance, evaluated_at),
        EvalState::Alerting => to_alerting(rule, instance, evaluated_at),
        EvalState::Error => match rule.exec_err_policy {
            ExecErrPolicy::Alerting => to_alerting(rule, instance, evaluated_at),
            ExecErrPolicy::KeepLast => keep_last(rule, instance, evaluated_at),
        },
        EvalState::NoData => match rule.no_data_policy {
            NoDataPolicy::Alerting => to_alerting(rule, instance, evaluated_at),
            NoDataPolicy::NoData => to_nodata(rule, instance, evaluated_at),
            NoDataPolicy::KeepLast => keep_last(rule, instance, evaluated_at),
            NoDataPolicy::Normal => to_normal(instance, evaluated_at),
        },
        EvalState::Pending => {
            // Evaluators never produce Pending; it only arises from the
            // Alerting branch. Treat it as a malformed result.
            tracing::warn!(
                rule_uid = %instance.rule_uid,
                "Evaluator produced a Pending result; leaving state unchanged."
            );
            keep_last(rule, instance, evaluated_at);
        }
    }
}

fn to_normal(instance: &mut AlertInstance, evaluated_at: DateTime<Utc>) {
    if instance.state != EvalState::Normal {
        instance.starts_at = evaluated_at;
        instance.ends_at = evaluated_at;
    }
    instance.state = EvalState::Normal;
}

fn to_alerting(rule: &SchedulableRule, instance: &mut AlertInstance, evaluated_at: DateTime<Utc>) {
    match instance.state {
        EvalState::Alerting => {
            instance.ends_at = extended_ends_at(rule, evaluated_at);
        }
        EvalState::Pending if evaluated_at - instance.starts_at >= rule.for_duration() => {
            instance.state = EvalState::Alerting;
            instance.starts_at = evaluated_at;
            instance.ends_at = extended_ends_at(rule, evaluated_at);
        }
        EvalState::Pending => {
            instance.ends_at = extended_ends_at(rule, evaluated_at);
        }
        _ => {
            instance.starts_at = evaluated_at;
            if rule.for_seconds == 0 {
                instance.state = EvalState::Alerting;
                instance.ends_at = extended_ends_at(rule, evaluated_at);
            } else {
                instance.state = EvalState::Pending;
                instance.ends_at = evaluated_at + rule.for_duration();
            }
        }
    }
}

fn to_nodata(rule: &SchedulableRule, instance: &mut AlertInstance, evaluated_at: DateTime<Utc>) {
    if instance.state != EvalState::NoData {
        instance.starts_at = evaluated_at;
    }
    instance.state = EvalState::NoData;
    instance.ends_at = extended_ends_at(rule, evaluated_at);
}

fn keep_last(rule: &SchedulableRule, instance: &mut AlertInstance, evaluated_at: DateTime<Utc>) {
    // Keep the firing window open so a kept Alerting/Pending state does not
    // expire mid-outage.
    if matches!(instance.state, EvalState::Alerting | EvalState::Pending) {
        instance.ends_at = extended_ends_at(rule, evaluated_at);
    }
}

/// The reason recorded when the cache state diverges from the raw evaluator
/// output: the raw state's name, but only when the raw state is neither
/// Normal nor Alerting.
fn divergence_reason(cache_state: EvalState, result_state: EvalState) -> Option<String> {
    if cache_state != result_state
        && !matches!(result_state, EvalState::Normal | EvalState::Alerting)
    {
        Some(result_state.to_string())
    } else {
        None
    }
}

fn annotation_event(
    rule: &SchedulableRule,
    labels: BTreeMap<String, String>,
    previous_state: EvalState,
    previous_reason: Option<String>,
    current_state: EvalState,
    current_reason: Option<String>,
    time: DateTime<Utc>,
) -> AnnotationEvent {
    AnnotationEvent {
        org_id: rule.org_id,
        rule_uid: rule.rule_uid.clone(),
        rule_title: rule.title.clone(),
        dashboard_uid: rule.dashboard_uid.clone(),
        panel_id: rule.panel_id,
        labels,
        previous_state,
        previous_reason,
        current_state,
        current_reason,
        time,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::{
        annotations::NoopAnnotationSink,
        history::MemoryHistorian,
        images::NoopImageCapturer,
        persistence::traits::MockInstanceStore,
    };

    fn rule(for_seconds: i64) -> SchedulableRule {
        SchedulableRule {
            org_id: 1,
            rule_uid: "r1".to_string(),
            title: "cpu high".to_string(),
            interval_seconds: 10,
            version: 1,
            for_seconds,
            no_data_policy: NoDataPolicy::NoData,
            exec_err_policy: ExecErrPolicy::Alerting,
            dashboard_uid: None,
            panel_id: None,
            labels: HashMap::new(),
            annotations: HashMap::new(),
            updated_at: Utc::now(),
        }
    }

    fn result(state: EvalState, at: DateTime<Utc>) -> EvaluationResult {
        EvaluationResult {
            state,
            instance_labels: [("instance".to_string(), "one".to_string())].into(),
            values: BTreeMap::new(),
            evaluated_at: at,
            evaluation_duration: Duration::from_millis(3),
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn manager() -> StateManager {
        let mut store = MockInstanceStore::new();
        store.expect_save_instances().returning(|_| Ok(()));
        store.expect_delete_instances().returning(|_| Ok(()));
        store.expect_delete_instances_by_rule().returning(|_| Ok(()));
        let historian = Arc::new(Historian::new(Arc::new(MemoryHistorian::default()), vec![]));
        StateManager::new(
            Arc::new(store),
            historian,
            Arc::new(NoopImageCapturer),
            Arc::new(NoopAnnotationSink),
            10,
        )
    }

    async fn process(
        manager: &StateManager,
        rule: &SchedulableRule,
        state: EvalState,
        secs: i64,
    ) -> AlertInstance {
        let states = manager
            .process_eval_results(at(secs), rule, vec![result(state, at(secs))])
            .await;
        states.into_iter().next().expect("one state per result")
    }

    #[tokio::test]
    async fn zero_for_alerting_fires_immediately() {
        let manager = manager();
        let rule = rule(0);

        let state = process(&manager, &rule, EvalState::Alerting, 100).await;
        assert_eq!(state.state, EvalState::Alerting);
        assert_eq!(state.starts_at, at(100));
        // No For configured: ends_at extends by twice the interval.
        assert_eq!(state.ends_at, at(120));
        assert!(!state.resolved);
    }

    #[tokio::test]
    async fn for_window_goes_pending_then_promotes() {
        let manager = manager();
        let rule = rule(20);

        let s0 = process(&manager, &rule, EvalState::Alerting, 0).await;
        assert_eq!(s0.state, EvalState::Pending);
        assert_eq!(s0.starts_at, at(0));

        let s1 = process(&manager, &rule, EvalState::Alerting, 10).await;
        assert_eq!(s1.state, EvalState::Pending);
        assert_eq!(s1.starts_at, at(0));

        let s2 = process(&manager, &rule, EvalState::Alerting, 20).await;
        assert_eq!(s2.state, EvalState::Alerting);
        assert_eq!(s2.starts_at, at(20));
        assert_eq!(s2.ends_at, at(40));
    }

    #[tokio::test]
    async fn resolved_is_one_shot() {
        let manager = manager();
        let rule = rule(0);

        process(&manager, &rule, EvalState::Alerting, 0).await;
        let resolved = process(&manager, &rule, EvalState::Normal, 10).await;
        assert!(resolved.resolved);
        assert_eq!(resolved.state, EvalState::Normal);
        assert_eq!(resolved.ends_at, at(10));

        let next = process(&manager, &rule, EvalState::Normal, 20).await;
        assert!(!next.resolved, "resolved must not persist past the transition cycle");
        assert_eq!(next.state, EvalState::Normal);
    }

    #[tokio::test]
    async fn error_policy_alerting_flips_state_and_records_reason() {
        let manager = manager();
        let rule = rule(0);

        let state = process(&manager, &rule, EvalState::Error, 0).await;
        assert_eq!(state.state, EvalState::Alerting);
        assert_eq!(state.state_reason.as_deref(), Some("Error"));
    }

    #[tokio::test]
    async fn error_policy_keep_last_keeps_state() {
        let manager = manager();
        let mut rule = rule(0);
        rule.exec_err_policy = ExecErrPolicy::KeepLast;

        process(&manager, &rule, EvalState::Alerting, 0).await;
        let kept = process(&manager, &rule, EvalState::Error, 10).await;
        assert_eq!(kept.state, EvalState::Alerting);
        assert_eq!(kept.state_reason.as_deref(), Some("Error"));
        // The firing window keeps being extended while the error lasts.
        assert_eq!(kept.ends_at, at(30));
    }

    #[tokio::test]
    async fn nodata_policies() {
        // Default policy: surface NoData; same state as raw result, no reason.
        let manager = manager();
        let rule_nodata = rule(0);
        let state = process(&manager, &rule_nodata, EvalState::NoData, 0).await;
        assert_eq!(state.state, EvalState::NoData);
        assert_eq!(state.state_reason, None);

        // Normal policy: state diverges, reason records the raw NoData.
        let manager = self::manager();
        let mut rule_normal = rule(0);
        rule_normal.no_data_policy = NoDataPolicy::Normal;
        let state = process(&manager, &rule_normal, EvalState::NoData, 0).await;
        assert_eq!(state.state, EvalState::Normal);
        assert_eq!(state.state_reason.as_deref(), Some("NoData"));

        // Alerting policy.
        let manager = self::manager();
        let mut rule_alerting = rule(0);
        rule_alerting.no_data_policy = NoDataPolicy::Alerting;
        let state = process(&manager, &rule_alerting, EvalState::NoData, 0).await;
        assert_eq!(state.state, EvalState::Alerting);
        assert_eq!(state.state_reason.as_deref(), Some("NoData"));
    }

    #[tokio::test]
    async fn pending_from_alerting_result_carries_no_reason() {
        let manager = manager();
        let rule = rule(20);
        let state = process(&manager, &rule, EvalState::Alerting, 0).await;
        assert_eq!(state.state, EvalState::Pending);
        // Raw state was Alerting, which never becomes a reason.
        assert_eq!(state.state_reason, None);
    }

    #[tokio::test]
    async fn stale_entry_is_removed_after_two_intervals() {
        let manager = manager();
        let rule = rule(0);

        process(&manager, &rule, EvalState::Alerting, 0).await;
        assert_eq!(manager.get_states_for_rule(1, "r1").len(), 1);

        // A cycle that no longer reports the series, within the window: kept.
        let other = EvaluationResult {
            instance_labels: [("instance".to_string(), "two".to_string())].into(),
            ..result(EvalState::Normal, at(10))
        };
        manager.process_eval_results(at(10), &rule, vec![other.clone()]).await;
        assert_eq!(manager.get_states_for_rule(1, "r1").len(), 2);

        // Past twice the interval: the unreported series is dropped.
        manager.process_eval_results(at(21), &rule, vec![other]).await;
        let remaining = manager.get_states_for_rule(1, "r1");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].labels.get("instance").map(String::as_str), Some("two"));
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let manager = manager();
        let rule = rule(0);
        let r = result(EvalState::Normal, at(0));

        let first = manager.get_or_create(&rule, &r);
        let second = manager.get_or_create(&rule, &r);
        assert_eq!(first.key(), second.key());
        assert_eq!(first.state, EvalState::Normal);
        assert_eq!(manager.get_all(1).len(), 1);
    }

    #[tokio::test]
    async fn remove_by_rule_clears_cache() {
        let manager = manager();
        let rule = rule(0);
        process(&manager, &rule, EvalState::Alerting, 0).await;

        let removed = manager.remove_by_rule(&rule.key());
        assert_eq!(removed.len(), 1);
        assert!(manager.get_states_for_rule(1, "r1").is_empty());
    }
}
