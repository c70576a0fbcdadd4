//! Integration tests for the scheduler tick loop: reconciliation, per-rule
//! intervals, drop-stale signaling and panic isolation.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use vigil::{
    annotations::NoopAnnotationSink,
    evaluation::{EvaluationError, RuleEvaluator},
    history::{Historian, MemoryHistorian},
    images::NoopImageCapturer,
    models::{EvalState, EvaluationResult, ExecErrPolicy, NoDataPolicy, SchedulableRule},
    persistence::SqliteInstanceStore,
    rules::{RuleReadError, RuleReader},
    scheduler::Scheduler,
    state::StateManager,
};

/// A rule reader over a mutable in-memory rule set.
#[derive(Default)]
struct FakeRuleReader {
    rules: Mutex<Vec<SchedulableRule>>,
}

impl FakeRuleReader {
    fn set(&self, rules: Vec<SchedulableRule>) {
        *self.rules.lock().unwrap() = rules;
    }
}

#[async_trait]
impl RuleReader for FakeRuleReader {
    async fn org_ids(&self) -> Result<Vec<i64>, RuleReadError> {
        let mut ids: Vec<i64> = self.rules.lock().unwrap().iter().map(|r| r.org_id).collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    async fn list_rules(&self, org_id: i64) -> Result<Vec<SchedulableRule>, RuleReadError> {
        Ok(self
            .rules
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.org_id == org_id)
            .cloned()
            .collect())
    }
}

/// Counts evaluations per rule and tracks concurrency; can be gated to
/// simulate a slow rule.
#[derive(Default)]
struct CountingEvaluator {
    counts: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    gate: Option<Arc<Notify>>,
}

impl CountingEvaluator {
    fn gated(gate: Arc<Notify>) -> Self {
        Self { gate: Some(gate), ..Default::default() }
    }

    fn count(&self, uid: &str) -> usize {
        self.counts.lock().unwrap().get(uid).copied().unwrap_or(0)
    }
}

#[async_trait]
impl RuleEvaluator for CountingEvaluator {
    async fn evaluate(
        &self,
        rule: &SchedulableRule,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Vec<EvaluationResult>, EvaluationError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        *self.counts.lock().unwrap().entry(rule.rule_uid.clone()).or_insert(0) += 1;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(vec![EvaluationResult {
            state: EvalState::Normal,
            instance_labels: [("instance".to_string(), "node-1".to_string())].into(),
            values: BTreeMap::new(),
            evaluated_at: scheduled_at,
            evaluation_duration: Duration::from_millis(1),
        }])
    }
}

/// Always panics, to exercise evaluation-cycle isolation.
#[derive(Default)]
struct PanickingEvaluator {
    attempts: AtomicUsize,
}

#[async_trait]
impl RuleEvaluator for PanickingEvaluator {
    async fn evaluate(
        &self,
        _rule: &SchedulableRule,
        _scheduled_at: DateTime<Utc>,
    ) -> Result<Vec<EvaluationResult>, EvaluationError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        panic!("evaluator blew up");
    }
}

fn rule(uid: &str, interval_seconds: i64) -> SchedulableRule {
    SchedulableRule {
        org_id: 1,
        rule_uid: uid.to_string(),
        title: format!("rule {uid}"),
        interval_seconds,
        version: 1,
        for_seconds: 0,
        no_data_policy: NoDataPolicy::NoData,
        exec_err_policy: ExecErrPolicy::Alerting,
        dashboard_uid: None,
        panel_id: None,
        labels: HashMap::new(),
        annotations: HashMap::new(),
        updated_at: Utc::now(),
    }
}

async fn state_manager() -> Arc<StateManager> {
    let store = SqliteInstanceStore::new("sqlite::memory:")
        .await
        .expect("Failed to set up in-memory database");
    store.run_migrations().await.expect("Failed to run migrations");
    let historian = Arc::new(Historian::new(Arc::new(MemoryHistorian::default()), vec![]));
    Arc::new(StateManager::new(
        Arc::new(store),
        historian,
        Arc::new(NoopImageCapturer),
        Arc::new(NoopAnnotationSink),
        100,
    ))
}

#[tokio::test(flavor = "multi_thread")]
async fn rules_evaluate_on_their_own_interval() {
    let evaluator = Arc::new(CountingEvaluator::default());
    let reader = Arc::new(FakeRuleReader::default());
    reader.set(vec![rule("fast", 1), rule("slow", 4)]);
    let state_manager = state_manager().await;
    let token = CancellationToken::new();
    let scheduler = Scheduler::new(
        Duration::from_millis(100),
        reader.clone(),
        evaluator.clone(),
        state_manager.clone(),
        token.clone(),
    );
    let run = tokio::spawn(scheduler.run());

    tokio::time::sleep(Duration::from_millis(650)).await;
    token.cancel();
    run.await.unwrap();

    let fast = evaluator.count("fast");
    let slow = evaluator.count("slow");
    assert!(fast >= 3, "fast rule should evaluate on every tick, got {fast}");
    assert!(slow >= 1, "slow rule should evaluate at least once, got {slow}");
    assert!(fast > slow, "fast ({fast}) should outpace slow ({slow})");

    // Both rules produced state visible through the read API.
    assert_eq!(state_manager.get_states_for_rule(1, "fast").len(), 1);
    assert_eq!(state_manager.get_states_for_rule(1, "slow").len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn reconciliation_starts_and_stops_routines() {
    let evaluator = Arc::new(CountingEvaluator::default());
    let reader = Arc::new(FakeRuleReader::default());
    reader.set(vec![rule("a", 1)]);
    let state_manager = state_manager().await;
    let token = CancellationToken::new();
    let scheduler = Scheduler::new(
        Duration::from_millis(50),
        reader.clone(),
        evaluator.clone(),
        state_manager.clone(),
        token.clone(),
    );
    let snapshots = scheduler.snapshots();
    let run = tokio::spawn(scheduler.run());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(snapshots.len(), 1);
    assert!(evaluator.count("a") >= 1);
    assert_eq!(state_manager.get_states_for_rule(1, "a").len(), 1);

    // Delete the rule: its routine stops and its state is removed.
    reader.set(vec![]);
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(snapshots.len(), 0);
    assert!(state_manager.get_states_for_rule(1, "a").is_empty());

    let settled = evaluator.count("a");
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(evaluator.count("a"), settled, "deleted rule must not evaluate again");

    token.cancel();
    run.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_rule_drops_ticks_and_never_runs_concurrently() {
    let gate = Arc::new(Notify::new());
    let evaluator = Arc::new(CountingEvaluator::gated(gate.clone()));
    let reader = Arc::new(FakeRuleReader::default());
    reader.set(vec![rule("slowpoke", 1)]);
    let state_manager = state_manager().await;
    let token = CancellationToken::new();
    let scheduler = Scheduler::new(
        Duration::from_millis(50),
        reader.clone(),
        evaluator.clone(),
        state_manager.clone(),
        token.clone(),
    );
    let run = tokio::spawn(scheduler.run());

    // Roughly eight ticks elapse while the first evaluation is stuck on the
    // gate; at most one of them may be buffered behind it.
    tokio::time::sleep(Duration::from_millis(400)).await;
    for _ in 0..3 {
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    token.cancel();
    run.await.unwrap();

    let count = evaluator.count("slowpoke");
    assert!(count >= 1, "the gated rule should eventually evaluate");
    assert!(
        count <= 5,
        "ticks during the stall must be dropped, not queued (got {count} evaluations)"
    );
    assert_eq!(
        evaluator.max_in_flight.load(Ordering::SeqCst),
        1,
        "no two evaluations of the same rule may overlap"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn panicking_evaluation_is_isolated_and_surfaces_as_error_state() {
    let evaluator = Arc::new(PanickingEvaluator::default());
    let reader = Arc::new(FakeRuleReader::default());
    reader.set(vec![rule("doomed", 1)]);
    let state_manager = state_manager().await;
    let token = CancellationToken::new();
    let scheduler = Scheduler::new(
        Duration::from_millis(50),
        reader.clone(),
        evaluator.clone(),
        state_manager.clone(),
        token.clone(),
    );
    let run = tokio::spawn(scheduler.run());

    tokio::time::sleep(Duration::from_millis(400)).await;
    token.cancel();
    run.await.unwrap();

    // The routine survived the first panic and kept evaluating.
    assert!(
        evaluator.attempts.load(Ordering::SeqCst) >= 2,
        "routine must keep running after a panicked cycle"
    );

    // The panicked cycles surfaced as Error results; with the Alerting
    // on-error policy the instance fires, with the raw state as reason.
    let states = state_manager.get_states_for_rule(1, "doomed");
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].state, EvalState::Alerting);
    assert_eq!(states[0].state_reason.as_deref(), Some("Error"));
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_stops_everything() {
    let evaluator = Arc::new(CountingEvaluator::default());
    let reader = Arc::new(FakeRuleReader::default());
    reader.set(vec![rule("a", 1), rule("b", 1)]);
    let state_manager = state_manager().await;
    let token = CancellationToken::new();
    let scheduler = Scheduler::new(
        Duration::from_millis(50),
        reader,
        evaluator.clone(),
        state_manager,
        token.clone(),
    );
    let run = tokio::spawn(scheduler.run());

    tokio::time::sleep(Duration::from_millis(200)).await;
    token.cancel();
    run.await.unwrap();

    let a = evaluator.count("a");
    let b = evaluator.count("b");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(evaluator.count("a"), a, "no evaluation after shutdown");
    assert_eq!(evaluator.count("b"), b, "no evaluation after shutdown");
}
