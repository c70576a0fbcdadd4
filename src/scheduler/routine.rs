//! The long-running task owned by each active rule.

use std::{collections::BTreeMap, sync::Arc, time::Instant};

use crate::{
    evaluation::RuleEvaluator,
    models::{EvalState, EvaluationResult, RuleKey, RuleSnapshots},
    registry::{Evaluation, RuleRoutineHandle},
    state::StateManager,
};

/// One rule's evaluation loop: blocks on the routine's mailboxes, performs
/// evaluation when signalled and hands results to the state manager.
///
/// Evaluations are strictly sequential within a rule; a cycle that errors or
/// panics is isolated into a single Error-state result and never brings the
/// routine down.
pub(crate) struct RuleRoutine {
    key: RuleKey,
    handle: Arc<RuleRoutineHandle>,
    snapshots: Arc<RuleSnapshots>,
    evaluator: Arc<dyn RuleEvaluator>,
    state_manager: Arc<StateManager>,
}

impl RuleRoutine {
    pub fn new(
        key: RuleKey,
        handle: Arc<RuleRoutineHandle>,
        snapshots: Arc<RuleSnapshots>,
        evaluator: Arc<dyn RuleEvaluator>,
        state_manager: Arc<StateManager>,
    ) -> Self {
        Self { key, handle, snapshots, evaluator, state_manager }
    }

    /// The routine's main loop. Exits when the routine's scope is cancelled.
    pub async fn run(self) {
        tracing::debug!(rule = %self.key, "Rule routine started.");
        // The highest definition version this routine has acted on.
        let mut current_version: i64 = 0;

        loop {
            let handle = Arc::clone(&self.handle);
            tokio::select! {
                biased;

                _ = handle.cancellation_token().cancelled() => break,

                maybe_version = handle.next_version() => {
                    let Some(version) = maybe_version else { break };
                    if version > current_version {
                        tracing::debug!(rule = %self.key, version, "Rule definition changed; next evaluation uses the latest snapshot.");
                        current_version = version;
                    }
                }

                maybe_eval = handle.next_evaluation() => {
                    let Some(eval) = maybe_eval else { break };
                    current_version = current_version.max(eval.version);
                    self.evaluate_cycle(eval).await;
                }
            }
        }
        tracing::debug!(rule = %self.key, "Rule routine stopped.");
    }

    /// Performs one evaluation cycle at the scheduled time, against the
    /// latest known rule definition.
    async fn evaluate_cycle(&self, eval: Evaluation) {
        let Some(rule) = self.snapshots.get(&self.key) else {
            tracing::warn!(rule = %self.key, "No definition in snapshot for scheduled rule; skipping cycle.");
            return;
        };

        let started = Instant::now();
        let scheduled_at = eval.scheduled_at;
        let evaluator = Arc::clone(&self.evaluator);
        let eval_rule = Arc::clone(&rule);

        // The evaluator runs on its own task so a panic inside it is caught
        // at the join boundary instead of unwinding through the routine.
        let outcome =
            tokio::spawn(async move { evaluator.evaluate(&eval_rule, scheduled_at).await }).await;

        let results = match outcome {
            Ok(Ok(results)) => results,
            Ok(Err(e)) => {
                tracing::error!(rule = %self.key, error = %e, "Rule evaluation failed.");
                vec![error_result(scheduled_at, started)]
            }
            Err(join_error) => {
                if join_error.is_panic() {
                    tracing::error!(rule = %self.key, "Rule evaluation panicked; producing an Error result.");
                } else {
                    tracing::error!(rule = %self.key, error = %join_error, "Rule evaluation task failed.");
                }
                vec![error_result(scheduled_at, started)]
            }
        };

        let states = self.state_manager.process_eval_results(scheduled_at, &rule, results).await;
        tracing::debug!(
            rule = %self.key,
            states = states.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Evaluation cycle completed."
        );
    }
}

/// The synthesized result of a failed or panicked evaluation cycle.
fn error_result(
    scheduled_at: chrono::DateTime<chrono::Utc>,
    started: Instant,
) -> EvaluationResult {
    EvaluationResult {
        state: EvalState::Error,
        instance_labels: BTreeMap::new(),
        values: BTreeMap::new(),
        evaluated_at: scheduled_at,
        evaluation_duration: started.elapsed(),
    }
}
