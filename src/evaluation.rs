//! The evaluation contract: the engine schedules evaluations, the embedding
//! service performs them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

use crate::models::{EvaluationResult, SchedulableRule};

/// Errors an evaluator can report for a whole cycle.
#[derive(Debug, Error)]
pub enum EvaluationError {
    /// The rule's underlying query failed.
    #[error("query execution failed: {0}")]
    QueryFailed(String),

    /// The rule's condition could not be computed from the query results.
    #[error("condition evaluation failed: {0}")]
    ConditionFailed(String),
}

/// Evaluates one rule's data at a point in time.
///
/// A whole-cycle failure (an `Err` return, or a panic inside the evaluator)
/// is isolated by the rule routine and surfaces as a single Error-state
/// result for that cycle; it never brings down the scheduler or other rules.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RuleEvaluator: Send + Sync {
    /// Evaluates the rule as of `scheduled_at`, returning one result per
    /// series the rule's query produced.
    async fn evaluate(
        &self,
        rule: &SchedulableRule,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Vec<EvaluationResult>, EvaluationError>;
}
