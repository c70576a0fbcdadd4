//! The rule-definition source the scheduler reconciles against.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

use crate::models::SchedulableRule;

/// Errors that can occur while reading rule definitions.
#[derive(Debug, Error)]
pub enum RuleReadError {
    /// The backing rule store failed.
    #[error("rule store operation failed: {0}")]
    StoreFailed(String),
}

/// Source of truth for rule definitions, polled by the scheduler during
/// reconciliation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RuleReader: Send + Sync {
    /// Lists every organization that has schedulable rules.
    async fn org_ids(&self) -> Result<Vec<i64>, RuleReadError>;

    /// Lists the schedulable rules of one organization.
    async fn list_rules(&self, org_id: i64) -> Result<Vec<SchedulableRule>, RuleReadError>;
}
