//! The durable instance-store contract consumed by the state manager.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use super::error::PersistenceError;
use crate::models::{InstanceKey, PersistedInstance, RuleKey};

/// Filters for listing persisted instances.
#[derive(Debug, Clone, Default)]
pub struct InstanceQuery {
    /// Restrict to this organization.
    pub org_id: i64,
    /// Restrict to one rule, if set.
    pub rule_uid: Option<String>,
}

/// Durable persistence for current alert instance state.
///
/// All calls are best-effort from the engine's perspective: failures are
/// logged and the in-memory cache stays authoritative for the running
/// process.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Lists every organization that has persisted instances. Used to warm
    /// the state cache at startup.
    async fn fetch_org_ids(&self) -> Result<Vec<i64>, PersistenceError>;

    /// Lists persisted instances matching the query.
    async fn list_instances(
        &self,
        query: InstanceQuery,
    ) -> Result<Vec<PersistedInstance>, PersistenceError>;

    /// Upserts a batch of instances, one row per
    /// `(org_id, rule_uid, labels_hash)`.
    async fn save_instances(&self, batch: Vec<PersistedInstance>) -> Result<(), PersistenceError>;

    /// Deletes the rows identified by the given keys.
    async fn delete_instances(&self, keys: Vec<InstanceKey>) -> Result<(), PersistenceError>;

    /// Deletes every row belonging to one rule.
    async fn delete_instances_by_rule(&self, key: RuleKey) -> Result<(), PersistenceError>;
}
