//! SQLite-backed implementation of the instance store.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};

use super::{
    error::PersistenceError,
    traits::{InstanceQuery, InstanceStore},
};
use crate::models::{InstanceKey, PersistedInstance, RuleKey};

/// A concrete [`InstanceStore`] backed by SQLite.
pub struct SqliteInstanceStore {
    /// The SQLite connection pool used for database operations.
    pool: SqlitePool,
}

impl SqliteInstanceStore {
    /// Connects to the given database URL, creating the database file if it
    /// does not exist.
    #[tracing::instrument(level = "info")]
    pub async fn new(database_url: &str) -> Result<Self, PersistenceError> {
        tracing::debug!(database_url, "Connecting to SQLite instance store.");
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| PersistenceError::InvalidInput(e.to_string()))?
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await.map_err(|e| {
            PersistenceError::OperationFailed(format!("Failed to connect to database: {}", e))
        })?;
        tracing::info!(database_url, "Connected to SQLite instance store.");
        Ok(Self { pool })
    }

    /// Runs database migrations.
    #[tracing::instrument(skip(self), level = "info")]
    pub async fn run_migrations(&self) -> Result<(), PersistenceError> {
        sqlx::migrate!("./migrations").run(&self.pool).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to run database migrations.");
            PersistenceError::MigrationError(e.to_string())
        })?;
        tracing::info!("Database migrations completed successfully.");
        Ok(())
    }

    /// Closes the connection pool gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl InstanceStore for SqliteInstanceStore {
    #[tracing::instrument(skip(self), level = "debug")]
    async fn fetch_org_ids(&self) -> Result<Vec<i64>, PersistenceError> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT DISTINCT org_id FROM alert_instance ORDER BY org_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(org_id,)| org_id).collect())
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn list_instances(
        &self,
        query: InstanceQuery,
    ) -> Result<Vec<PersistedInstance>, PersistenceError> {
        let instances = match &query.rule_uid {
            Some(rule_uid) => {
                sqlx::query_as::<_, PersistedInstance>(
                    "SELECT org_id, rule_uid, labels_hash, labels, current_state, \
                     current_reason, current_state_since, current_state_end, last_eval_time \
                     FROM alert_instance WHERE org_id = ? AND rule_uid = ?",
                )
                .bind(query.org_id)
                .bind(rule_uid)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, PersistedInstance>(
                    "SELECT org_id, rule_uid, labels_hash, labels, current_state, \
                     current_reason, current_state_since, current_state_end, last_eval_time \
                     FROM alert_instance WHERE org_id = ?",
                )
                .bind(query.org_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        tracing::debug!(org_id = query.org_id, count = instances.len(), "Listed alert instances.");
        Ok(instances)
    }

    #[tracing::instrument(skip_all, fields(batch_size = batch.len()), level = "debug")]
    async fn save_instances(&self, batch: Vec<PersistedInstance>) -> Result<(), PersistenceError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for instance in &batch {
            sqlx::query(
                "INSERT INTO alert_instance \
                 (org_id, rule_uid, labels_hash, labels, current_state, current_reason, \
                  current_state_since, current_state_end, last_eval_time) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT (org_id, rule_uid, labels_hash) DO UPDATE SET \
                  labels = excluded.labels, \
                  current_state = excluded.current_state, \
                  current_reason = excluded.current_reason, \
                  current_state_since = excluded.current_state_since, \
                  current_state_end = excluded.current_state_end, \
                  last_eval_time = excluded.last_eval_time",
            )
            .bind(instance.org_id)
            .bind(&instance.rule_uid)
            .bind(&instance.labels_hash)
            .bind(&instance.labels)
            .bind(&instance.current_state)
            .bind(&instance.current_reason)
            .bind(instance.current_state_since)
            .bind(instance.current_state_end)
            .bind(instance.last_eval_time)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(count = keys.len()), level = "debug")]
    async fn delete_instances(&self, keys: Vec<InstanceKey>) -> Result<(), PersistenceError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for key in &keys {
            sqlx::query(
                "DELETE FROM alert_instance \
                 WHERE org_id = ? AND rule_uid = ? AND labels_hash = ?",
            )
            .bind(key.org_id)
            .bind(&key.rule_uid)
            .bind(key.labels_hash())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn delete_instances_by_rule(&self, key: RuleKey) -> Result<(), PersistenceError> {
        let result = sqlx::query("DELETE FROM alert_instance WHERE org_id = ? AND rule_uid = ?")
            .bind(key.org_id)
            .bind(&key.rule_uid)
            .execute(&self.pool)
            .await?;
        tracing::debug!(rule = %key, rows = result.rows_affected(), "Deleted alert instances by rule.");
        Ok(())
    }
}
