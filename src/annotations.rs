//! Annotation events emitted on visible state changes.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::EvalState;

/// An annotation describing one visible `(state, reason)` change of an alert
/// instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationEvent {
    /// The owning organization.
    pub org_id: i64,
    /// The owning rule.
    pub rule_uid: String,
    /// Rule title at the time of the transition.
    pub rule_title: String,
    /// Linked dashboard, if any.
    pub dashboard_uid: Option<String>,
    /// Linked panel, if any.
    pub panel_id: Option<i64>,
    /// The labels identifying the series.
    pub labels: BTreeMap<String, String>,
    /// State before the transition.
    pub previous_state: EvalState,
    /// State reason before the transition, if any.
    pub previous_reason: Option<String>,
    /// State after the transition.
    pub current_state: EvalState,
    /// State reason after the transition, if any.
    pub current_reason: Option<String>,
    /// When the transition happened.
    pub time: DateTime<Utc>,
}

/// Errors that can occur while saving an annotation.
#[derive(Debug, Error)]
pub enum AnnotationError {
    /// The sink rejected or failed to store the event.
    #[error("failed to save annotation: {0}")]
    SaveFailed(String),
}

/// Receives annotation events. Saves are fire-and-forget from the engine's
/// perspective; failures are logged, never propagated to the evaluation
/// cycle.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AnnotationSink: Send + Sync {
    /// Stores one annotation event.
    async fn save(&self, event: AnnotationEvent) -> Result<(), AnnotationError>;
}

/// An [`AnnotationSink`] that discards every event.
#[derive(Debug, Default)]
pub struct NoopAnnotationSink;

#[async_trait]
impl AnnotationSink for NoopAnnotationSink {
    async fn save(&self, _event: AnnotationEvent) -> Result<(), AnnotationError> {
        Ok(())
    }
}

/// Saves an annotation on a background task, logging failures only.
pub(crate) fn spawn_save(sink: Arc<dyn AnnotationSink>, event: AnnotationEvent) {
    tokio::spawn(async move {
        let rule_uid = event.rule_uid.clone();
        if let Err(e) = sink.save(event).await {
            tracing::warn!(rule_uid = %rule_uid, error = %e, "Failed to save state-change annotation.");
        }
    });
}
