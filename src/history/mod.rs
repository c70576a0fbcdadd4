//! State-transition history: the backend contract and the fan-out that
//! routes every transition batch to all configured backends.

pub mod memory;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::models::{HistoryEntry, HistoryQuery, RuleMeta, StateTransition};

pub use memory::MemoryHistorian;

/// A completion signal for one `record` call. Resolves once the write has
/// been fully applied (or failed).
pub type RecordSignal = oneshot::Receiver<Result<(), HistorianError>>;

/// Errors produced by history backends and the fan-out.
#[derive(Debug, Error)]
pub enum HistorianError {
    /// A single backend failed to apply the write.
    #[error("history backend error: {0}")]
    Backend(String),

    /// A backend dropped its completion signal without producing a value.
    #[error("history backend dropped its completion signal")]
    SignalDropped,

    /// One or more backends of a fan-out failed.
    #[error("{0}")]
    Fanout(JoinedErrors),
}

/// The aggregated failures of a fan-out write.
#[derive(Debug)]
pub struct JoinedErrors(pub Vec<HistorianError>);

impl fmt::Display for JoinedErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} history backend(s) failed: ", self.0.len())?;
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", e)?;
        }
        Ok(())
    }
}

/// One history backend: a sink for transition batches and, for the primary
/// backend only, a source for history reads.
#[async_trait]
pub trait HistorianBackend: Send + Sync {
    /// Dispatches one transition batch. Returns immediately with a
    /// completion signal; the write itself may proceed on a background task.
    fn record(&self, meta: RuleMeta, transitions: Vec<StateTransition>) -> RecordSignal;

    /// Queries recorded transitions.
    async fn query(&self, query: HistoryQuery) -> Result<Vec<HistoryEntry>, HistorianError>;
}

/// Routes every transition batch to a primary backend and zero or more
/// secondary backends concurrently.
///
/// The fan-out never short-circuits: a failing or slow secondary cannot stop
/// the primary write from being dispatched, and the returned signal only
/// resolves after every backend's own signal has produced a value. Reads are
/// served exclusively by the primary backend.
pub struct Historian {
    primary: Arc<dyn HistorianBackend>,
    secondaries: Vec<Arc<dyn HistorianBackend>>,
}

impl Historian {
    /// Creates a fan-out over a primary and any number of secondaries.
    pub fn new(primary: Arc<dyn HistorianBackend>, secondaries: Vec<Arc<dyn HistorianBackend>>) -> Self {
        Self { primary, secondaries }
    }

    /// Records a transition batch to every backend.
    ///
    /// The returned signal resolves with `Ok(())` if all backends succeeded,
    /// or with a joined error aggregating every backend failure.
    pub fn record(&self, meta: RuleMeta, transitions: Vec<StateTransition>) -> RecordSignal {
        let (tx, rx) = oneshot::channel();
        if transitions.is_empty() {
            let _ = tx.send(Ok(()));
            return rx;
        }

        // Dispatch to every backend up front so they proceed concurrently.
        let mut signals = Vec::with_capacity(1 + self.secondaries.len());
        signals.push(self.primary.record(meta.clone(), transitions.clone()));
        for backend in &self.secondaries {
            signals.push(backend.record(meta.clone(), transitions.clone()));
        }

        let rule_uid = meta.rule_uid.clone();
        tokio::spawn(async move {
            let mut errors = Vec::new();
            for signal in signals {
                match signal.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => errors.push(e),
                    Err(_) => errors.push(HistorianError::SignalDropped),
                }
            }
            let result = if errors.is_empty() {
                Ok(())
            } else {
                tracing::warn!(rule_uid = %rule_uid, failed = errors.len(), "History fan-out completed with failures.");
                Err(HistorianError::Fanout(JoinedErrors(errors)))
            };
            // The caller may have dropped the signal; that is fine.
            let _ = tx.send(result);
        });
        rx
    }

    /// Queries the primary backend.
    pub async fn query(&self, query: HistoryQuery) -> Result<Vec<HistoryEntry>, HistorianError> {
        self.primary.query(query).await
    }
}
