//! An in-memory, ring-buffered history backend.

use std::{
    collections::VecDeque,
    sync::Mutex,
};

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::{HistorianBackend, HistorianError, RecordSignal};
use crate::models::{HistoryEntry, HistoryQuery, RuleMeta, StateTransition};

/// Keeps the most recent transitions in a bounded ring buffer.
///
/// The default primary backend for embedders that do not configure durable
/// history storage, and the workhorse of the engine's tests.
pub struct MemoryHistorian {
    entries: Mutex<VecDeque<HistoryEntry>>,
    capacity: usize,
}

impl MemoryHistorian {
    /// Creates a backend that retains at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self { entries: Mutex::new(VecDeque::new()), capacity: capacity.max(1) }
    }

    /// Number of entries currently retained.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("history ring lock poisoned").len()
    }

    /// Whether the ring is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryHistorian {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl HistorianBackend for MemoryHistorian {
    fn record(&self, meta: RuleMeta, transitions: Vec<StateTransition>) -> RecordSignal {
        let (tx, rx) = oneshot::channel();
        {
            let mut entries = self.entries.lock().expect("history ring lock poisoned");
            for transition in transitions {
                while entries.len() >= self.capacity {
                    entries.pop_front();
                }
                entries.push_back(HistoryEntry { rule: meta.clone(), transition });
            }
        }
        let _ = tx.send(Ok(()));
        rx
    }

    async fn query(&self, query: HistoryQuery) -> Result<Vec<HistoryEntry>, HistorianError> {
        let entries = self.entries.lock().expect("history ring lock poisoned");
        Ok(entries
            .iter()
            .filter(|e| e.rule.org_id == query.org_id)
            .filter(|e| query.rule_uid.as_ref().is_none_or(|uid| &e.rule.rule_uid == uid))
            .filter(|e| query.from.is_none_or(|from| e.transition.at >= from))
            .filter(|e| query.to.is_none_or(|to| e.transition.at <= to))
            .cloned()
            .collect())
    }
}
