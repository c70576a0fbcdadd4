//! The per-rule routine registry and its signaling primitives.
//!
//! Each active rule owns one routine: a background task blocking on two
//! mailboxes (evaluate, update-version) and a cancellable scope. The
//! mailboxes buffer at most one message and always keep the latest one, so a
//! routine that falls behind acts on the most recent scheduled time and
//! version rather than a stale queued one.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::models::RuleKey;

/// Errors surfaced by registry signaling.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The target routine has already been stopped.
    #[error("rule routine has been stopped")]
    Stopped,

    /// No routine exists for the requested key.
    #[error("no routine registered for rule {0}")]
    NotFound(RuleKey),
}

/// A single-slot mailbox: posting replaces (and returns) any undelivered
/// message, receiving waits for the next message or cancellation.
#[derive(Debug, Default)]
pub struct Mailbox<T> {
    slot: Mutex<Option<T>>,
    notify: Notify,
}

impl<T> Mailbox<T> {
    /// Creates an empty mailbox.
    pub fn new() -> Self {
        Self { slot: Mutex::new(None), notify: Notify::new() }
    }

    /// Posts a message, displacing any undelivered one.
    ///
    /// Returns the displaced message so the caller can account for the
    /// dropped signal.
    pub fn post(&self, value: T) -> Option<T> {
        let dropped = {
            let mut slot = self.slot.lock().expect("mailbox lock poisoned");
            slot.replace(value)
        };
        self.notify.notify_one();
        dropped
    }

    /// Posts a message, merging it with any undelivered one.
    ///
    /// The merge function receives `(pending, new)` and decides what single
    /// message the consumer will observe.
    pub fn post_merge(&self, value: T, merge: impl FnOnce(T, T) -> T) {
        {
            let mut slot = self.slot.lock().expect("mailbox lock poisoned");
            let merged = match slot.take() {
                Some(pending) => merge(pending, value),
                None => value,
            };
            *slot = Some(merged);
        }
        self.notify.notify_one();
    }

    /// Takes the pending message without waiting, if there is one.
    pub fn try_recv(&self) -> Option<T> {
        self.slot.lock().expect("mailbox lock poisoned").take()
    }

    /// Waits for the next message. Returns `None` once `cancel` fires.
    ///
    /// `Notify` stores a permit when a post races a waiter, so a message
    /// posted just before this call is never lost.
    pub async fn recv(&self, cancel: &CancellationToken) -> Option<T> {
        loop {
            if let Some(value) = self.try_recv() {
                return Some(value);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }
}

/// An evaluation request: the tick the evaluation was scheduled for and the
/// rule version the scheduler saw at that tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    /// The tick time this evaluation was scheduled for.
    pub scheduled_at: DateTime<Utc>,
    /// The rule definition version at scheduling time.
    pub version: i64,
}

/// The live handle of one rule routine: its cancellable scope and its two
/// signaling mailboxes.
#[derive(Debug)]
pub struct RuleRoutineHandle {
    eval: Mailbox<Evaluation>,
    update: Mailbox<i64>,
    token: CancellationToken,
}

impl RuleRoutineHandle {
    fn new(token: CancellationToken) -> Self {
        Self { eval: Mailbox::new(), update: Mailbox::new(), token }
    }

    /// Signals the routine to evaluate at `scheduled_at`.
    ///
    /// At most one evaluation request is ever buffered: a request the
    /// routine has not consumed yet is displaced and returned, so the
    /// scheduler can count the dropped tick. Freshness over completeness: a
    /// routine that missed a tick evaluates at the latest requested time.
    pub fn evaluate(&self, eval: Evaluation) -> Result<Option<Evaluation>, RegistryError> {
        if self.token.is_cancelled() {
            return Err(RegistryError::Stopped);
        }
        Ok(self.eval.post(eval))
    }

    /// Signals the routine that the rule definition changed.
    ///
    /// Rapid successive edits collapse into one signal carrying the highest
    /// pending version.
    pub fn update_version(&self, version: i64) -> Result<(), RegistryError> {
        if self.token.is_cancelled() {
            return Err(RegistryError::Stopped);
        }
        self.update.post_merge(version, i64::max);
        Ok(())
    }

    /// Waits for the next evaluation request. `None` once the routine's
    /// scope is cancelled.
    pub async fn next_evaluation(&self) -> Option<Evaluation> {
        self.eval.recv(&self.token).await
    }

    /// Waits for the next version-update signal. `None` once the routine's
    /// scope is cancelled.
    pub async fn next_version(&self) -> Option<i64> {
        self.update.recv(&self.token).await
    }

    /// The routine's cancellable scope.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancels the routine's scope, unblocking any pending receives.
    pub fn stop(&self) {
        self.token.cancel();
    }
}

/// Holds one live routine handle per active rule key.
///
/// Guarded by a single coarse lock: creation and deletion are rare relative
/// to ticks, and no caller ever holds the lock across an await point.
pub struct RoutineRegistry {
    routines: Mutex<HashMap<RuleKey, Arc<RuleRoutineHandle>>>,
    parent: CancellationToken,
}

impl RoutineRegistry {
    /// Creates a registry whose routines derive their scopes from `parent`.
    pub fn new(parent: CancellationToken) -> Self {
        Self { routines: Mutex::new(HashMap::new()), parent }
    }

    /// Returns the existing handle for `key`, or atomically creates one with
    /// a fresh child scope. The boolean is true when a new handle was
    /// created.
    pub fn get_or_create(&self, key: RuleKey) -> (Arc<RuleRoutineHandle>, bool) {
        let mut routines = self.routines.lock().expect("routine registry lock poisoned");
        if let Some(handle) = routines.get(&key) {
            return (Arc::clone(handle), false);
        }
        let handle = Arc::new(RuleRoutineHandle::new(self.parent.child_token()));
        routines.insert(key, Arc::clone(&handle));
        (handle, true)
    }

    /// Returns the handle for `key`, if the routine is registered.
    pub fn get(&self, key: &RuleKey) -> Result<Arc<RuleRoutineHandle>, RegistryError> {
        self.routines
            .lock()
            .expect("routine registry lock poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(key.clone()))
    }

    /// Removes and returns the handle for `key` so the caller can cancel its
    /// scope.
    pub fn delete(&self, key: &RuleKey) -> Option<Arc<RuleRoutineHandle>> {
        self.routines.lock().expect("routine registry lock poisoned").remove(key)
    }

    /// Snapshot of all active keys, for reconciliation diffing.
    pub fn keys(&self) -> HashSet<RuleKey> {
        self.routines.lock().expect("routine registry lock poisoned").keys().cloned().collect()
    }

    /// Number of live routines.
    pub fn len(&self) -> usize {
        self.routines.lock().expect("routine registry lock poisoned").len()
    }

    /// Whether any routines are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
