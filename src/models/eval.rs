//! Evaluation results and label-set fingerprinting.

use std::{collections::BTreeMap, fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The state reported for a single series by one evaluation cycle, and also
/// the state an alert instance holds in the cache.
///
/// `Pending` is never produced by an evaluator; it is only reached through
/// the transition algorithm when a rule carries a "For" duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvalState {
    /// The condition did not fire.
    Normal,
    /// The condition fired but the "For" window has not elapsed yet.
    Pending,
    /// The condition fired.
    Alerting,
    /// The evaluation returned no data for this series.
    NoData,
    /// The evaluation itself failed.
    Error,
}

impl EvalState {
    /// Parses the canonical string form produced by [`fmt::Display`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Normal" => Some(Self::Normal),
            "Pending" => Some(Self::Pending),
            "Alerting" => Some(Self::Alerting),
            "NoData" => Some(Self::NoData),
            "Error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for EvalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Normal => "Normal",
            Self::Pending => "Pending",
            Self::Alerting => "Alerting",
            Self::NoData => "NoData",
            Self::Error => "Error",
        };
        f.write_str(s)
    }
}

/// One series' outcome from a single evaluation cycle of a rule.
#[derive(Debug, Clone)]
pub struct EvaluationResult {
    /// The raw state the evaluator reported for this series.
    pub state: EvalState,
    /// The labels identifying this series. Sorted map so fingerprinting is
    /// deterministic.
    pub instance_labels: BTreeMap<String, String>,
    /// Numeric values the evaluation produced, keyed by ref id.
    pub values: BTreeMap<String, f64>,
    /// When the evaluation was performed.
    pub evaluated_at: DateTime<Utc>,
    /// How long the evaluation took.
    pub evaluation_duration: Duration,
}

impl EvaluationResult {
    /// The fingerprint of this result's label set.
    pub fn fingerprint(&self) -> u64 {
        fingerprint(&self.instance_labels)
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Computes a stable 64-bit FNV-1a fingerprint of a label set.
///
/// Key/value pairs are folded in sorted order with distinct separators so
/// `{a: "bc"}` and `{ab: "c"}` hash differently. The same algorithm must be
/// used everywhere an instance is keyed, including the persisted
/// `labels_hash` column.
pub fn fingerprint(labels: &BTreeMap<String, String>) -> u64 {
    let mut hash = FNV_OFFSET;
    let mut fold = |bytes: &[u8]| {
        for b in bytes {
            hash ^= u64::from(*b);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    };
    for (key, value) in labels {
        fold(key.as_bytes());
        fold(&[0xfe]);
        fold(value.as_bytes());
        fold(&[0xff]);
    }
    hash
}
