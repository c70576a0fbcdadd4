//! Data model for rules, evaluation results, alert instances and history
//! records.

pub mod eval;
pub mod history;
pub mod instance;
pub mod rule;

pub use eval::{fingerprint, EvalState, EvaluationResult};
pub use history::{HistoryEntry, HistoryQuery, RuleMeta, StateTransition};
pub use instance::{AlertInstance, InstanceKey, PersistedInstance};
pub use rule::{ExecErrPolicy, NoDataPolicy, RuleKey, RuleSnapshots, SchedulableRule};
