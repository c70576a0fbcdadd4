#![warn(missing_docs)]
//! Vigil is an in-process alert-rule evaluation engine: it schedules periodic
//! evaluation of alerting rules, tracks per-series alert state across cycles,
//! and records state transitions to durable history backends.
//!
//! The engine has no user-facing surface of its own. A surrounding service
//! embeds it by providing a [`rules::RuleReader`] (the source of rule
//! definitions), an [`evaluation::RuleEvaluator`] (the thing that actually
//! evaluates rule data), and optionally an instance store, annotation sink,
//! image capturer and history backends. See [`engine::EngineBuilder`].

pub mod annotations;
pub mod config;
pub mod engine;
pub mod evaluation;
pub mod history;
pub mod images;
pub mod models;
pub mod persistence;
pub mod registry;
pub mod rules;
pub mod scheduler;
pub mod state;
