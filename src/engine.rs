//! The engine facade: wires the scheduler, state manager, historian and
//! stores together and manages their lifecycle.
//!
//! An embedding service builds an [`Engine`] through [`EngineBuilder`],
//! calls [`Engine::run`] on a task of its own, and cancels the engine's
//! token to initiate graceful shutdown: the tick loop stops, every rule
//! routine's scope is cancelled, and the state cache is flushed best-effort
//! within the configured timeout.

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{
    annotations::{AnnotationSink, NoopAnnotationSink},
    config::EngineConfig,
    evaluation::RuleEvaluator,
    history::{Historian, HistorianBackend, MemoryHistorian},
    images::{ImageCapturer, NoopImageCapturer},
    persistence::{InstanceStore, PersistenceError, SqliteInstanceStore},
    rules::RuleReader,
    scheduler::Scheduler,
    state::StateManager,
};

/// Errors that can occur while assembling or running the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A rule reader was not provided to the builder.
    #[error("Missing rule reader for Engine")]
    MissingRuleReader,

    /// A rule evaluator was not provided to the builder.
    #[error("Missing rule evaluator for Engine")]
    MissingEvaluator,

    /// The instance store could not be initialized.
    #[error("Instance store initialization failed: {0}")]
    Store(#[from] PersistenceError),
}

/// Assembles an [`Engine`] from its required and optional collaborators.
#[derive(Default)]
pub struct EngineBuilder {
    config: Option<EngineConfig>,
    rule_reader: Option<Arc<dyn RuleReader>>,
    evaluator: Option<Arc<dyn RuleEvaluator>>,
    store: Option<Arc<dyn InstanceStore>>,
    primary_history: Option<Arc<dyn HistorianBackend>>,
    secondary_history: Vec<Arc<dyn HistorianBackend>>,
    images: Option<Arc<dyn ImageCapturer>>,
    annotations: Option<Arc<dyn AnnotationSink>>,
}

impl EngineBuilder {
    /// Creates a new, empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the engine configuration. Defaults apply when omitted.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Sets the rule-definition source. Required.
    pub fn rule_reader(mut self, reader: Arc<dyn RuleReader>) -> Self {
        self.rule_reader = Some(reader);
        self
    }

    /// Sets the rule evaluator. Required.
    pub fn evaluator(mut self, evaluator: Arc<dyn RuleEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Sets the instance store. When omitted, a SQLite store is opened at
    /// the configured `database_url`.
    pub fn instance_store(mut self, store: Arc<dyn InstanceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the primary history backend. Defaults to an in-memory ring.
    pub fn primary_history(mut self, backend: Arc<dyn HistorianBackend>) -> Self {
        self.primary_history = Some(backend);
        self
    }

    /// Adds a secondary history backend.
    pub fn secondary_history(mut self, backend: Arc<dyn HistorianBackend>) -> Self {
        self.secondary_history.push(backend);
        self
    }

    /// Sets the image capturer. Defaults to a no-op capturer.
    pub fn image_capturer(mut self, images: Arc<dyn ImageCapturer>) -> Self {
        self.images = Some(images);
        self
    }

    /// Sets the annotation sink. Defaults to a no-op sink.
    pub fn annotation_sink(mut self, annotations: Arc<dyn AnnotationSink>) -> Self {
        self.annotations = Some(annotations);
        self
    }

    /// Assembles and wires the engine.
    pub async fn build(self) -> Result<Engine, EngineError> {
        let config = self.config.unwrap_or_default();
        let rule_reader = self.rule_reader.ok_or(EngineError::MissingRuleReader)?;
        let evaluator = self.evaluator.ok_or(EngineError::MissingEvaluator)?;

        let store: Arc<dyn InstanceStore> = match self.store {
            Some(store) => store,
            None => {
                let store = SqliteInstanceStore::new(&config.database_url).await?;
                store.run_migrations().await?;
                Arc::new(store)
            }
        };

        let primary = self
            .primary_history
            .unwrap_or_else(|| Arc::new(MemoryHistorian::new(config.memory_history_limit)));
        let historian = Arc::new(Historian::new(primary, self.secondary_history));

        let state_manager = Arc::new(StateManager::new(
            Arc::clone(&store),
            Arc::clone(&historian),
            self.images.unwrap_or_else(|| Arc::new(NoopImageCapturer)),
            self.annotations.unwrap_or_else(|| Arc::new(NoopAnnotationSink)),
            config.result_history_limit,
        ));

        let token = CancellationToken::new();
        let scheduler = Scheduler::new(
            config.base_interval,
            rule_reader,
            evaluator,
            Arc::clone(&state_manager),
            token.clone(),
        );

        Ok(Engine { config, state_manager, historian, scheduler: Some(scheduler), token })
    }
}

/// The assembled evaluation engine.
pub struct Engine {
    config: EngineConfig,
    state_manager: Arc<StateManager>,
    historian: Arc<Historian>,
    scheduler: Option<Scheduler>,
    token: CancellationToken,
}

impl Engine {
    /// Returns a new [`EngineBuilder`].
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// The engine's read API: current per-series alert state.
    pub fn state_manager(&self) -> Arc<StateManager> {
        Arc::clone(&self.state_manager)
    }

    /// The historian fan-out, for history reads.
    pub fn historian(&self) -> Arc<Historian> {
        Arc::clone(&self.historian)
    }

    /// The token that cancels the whole engine. Embedders cancel it (for
    /// example from their signal handler) to initiate graceful shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Runs the engine until its token is cancelled.
    ///
    /// Warms the state cache from the instance store, runs the scheduler
    /// tick loop, and on shutdown flushes the cache best-effort within the
    /// configured timeout.
    pub async fn run(mut self) -> Result<(), EngineError> {
        self.state_manager.warm().await;

        let mut tasks = JoinSet::new();
        if let Some(scheduler) = self.scheduler.take() {
            tasks.spawn(scheduler.run());
        }

        loop {
            tokio::select! {
                maybe_result = tasks.join_next() => {
                    match maybe_result {
                        Some(Ok(())) => {}
                        Some(Err(e)) => {
                            tracing::error!(error = %e, "A scheduler task failed. Initiating shutdown.");
                            self.token.cancel();
                        }
                        None => break,
                    }
                }
                _ = self.token.cancelled() => break,
            }
        }

        // Cancellation has cascaded to every rule routine; wait for the tick
        // loop to drain, then persist what we have.
        tasks.shutdown().await;
        tracing::info!("All scheduler tasks have completed.");

        let flush = self.state_manager.flush();
        if tokio::time::timeout(self.config.shutdown_timeout, flush).await.is_err() {
            tracing::warn!(
                timeout_secs = self.config.shutdown_timeout.as_secs(),
                "Final state flush did not complete within the shutdown timeout."
            );
        }

        tracing::info!("Engine shutdown complete.");
        Ok(())
    }
}
