//! NarratorSession - the primary public API.
//!
//! A session owns one orchestrator and its per-session state (sticky context,
//! window, scene, cost totals). The handle is cheap to clone; every clone
//! talks to the same orchestrator, and input submitted while a turn is in
//! flight is rejected with [`NarratorError::Busy`].

use crate::client::CompletionClient;
use crate::config::NarratorConfig;
use crate::entity::EntityError;
use crate::orchestrator::{Orchestrator, Turn};
use crate::prompt::CallType;
use crate::store::EntityStore;
use claude::Claude;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors surfaced to the caller of a session.
#[derive(Debug, Error)]
pub enum NarratorError {
    #[error("a turn is already in progress")]
    Busy,

    #[error("generation failed: {0}")]
    GenerationFailed(String),

    #[error("entity error: {0}")]
    Entity(#[from] EntityError),

    #[error("No API key configured - set ANTHROPIC_API_KEY environment variable")]
    NoApiKey,
}

/// A narrator session handle.
#[derive(Clone)]
pub struct NarratorSession {
    inner: Arc<Mutex<Orchestrator>>,
}

impl NarratorSession {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            inner: Arc::new(Mutex::new(orchestrator)),
        }
    }

    /// Build a session over the given store with a client from the
    /// environment.
    ///
    /// Requires `ANTHROPIC_API_KEY` environment variable to be set.
    pub fn from_env(store: Arc<dyn EntityStore>, config: NarratorConfig) -> Result<Self, NarratorError> {
        let client = Claude::from_env()
            .map_err(|_| NarratorError::NoApiKey)?
            .with_model(&config.generation_model);
        Ok(Self::with_client(Arc::new(client), store, config))
    }

    pub fn with_client(
        client: Arc<dyn CompletionClient>,
        store: Arc<dyn EntityStore>,
        config: NarratorConfig,
    ) -> Self {
        Self::new(Orchestrator::new(client, store, config))
    }

    /// Submit one player input.
    ///
    /// The turn runs on its own task: once accepted it runs to completion even
    /// if the returned future is dropped, and the session stays busy until then.
    pub async fn submit(
        &self,
        call_type: CallType,
        player_input: impl Into<String>,
    ) -> Result<Turn, NarratorError> {
        let mut orchestrator = self
            .inner
            .clone()
            .try_lock_owned()
            .map_err(|_| NarratorError::Busy)?;
        let player_input = player_input.into();

        tokio::spawn(async move { orchestrator.handle_input(call_type, &player_input).await })
            .await
            .map_err(|e| NarratorError::GenerationFailed(format!("turn task failed: {e}")))?
    }

    /// Run a closure against the orchestrator if no turn is in flight.
    pub fn try_with<R>(&self, f: impl FnOnce(&mut Orchestrator) -> R) -> Result<R, NarratorError> {
        let mut orchestrator = self.inner.try_lock().map_err(|_| NarratorError::Busy)?;
        Ok(f(&mut orchestrator))
    }

    /// Whether a turn is in flight.
    pub fn is_busy(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}
