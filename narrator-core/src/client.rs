//! The completion seam used by the router and the orchestrator.

use async_trait::async_trait;
use claude::{Claude, Request, Response};

/// Anything that can answer a Messages API request.
///
/// [`Claude`] is the production implementation; tests use
/// [`crate::testing::MockClient`].
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: Request) -> Result<Response, claude::Error>;
}

#[async_trait]
impl CompletionClient for Claude {
    async fn complete(&self, request: Request) -> Result<Response, claude::Error> {
        Claude::complete(self, request).await
    }
}
