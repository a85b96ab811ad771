//! Single-shot provider router
//!
//! Picks a provider from the task context (reasoning need, complexity,
//! priority), retries transient failures with exponential backoff, and
//! falls through to the next candidate when a provider fails permanently.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::domain::Priority;

use super::{CompletionRequest, CompletionResponse, LlmClient, LlmError};

/// Rough complexity of the work in the current loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

/// Per-call routing inputs
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskContext {
    pub reasoning: bool,
    pub complexity: Complexity,
    pub priority: Priority,
}

/// Attempts per provider before giving up on it
const MAX_ATTEMPTS: u32 = 3;

/// Router over one or more providers
pub struct LlmRouter {
    /// Default provider for routine loops
    primary: Arc<dyn LlmClient>,
    /// Stronger provider for reasoning-heavy or high-stakes loops
    reasoning: Option<Arc<dyn LlmClient>>,
    /// Last resort when the picked provider fails permanently
    fallback: Option<Arc<dyn LlmClient>>,
}

impl LlmRouter {
    pub fn new(primary: Arc<dyn LlmClient>) -> Self {
        Self {
            primary,
            reasoning: None,
            fallback: None,
        }
    }

    pub fn with_reasoning(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.reasoning = Some(client);
        self
    }

    pub fn with_fallback(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.fallback = Some(client);
        self
    }

    /// Ordered provider candidates for a task context
    fn candidates(&self, ctx: &TaskContext) -> Vec<Arc<dyn LlmClient>> {
        let wants_reasoning = ctx.reasoning
            || ctx.complexity == Complexity::High
            || ctx.priority >= Priority::Urgent;

        let mut out: Vec<Arc<dyn LlmClient>> = Vec::new();
        if wants_reasoning {
            if let Some(reasoning) = &self.reasoning {
                out.push(reasoning.clone());
            }
        }
        out.push(self.primary.clone());
        if let Some(fallback) = &self.fallback {
            out.push(fallback.clone());
        }
        out
    }

    /// Complete with retries and provider fallback.
    ///
    /// Transient errors retry the same provider up to [`MAX_ATTEMPTS`] with
    /// 1 s / 2 s / 4 s backoff (or the provider's own retry-after); permanent
    /// errors move to the next candidate immediately.
    pub async fn complete(
        &self,
        ctx: &TaskContext,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        let mut last_error = LlmError::Unavailable("no providers configured".into());

        for client in self.candidates(ctx) {
            match Self::complete_on(client.as_ref(), request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!(provider = client.name(), error = %e, "Provider failed, trying next");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn complete_on(
        client: &dyn LlmClient,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        let timeout = request.timeout;
        let mut attempt = 1u32;
        loop {
            debug!(provider = client.name(), attempt, "LLM call");
            let result = tokio::time::timeout(timeout, client.complete(request.clone()))
                .await
                .map_err(|_| LlmError::Timeout(timeout))
                .and_then(|r| r);

            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    let backoff = e
                        .retry_after()
                        .unwrap_or_else(|| Duration::from_secs(1 << (attempt - 1)));
                    debug!(provider = client.name(), attempt, ?backoff, "Retrying after transient LLM error");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Availability probe with a bounded retry (single attempt, 5 s)
    pub async fn probe(&self) -> bool {
        let probe = tokio::time::timeout(Duration::from_secs(5), self.primary.probe()).await;
        matches!(probe, Ok(Ok(())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::mock::MockLlmClient;

    fn req() -> CompletionRequest {
        CompletionRequest::new("sys", "hi").with_timeout(Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let client = Arc::new(MockLlmClient::new(vec![
            Err(LlmError::Api { status: 503, message: "busy".into() }),
            Err(LlmError::Api { status: 503, message: "busy".into() }),
            Ok("third time".into()),
        ]));
        let router = LlmRouter::new(client.clone());

        let response = router.complete(&TaskContext::default(), req()).await.unwrap();
        assert_eq!(response.text, "third time");
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_does_not_retry() {
        let client = Arc::new(MockLlmClient::new(vec![
            Err(LlmError::Auth("bad key".into())),
            Ok("never reached".into()),
        ]));
        let router = LlmRouter::new(client.clone());

        let result = router.complete(&TaskContext::default(), req()).await;
        assert!(matches!(result, Err(LlmError::Auth(_))));
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn test_fallback_provider_is_used() {
        let primary = Arc::new(MockLlmClient::new(vec![Err(LlmError::Auth("bad key".into()))]));
        let fallback = Arc::new(MockLlmClient::always("from fallback"));
        let router = LlmRouter::new(primary).with_fallback(fallback.clone());

        let response = router.complete(&TaskContext::default(), req()).await.unwrap();
        assert_eq!(response.text, "from fallback");
    }

    #[tokio::test]
    async fn test_reasoning_context_prefers_reasoning_provider() {
        let primary = Arc::new(MockLlmClient::always("primary"));
        let reasoning = Arc::new(MockLlmClient::always("reasoning"));
        let router = LlmRouter::new(primary).with_reasoning(reasoning);

        let ctx = TaskContext {
            reasoning: true,
            ..Default::default()
        };
        let response = router.complete(&ctx, req()).await.unwrap();
        assert_eq!(response.text, "reasoning");

        // Routine work still goes to the primary
        let response = router.complete(&TaskContext::default(), req()).await.unwrap();
        assert_eq!(response.text, "primary");
    }

    #[tokio::test]
    async fn test_urgent_priority_routes_to_reasoning() {
        let primary = Arc::new(MockLlmClient::always("primary"));
        let reasoning = Arc::new(MockLlmClient::always("reasoning"));
        let router = LlmRouter::new(primary).with_reasoning(reasoning);

        let ctx = TaskContext {
            priority: Priority::Urgent,
            ..Default::default()
        };
        assert_eq!(router.complete(&ctx, req()).await.unwrap().text, "reasoning");
    }

    #[tokio::test]
    async fn test_probe_ok() {
        let router = LlmRouter::new(Arc::new(MockLlmClient::always("pong")));
        assert!(router.probe().await);
    }
}
