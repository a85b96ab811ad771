//! LlmClient trait definition

use std::time::Duration;

use async_trait::async_trait;

use super::LlmError;

/// One single-shot completion request. Each call is independent; the loop
/// prompt carries all context the model needs.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub prompt: String,
    pub max_tokens: u32,
    /// Per-call deadline; the provider call is abandoned past it
    pub timeout: Duration,
}

impl CompletionRequest {
    pub fn new(system_prompt: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            prompt: prompt.into(),
            max_tokens: 8192,
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Token accounting for one call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// The provider's raw reply; structured content is recovered by the parser
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub text: String,
    pub usage: TokenUsage,
}

/// Stateless LLM provider seam. Implementations wrap external CLI or HTTP
/// providers; the daemon never sees past this trait.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Provider name, for routing decisions and logs
    fn name(&self) -> &str;

    /// Send one completion request
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Cheap availability check used at daemon startup
    async fn probe(&self) -> Result<(), LlmError>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Mock LLM client for unit tests: returns scripted responses in order
    pub struct MockLlmClient {
        responses: Mutex<Vec<Result<String, LlmError>>>,
        call_count: AtomicUsize,
    }

    impl MockLlmClient {
        pub fn new(responses: Vec<Result<String, LlmError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                call_count: AtomicUsize::new(0),
            }
        }

        /// Convenience: every call succeeds with the same text
        pub fn always(text: &str) -> Self {
            Self::new(vec![Ok(text.to_string())])
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmClient for MockLlmClient {
        fn name(&self) -> &str {
            "mock"
        }

        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            let next = if responses.len() > 1 {
                responses.remove(0)
            } else {
                // Last response repeats forever
                match responses.first() {
                    Some(Ok(text)) => Ok(text.clone()),
                    Some(Err(_)) | None => Err(LlmError::Unavailable("no more mock responses".into())),
                }
            };
            next.map(|text| CompletionResponse {
                text,
                usage: TokenUsage::default(),
            })
        }

        async fn probe(&self) -> Result<(), LlmError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_mock_returns_scripted_responses() {
        let client = MockLlmClient::new(vec![Ok("one".into()), Ok("two".into())]);
        let req = CompletionRequest::new("sys", "hi");

        assert_eq!(client.complete(req.clone()).await.unwrap().text, "one");
        assert_eq!(client.complete(req.clone()).await.unwrap().text, "two");
        // Last response repeats
        assert_eq!(client.complete(req).await.unwrap().text, "two");
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn test_mock_scripted_error() {
        let client = MockLlmClient::new(vec![
            Err(LlmError::Api { status: 503, message: "busy".into() }),
            Ok("recovered".into()),
        ]);
        let req = CompletionRequest::new("sys", "hi");

        assert!(client.complete(req.clone()).await.is_err());
        assert_eq!(client.complete(req).await.unwrap().text, "recovered");
    }
}
