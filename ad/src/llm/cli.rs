//! CLI provider client
//!
//! Wraps an external LLM command-line provider: one subprocess per
//! completion, prompt on argv, reply on stdout. The daemon never assumes
//! anything else about the provider.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use super::{CompletionRequest, CompletionResponse, LlmClient, LlmError, TokenUsage};

/// LLM client shelling out to a provider CLI
pub struct CliLlmClient {
    name: String,
    command: String,
    base_args: Vec<String>,
}

impl CliLlmClient {
    pub fn new(name: impl Into<String>, command: impl Into<String>, base_args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            base_args,
        }
    }

    async fn run(&self, args: Vec<String>, timeout: Duration) -> Result<String, LlmError> {
        let mut child = tokio::process::Command::new(&self.command)
            .args(&self.base_args)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| LlmError::Unavailable(format!("spawn {}: {}", self.command, e)))?;

        let stdout = child.stdout.take();
        let reader = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut out) = stdout {
                let _ = out.read_to_string(&mut buf).await;
            }
            buf
        });

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(reader.await.unwrap_or_default()),
            Ok(Ok(status)) => {
                let code = status.code().unwrap_or(-1);
                warn!(command = %self.command, code, "Provider CLI failed");
                Err(LlmError::Api {
                    status: 500,
                    message: format!("provider exited with code {}", code),
                })
            }
            Ok(Err(e)) => Err(LlmError::Unavailable(e.to_string())),
            Err(_) => {
                debug!(command = %self.command, ?timeout, "Provider CLI timed out, sending SIGTERM");
                if let Some(pid) = child.id() {
                    let _ = nix::sys::signal::kill(
                        nix::unistd::Pid::from_raw(pid as i32),
                        nix::sys::signal::Signal::SIGTERM,
                    );
                }
                let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
                let _ = child.kill().await;
                Err(LlmError::Timeout(timeout))
            }
        }
    }
}

#[async_trait]
impl LlmClient for CliLlmClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let args = vec![
            "--system".to_string(),
            request.system_prompt.clone(),
            "-p".to_string(),
            request.prompt.clone(),
        ];
        let text = self.run(args, request.timeout).await?;
        if text.trim().is_empty() {
            return Err(LlmError::InvalidInput("provider returned no output".to_string()));
        }
        Ok(CompletionResponse {
            text,
            usage: TokenUsage::default(),
        })
    }

    async fn probe(&self) -> Result<(), LlmError> {
        self.run(vec!["--version".to_string()], Duration::from_secs(5))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `sh -c` stands in for a provider CLI in these tests

    #[tokio::test]
    async fn test_successful_run_returns_stdout() {
        let client = CliLlmClient::new("echo", "sh", vec!["-c".into(), "echo pong #".into()]);
        let out = client.run(vec![], Duration::from_secs(5)).await.unwrap();
        assert_eq!(out.trim(), "pong");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_an_api_error() {
        let client = CliLlmClient::new("fail", "sh", vec!["-c".into(), "exit 3 #".into()]);
        let err = client.run(vec![], Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, LlmError::Api { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_command_is_unavailable() {
        let client = CliLlmClient::new("ghost", "/nonexistent/llm-cli", vec![]);
        let err = client.probe().await.unwrap_err();
        assert!(matches!(err, LlmError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_timeout_kills_the_process() {
        let client = CliLlmClient::new("slow", "sh", vec!["-c".into(), "sleep 30 #".into()]);
        let start = std::time::Instant::now();
        let err = client.run(vec![], Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, LlmError::Timeout(_)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
