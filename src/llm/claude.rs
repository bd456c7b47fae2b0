//! Claude CLI provider.
//!
//! Wraps the `claude` CLI in print mode: the prompt goes in on stdin, the
//! completion comes back on stdout. Token counts are estimated from
//! character lengths (~4 chars per token) because the CLI's text output
//! format does not report usage.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{LlmClient, LlmResponse};

/// Rough token estimate: characters per token.
const CHARS_PER_TOKEN: usize = 4;

/// Production LLM client backed by the `claude` CLI.
#[derive(Debug, Clone)]
pub struct ClaudeCliClient {
    /// Working directory for CLI execution.
    project_dir: PathBuf,
    /// Per-request timeout.
    timeout: Duration,
}

impl ClaudeCliClient {
    /// Default per-request timeout (5 minutes).
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

    #[must_use]
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Override the per-request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run_cli(&self, model: &str, prompt: &str) -> Result<String> {
        debug!(model, prompt_chars = prompt.len(), "running claude CLI");

        let mut child = Command::new("claude")
            .args(["-p", "--model", model, "--output-format", "text"])
            .current_dir(&self.project_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    anyhow!("the 'claude' CLI is not installed or not in PATH")
                } else {
                    anyhow!("failed to spawn claude process: {e}")
                }
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| anyhow!("failed to write prompt to stdin: {e}"))?;
            stdin
                .flush()
                .await
                .map_err(|e| anyhow!("failed to flush stdin: {e}"))?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow!("model call timed out after {}s", self.timeout.as_secs()))?
            .map_err(|e| anyhow!("failed to read model output: {e}"))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(anyhow!(
                "model process exited with {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ))
        }
    }
}

#[async_trait]
impl LlmClient for ClaudeCliClient {
    async fn complete(&self, model: &str, prompt: &str) -> Result<LlmResponse> {
        let content = self.run_cli(model, prompt).await?;
        Ok(LlmResponse {
            prompt_tokens: (prompt.len() / CHARS_PER_TOKEN) as u64,
            output_tokens: (content.len() / CHARS_PER_TOKEN) as u64,
            model: model.to_string(),
            content,
        })
    }
}
