//! Test doubles for the kernel's external seams.
//!
//! Scripted mocks for the model provider, the scanner, the verifier, and
//! the webhook transport, so cycle logic can be tested deterministically
//! without subprocesses or a network.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::llm::{LlmClient, LlmResponse};
use crate::scanner::{RepoScanner, ScanResults};
use crate::sense::Candidate;
use crate::verifier::{TaskVerifier, VerificationResult, VerifyOutcome};
use crate::webhook::{PostOutcome, WebhookTransport};

// =============================================================================
// MockLlmClient
// =============================================================================

/// Scripted model provider.
///
/// Responses are consumed in order; an optional repeated response serves
/// every call once the script is exhausted.
#[derive(Debug, Default)]
pub struct MockLlmClient {
    responses: Mutex<VecDeque<String>>,
    repeated: Mutex<Option<String>>,
    calls: AtomicU32,
    models: Mutex<Vec<String>>,
}

impl MockLlmClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one scripted response.
    #[must_use]
    pub fn with_response(self, content: impl Into<String>) -> Self {
        self.responses.lock().unwrap().push_back(content.into());
        self
    }

    /// Serve this response for every call after the script runs out.
    #[must_use]
    pub fn with_repeated_response(self, content: impl Into<String>) -> Self {
        *self.repeated.lock().unwrap() = Some(content.into());
        self
    }

    /// Number of completions served.
    #[must_use]
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Model names in call order.
    #[must_use]
    pub fn models_called(&self) -> Vec<String> {
        self.models.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, model: &str, prompt: &str) -> Result<LlmResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.models.lock().unwrap().push(model.to_string());

        let content = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.repeated.lock().unwrap().clone())
            .ok_or_else(|| anyhow!("mock LLM has no scripted response left"))?;

        Ok(LlmResponse {
            prompt_tokens: (prompt.len() / 4) as u64,
            output_tokens: (content.len() / 4) as u64,
            model: model.to_string(),
            content,
        })
    }
}

// =============================================================================
// MockScanner
// =============================================================================

/// Scanner returning a fixed result set.
#[derive(Debug, Clone, Default)]
pub struct MockScanner {
    results: ScanResults,
}

impl MockScanner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_results(mut self, results: ScanResults) -> Self {
        self.results = results;
        self
    }
}

#[async_trait]
impl RepoScanner for MockScanner {
    async fn scan(&self) -> crate::error::Result<ScanResults> {
        Ok(self.results.clone())
    }
}

// =============================================================================
// MockVerifier
// =============================================================================

/// Verifier returning scripted results, then a repeated template.
#[derive(Debug, Default)]
pub struct MockVerifier {
    script: Mutex<VecDeque<VerificationResult>>,
    repeated: Mutex<Option<VerificationResult>>,
    calls: AtomicU32,
}

impl MockVerifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A verifier that always succeeds.
    #[must_use]
    pub fn succeeding() -> Self {
        Self::new().with_repeated_result(VerificationResult {
            outcome: VerifyOutcome::Success,
            exit_code: Some(0),
            output: "1 passed".to_string(),
            command: "mock-verify".to_string(),
            reason: None,
            rolled_back: false,
            auto_committed: false,
        })
    }

    /// A verifier that always fails with the given output.
    #[must_use]
    pub fn failing(output: impl Into<String>) -> Self {
        Self::new().with_repeated_result(VerificationResult {
            outcome: VerifyOutcome::Failure,
            exit_code: Some(1),
            output: output.into(),
            command: "mock-verify".to_string(),
            reason: None,
            rolled_back: false,
            auto_committed: false,
        })
    }

    /// Queue one scripted result.
    #[must_use]
    pub fn with_result(self, result: VerificationResult) -> Self {
        self.script.lock().unwrap().push_back(result);
        self
    }

    /// Serve this result for every call after the script runs out.
    #[must_use]
    pub fn with_repeated_result(self, result: VerificationResult) -> Self {
        *self.repeated.lock().unwrap() = Some(result);
        self
    }

    #[must_use]
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskVerifier for MockVerifier {
    async fn verify(&self, _task: &Candidate) -> VerificationResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.repeated.lock().unwrap().clone())
            .unwrap_or_else(|| VerificationResult::skipped("mock verifier has no script"))
    }
}

// =============================================================================
// MockWebhookTransport
// =============================================================================

/// Shared view of when each POST attempt happened.
#[derive(Debug, Clone, Default)]
pub struct AttemptRecorder {
    attempts: Arc<Mutex<Vec<Instant>>>,
}

impl AttemptRecorder {
    #[must_use]
    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    /// Gaps between consecutive attempts, for backoff assertions.
    #[must_use]
    pub fn attempt_gaps(&self) -> Vec<Duration> {
        let attempts = self.attempts.lock().unwrap();
        attempts.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

/// Scripted webhook transport recording attempt times.
#[derive(Debug, Default)]
pub struct MockWebhookTransport {
    script: Mutex<VecDeque<PostOutcome>>,
    repeated: Mutex<Option<PostOutcome>>,
    recorder: AttemptRecorder,
}

impl MockWebhookTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one response with the given HTTP status.
    #[must_use]
    pub fn with_status(self, status: u16) -> Self {
        self.script.lock().unwrap().push_back(PostOutcome {
            status: Some(status),
            retry_after: None,
            error: None,
        });
        self
    }

    /// Queue a 429 carrying a `Retry-After` duration.
    #[must_use]
    pub fn with_rate_limit(self, retry_after: Duration) -> Self {
        self.script.lock().unwrap().push_back(PostOutcome {
            status: Some(429),
            retry_after: Some(retry_after),
            error: None,
        });
        self
    }

    /// Serve this status for every call after the script runs out.
    #[must_use]
    pub fn with_repeated_status(self, status: u16) -> Self {
        *self.repeated.lock().unwrap() = Some(PostOutcome {
            status: Some(status),
            retry_after: None,
            error: None,
        });
        self
    }

    /// Handle for asserting on attempt timing after the notifier consumed
    /// the transport.
    #[must_use]
    pub fn recorder(&self) -> AttemptRecorder {
        self.recorder.clone()
    }
}

#[async_trait]
impl WebhookTransport for MockWebhookTransport {
    async fn post(
        &self,
        _url: &str,
        _body: &serde_json::Value,
        _idempotency_key: &str,
    ) -> PostOutcome {
        self.recorder.attempts.lock().unwrap().push(Instant::now());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.repeated.lock().unwrap().clone())
            .unwrap_or(PostOutcome {
                status: None,
                retry_after: None,
                error: Some("mock transport has no scripted response".to_string()),
            })
    }
}
