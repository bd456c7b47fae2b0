//! Webhook notification with bounded retry and idempotency.
//!
//! Cycle-end and PAUSED events go out as an HTTP POST. Delivery is best
//! effort: transport errors, 5xx, and 429 are retried with exponential
//! backoff and jitter under a hard wall-clock ceiling, and a failed
//! delivery is recorded as a warning, never a cycle failure.

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Retries after the first attempt.
pub const WEBHOOK_MAX_RETRIES: u32 = 3;

/// Base backoff delay.
pub const WEBHOOK_BASE_DELAY: Duration = Duration::from_millis(500);

/// Cap on a single backoff delay.
pub const WEBHOOK_MAX_DELAY: Duration = Duration::from_secs(30);

/// Maximum random jitter added to each delay.
pub const WEBHOOK_JITTER: Duration = Duration::from_millis(250);

/// Per-attempt HTTP timeout.
pub const WEBHOOK_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Hard ceiling on total delivery wall time.
pub const WEBHOOK_TOTAL_CEILING: Duration = Duration::from_secs(60);

/// Idempotency key for one event: `cycle_id:event_name`.
///
/// Receivers may deduplicate on it; the same cycle and event always yield
/// the same key.
#[must_use]
pub fn idempotency_key(cycle_id: &str, event_name: &str) -> String {
    format!("{cycle_id}:{event_name}")
}

/// Event payload shipped to the webhook endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEvent {
    pub cycle_id: String,
    pub status: String,
    pub workspace: String,
    pub summary: String,
    pub idempotency_key: String,
    pub ts: String,
}

impl WebhookEvent {
    #[must_use]
    pub fn new(
        cycle_id: &str,
        event_name: &str,
        status: &str,
        workspace: &str,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            cycle_id: cycle_id.to_string(),
            status: status.to_string(),
            workspace: workspace.to_string(),
            summary: summary.into(),
            idempotency_key: idempotency_key(cycle_id, event_name),
            ts: Utc::now().to_rfc3339(),
        }
    }
}

/// What one POST attempt produced.
#[derive(Debug, Clone, Default)]
pub struct PostOutcome {
    /// HTTP status, when a response arrived.
    pub status: Option<u16>,
    /// `Retry-After` value on a 429, when present.
    pub retry_after: Option<Duration>,
    /// Transport-level error, when no response arrived.
    pub error: Option<String>,
}

impl PostOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.status, Some(code) if (200..300).contains(&code))
    }

    /// Whether this outcome is worth retrying (transport error, 5xx, 429).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self.status {
            None => true,
            Some(429) => true,
            Some(code) => (500..600).contains(&code),
        }
    }
}

/// One HTTP POST attempt. Seam for testing the retry policy.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post(&self, url: &str, body: &serde_json::Value, idempotency_key: &str)
        -> PostOutcome;
}

/// Production transport over reqwest.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    #[must_use]
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_ATTEMPT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn post(
        &self,
        url: &str,
        body: &serde_json::Value,
        idempotency_key: &str,
    ) -> PostOutcome {
        let response = self
            .client
            .post(url)
            .header("X-Idempotency-Key", idempotency_key)
            .json(body)
            .send()
            .await;
        match response {
            Ok(resp) => {
                let retry_after = resp
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs);
                PostOutcome {
                    status: Some(resp.status().as_u16()),
                    retry_after,
                    error: None,
                }
            }
            Err(e) => PostOutcome {
                status: None,
                retry_after: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Delivery record for the cycle report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    pub delivered: bool,
    pub attempts: u32,
}

/// Delivers cycle events with bounded retry.
pub struct WebhookNotifier {
    url: String,
    transport: Box<dyn WebhookTransport>,
    max_retries: u32,
    base_delay: Duration,
    jitter: Duration,
    ceiling: Duration,
}

impl WebhookNotifier {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            transport: Box::new(HttpTransport::new()),
            max_retries: WEBHOOK_MAX_RETRIES,
            base_delay: WEBHOOK_BASE_DELAY,
            jitter: WEBHOOK_JITTER,
            ceiling: WEBHOOK_TOTAL_CEILING,
        }
    }

    /// Swap the transport (tests use a scripted mock).
    #[must_use]
    pub fn with_transport(mut self, transport: Box<dyn WebhookTransport>) -> Self {
        self.transport = transport;
        self
    }

    /// Disable jitter for deterministic timing tests.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = Duration::ZERO;
        self
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(WEBHOOK_MAX_DELAY);
        if self.jitter.is_zero() {
            return base;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        base + Duration::from_millis(jitter_ms)
    }

    /// Deliver one event, retrying on transport errors, 5xx, and 429.
    ///
    /// On 429 a `Retry-After` header overrides the computed backoff. Total
    /// wall time is bounded by the ceiling; exceeding it records a
    /// delivery failure.
    pub async fn notify(&self, event: &WebhookEvent) -> DeliveryResult {
        let body = json!(event);
        let started = Instant::now();
        let mut attempts = 0;

        for attempt in 0..=self.max_retries {
            attempts += 1;
            let outcome = self
                .transport
                .post(&self.url, &body, &event.idempotency_key)
                .await;

            if outcome.is_success() {
                info!(
                    "webhook delivered (attempts={attempts}, key={})",
                    event.idempotency_key
                );
                return DeliveryResult {
                    delivered: true,
                    attempts,
                };
            }

            if !outcome.is_retryable() {
                warn!(
                    "webhook rejected with status {:?}; not retrying",
                    outcome.status
                );
                return DeliveryResult {
                    delivered: false,
                    attempts,
                };
            }

            if attempt == self.max_retries {
                break;
            }

            let delay = match (outcome.status, outcome.retry_after) {
                (Some(429), Some(retry_after)) => retry_after,
                _ => self.backoff_delay(attempt),
            };

            if started.elapsed() + delay > self.ceiling {
                warn!(
                    "webhook delivery ceiling reached after {attempts} attempt(s) (key={})",
                    event.idempotency_key
                );
                return DeliveryResult {
                    delivered: false,
                    attempts,
                };
            }

            debug!(
                "webhook attempt {attempts} failed ({:?}); retrying in {:?}",
                outcome.status.or(Some(0)),
                delay
            );
            tokio::time::sleep(delay).await;
        }

        warn!(
            "webhook delivery failed after {attempts} attempt(s) (key={})",
            event.idempotency_key
        );
        DeliveryResult {
            delivered: false,
            attempts,
        }
    }
}
