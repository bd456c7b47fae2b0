//! Model provider seam.
//!
//! The kernel never synthesizes patches itself; it hands a prompt to an
//! [`LlmClient`] and validates whatever comes back. The production client
//! wraps the `claude` CLI; tests use the scripted mock in
//! [`crate::testing`].

pub mod claude;

use anyhow::Result;
use async_trait::async_trait;

pub use claude::ClaudeCliClient;

/// Default model for patch generation.
pub const DEFAULT_MODEL: &str = "sonnet";

/// Escalation model used once after the default model is exhausted.
pub const DEFAULT_STRONG_MODEL: &str = "opus";

/// One model completion.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub prompt_tokens: u64,
    pub output_tokens: u64,
    pub model: String,
}

/// A provider that turns prompts into completions.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run one prompt against the named model.
    async fn complete(&self, model: &str, prompt: &str) -> Result<LlmResponse>;
}

// =============================================================================
// Price table
// =============================================================================

/// Cost per million tokens (input, output) in USD for known models.
///
/// Unknown models fall back to the default-model rate so cost estimates
/// stay conservative rather than silently zero.
#[must_use]
pub fn cost_per_million_tokens(model: &str) -> (f64, f64) {
    let name = model.to_lowercase();
    if name.contains("opus") {
        (15.0, 75.0)
    } else if name.contains("haiku") {
        (0.25, 1.25)
    } else {
        // sonnet and anything unrecognized
        (3.0, 15.0)
    }
}

/// Estimated USD cost of one call, rounded to 6 decimal places.
#[must_use]
pub fn estimate_cost_usd(model: &str, prompt_tokens: u64, output_tokens: u64) -> f64 {
    let (input_rate, output_rate) = cost_per_million_tokens(model);
    let cost = prompt_tokens as f64 * input_rate / 1_000_000.0
        + output_tokens as f64 * output_rate / 1_000_000.0;
    (cost * 1_000_000.0).round() / 1_000_000.0
}
