// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;

use crate::error::LlmError;
use crate::types::{LlmResult, StreamEvent, ThinkingLevel};

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// One provider call, already adapted to the target wire format by
/// [`crate::adapter::adapt`] / [`crate::adapter::adapt_tools`].
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub model_id: String,
    pub api_key: String,
    /// Provider-ready conversation messages.
    pub messages: Vec<Value>,
    /// Merged system prompt (Anthropic only; empty string for none).
    pub system_text: Option<String>,
    /// Provider-ready tool definitions.
    pub tools: Vec<Value>,
    pub max_tokens: u32,
    pub thinking: ThinkingLevel,
    /// Omitted from the request when `None` (extended thinking disallows it).
    pub temperature: Option<f32>,
    pub timeout: Duration,
}

/// A single provider's HTTP surface: one-shot and streaming calls. Parsing
/// of the provider-native response into [`LlmResult`] lives behind this
/// trait; retries and fallbacks are the gateway's business.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn name(&self) -> &'static str;

    async fn call(&self, req: ProviderRequest) -> Result<LlmResult, LlmError>;

    /// Lazy finite event sequence, ending with `MessageEnd` (or `Error`).
    async fn stream(&self, req: ProviderRequest) -> Result<EventStream, LlmError>;
}

/// Split a `provider/model-id` string. A bare model id defaults to
/// `anthropic`, mirroring the routing table's primary provider.
pub fn split_model(model: &str) -> (&str, &str) {
    match model.split_once('/') {
        Some((provider, id)) => (provider, id),
        None => ("anthropic", model),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_with_provider() {
        assert_eq!(
            split_model("openai/gpt-4o"),
            ("openai", "gpt-4o")
        );
    }

    #[test]
    fn split_bare_model_defaults_to_anthropic() {
        assert_eq!(
            split_model("claude-sonnet-4-5"),
            ("anthropic", "claude-sonnet-4-5")
        );
    }

    #[test]
    fn split_keeps_extra_slashes_in_model_id() {
        assert_eq!(
            split_model("openrouter/meta-llama/llama-3.3-70b"),
            ("openrouter", "meta-llama/llama-3.3-70b")
        );
    }
}
