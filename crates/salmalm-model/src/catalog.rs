// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Static model catalog: per-model token rates used by the usage meter, and
//! the per-provider fallback models used by the gateway's failover chain.
//! Matched by substring so dated model revisions inherit their family rate.

/// (model-id fragment, USD per 1M input tokens, USD per 1M output tokens)
const RATES: &[(&str, f64, f64)] = &[
    // Anthropic
    ("claude-opus", 15.0, 75.0),
    ("claude-sonnet", 3.0, 15.0),
    ("claude-haiku", 0.80, 4.0),
    ("claude-3-5-haiku", 0.80, 4.0),
    // OpenAI
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-4o", 2.50, 10.0),
    ("gpt-4.1-mini", 0.40, 1.60),
    ("gpt-4.1", 2.0, 8.0),
    ("o4-mini", 1.10, 4.40),
    ("o3", 2.0, 8.0),
    // xAI
    ("grok-3-mini", 0.30, 0.50),
    ("grok-3", 3.0, 15.0),
    ("grok-4", 3.0, 15.0),
    // Google
    ("gemini-2.5-pro", 1.25, 10.0),
    ("gemini-2.5-flash", 0.30, 2.50),
    ("gemini-2.0-flash", 0.10, 0.40),
];

/// Cost in USD for one call. Unknown models (local Ollama, OpenRouter
/// passthroughs without a rate entry) cost zero.
pub fn cost_usd(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let Some((_, input_rate, output_rate)) =
        RATES.iter().find(|(fragment, _, _)| model.contains(fragment))
    else {
        return 0.0;
    };
    (input_tokens as f64 * input_rate + output_tokens as f64 * output_rate) / 1_000_000.0
}

/// Model used when falling back to `provider` after a primary failure.
pub fn fallback_model(provider: &str) -> Option<&'static str> {
    match provider {
        "anthropic" => Some("claude-sonnet-4-5"),
        "xai" => Some("grok-3"),
        "google" => Some("gemini-2.5-flash"),
        "openai" => Some("gpt-4o"),
        _ => None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
