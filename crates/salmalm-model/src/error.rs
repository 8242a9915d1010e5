// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::OnceLock;

use regex::Regex;

/// Failures from one provider HTTP exchange.
///
/// `Http` carries transient statuses the caller may retry; the named variants
/// are terminal for the current provider (the gateway decides whether to
/// surface them or fall back).
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Invalid API key (401). Please check your key.")]
    Auth,
    #[error("Insufficient API credits (402). Check billing info.")]
    InsufficientCredits,
    #[error("Access forbidden (403): {0}")]
    Forbidden(String),
    #[error("model requires the responses endpoint: {0}")]
    ResponsesOnly(String),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
}

impl LlmError {
    /// Transient errors worth another attempt with backoff: HTTP 429 and the
    /// 5xx family (529 is Anthropic's overloaded status), connection errors,
    /// and read timeouts.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { status, .. } => {
                matches!(status, 429 | 500 | 502 | 503 | 504 | 529)
            }
            Self::Network(_) | Self::Timeout => true,
            _ => false,
        }
    }

    /// True when the provider reported the prompt exceeded its context
    /// window. The gateway must not fall back on this — the caller compacts
    /// and retries instead.
    pub fn is_token_overflow(&self) -> bool {
        let msg = self.to_string();
        msg.contains("prompt is too long") || msg.to_lowercase().contains("maximum context")
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(scrub_secrets(&e.to_string()))
        }
    }
}

/// Replace credential-shaped runs (≥20 chars of `[A-Za-z0-9_-]`) with `***`
/// so API keys never reach the logs through error bodies.
pub fn scrub_secrets(text: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"[A-Za-z0-9_\-]{20,}").expect("static regex"));
    re.replace_all(text, "***").into_owned()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        for status in [429u16, 500, 502, 503, 504, 529] {
            assert!(
                LlmError::Http { status, body: String::new() }.is_retryable(),
                "{status} should be retryable"
            );
        }
        for status in [400u16, 401, 402, 403, 404] {
            assert!(!LlmError::Http { status, body: String::new() }.is_retryable());
        }
    }

    #[test]
    fn auth_and_credits_are_terminal() {
        assert!(!LlmError::Auth.is_retryable());
        assert!(!LlmError::InsufficientCredits.is_retryable());
    }

    #[test]
    fn token_overflow_detection() {
        let e = LlmError::Http {
            status: 400,
            body: "prompt is too long: 210000 tokens".into(),
        };
        assert!(e.is_token_overflow());
        let e = LlmError::Http {
            status: 400,
            body: "input exceeds the Maximum Context length".into(),
        };
        assert!(e.is_token_overflow());
        assert!(!LlmError::Auth.is_token_overflow());
    }

    #[test]
    fn scrub_masks_long_tokens() {
        let body = r#"{"error":"key sk-ant-REDACTED rejected"}"#;
        let scrubbed = scrub_secrets(body);
        assert!(!scrubbed.contains("AbCdEfGhIjKlMnOpQrStUv"));
        assert!(scrubbed.contains("***"));
    }

    #[test]
    fn scrub_keeps_short_words() {
        assert_eq!(scrub_secrets("rate limit exceeded"), "rate limit exceeded");
    }
}
