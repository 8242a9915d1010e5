// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Heuristic model routing: classify the message into an intent, pick a
//! price tier from intent/length/complexity hints, then select the first
//! provider (in preference order) that has a key in the vault.

use std::sync::Mutex;
use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Chat,
    Code,
    Analysis,
    Search,
    System,
    Creative,
    File,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Code => "code",
            Self::Analysis => "analysis",
            Self::Search => "search",
            Self::System => "system",
            Self::Creative => "creative",
            Self::File => "file",
        }
    }
}

/// Tier 1 = cheap/fast, 2 = balanced, 3 = flagship.
pub type Tier = u8;

/// Per-provider models for tiers [1, 2, 3], in provider preference order.
/// The first provider with a vault key wins.
const ROUTES: &[(&str, [&str; 3])] = &[
    ("anthropic", ["claude-haiku-4-5", "claude-sonnet-4-5", "claude-opus-4-1"]),
    ("openai", ["gpt-4o-mini", "gpt-4o", "gpt-4.1"]),
    ("google", ["gemini-2.0-flash", "gemini-2.5-flash", "gemini-2.5-pro"]),
    ("xai", ["grok-3-mini", "grok-3", "grok-4"]),
    ("openrouter", ["deepseek/deepseek-chat", "deepseek/deepseek-chat", "deepseek/deepseek-r1"]),
    ("ollama", ["llama3.2", "llama3.2", "llama3.2"]),
];

pub struct ModelRouter {
    forced: Mutex<Option<String>>,
}

impl ModelRouter {
    pub fn new() -> Self {
        Self { forced: Mutex::new(None) }
    }

    /// Force every route to a fixed `provider/model` (the `/model` command).
    /// `None` restores automatic routing.
    pub fn set_forced(&self, model: Option<String>) {
        *self.forced.lock().expect("router lock") = model;
    }

    pub fn forced(&self) -> Option<String> {
        self.forced.lock().expect("router lock").clone()
    }

    /// Pick `provider/model-id` for a message. `available` lists providers
    /// that currently have a key in the vault.
    pub fn route(&self, text: &str, has_tools: bool, available: &[String]) -> String {
        if let Some(forced) = self.forced() {
            return forced;
        }
        let intent = classify(text);
        let tier = pick_tier(text, intent, has_tools);
        for (provider, models) in ROUTES {
            if available.iter().any(|a| a == provider) {
                let model = models[(tier - 1) as usize];
                return format!("{provider}/{model}");
            }
        }
        // No keys at all; the gateway will produce the key-missing message.
        let (provider, models) = ROUTES[0];
        format!("{provider}/{}", models[(tier - 1) as usize])
    }
}

impl Default for ModelRouter {
    fn default() -> Self {
        Self::new()
    }
}

pub fn classify(text: &str) -> Intent {
    struct Patterns {
        code: Regex,
        analysis: Regex,
        search: Regex,
        system: Regex,
        creative: Regex,
        file: Regex,
    }
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    let p = PATTERNS.get_or_init(|| Patterns {
        code: Regex::new(
            r"(?i)\b(code|debug|refactor|compile|function|implement|stack ?trace|bug|error|regex|sql|python|rust|javascript)\b",
        )
        .expect("static regex"),
        analysis: Regex::new(r"(?i)\b(analy[sz]e|compare|evaluate|review|explain why|summar|assess|trade-?off)\b")
            .expect("static regex"),
        search: Regex::new(r"(?i)\b(search|find|look ?up|latest|news|weather|price)\b")
            .expect("static regex"),
        system: Regex::new(r"(?i)^/(queue|model|session|status|help)|\b(restart|shutdown|config)\b")
            .expect("static regex"),
        creative: Regex::new(r"(?i)\b(write|story|poem|essay|draft|compose|brainstorm)\b")
            .expect("static regex"),
        file: Regex::new(r"(?i)\b(file|upload|attach|image|photo|pdf|document)\b")
            .expect("static regex"),
    });

    if p.system.is_match(text) {
        Intent::System
    } else if text.contains("```") || p.code.is_match(text) {
        Intent::Code
    } else if p.analysis.is_match(text) {
        Intent::Analysis
    } else if p.search.is_match(text) {
        Intent::Search
    } else if p.file.is_match(text) {
        Intent::File
    } else if p.creative.is_match(text) {
        Intent::Creative
    } else {
        Intent::Chat
    }
}

/// Price tier for a message; surfaced to clients as `complexity`.
pub fn pick_tier(text: &str, intent: Intent, has_tools: bool) -> Tier {
    // Explicit complexity hints dominate everything else.
    let lower = text.to_lowercase();
    if ["analyze deeply", "think hard", "in depth", "thorough"]
        .iter()
        .any(|h| lower.contains(h))
    {
        return 3;
    }
    if ["quick answer", "briefly", "one line", "tl;dr"]
        .iter()
        .any(|h| lower.contains(h))
    {
        return 1;
    }

    let mut tier: i32 = match intent {
        Intent::Chat | Intent::Search | Intent::System => 1,
        Intent::Creative | Intent::File => 2,
        Intent::Code | Intent::Analysis => 2,
    };
    if text.len() > 800 {
        tier += 1;
    }
    if text.contains("```") {
        tier += 1;
    }
    if has_tools && tier < 2 {
        tier = 2;
    }
    tier.clamp(1, 3) as Tier
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn avail(providers: &[&str]) -> Vec<String> {
        providers.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn classify_code() {
        assert_eq!(classify("please debug this function"), Intent::Code);
        assert_eq!(classify("```rust\nfn main(){}\n```"), Intent::Code);
    }

    #[test]
    fn classify_analysis_and_search() {
        assert_eq!(classify("compare these two approaches"), Intent::Analysis);
        assert_eq!(classify("what's the latest news"), Intent::Search);
    }

    #[test]
    fn classify_system_command() {
        assert_eq!(classify("/queue steer"), Intent::System);
    }

    #[test]
    fn classify_default_is_chat() {
        assert_eq!(classify("good morning"), Intent::Chat);
    }

    #[test]
    fn short_chat_routes_to_cheap_tier() {
        let r = ModelRouter::new();
        let model = r.route("hello", false, &avail(&["anthropic"]));
        assert_eq!(model, "anthropic/claude-haiku-4-5");
    }

    #[test]
    fn deep_analysis_hint_routes_to_flagship() {
        let r = ModelRouter::new();
        let model = r.route("analyze deeply the failure modes", false, &avail(&["anthropic"]));
        assert_eq!(model, "anthropic/claude-opus-4-1");
    }

    #[test]
    fn quick_hint_downgrades_tier() {
        let r = ModelRouter::new();
        let model = r.route("briefly, compare A and B", false, &avail(&["anthropic"]));
        assert_eq!(model, "anthropic/claude-haiku-4-5");
    }

    #[test]
    fn tools_bump_chat_to_balanced() {
        let r = ModelRouter::new();
        let model = r.route("hello", true, &avail(&["anthropic"]));
        assert_eq!(model, "anthropic/claude-sonnet-4-5");
    }

    #[test]
    fn provider_order_respects_availability() {
        let r = ModelRouter::new();
        let model = r.route("hello", false, &avail(&["google", "xai"]));
        assert!(model.starts_with("google/"), "got {model}");
    }

    #[test]
    fn forced_model_overrides_routing() {
        let r = ModelRouter::new();
        r.set_forced(Some("openai/gpt-4o".into()));
        assert_eq!(r.route("debug this", true, &avail(&["anthropic"])), "openai/gpt-4o");
        r.set_forced(None);
        assert_ne!(r.route("debug this", true, &avail(&["anthropic"])), "openai/gpt-4o");
    }

    #[test]
    fn no_keys_still_returns_a_model() {
        let r = ModelRouter::new();
        let model = r.route("hello", false, &[]);
        assert!(model.contains('/'));
    }

    #[test]
    fn long_code_message_reaches_flagship() {
        let r = ModelRouter::new();
        let long = format!("refactor this\n```rust\n{}\n```", "x".repeat(900));
        let model = r.route(&long, false, &avail(&["anthropic"]));
        assert_eq!(model, "anthropic/claude-opus-4-1");
    }
}
