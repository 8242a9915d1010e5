// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The single entry point for every LLM call. Orchestrates, in order:
//! routing, the response cache, the hard cost cap, key resolution, message
//! adaptation, provider dispatch, the OpenAI responses-endpoint retry,
//! token-overflow detection, and cross-provider fallback.
//!
//! User-level failures (missing key, cost cap, exhausted fallbacks) are
//! returned as readable `content` text — [`LlmGateway::call`] never fails
//! with an `Err`, so callers always have something to show.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tracing::{error, info, warn};

use salmalm_vault::Vault;

use crate::adapter::{adapt, adapt_tools, Adapted, WireFormat};
use crate::anthropic::AnthropicClient;
use crate::cache::ResponseCache;
use crate::catalog;
use crate::error::LlmError;
use crate::google::GeminiClient;
use crate::openai_compat::OpenAiCompatClient;
use crate::provider::{split_model, ProviderClient, ProviderRequest};
use crate::router::{classify, ModelRouter};
use crate::types::{
    CallFailure, LlmResult, Message, StreamEvent, ThinkingLevel, ToolSchema, Usage,
};
use crate::usage::UsageMeter;

/// Providers whose models are reached through an OpenRouter key.
const OPENROUTER_ROUTED: [&str; 4] = ["deepseek", "meta-llama", "mistralai", "qwen"];

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub timeout: Duration,
    pub max_tokens: u32,
    pub temp_chat: f32,
    pub temp_tool: f32,
    pub cache_enabled: bool,
    /// Providers tried, in order, after the primary fails. The original
    /// provider is always skipped.
    pub fallback_order: Vec<String>,
    /// Per-provider base-URL overrides (proxies, test stubs). The Ollama URL
    /// from the vault still wins for `ollama`.
    pub base_urls: HashMap<String, String>,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            max_tokens: 4096,
            temp_chat: 0.7,
            temp_tool: 0.3,
            cache_enabled: true,
            fallback_order: vec!["anthropic".into(), "xai".into(), "google".into()],
            base_urls: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// `provider/model-id`; routed automatically when `None`.
    pub model: Option<String>,
    pub tools: Vec<ToolSchema>,
    pub max_tokens: Option<u32>,
    pub thinking: ThinkingLevel,
    /// Scopes the response cache so sessions never see each other's answers.
    pub session_id: Option<String>,
}

/// Counters surfaced by `/metrics`.
#[derive(Default)]
pub struct GatewayMetrics {
    pub llm_calls: AtomicU64,
    pub llm_errors: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cost_cap_hits: AtomicU64,
    pub fallbacks: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub llm_calls: u64,
    pub llm_errors: u64,
    pub cache_hits: u64,
    pub cost_cap_hits: u64,
    pub fallbacks: u64,
}

pub struct LlmGateway {
    vault: Arc<Mutex<Vault>>,
    pub router: ModelRouter,
    cache: ResponseCache,
    pub meter: Arc<UsageMeter>,
    opts: GatewayOptions,
    http: reqwest::Client,
    /// Models confirmed to need `/responses`; checked before dispatch so
    /// future calls skip the failing chat endpoint entirely.
    responses_models: Mutex<HashSet<String>>,
    /// Models that failed both endpoints; skipped straight to fallback.
    responses_blacklist: Mutex<HashSet<String>>,
    pub metrics: GatewayMetrics,
}

impl LlmGateway {
    pub fn new(vault: Arc<Mutex<Vault>>, meter: Arc<UsageMeter>, opts: GatewayOptions) -> Self {
        Self {
            vault,
            router: ModelRouter::new(),
            cache: ResponseCache::new(),
            meter,
            opts,
            http: reqwest::Client::new(),
            responses_models: Mutex::new(HashSet::new()),
            responses_blacklist: Mutex::new(HashSet::new()),
            metrics: GatewayMetrics::default(),
        }
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            llm_calls: self.metrics.llm_calls.load(Ordering::Relaxed),
            llm_errors: self.metrics.llm_errors.load(Ordering::Relaxed),
            cache_hits: self.metrics.cache_hits.load(Ordering::Relaxed),
            cost_cap_hits: self.metrics.cost_cap_hits.load(Ordering::Relaxed),
            fallbacks: self.metrics.fallbacks.load(Ordering::Relaxed),
        }
    }

    /// Providers that currently have a usable key, in routing-table order.
    pub fn available_providers(&self) -> Vec<String> {
        let vault = self.vault.lock().expect("vault lock");
        let mut out = Vec::new();
        for provider in ["anthropic", "openai", "google", "xai", "openrouter"] {
            if resolve_api_key_locked(&vault, provider).is_some() {
                out.push(provider.to_string());
            }
        }
        // Ollama needs no key, but only participates when a URL is set.
        if vault.get("ollama_url").is_some() {
            out.push("ollama".to_string());
        }
        out
    }

    fn resolve_api_key(&self, provider: &str) -> Option<String> {
        let vault = self.vault.lock().expect("vault lock");
        resolve_api_key_locked(&vault, provider)
    }

    fn resolve_model(&self, messages: &[Message], opts: &CallOptions) -> String {
        if let Some(model) = &opts.model {
            return model.clone();
        }
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == crate::types::Role::User)
            .map(|m| m.text())
            .unwrap_or_default();
        self.router
            .route(&last_user, !opts.tools.is_empty(), &self.available_providers())
    }

    fn client_for(&self, provider: &str) -> Box<dyn ProviderClient> {
        let base = |default: &str| -> String {
            self.opts
                .base_urls
                .get(provider)
                .cloned()
                .unwrap_or_else(|| default.to_string())
        };
        match provider {
            "anthropic" => Box::new(AnthropicClient::with_base_url(
                self.http.clone(),
                base("https://api.anthropic.com"),
            )),
            "google" => Box::new(GeminiClient::new(self.http.clone())),
            "xai" => Box::new(OpenAiCompatClient::new(
                "xai",
                base("https://api.x.ai/v1"),
                self.http.clone(),
            )),
            "ollama" => {
                let url = self
                    .vault
                    .lock()
                    .expect("vault lock")
                    .get("ollama_url")
                    .map(str::to_string)
                    .unwrap_or_else(|| base("http://localhost:11434/v1"));
                Box::new(OpenAiCompatClient::new("ollama", url, self.http.clone()))
            }
            "openrouter" => Box::new(OpenAiCompatClient::new(
                "openrouter",
                base("https://openrouter.ai/api/v1"),
                self.http.clone(),
            )),
            p if OPENROUTER_ROUTED.contains(&p) => Box::new(OpenAiCompatClient::new(
                "openrouter",
                base("https://openrouter.ai/api/v1"),
                self.http.clone(),
            )),
            _ => Box::new(OpenAiCompatClient::new(
                "openai",
                base("https://api.openai.com/v1"),
                self.http.clone(),
            )),
        }
    }

    fn build_request(
        &self,
        model_id: &str,
        api_key: &str,
        adapted: Adapted,
        tools: Vec<serde_json::Value>,
        opts: &CallOptions,
    ) -> ProviderRequest {
        // Thinking disallows explicit temperature; tool calls get the
        // precision temperature, plain chat the creative one.
        let temperature = if opts.thinking != ThinkingLevel::Off {
            None
        } else if !opts.tools.is_empty() {
            Some(self.opts.temp_tool)
        } else {
            Some(self.opts.temp_chat)
        };
        ProviderRequest {
            model_id: model_id.to_string(),
            api_key: api_key.to_string(),
            messages: adapted.messages,
            system_text: adapted.system_text,
            tools,
            max_tokens: opts.max_tokens.unwrap_or(self.opts.max_tokens),
            thinking: opts.thinking,
            temperature,
            timeout: self.opts.timeout,
        }
    }

    /// Providers tried after `original` fails, keyless entries skipped. No
    /// provider appears twice and the original never appears.
    fn fallback_chain(&self, original: &str) -> Vec<String> {
        let mut chain: Vec<String> = Vec::new();
        for provider in &self.opts.fallback_order {
            if provider == original || chain.contains(provider) {
                continue;
            }
            if self.resolve_api_key(provider).is_none() {
                continue;
            }
            chain.push(provider.clone());
        }
        chain
    }

    // ─── One-shot entry point ─────────────────────────────────────────────────

    pub async fn call(&self, messages: &[Message], opts: CallOptions) -> LlmResult {
        let model = self.resolve_model(messages, &opts);

        // Cache consult: tool-free, non-streaming calls only.
        if opts.tools.is_empty() && self.opts.cache_enabled {
            if let Some(text) =
                self.cache.get(&model, messages, opts.session_id.as_deref())
            {
                self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
                let mut result = LlmResult::text(&model, text);
                result.cached = true;
                return result;
            }
        }

        if let Err(e) = self.meter.check_cost_cap() {
            self.metrics.cost_cap_hits.fetch_add(1, Ordering::Relaxed);
            return LlmResult::text(&model, format!("⚠️ {e}"));
        }

        let (provider, model_id) = split_model(&model);
        let Some(api_key) = self.resolve_api_key(provider) else {
            return LlmResult::text(
                &model,
                format!(
                    "❌ {provider} API key not configured.\n\n\
                     💡 In Settings, add `{provider}_api_key` or\n\
                     try switching models: `/model auto`"
                ),
            );
        };

        // Blacklisted models failed both chat and responses endpoints; go
        // straight to the fallback chain.
        if self.responses_blacklist.lock().expect("lock").contains(model_id) {
            warn!(model = %model, "model blacklisted on both endpoints, using fallback");
            if let Some(result) = self.try_fallback(messages, &opts, provider).await {
                return result;
            }
            return LlmResult::text(
                &model,
                format!("❌ {model} is not a chat model and no fallback is available."),
            );
        }

        let format = WireFormat::for_provider(provider);
        let adapted = adapt(messages, format);
        let tools = adapt_tools(&opts.tools, format);
        let request = self.build_request(model_id, &api_key, adapted, tools, &opts);

        info!(
            model = %model,
            msgs = messages.len(),
            tools = opts.tools.len(),
            "LLM call"
        );
        self.metrics.llm_calls.fetch_add(1, Ordering::Relaxed);

        let client = self.client_for(provider);
        let use_responses = provider == "openai"
            && self.responses_models.lock().expect("lock").contains(model_id);
        let outcome = if use_responses {
            self.call_openai_responses(request.clone()).await
        } else {
            client.call(request.clone()).await
        };

        match outcome {
            Ok(mut result) => {
                result.model = model.clone();
                self.finish_success(messages, &opts, &mut result);
                result
            }
            Err(e) => {
                self.metrics.llm_errors.fetch_add(1, Ordering::Relaxed);
                error!(model = %model, "LLM error: {e}");
                self.recover(messages, &opts, provider, &model, model_id, request, e)
                    .await
            }
        }
    }

    /// One transparent retry against the responses endpoint for an OpenAI
    /// model that rejected `/chat/completions` with "not a chat model".
    /// The outcome is memoized either way: success registers the model in
    /// `responses_models` (future calls skip the chat endpoint), failure
    /// blacklists it (future calls skip straight to fallback). Returns
    /// `None` when the error is not a responses-only rejection.
    async fn retry_responses_only(
        &self,
        provider: &str,
        model: &str,
        model_id: &str,
        request: ProviderRequest,
        e: &LlmError,
    ) -> Option<LlmResult> {
        if provider != "openai" || !matches!(e, LlmError::ResponsesOnly(_)) {
            return None;
        }
        info!(model = %model, "retrying with v1/responses endpoint");
        match self.call_openai_responses(request).await {
            Ok(mut result) => {
                result.model = model.to_string();
                self.responses_models
                    .lock()
                    .expect("lock")
                    .insert(model_id.to_string());
                Some(result)
            }
            Err(e2) => {
                error!(model = %model, "v1/responses also failed: {e2}");
                self.responses_blacklist
                    .lock()
                    .expect("lock")
                    .insert(model_id.to_string());
                None
            }
        }
    }

    /// Error path shared by call(): responses retry, overflow, fallback.
    async fn recover(
        &self,
        messages: &[Message],
        opts: &CallOptions,
        provider: &str,
        model: &str,
        model_id: &str,
        request: ProviderRequest,
        e: LlmError,
    ) -> LlmResult {
        if let Some(mut result) = self
            .retry_responses_only(provider, model, model_id, request, &e)
            .await
        {
            self.finish_success(messages, opts, &mut result);
            return result;
        }

        // Token overflow never falls back: the caller compacts and retries.
        if e.is_token_overflow() {
            warn!(model = %model, msgs = messages.len(), "token overflow detected");
            let mut result = LlmResult::text(model, "");
            result.error = Some(CallFailure::TokenOverflow);
            return result;
        }

        if let Some(result) = self.try_fallback(messages, opts, provider).await {
            return result;
        }

        let err_text: String = e.to_string().chars().take(200).collect();
        LlmResult::text(model, format!("❌ All LLM calls failed. Last error: {err_text}"))
    }

    async fn try_fallback(
        &self,
        messages: &[Message],
        opts: &CallOptions,
        original_provider: &str,
    ) -> Option<LlmResult> {
        for fb_provider in self.fallback_chain(original_provider) {
            let Some(fb_model_id) = catalog::fallback_model(&fb_provider) else {
                continue;
            };
            // The cap guards fallbacks too: one expensive failure must not
            // tunnel past it through the retry path.
            if let Err(e) = self.meter.check_cost_cap() {
                self.metrics.cost_cap_hits.fetch_add(1, Ordering::Relaxed);
                return Some(LlmResult::text(
                    format!("{fb_provider}/{fb_model_id}"),
                    format!("⚠️ {e}"),
                ));
            }
            let Some(api_key) = self.resolve_api_key(&fb_provider) else {
                continue;
            };
            info!(from = original_provider, to = %fb_provider, "provider fallback");
            self.metrics.fallbacks.fetch_add(1, Ordering::Relaxed);

            let format = WireFormat::for_provider(&fb_provider);
            let adapted = adapt(messages, format);
            let tools = adapt_tools(&opts.tools, format);
            let request = self.build_request(fb_model_id, &api_key, adapted, tools, opts);
            match self.client_for(&fb_provider).call(request).await {
                Ok(mut result) => {
                    result.model = format!("{fb_provider}/{fb_model_id}");
                    self.finish_success(messages, opts, &mut result);
                    return Some(result);
                }
                Err(e) => {
                    error!(provider = %fb_provider, "fallback also failed: {e}");
                }
            }
        }
        None
    }

    async fn call_openai_responses(&self, request: ProviderRequest) -> Result<LlmResult, LlmError> {
        let base = self
            .opts
            .base_urls
            .get("openai")
            .cloned()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        let client = OpenAiCompatClient::new("openai", base, self.http.clone());
        client.call_responses(request).await
    }

    /// Usage metering and cache population after any successful call.
    fn finish_success(&self, messages: &[Message], opts: &CallOptions, result: &mut LlmResult) {
        let intent = messages
            .iter()
            .rev()
            .find(|m| m.role == crate::types::Role::User)
            .map(|m| classify(&m.text()).as_str())
            .unwrap_or("chat");
        self.meter.record(
            opts.session_id.as_deref().unwrap_or(""),
            &result.model,
            result.usage.input_tokens,
            result.usage.output_tokens,
            intent,
        );
        if opts.tools.is_empty()
            && self.opts.cache_enabled
            && result.tool_calls.is_empty()
            && !result.content.is_empty()
        {
            self.cache.put(
                &result.model,
                messages,
                opts.session_id.as_deref(),
                &result.content,
            );
        }
    }

    // ─── Streaming entry point ────────────────────────────────────────────────

    /// Identical contract to [`call`], but provider events are forwarded to
    /// `on_event` as they arrive (in provider order). The final result is
    /// also returned. Caching is bypassed — streamed turns are always live.
    pub async fn stream(
        &self,
        messages: &[Message],
        opts: CallOptions,
        mut on_event: impl FnMut(&StreamEvent) + Send,
    ) -> LlmResult {
        let model = self.resolve_model(messages, &opts);

        if let Err(e) = self.meter.check_cost_cap() {
            self.metrics.cost_cap_hits.fetch_add(1, Ordering::Relaxed);
            let message = format!("⚠️ {e}");
            on_event(&StreamEvent::Error { message: message.clone() });
            return LlmResult::text(&model, message);
        }

        let (provider, model_id) = split_model(&model);
        let Some(api_key) = self.resolve_api_key(provider) else {
            let message = format!("❌ {provider} API key not configured.");
            on_event(&StreamEvent::Error { message: message.clone() });
            return LlmResult::text(&model, message);
        };

        // Memoized endpoint knowledge applies to streams too: blacklisted
        // models skip straight to fallback, responses-only models are served
        // via the blocking endpoint below.
        if self.responses_blacklist.lock().expect("lock").contains(model_id) {
            warn!(model = %model, "model blacklisted on both endpoints, using fallback");
            if let Some(result) = self.try_fallback(messages, &opts, provider).await {
                if !result.content.is_empty() {
                    on_event(&StreamEvent::TextDelta { text: result.content.clone() });
                }
                return result;
            }
            let message = format!("❌ {model} is not a chat model and no fallback is available.");
            on_event(&StreamEvent::Error { message: message.clone() });
            return LlmResult::text(&model, message);
        }

        let format = WireFormat::for_provider(provider);
        let adapted = adapt(messages, format);
        let tools = adapt_tools(&opts.tools, format);
        let request = self.build_request(model_id, &api_key, adapted, tools, &opts);

        info!(model = %model, msgs = messages.len(), "LLM stream");
        self.metrics.llm_calls.fetch_add(1, Ordering::Relaxed);

        let memoized_responses_only = provider == "openai"
            && self.responses_models.lock().expect("lock").contains(model_id);
        let attempt = if memoized_responses_only {
            // Skip the chat stream that is known to fail; the recovery path
            // delivers the reply from /responses as a single delta.
            Err(LlmError::ResponsesOnly("memoized responses-only model".into()))
        } else {
            self.client_for(provider).stream(request.clone()).await
        };
        let mut stream = match attempt {
            Ok(s) => s,
            Err(e) => {
                if !memoized_responses_only {
                    self.metrics.llm_errors.fetch_add(1, Ordering::Relaxed);
                    error!(model = %model, "stream setup failed: {e}");
                }
                return self
                    .stream_recover(messages, &opts, provider, &model, model_id, request, e, &mut on_event)
                    .await;
            }
        };

        let mut result = LlmResult {
            model: model.clone(),
            ..Default::default()
        };
        let mut thinking = String::new();
        while let Some(event) = stream.next().await {
            on_event(&event);
            match event {
                StreamEvent::ThinkingDelta { text } => thinking.push_str(&text),
                StreamEvent::MessageEnd { content, tool_calls, usage } => {
                    result.content = content;
                    result.tool_calls = tool_calls;
                    result.usage = usage;
                }
                StreamEvent::Error { message } => {
                    self.metrics.llm_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(model = %model, "stream error event: {message}");
                }
                _ => {}
            }
        }
        result.thinking = (!thinking.is_empty()).then_some(thinking);

        self.meter.record(
            opts.session_id.as_deref().unwrap_or(""),
            &result.model,
            result.usage.input_tokens,
            result.usage.output_tokens,
            "stream",
        );
        result
    }

    /// Stream-side twin of `recover()`: the same responses retry (with
    /// memoization), token-overflow surfacing, and fallback chain, with
    /// recovered text delivered through the event callback as one delta.
    #[allow(clippy::too_many_arguments)]
    async fn stream_recover(
        &self,
        messages: &[Message],
        opts: &CallOptions,
        provider: &str,
        model: &str,
        model_id: &str,
        request: ProviderRequest,
        e: LlmError,
        on_event: &mut (impl FnMut(&StreamEvent) + Send),
    ) -> LlmResult {
        if let Some(mut result) = self
            .retry_responses_only(provider, model, model_id, request, &e)
            .await
        {
            self.finish_success(messages, opts, &mut result);
            if !result.content.is_empty() {
                on_event(&StreamEvent::TextDelta { text: result.content.clone() });
            }
            return result;
        }

        if e.is_token_overflow() {
            warn!(model = %model, msgs = messages.len(), "token overflow detected");
            let mut result = LlmResult::text(model, "");
            result.error = Some(CallFailure::TokenOverflow);
            return result;
        }

        if let Some(result) = self.try_fallback(messages, opts, provider).await {
            if !result.content.is_empty() {
                on_event(&StreamEvent::TextDelta { text: result.content.clone() });
            }
            return result;
        }

        let err_text: String = e.to_string().chars().take(200).collect();
        let message = format!("❌ All LLM calls failed. Last error: {err_text}");
        on_event(&StreamEvent::Error { message: message.clone() });
        LlmResult::text(model, message)
    }
}

fn resolve_api_key_locked(vault: &Vault, provider: &str) -> Option<String> {
    if OPENROUTER_ROUTED.contains(&provider) {
        return vault.get("openrouter_api_key").map(str::to_string);
    }
    match provider {
        "ollama" => Some(
            vault
                .get("ollama_api_key")
                .unwrap_or("ollama")
                .to_string(),
        ),
        "google" => vault
            .get("google_api_key")
            .or_else(|| vault.get("gemini_api_key"))
            .map(str::to_string),
        _ => vault.get(&format!("{provider}_api_key")).map(str::to_string),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway_with_keys(keys: &[(&str, &str)]) -> (tempfile::TempDir, LlmGateway) {
        gateway_with(keys, GatewayOptions::default())
    }

    fn gateway_with(
        keys: &[(&str, &str)],
        opts: GatewayOptions,
    ) -> (tempfile::TempDir, LlmGateway) {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = Vault::new(dir.path().join("vault"));
        vault.create("pw").unwrap();
        for (k, v) in keys {
            vault.set(k, v).unwrap();
        }
        let gw = LlmGateway::new(
            Arc::new(Mutex::new(vault)),
            Arc::new(UsageMeter::new(0.0)),
            opts,
        );
        (dir, gw)
    }

    #[test]
    fn fallback_chain_excludes_original_and_keyless() {
        let (_dir, gw) = gateway_with_keys(&[
            ("anthropic_api_key", "a"),
            ("google_api_key", "g"),
        ]);
        // Original anthropic: chain must not contain it; xai has no key.
        assert_eq!(gw.fallback_chain("anthropic"), vec!["google".to_string()]);
    }

    #[test]
    fn fallback_chain_never_repeats_a_provider() {
        let mut opts = GatewayOptions::default();
        opts.fallback_order =
            vec!["anthropic".into(), "anthropic".into(), "google".into()];
        let (_dir, gw) = gateway_with(
            &[("anthropic_api_key", "a"), ("google_api_key", "g")],
            opts,
        );
        let chain = gw.fallback_chain("openai");
        assert_eq!(chain, vec!["anthropic".to_string(), "google".to_string()]);
    }

    #[test]
    fn available_providers_reflect_vault_keys() {
        let (_dir, gw) = gateway_with_keys(&[("openai_api_key", "sk")]);
        assert_eq!(gw.available_providers(), vec!["openai".to_string()]);
    }

    #[test]
    fn openrouter_routed_providers_use_openrouter_key() {
        let (_dir, gw) = gateway_with_keys(&[("openrouter_api_key", "or")]);
        assert_eq!(gw.resolve_api_key("deepseek").as_deref(), Some("or"));
        assert_eq!(gw.resolve_api_key("qwen").as_deref(), Some("or"));
    }

    #[test]
    fn google_key_falls_back_to_gemini_alias() {
        let (_dir, gw) = gateway_with_keys(&[("gemini_api_key", "gk")]);
        assert_eq!(gw.resolve_api_key("google").as_deref(), Some("gk"));
    }

    #[tokio::test]
    async fn missing_key_returns_structured_message() {
        let (_dir, gw) = gateway_with_keys(&[]);
        let result = gw
            .call(
                &[Message::user("hi")],
                CallOptions {
                    model: Some("anthropic/claude-haiku-4-5".into()),
                    ..Default::default()
                },
            )
            .await;
        assert!(result.content.contains("anthropic API key not configured"));
        assert_eq!(result.usage, Usage::default());
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn cost_cap_refuses_before_any_call() {
        let (_dir, gw) = gateway_with_keys(&[("anthropic_api_key", "a")]);
        // Spend past the cap, then verify the gateway refuses.
        gw.meter.set_cost_cap(0.001);
        gw.meter.record("s", "claude-opus-4-1", 1_000_000, 0, "chat");
        let result = gw
            .call(
                &[Message::user("hi")],
                CallOptions {
                    model: Some("anthropic/claude-haiku-4-5".into()),
                    ..Default::default()
                },
            )
            .await;
        assert!(result.content.starts_with("⚠️"), "got: {}", result.content);
        assert!(result.content.contains("Cost cap exceeded"));
        assert_eq!(gw.metrics_snapshot().cost_cap_hits, 1);
    }

    #[tokio::test]
    async fn cached_result_short_circuits() {
        let (_dir, gw) = gateway_with_keys(&[("anthropic_api_key", "a")]);
        let msgs = [Message::user("ping")];
        gw.cache
            .put("anthropic/claude-haiku-4-5", &msgs, Some("s1"), "pong");
        let result = gw
            .call(
                &msgs,
                CallOptions {
                    model: Some("anthropic/claude-haiku-4-5".into()),
                    session_id: Some("s1".into()),
                    ..Default::default()
                },
            )
            .await;
        assert!(result.cached);
        assert_eq!(result.content, "pong");
        assert_eq!(result.usage.input_tokens, 0);
        assert_eq!(result.usage.output_tokens, 0);
        assert_eq!(gw.metrics_snapshot().cache_hits, 1);
    }

    #[test]
    fn temperature_policy_tools_vs_chat_vs_thinking() {
        let (_dir, gw) = gateway_with_keys(&[]);
        let adapted = Adapted { system_text: None, messages: vec![] };
        let chat = gw.build_request("m", "k", adapted.clone(), vec![], &CallOptions::default());
        assert_eq!(chat.temperature, Some(0.7));

        let tool_opts = CallOptions {
            tools: vec![ToolSchema {
                name: "t".into(),
                description: String::new(),
                parameters: serde_json::json!({}),
            }],
            ..Default::default()
        };
        let tool = gw.build_request("m", "k", adapted.clone(), vec![], &tool_opts);
        assert_eq!(tool.temperature, Some(0.3));

        let think_opts = CallOptions {
            thinking: ThinkingLevel::High,
            ..Default::default()
        };
        let think = gw.build_request("m", "k", adapted, vec![], &think_opts);
        assert_eq!(think.temperature, None);
    }
}
