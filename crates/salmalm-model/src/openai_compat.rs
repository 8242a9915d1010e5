// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! OpenAI-compatible chat-completions client. Serves OpenAI itself plus
//! every provider speaking the same dialect (xAI, OpenRouter, Ollama, and
//! the OpenRouter-routed model families).
//!
//! Also implements the `/responses` endpoint used by reasoning models that
//! reject `/chat/completions` with "not a chat model" — the gateway decides
//! when to route there.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::error::LlmError;
use crate::http::{classify_error, post_json};
use crate::provider::{EventStream, ProviderClient, ProviderRequest};
use crate::types::{LlmResult, StreamEvent, ToolCallRequest, Usage};

pub struct OpenAiCompatClient {
    provider: &'static str,
    base_url: String,
    http: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn new(provider: &'static str, base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self { provider, base_url: base_url.into(), http }
    }

    fn headers(&self, api_key: &str) -> Vec<(&'static str, String)> {
        let mut h = vec![("content-type", "application/json".to_string())];
        // Ollama runs keyless; the sentinel key skips the auth header.
        if !api_key.is_empty() && api_key != "ollama" {
            h.push(("authorization", format!("Bearer {api_key}")));
        }
        h
    }

    fn build_body(req: &ProviderRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": req.model_id,
            "max_tokens": req.max_tokens,
            "messages": req.messages,
        });
        if let Some(t) = req.temperature {
            body["temperature"] = json!(t);
        }
        if !req.tools.is_empty() {
            body["tools"] = json!(req.tools);
        }
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({ "include_usage": true });
        }
        body
    }

    /// One-shot call against the `/responses` endpoint. Message content is
    /// flattened to text input items; tool calling is not offered here (the
    /// models that need this endpoint are chat-only in our usage).
    pub async fn call_responses(&self, req: ProviderRequest) -> Result<LlmResult, LlmError> {
        let input: Vec<Value> = req
            .messages
            .iter()
            .map(|m| {
                json!({
                    "role": m["role"],
                    "content": flatten_content(&m["content"]),
                })
            })
            .collect();
        let body = json!({
            "model": req.model_id,
            "input": input,
            "max_output_tokens": req.max_tokens,
        });
        let headers = self.headers(&req.api_key);
        let header_refs: Vec<(&str, &str)> =
            headers.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let resp = post_json(
            &self.http,
            &format!("{}/responses", self.base_url),
            &header_refs,
            &body,
            req.timeout,
        )
        .await?;

        let mut content = String::new();
        for item in resp["output"].as_array().into_iter().flatten() {
            if item["type"] == "message" {
                for part in item["content"].as_array().into_iter().flatten() {
                    if part["type"] == "output_text" {
                        content.push_str(part["text"].as_str().unwrap_or(""));
                    }
                }
            }
        }
        Ok(LlmResult {
            content,
            usage: Usage {
                input_tokens: resp["usage"]["input_tokens"].as_u64().unwrap_or(0),
                output_tokens: resp["usage"]["output_tokens"].as_u64().unwrap_or(0),
                ..Default::default()
            },
            ..Default::default()
        })
    }
}

fn flatten_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

#[async_trait]
impl ProviderClient for OpenAiCompatClient {
    fn name(&self) -> &'static str {
        self.provider
    }

    async fn call(&self, req: ProviderRequest) -> Result<LlmResult, LlmError> {
        let body = Self::build_body(&req, false);
        debug!(provider = self.provider, model = %req.model_id, "chat-completions call");
        let headers = self.headers(&req.api_key);
        let header_refs: Vec<(&str, &str)> =
            headers.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let resp = post_json(
            &self.http,
            &format!("{}/chat/completions", self.base_url),
            &header_refs,
            &body,
            req.timeout,
        )
        .await?;

        let message = &resp["choices"][0]["message"];
        let tool_calls = message["tool_calls"]
            .as_array()
            .into_iter()
            .flatten()
            .map(parse_tool_call)
            .collect();
        Ok(LlmResult {
            content: message["content"].as_str().unwrap_or("").to_string(),
            tool_calls,
            usage: Usage {
                input_tokens: resp["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
                output_tokens: resp["usage"]["completion_tokens"].as_u64().unwrap_or(0),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    async fn stream(&self, req: ProviderRequest) -> Result<EventStream, LlmError> {
        let body = Self::build_body(&req, true);
        let mut builder = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(req.timeout)
            .json(&body);
        for (k, v) in self.headers(&req.api_key) {
            builder = builder.header(k, v);
        }
        let resp = builder.send().await.map_err(LlmError::from)?;
        let status = resp.status().as_u16();
        if status >= 400 {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_error(status, &text));
        }

        let (tx, rx) = mpsc::channel::<StreamEvent>(64);
        tokio::spawn(pump_sse(resp, tx));
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Chat-completions `tool_calls[i].function.arguments` is a JSON-encoded
/// string; unparseable payloads are wrapped as `{"raw": ...}`.
fn parse_tool_call(tc: &Value) -> ToolCallRequest {
    let raw_args = tc["function"]["arguments"].as_str().unwrap_or("{}");
    let arguments = serde_json::from_str::<Value>(raw_args)
        .ok()
        .filter(Value::is_object)
        .unwrap_or_else(|| json!({ "raw": raw_args }));
    ToolCallRequest {
        id: tc["id"].as_str().unwrap_or("").to_string(),
        name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
        arguments,
    }
}

#[derive(Default)]
struct PendingTool {
    id: String,
    name: String,
    args_buf: String,
}

async fn pump_sse(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    let mut bytes = resp.bytes_stream();
    let mut buf = String::new();
    let mut content = String::new();
    let mut pending: HashMap<u64, PendingTool> = HashMap::new();
    let mut started: std::collections::HashSet<u64> = Default::default();
    let mut usage = Usage::default();

    while let Some(chunk) = bytes.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx.send(StreamEvent::Error { message: e.to_string() }).await;
                return;
            }
        };
        buf.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(pos) = buf.find('\n') {
            let line = buf[..pos].trim_end_matches('\r').to_string();
            buf.drain(..=pos);
            let Some(data) = line.strip_prefix("data: ") else { continue };
            let data = data.trim();
            if data == "[DONE]" {
                let tool_calls = finish_tools(&mut pending);
                let _ = tx
                    .send(StreamEvent::MessageEnd {
                        content: std::mem::take(&mut content),
                        tool_calls,
                        usage,
                    })
                    .await;
                return;
            }
            let Ok(v) = serde_json::from_str::<Value>(data) else { continue };

            if let Some(u) = v.get("usage").filter(|u| !u.is_null()) {
                usage.input_tokens = u["prompt_tokens"].as_u64().unwrap_or(usage.input_tokens);
                usage.output_tokens =
                    u["completion_tokens"].as_u64().unwrap_or(usage.output_tokens);
            }

            let delta = &v["choices"][0]["delta"];
            if let Some(text) = delta["content"].as_str() {
                if !text.is_empty() {
                    content.push_str(text);
                    if tx
                        .send(StreamEvent::TextDelta { text: text.to_string() })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
            for tc in delta["tool_calls"].as_array().into_iter().flatten() {
                let index = tc["index"].as_u64().unwrap_or(0);
                let entry = pending.entry(index).or_default();
                if let Some(id) = tc["id"].as_str() {
                    entry.id = id.to_string();
                }
                if let Some(name) = tc["function"]["name"].as_str() {
                    entry.name = name.to_string();
                }
                if let Some(args) = tc["function"]["arguments"].as_str() {
                    entry.args_buf.push_str(args);
                }
                if !entry.name.is_empty() && started.insert(index) {
                    let _ = tx
                        .send(StreamEvent::ToolUseStart {
                            id: entry.id.clone(),
                            name: entry.name.clone(),
                        })
                        .await;
                } else if let Some(args) = tc["function"]["arguments"].as_str() {
                    let _ = tx
                        .send(StreamEvent::ToolUseDelta {
                            id: entry.id.clone(),
                            partial_json: args.to_string(),
                        })
                        .await;
                }
            }
        }
    }

    // Stream ended without [DONE]; still deliver what accumulated.
    let tool_calls = finish_tools(&mut pending);
    let _ = tx
        .send(StreamEvent::MessageEnd { content, tool_calls, usage })
        .await;
}

fn finish_tools(pending: &mut HashMap<u64, PendingTool>) -> Vec<ToolCallRequest> {
    let mut entries: Vec<(u64, PendingTool)> = pending.drain().collect();
    entries.sort_by_key(|(i, _)| *i);
    entries
        .into_iter()
        .filter(|(_, p)| !p.name.is_empty())
        .map(|(_, p)| {
            let arguments = serde_json::from_str::<Value>(&p.args_buf)
                .ok()
                .filter(Value::is_object)
                .unwrap_or_else(|| {
                    if p.args_buf.trim().is_empty() {
                        json!({})
                    } else {
                        json!({ "raw": p.args_buf })
                    }
                });
            ToolCallRequest { id: p.id, name: p.name, arguments }
        })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
