// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
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

const API_VERSION: &str = "2023-06-01";
const BETA: &str = "prompt-caching-2024-07-31";

/// Marker splitting the merged system prompt into a stable, cacheable prefix
/// and a volatile suffix. Only the first occurrence splits.
pub const CACHE_BOUNDARY: &str = "<!-- CACHE_BOUNDARY -->";

pub struct AnthropicClient {
    base_url: String,
    http: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_base_url(http, "https://api.anthropic.com")
    }

    /// Base-URL override for self-hosted proxies and test stubs.
    pub fn with_base_url(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), http }
    }

    fn build_body(req: &ProviderRequest, stream: bool) -> Value {
        // Extended thinking applies only to the opus/sonnet families and
        // requires max_tokens ≥ budget + 4000; temperature must be omitted.
        let budget = req
            .thinking
            .budget_tokens()
            .filter(|_| req.model_id.contains("opus") || req.model_id.contains("sonnet"));

        let mut body = json!({
            "model": req.model_id,
            "messages": req.messages,
            "max_tokens": req.max_tokens,
        });
        if stream {
            body["stream"] = json!(true);
        }
        if let Some(budget) = budget {
            body["max_tokens"] = json!(req.max_tokens.max(budget + 4_000));
            body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
        } else if let Some(t) = req.temperature {
            body["temperature"] = json!(t);
        }

        if let Some(system) = req.system_text.as_deref().filter(|s| !s.is_empty()) {
            body["system"] = json!(system_blocks(system));
        }

        if !req.tools.is_empty() {
            // cache_control on the last tool caches the whole tools array
            // as one prefix.
            let mut tools = req.tools.clone();
            if let Some(last) = tools.last_mut() {
                last["cache_control"] = json!({ "type": "ephemeral" });
            }
            body["tools"] = json!(tools);
        }
        body
    }
}

/// Build the `system` array. A [`CACHE_BOUNDARY`] in the merged prompt
/// splits it into two ephemeral-cached blocks (stable prefix, volatile
/// suffix); otherwise a single cached block is sent.
fn system_blocks(system: &str) -> Vec<Value> {
    match system.split_once(CACHE_BOUNDARY) {
        Some((stable, volatile)) => vec![
            json!({
                "type": "text",
                "text": stable.trim(),
                "cache_control": { "type": "ephemeral" },
            }),
            json!({
                "type": "text",
                "text": volatile.trim(),
                "cache_control": { "type": "ephemeral" },
            }),
        ],
        None => vec![json!({
            "type": "text",
            "text": system,
            "cache_control": { "type": "ephemeral" },
        })],
    }
}

fn parse_usage(usage: &Value) -> Usage {
    Usage {
        input_tokens: usage["input_tokens"].as_u64().unwrap_or(0),
        output_tokens: usage["output_tokens"].as_u64().unwrap_or(0),
        cache_read_tokens: usage["cache_read_input_tokens"].as_u64().unwrap_or(0),
        cache_write_tokens: usage["cache_creation_input_tokens"].as_u64().unwrap_or(0),
    }
}

#[async_trait]
impl ProviderClient for AnthropicClient {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn call(&self, req: ProviderRequest) -> Result<LlmResult, LlmError> {
        let body = Self::build_body(&req, false);
        debug!(model = %req.model_id, msgs = req.messages.len(), "anthropic call");
        let resp = post_json(
            &self.http,
            &format!("{}/v1/messages", self.base_url),
            &[
                ("x-api-key", req.api_key.as_str()),
                ("content-type", "application/json"),
                ("anthropic-version", API_VERSION),
                ("anthropic-beta", BETA),
            ],
            &body,
            req.timeout,
        )
        .await?;

        let mut content = String::new();
        let mut thinking = String::new();
        let mut tool_calls = Vec::new();
        for block in resp["content"].as_array().into_iter().flatten() {
            match block["type"].as_str().unwrap_or("") {
                "text" => content.push_str(block["text"].as_str().unwrap_or("")),
                "thinking" => thinking.push_str(block["thinking"].as_str().unwrap_or("")),
                "tool_use" => tool_calls.push(ToolCallRequest {
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                    arguments: block["input"].clone(),
                }),
                _ => {}
            }
        }
        Ok(LlmResult {
            content,
            thinking: (!thinking.is_empty()).then_some(thinking),
            tool_calls,
            usage: parse_usage(&resp["usage"]),
            ..Default::default()
        })
    }

    async fn stream(&self, req: ProviderRequest) -> Result<EventStream, LlmError> {
        let body = Self::build_body(&req, true);
        let resp = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .timeout(req.timeout)
            .header("x-api-key", &req.api_key)
            .header("content-type", "application/json")
            .header("anthropic-version", API_VERSION)
            .header("anthropic-beta", BETA)
            .json(&body)
            .send()
            .await
            .map_err(LlmError::from)?;

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

struct PendingTool {
    id: String,
    name: String,
    args_buf: String,
}

/// Read the SSE byte stream, translating Anthropic events into the common
/// [`StreamEvent`] shape. SSE lines can split across TCP chunks, so a
/// remainder buffer carries incomplete lines forward.
async fn pump_sse(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    let mut bytes = resp.bytes_stream();
    let mut buf = String::new();
    let mut content = String::new();
    let mut tool_calls: Vec<ToolCallRequest> = Vec::new();
    let mut pending: HashMap<u64, PendingTool> = HashMap::new();
    let mut usage = Usage::default();

    while let Some(chunk) = bytes.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error { message: e.to_string() })
                    .await;
                return;
            }
        };
        buf.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(pos) = buf.find('\n') {
            let line = buf[..pos].trim_end_matches('\r').to_string();
            buf.drain(..=pos);
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            let Ok(v) = serde_json::from_str::<Value>(data.trim()) else {
                continue;
            };
            for ev in translate_event(&v, &mut content, &mut tool_calls, &mut pending, &mut usage)
            {
                if tx.send(ev).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn translate_event(
    v: &Value,
    content: &mut String,
    tool_calls: &mut Vec<ToolCallRequest>,
    pending: &mut HashMap<u64, PendingTool>,
    usage: &mut Usage,
) -> Vec<StreamEvent> {
    match v["type"].as_str().unwrap_or("") {
        "message_start" => {
            let u = parse_usage(&v["message"]["usage"]);
            usage.input_tokens = u.input_tokens;
            usage.cache_read_tokens = u.cache_read_tokens;
            usage.cache_write_tokens = u.cache_write_tokens;
            vec![]
        }
        "content_block_start" => {
            let index = v["index"].as_u64().unwrap_or(0);
            let block = &v["content_block"];
            if block["type"] == "tool_use" {
                let id = block["id"].as_str().unwrap_or("").to_string();
                let name = block["name"].as_str().unwrap_or("").to_string();
                pending.insert(
                    index,
                    PendingTool { id: id.clone(), name: name.clone(), args_buf: String::new() },
                );
                vec![StreamEvent::ToolUseStart { id, name }]
            } else {
                vec![]
            }
        }
        "content_block_delta" => {
            let index = v["index"].as_u64().unwrap_or(0);
            let delta = &v["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => {
                    let text = delta["text"].as_str().unwrap_or("").to_string();
                    content.push_str(&text);
                    vec![StreamEvent::TextDelta { text }]
                }
                "thinking_delta" => {
                    let text = delta["thinking"].as_str().unwrap_or("").to_string();
                    if text.is_empty() {
                        vec![]
                    } else {
                        vec![StreamEvent::ThinkingDelta { text }]
                    }
                }
                "input_json_delta" => {
                    let partial = delta["partial_json"].as_str().unwrap_or("").to_string();
                    if let Some(pt) = pending.get_mut(&index) {
                        pt.args_buf.push_str(&partial);
                        vec![StreamEvent::ToolUseDelta { id: pt.id.clone(), partial_json: partial }]
                    } else {
                        vec![]
                    }
                }
                // signature_delta and future types carry nothing streamable.
                _ => vec![],
            }
        }
        "content_block_stop" => {
            let index = v["index"].as_u64().unwrap_or(0);
            if let Some(pt) = pending.remove(&index) {
                let arguments = parse_tool_args(&pt.args_buf);
                let tc = ToolCallRequest { id: pt.id, name: pt.name, arguments };
                tool_calls.push(tc.clone());
                vec![StreamEvent::ToolUseEnd {
                    id: tc.id,
                    name: tc.name,
                    arguments: tc.arguments,
                }]
            } else {
                vec![]
            }
        }
        "message_delta" => {
            if let Some(out) = v["usage"]["output_tokens"].as_u64() {
                usage.output_tokens = out;
            }
            vec![]
        }
        "message_stop" => vec![StreamEvent::MessageEnd {
            content: std::mem::take(content),
            tool_calls: std::mem::take(tool_calls),
            usage: *usage,
        }],
        _ => vec![],
    }
}

/// Empty buffers become `{}`; unparseable JSON is wrapped as `{"raw": ...}`
/// so the conversation history stays valid on the next request.
fn parse_tool_args(buf: &str) -> Value {
    if buf.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str::<Value>(buf)
        .ok()
        .filter(Value::is_object)
        .unwrap_or_else(|| json!({ "raw": buf }))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
