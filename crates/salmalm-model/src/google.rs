// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
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

pub struct GeminiClient {
    base_url: String,
    http: reqwest::Client,
}

impl GeminiClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com/v1beta".into(),
            http,
        }
    }

    fn build_body(req: &ProviderRequest) -> Value {
        let mut body = json!({
            "contents": req.messages,
            "generationConfig": { "maxOutputTokens": req.max_tokens },
        });
        if let Some(t) = req.temperature {
            body["generationConfig"]["temperature"] = json!(t);
        }
        if !req.tools.is_empty() {
            body["tools"] = json!([{ "functionDeclarations": req.tools }]);
        }
        body
    }
}

/// Gemini reports no tool-call id; synthesize a stable-enough one from the
/// function name and the current wall-clock, as the original gateway did.
fn synth_call_id(name: &str) -> String {
    format!("google_{name}_{}", chrono::Utc::now().timestamp_millis())
}

fn parse_candidates(resp: &Value) -> (String, Vec<ToolCallRequest>) {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for cand in resp["candidates"].as_array().into_iter().flatten() {
        for part in cand["content"]["parts"].as_array().into_iter().flatten() {
            if let Some(t) = part["text"].as_str() {
                text.push_str(t);
            } else if let Some(fc) = part.get("functionCall") {
                let name = fc["name"].as_str().unwrap_or("").to_string();
                tool_calls.push(ToolCallRequest {
                    id: synth_call_id(&name),
                    name,
                    arguments: fc.get("args").cloned().unwrap_or_else(|| json!({})),
                });
            }
        }
    }
    (text, tool_calls)
}

fn parse_usage(resp: &Value) -> Usage {
    let meta = &resp["usageMetadata"];
    Usage {
        input_tokens: meta["promptTokenCount"].as_u64().unwrap_or(0),
        output_tokens: meta["candidatesTokenCount"].as_u64().unwrap_or(0),
        ..Default::default()
    }
}

#[async_trait]
impl ProviderClient for GeminiClient {
    fn name(&self) -> &'static str {
        "google"
    }

    async fn call(&self, req: ProviderRequest) -> Result<LlmResult, LlmError> {
        let body = Self::build_body(&req);
        debug!(model = %req.model_id, "gemini call");
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, req.model_id, req.api_key
        );
        let resp = post_json(
            &self.http,
            &url,
            &[("content-type", "application/json")],
            &body,
            req.timeout,
        )
        .await?;

        let (content, tool_calls) = parse_candidates(&resp);
        Ok(LlmResult {
            content,
            tool_calls,
            usage: parse_usage(&resp),
            ..Default::default()
        })
    }

    async fn stream(&self, req: ProviderRequest) -> Result<EventStream, LlmError> {
        let body = Self::build_body(&req);
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, req.model_id, req.api_key
        );
        let resp = self
            .http
            .post(url)
            .timeout(req.timeout)
            .header("content-type", "application/json")
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

async fn pump_sse(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    let mut bytes = resp.bytes_stream();
    let mut buf = String::new();
    let mut content = String::new();
    let mut tool_calls: Vec<ToolCallRequest> = Vec::new();
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
                continue;
            }
            let Ok(event) = serde_json::from_str::<Value>(data) else { continue };

            let (text, calls) = parse_candidates(&event);
            if !text.is_empty() {
                content.push_str(&text);
                if tx.send(StreamEvent::TextDelta { text }).await.is_err() {
                    return;
                }
            }
            for tc in calls {
                let _ = tx
                    .send(StreamEvent::ToolUseStart { id: tc.id.clone(), name: tc.name.clone() })
                    .await;
                let _ = tx
                    .send(StreamEvent::ToolUseEnd {
                        id: tc.id.clone(),
                        name: tc.name.clone(),
                        arguments: tc.arguments.clone(),
                    })
                    .await;
                tool_calls.push(tc);
            }
            if !event["usageMetadata"].is_null() {
                let u = parse_usage(&event);
                if u.input_tokens > 0 {
                    usage.input_tokens = u.input_tokens;
                }
                if u.output_tokens > 0 {
                    usage.output_tokens = u.output_tokens;
                }
            }
        }
    }

    let _ = tx
        .send(StreamEvent::MessageEnd { content, tool_calls, usage })
        .await;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
