// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Pure message/tool adaptation from the canonical form into each provider's
//! wire format. No I/O here — every function is a deterministic rewrite, so
//! adaptation is trivially idempotent in the canonical direction.

use std::collections::HashSet;

use serde_json::{json, Value};

use crate::types::{ContentBlock, ImageSource, Message, MessageContent, Role, ToolSchema};

/// Wire families. xAI, OpenRouter, Ollama, DeepSeek, Mistral, Qwen, and Meta
/// all speak the OpenAI chat-completions dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Anthropic,
    OpenAi,
    Gemini,
}

impl WireFormat {
    pub fn for_provider(provider: &str) -> Self {
        match provider {
            "anthropic" => Self::Anthropic,
            "google" => Self::Gemini,
            _ => Self::OpenAi,
        }
    }
}

/// Provider-ready message list. `system_text` is populated for Anthropic
/// (whose API takes `system` as a top-level field); for the other families
/// system turns stay inside `messages`.
#[derive(Debug, Clone)]
pub struct Adapted {
    pub system_text: Option<String>,
    pub messages: Vec<Value>,
}

/// Convert canonical messages into the target provider's wire messages.
pub fn adapt(messages: &[Message], format: WireFormat) -> Adapted {
    match format {
        WireFormat::Anthropic => adapt_anthropic(messages),
        WireFormat::OpenAi => adapt_openai(messages),
        WireFormat::Gemini => adapt_gemini(messages),
    }
}

/// Convert canonical tool schemas into the target provider's tool format.
/// Gemini declarations are returned bare; the client wraps them in a single
/// `{"functionDeclarations": [...]}` entry.
pub fn adapt_tools(tools: &[ToolSchema], format: WireFormat) -> Vec<Value> {
    tools
        .iter()
        .map(|t| match format {
            WireFormat::Anthropic => json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.parameters,
            }),
            WireFormat::OpenAi => json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            }),
            WireFormat::Gemini => {
                let mut decl = json!({
                    "name": t.name,
                    "description": t.description,
                });
                // Gemini rejects empty parameter objects.
                if t.parameters
                    .get("properties")
                    .map(|p| p.as_object().map(|o| !o.is_empty()).unwrap_or(false))
                    .unwrap_or(false)
                {
                    decl["parameters"] = t.parameters.clone();
                }
                decl
            }
        })
        .collect()
}

/// Drop internal marker keys (`_recall`, `_plan_injected`, `_rag_injected`)
/// from raw message objects. Typed [`Message`]s never carry them, but
/// sessions persisted by older builds may.
pub fn strip_internal_keys(messages: &mut [Value]) {
    const INTERNAL: [&str; 3] = ["_recall", "_plan_injected", "_rag_injected"];
    for m in messages {
        if let Some(obj) = m.as_object_mut() {
            for key in INTERNAL {
                obj.remove(key);
            }
        }
    }
}

// ─── Anthropic ────────────────────────────────────────────────────────────────

fn adapt_anthropic(messages: &[Message]) -> Adapted {
    let mut system_parts: Vec<String> = Vec::new();
    let mut out: Vec<Value> = Vec::new();

    for m in messages {
        match m.role {
            Role::System => system_parts.push(m.text()),
            Role::Tool => {
                out.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": m.tool_call_id.as_deref().unwrap_or("unknown"),
                        "content": m.text(),
                    }]
                }));
            }
            Role::Assistant if !m.tool_calls.is_empty() => {
                let mut blocks: Vec<Value> = Vec::new();
                let text = m.text();
                if !text.trim().is_empty() {
                    blocks.push(json!({ "type": "text", "text": text }));
                }
                for tc in &m.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": tc.id,
                        "name": tc.name,
                        "input": object_args(&tc.arguments),
                    }));
                }
                out.push(json!({ "role": "assistant", "content": blocks }));
            }
            Role::User | Role::Assistant => {
                let role = if m.role == Role::User { "user" } else { "assistant" };
                match &m.content {
                    MessageContent::Text(t) => {
                        out.push(json!({ "role": role, "content": t }));
                    }
                    MessageContent::Blocks(blocks) => {
                        let content: Vec<Value> =
                            blocks.iter().map(anthropic_block).collect();
                        out.push(json!({ "role": role, "content": content }));
                    }
                }
            }
        }
    }

    drop_orphan_tool_results(&mut out);

    let system_text = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n"))
    };
    Adapted { system_text, messages: out }
}

fn anthropic_block(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => json!({ "type": "text", "text": text }),
        ContentBlock::Image { source } => match source {
            ImageSource::Base64 { media_type, data } => json!({
                "type": "image",
                "source": { "type": "base64", "media_type": media_type, "data": data }
            }),
            ImageSource::Url { url } => json!({
                "type": "image",
                "source": { "type": "url", "url": url }
            }),
        },
        ContentBlock::ToolUse { id, name, input } => json!({
            "type": "tool_use", "id": id, "name": name, "input": object_args(input),
        }),
        ContentBlock::ToolResult { tool_use_id, content } => json!({
            "type": "tool_result", "tool_use_id": tool_use_id, "content": content,
        }),
    }
}

/// Orphan-filter invariant: every `tool_result` sent to Anthropic must
/// answer a `tool_use` present earlier in the same sequence. Results whose
/// id is unknown are dropped; a message left with no valid blocks is removed
/// entirely (Anthropic rejects empty content arrays).
fn drop_orphan_tool_results(messages: &mut Vec<Value>) {
    let mut known_ids: HashSet<String> = HashSet::new();
    for m in messages.iter() {
        if let Some(blocks) = m["content"].as_array() {
            for b in blocks {
                if b["type"] == "tool_use" {
                    if let Some(id) = b["id"].as_str() {
                        known_ids.insert(id.to_string());
                    }
                }
            }
        }
    }

    messages.retain_mut(|m| {
        let Some(blocks) = m["content"].as_array() else {
            return true;
        };
        let only_tool_results = !blocks.is_empty()
            && blocks.iter().all(|b| b["type"] == "tool_result");
        if !only_tool_results {
            return true;
        }
        let valid: Vec<Value> = blocks
            .iter()
            .filter(|b| {
                b["tool_use_id"]
                    .as_str()
                    .map(|id| known_ids.contains(id))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        if valid.is_empty() {
            tracing::warn!("dropping orphan tool_result message before Anthropic call");
            return false;
        }
        m["content"] = Value::Array(valid);
        true
    });
}

// ─── OpenAI-compatible ────────────────────────────────────────────────────────

fn adapt_openai(messages: &[Message]) -> Adapted {
    let mut out: Vec<Value> = Vec::new();

    for m in messages {
        match m.role {
            Role::System => out.push(json!({ "role": "system", "content": m.text() })),
            Role::Tool => out.push(json!({
                "role": "tool",
                "tool_call_id": m.tool_call_id.as_deref().unwrap_or("unknown"),
                "content": m.text(),
            })),
            Role::Assistant if !m.tool_calls.is_empty() => {
                let tool_calls: Vec<Value> = m
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.name,
                                "arguments": tc.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
                let text = m.text();
                let content = if text.trim().is_empty() { Value::Null } else { json!(text) };
                out.push(json!({
                    "role": "assistant",
                    "content": content,
                    "tool_calls": tool_calls,
                }));
            }
            Role::User | Role::Assistant => {
                let role = if m.role == Role::User { "user" } else { "assistant" };
                match &m.content {
                    MessageContent::Text(t) => {
                        out.push(json!({ "role": role, "content": t }))
                    }
                    MessageContent::Blocks(blocks) => {
                        out.push(openai_block_message(role, blocks))
                    }
                }
            }
        }
    }

    Adapted { system_text: None, messages: out }
}

/// Text and tool-result blocks flatten into a single string; a message with
/// image blocks becomes a content array with data-URI `image_url` entries.
fn openai_block_message(role: &str, blocks: &[ContentBlock]) -> Value {
    let has_images = blocks.iter().any(|b| matches!(b, ContentBlock::Image { .. }));
    if !has_images {
        let text: Vec<&str> = blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::ToolResult { content, .. } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        return json!({ "role": role, "content": text.join("\n") });
    }
    let content: Vec<Value> = blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(json!({ "type": "text", "text": text })),
            ContentBlock::Image { source } => {
                let url = match source {
                    ImageSource::Base64 { media_type, data } => {
                        format!("data:{media_type};base64,{data}")
                    }
                    ImageSource::Url { url } => url.clone(),
                };
                Some(json!({ "type": "image_url", "image_url": { "url": url } }))
            }
            ContentBlock::ToolResult { content, .. } => {
                Some(json!({ "type": "text", "text": content }))
            }
            ContentBlock::ToolUse { .. } => None,
        })
        .collect();
    json!({ "role": role, "content": content })
}

// ─── Gemini ───────────────────────────────────────────────────────────────────

/// Gemini `contents`: roles are `user`/`model`, system turns are demoted to
/// an initial user turn, tool results become `functionResponse` parts, and
/// consecutive same-role entries are merged.
fn adapt_gemini(messages: &[Message]) -> Adapted {
    let mut entries: Vec<Value> = Vec::new();

    for m in messages {
        match m.role {
            Role::System => entries.push(json!({
                "role": "user",
                "parts": [{ "text": m.text() }]
            })),
            Role::Tool => {
                let name = m.tool_call_id.as_deref().unwrap_or("tool");
                entries.push(json!({
                    "role": "user",
                    "parts": [{
                        "functionResponse": {
                            "name": name,
                            "response": { "content": m.text() },
                        }
                    }]
                }));
            }
            Role::Assistant => {
                let mut parts: Vec<Value> = Vec::new();
                let text = m.text();
                if !text.is_empty() {
                    parts.push(json!({ "text": text }));
                }
                for tc in &m.tool_calls {
                    parts.push(json!({
                        "functionCall": { "name": tc.name, "args": object_args(&tc.arguments) }
                    }));
                }
                if !parts.is_empty() {
                    entries.push(json!({ "role": "model", "parts": parts }));
                }
            }
            Role::User => {
                let parts = match &m.content {
                    MessageContent::Text(t) => vec![json!({ "text": t })],
                    MessageContent::Blocks(blocks) => blocks
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::Text { text } => Some(json!({ "text": text })),
                            ContentBlock::Image {
                                source: ImageSource::Base64 { media_type, data },
                            } => Some(json!({
                                "inline_data": { "mime_type": media_type, "data": data }
                            })),
                            // Remote image URLs cannot be inlined without a
                            // fetch; Gemini adaptation skips them.
                            ContentBlock::Image { source: ImageSource::Url { .. } } => None,
                            ContentBlock::ToolResult { content, .. } => {
                                Some(json!({ "text": content }))
                            }
                            ContentBlock::ToolUse { .. } => None,
                        })
                        .collect(),
                };
                if !parts.is_empty() {
                    entries.push(json!({ "role": "user", "parts": parts }));
                }
            }
        }
    }

    // Merge consecutive same-role entries.
    let mut merged: Vec<Value> = Vec::new();
    for entry in entries {
        let same_role = merged
            .last()
            .map(|prev| prev["role"] == entry["role"])
            .unwrap_or(false);
        if same_role {
            let prev = merged.last_mut().expect("non-empty");
            if let (Some(dst), Some(src)) =
                (prev["parts"].as_array_mut(), entry["parts"].as_array())
            {
                dst.extend(src.iter().cloned());
            }
        } else {
            merged.push(entry);
        }
    }

    Adapted { system_text: None, messages: merged }
}

/// Coerce tool-call arguments to a JSON object. Strings are parsed; anything
/// unparseable is wrapped as `{"raw": <original>}` so the provider always
/// receives a valid object.
fn object_args(args: &Value) -> Value {
    match args {
        Value::Object(_) => args.clone(),
        Value::String(s) => serde_json::from_str::<Value>(s)
            .ok()
            .filter(Value::is_object)
            .unwrap_or_else(|| json!({ "raw": s })),
        other => json!({ "raw": other.to_string() }),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
