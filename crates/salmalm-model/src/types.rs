// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One turn of the canonical conversation.
///
/// `tool_calls` is set only on assistant turns; `tool_call_id` only on tool
/// turns (it names the `tool_use` id the result answers). `model` records
/// which provider/model produced an assistant turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self::plain(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        let mut m = Self::plain(Role::User, text);
        m.timestamp = Some(Utc::now());
        m
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, text)
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Text(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            model: None,
            timestamp: None,
        }
    }

    fn plain(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            model: None,
            timestamp: None,
        }
    }

    /// All text carried by this message, block contents joined by newlines.
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    ContentBlock::ToolResult { content, .. } => Some(content.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Character length used by the compaction threshold.
    pub fn char_len(&self) -> usize {
        match &self.content {
            MessageContent::Text(t) => t.len(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => text.len(),
                    ContentBlock::ToolResult { content, .. } => content.len(),
                    ContentBlock::ToolUse { input, .. } => input.to_string().len(),
                    // Images dominate token cost but not the char-based
                    // compaction heuristic; count a fixed stand-in.
                    ContentBlock::Image { .. } => 3072,
                })
                .sum(),
        }
    }
}

/// Content is either plain text or an ordered list of blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

/// A tool invocation requested by the model. `arguments` is always a JSON
/// object; malformed provider output is wrapped as `{"raw": "<text>"}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// A tool schema offered to the model, in canonical (Anthropic-flavored)
/// form. [`crate::adapter::adapt_tools`] rewrites it per provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: Value,
}

// ─── Call results ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
}

/// Marker carried in [`LlmResult::error`] for failures the caller is expected
/// to recover from rather than surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallFailure {
    /// The provider rejected the prompt as too long. The agent loop compacts
    /// the session and retries once; the gateway never falls back on this.
    TokenOverflow,
}

/// Result of one gateway call. User-surfaced failures (missing key, cost cap,
/// exhausted fallbacks) arrive as `content` text, never as an `Err`.
#[derive(Debug, Clone, Default)]
pub struct LlmResult {
    pub content: String,
    pub thinking: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Usage,
    pub model: String,
    pub cached: bool,
    pub error: Option<CallFailure>,
}

impl LlmResult {
    pub fn text(model: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: model.into(),
            ..Default::default()
        }
    }
}

// ─── Streaming ────────────────────────────────────────────────────────────────

/// Events produced by a streaming provider call, in provider order.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta {
        text: String,
    },
    ThinkingDelta {
        text: String,
    },
    ToolUseStart {
        id: String,
        name: String,
    },
    ToolUseDelta {
        id: String,
        partial_json: String,
    },
    ToolUseEnd {
        id: String,
        name: String,
        arguments: Value,
    },
    MessageEnd {
        content: String,
        tool_calls: Vec<ToolCallRequest>,
        usage: Usage,
    },
    Error {
        message: String,
    },
}

/// Extended-thinking effort. Budgets apply only to Anthropic opus/sonnet
/// model families; other providers ignore the level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    #[default]
    Off,
    Low,
    Medium,
    High,
    Xhigh,
}

impl ThinkingLevel {
    pub fn budget_tokens(&self) -> Option<u32> {
        match self {
            Self::Off => None,
            Self::Low => Some(4_000),
            Self::Medium => Some(10_000),
            Self::High => Some(16_000),
            Self::Xhigh => Some(32_000),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn user_message_has_timestamp() {
        let m = Message::user("hi");
        assert_eq!(m.role, Role::User);
        assert!(m.timestamp.is_some());
        assert_eq!(m.text(), "hi");
    }

    #[test]
    fn tool_result_sets_tool_call_id() {
        let m = Message::tool_result("toolu_01", "ok");
        assert_eq!(m.role, Role::Tool);
        assert_eq!(m.tool_call_id.as_deref(), Some("toolu_01"));
    }

    #[test]
    fn text_joins_blocks() {
        let m = Message {
            role: Role::User,
            content: MessageContent::Blocks(vec![
                ContentBlock::Text { text: "a".into() },
                ContentBlock::Image {
                    source: ImageSource::Url { url: "https://x/y.png".into() },
                },
                ContentBlock::Text { text: "b".into() },
            ]),
            tool_calls: vec![],
            tool_call_id: None,
            model: None,
            timestamp: None,
        };
        assert_eq!(m.text(), "a\nb");
    }

    #[test]
    fn char_len_counts_tool_results() {
        let m = Message {
            role: Role::User,
            content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: "t".into(),
                content: "12345678".into(),
            }]),
            tool_calls: vec![],
            tool_call_id: None,
            model: None,
            timestamp: None,
        };
        assert_eq!(m.char_len(), 8);
    }

    #[test]
    fn message_serde_round_trip() {
        let m = Message {
            role: Role::Assistant,
            content: MessageContent::Text("done".into()),
            tool_calls: vec![ToolCallRequest {
                id: "tc1".into(),
                name: "exec".into(),
                arguments: json!({"cmd": "ls"}),
            }],
            tool_call_id: None,
            model: Some("anthropic/claude-sonnet-4-5".into()),
            timestamp: None,
        };
        let s = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&s).unwrap();
        assert_eq!(back.role, Role::Assistant);
        assert_eq!(back.tool_calls.len(), 1);
        assert_eq!(back.tool_calls[0].name, "exec");
        assert_eq!(back.model.as_deref(), Some("anthropic/claude-sonnet-4-5"));
    }

    #[test]
    fn block_content_serde_round_trip() {
        let m = Message {
            role: Role::User,
            content: MessageContent::Blocks(vec![
                ContentBlock::Text { text: "look".into() },
                ContentBlock::Image {
                    source: ImageSource::Base64 {
                        media_type: "image/png".into(),
                        data: "AAAA".into(),
                    },
                },
            ]),
            tool_calls: vec![],
            tool_call_id: None,
            model: None,
            timestamp: None,
        };
        let s = serde_json::to_string(&m).unwrap();
        assert!(s.contains("\"type\":\"image\""));
        let back: Message = serde_json::from_str(&s).unwrap();
        match back.content {
            MessageContent::Blocks(b) => assert_eq!(b.len(), 2),
            _ => panic!("expected blocks"),
        }
    }

    #[test]
    fn plain_string_content_deserializes_as_text() {
        let m: Message = serde_json::from_str(r#"{"role":"user","content":"hello"}"#).unwrap();
        assert_eq!(m.content, MessageContent::Text("hello".into()));
        assert!(m.tool_calls.is_empty());
    }

    #[test]
    fn thinking_budgets() {
        assert_eq!(ThinkingLevel::Off.budget_tokens(), None);
        assert_eq!(ThinkingLevel::Low.budget_tokens(), Some(4_000));
        assert_eq!(ThinkingLevel::Medium.budget_tokens(), Some(10_000));
        assert_eq!(ThinkingLevel::High.budget_tokens(), Some(16_000));
        assert_eq!(ThinkingLevel::Xhigh.budget_tokens(), Some(32_000));
    }
}
