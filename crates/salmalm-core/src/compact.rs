// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Context-window management. When a session grows past the thresholds,
//! the history is rewritten to: the system prompt, the first two user turns
//! (intent anchor), a synthetic summary of the dropped span, and the most
//! recent tail. Summaries are deterministic — bullet points extracted from
//! the dropped user questions — so compaction never needs a model call.

use salmalm_model::{Message, MessageContent, Role};
use tracing::info;

use crate::session::Session;

/// Compact once either threshold is exceeded.
const PAIR_THRESHOLD: usize = 120;
const CHAR_THRESHOLD: usize = 200 * 1024;

/// Recent messages preserved verbatim.
const KEEP_RECENT: usize = 40;
/// Leading user turns preserved as the intent anchor.
const ANCHOR_USER_TURNS: usize = 2;

const MIN_BULLETS: usize = 5;
const MAX_BULLETS: usize = 15;

pub fn needs_compaction(session: &Session) -> bool {
    session.turn_pairs() > PAIR_THRESHOLD || session.total_chars() > CHAR_THRESHOLD
}

/// Rewrite the message list in place. Returns `true` when anything was
/// dropped. Safe to call unconditionally; small sessions are untouched.
pub fn compact(session: &mut Session) -> bool {
    if !needs_compaction(session) {
        return false;
    }

    let messages = std::mem::take(&mut session.messages);
    let (system, rest): (Vec<Message>, Vec<Message>) = messages
        .into_iter()
        .partition(|m| m.role == Role::System);

    // Anchor: everything up to and including the second user turn.
    let mut anchor_end = 0;
    let mut user_seen = 0;
    for (i, m) in rest.iter().enumerate() {
        if m.role == Role::User {
            user_seen += 1;
            if user_seen == ANCHOR_USER_TURNS {
                anchor_end = i + 1;
                break;
            }
        }
    }

    // Recent tail, with the boundary pulled back so it never starts inside
    // a tool interaction (an orphaned tool_result would be rejected by the
    // provider on the next call).
    let mut tail_start = rest.len().saturating_sub(KEEP_RECENT);
    while tail_start > anchor_end && is_tool_traffic(&rest[tail_start]) {
        tail_start -= 1;
    }
    if tail_start <= anchor_end {
        // Nothing left in the middle to drop.
        session.messages = system.into_iter().chain(rest).collect();
        return false;
    }

    let dropped = &rest[anchor_end..tail_start];
    let summary = summarize(dropped);
    info!(
        session = %session.id,
        dropped = dropped.len(),
        kept = anchor_end + (rest.len() - tail_start),
        "compacted session history"
    );

    let mut rebuilt = system;
    rebuilt.extend_from_slice(&rest[..anchor_end]);
    rebuilt.push(Message::system(summary));
    rebuilt.extend_from_slice(&rest[tail_start..]);
    session.messages = rebuilt;
    true
}

fn is_tool_traffic(m: &Message) -> bool {
    m.role == Role::Tool
        || !m.tool_calls.is_empty()
        || matches!(&m.content, MessageContent::Blocks(blocks) if blocks.iter().any(|b| {
            matches!(
                b,
                salmalm_model::ContentBlock::ToolUse { .. }
                    | salmalm_model::ContentBlock::ToolResult { .. }
            )
        }))
}

/// 5-15 bullets, built from the first sentences of the dropped user turns
/// (padded from assistant turns when there are too few questions).
fn summarize(dropped: &[Message]) -> String {
    let mut bullets: Vec<String> = dropped
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| first_sentence(&m.text()))
        .filter(|s| !s.is_empty())
        .collect();
    if bullets.len() < MIN_BULLETS {
        bullets.extend(
            dropped
                .iter()
                .filter(|m| m.role == Role::Assistant)
                .map(|m| first_sentence(&m.text()))
                .filter(|s| !s.is_empty())
                .take(MIN_BULLETS.saturating_sub(bullets.len())),
        );
    }
    bullets.truncate(MAX_BULLETS);
    if bullets.is_empty() {
        bullets.push(format!("{} earlier messages omitted", dropped.len()));
    }

    let mut out = String::from("## Conversation Summary\n");
    for b in bullets {
        out.push_str("- ");
        out.push_str(&b);
        out.push('\n');
    }
    out.push_str(&format!(
        "({} earlier messages were compacted away)",
        dropped.len()
    ));
    out
}

fn first_sentence(text: &str) -> String {
    let line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let sentence = line
        .split_inclusive(['.', '?', '!'])
        .next()
        .unwrap_or(line)
        .trim();
    let mut s: String = sentence.chars().take(96).collect();
    if sentence.chars().count() > 96 {
        s.push('…');
    }
    s
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use salmalm_model::ToolCallRequest;

    fn big_session() -> Session {
        let mut s = Session::new("s1", 0, "system prompt");
        for i in 0..200 {
            s.messages.push(Message::user(format!("Question number {i}? And more.")));
            s.messages.push(Message::assistant(format!("Answer number {i}.")));
        }
        s
    }

    #[test]
    fn small_session_is_untouched() {
        let mut s = Session::new("s1", 0, "sys");
        s.messages.push(Message::user("hi"));
        s.messages.push(Message::assistant("hello"));
        assert!(!compact(&mut s));
        assert_eq!(s.messages.len(), 3);
    }

    #[test]
    fn pair_threshold_triggers() {
        let s = big_session();
        assert!(needs_compaction(&s));
    }

    #[test]
    fn char_threshold_triggers() {
        let mut s = Session::new("s1", 0, "sys");
        s.messages.push(Message::user("x".repeat(300 * 1024)));
        assert!(needs_compaction(&s));
    }

    #[test]
    fn compaction_keeps_system_anchor_summary_and_tail() {
        let mut s = big_session();
        let before = s.messages.len();
        assert!(compact(&mut s));
        assert!(s.messages.len() < before);

        // System prompt first.
        assert_eq!(s.messages[0].role, Role::System);
        // Anchor: the first two user turns survive.
        assert!(s.messages[1].text().contains("Question number 0"));
        let anchor_texts: Vec<String> =
            s.messages[1..4].iter().map(|m| m.text()).collect();
        assert!(anchor_texts.iter().any(|t| t.contains("Question number 1")));
        // Summary message present.
        assert!(s
            .messages
            .iter()
            .any(|m| m.role == Role::System && m.text().starts_with("## Conversation Summary")));
        // The most recent turn survives verbatim.
        assert!(s
            .messages
            .last()
            .unwrap()
            .text()
            .contains("Answer number 199"));
    }

    #[test]
    fn summary_bullet_count_is_bounded() {
        let mut s = big_session();
        compact(&mut s);
        let summary = s
            .messages
            .iter()
            .find(|m| m.text().starts_with("## Conversation Summary"))
            .unwrap()
            .text();
        let bullets = summary.lines().filter(|l| l.starts_with("- ")).count();
        assert!((MIN_BULLETS..=MAX_BULLETS).contains(&bullets), "got {bullets}");
    }

    #[test]
    fn tail_never_starts_with_orphan_tool_traffic() {
        let mut s = Session::new("s1", 0, "sys");
        for i in 0..150 {
            s.messages.push(Message::user(format!("q{i}")));
            let mut asst = Message::assistant("using a tool");
            asst.tool_calls = vec![ToolCallRequest {
                id: format!("tc{i}"),
                name: "exec".into(),
                arguments: serde_json::json!({}),
            }];
            s.messages.push(asst);
            s.messages.push(Message::tool_result(format!("tc{i}"), "result"));
            s.messages.push(Message::assistant(format!("a{i}")));
        }
        assert!(compact(&mut s));
        // Find the first message after the summary; it must not be tool
        // traffic (tool result or a tool-calling assistant turn).
        let summary_idx = s
            .messages
            .iter()
            .position(|m| m.text().starts_with("## Conversation Summary"))
            .unwrap();
        let first_tail = &s.messages[summary_idx + 1];
        assert!(!is_tool_traffic(first_tail), "tail starts mid tool group");
    }

    #[test]
    fn compaction_is_idempotent_enough() {
        // A second compact right after the first must be a no-op.
        let mut s = big_session();
        assert!(compact(&mut s));
        let after_first = s.messages.len();
        assert!(!compact(&mut s));
        assert_eq!(s.messages.len(), after_first);
    }

    #[test]
    fn first_sentence_cuts_at_punctuation() {
        assert_eq!(first_sentence("Hello there. More text."), "Hello there.");
        assert_eq!(first_sentence("What is this?"), "What is this?");
        assert_eq!(first_sentence("\n\nskip blank lines. x"), "skip blank lines.");
    }
}
