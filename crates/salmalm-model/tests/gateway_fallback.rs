// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! End-to-end gateway behavior against stub provider servers: fallback on
//! repeated 5xx, token-overflow surfacing, and cache hits on repeat calls.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use salmalm_model::{
    CallFailure, CallOptions, GatewayOptions, LlmGateway, Message, UsageMeter,
};
use salmalm_vault::Vault;

/// Minimal HTTP/1.1 stub: answers every request on the listener with the
/// next canned (status, json-body) response, repeating the last one.
async fn spawn_stub(responses: Vec<(u16, String)>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut served = 0usize;
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let (status, body) = responses
                .get(served.min(responses.len() - 1))
                .cloned()
                .unwrap_or((500, "{}".into()));
            served += 1;
            // Drain the request head + body enough for the client to accept
            // our response, then reply and close.
            let mut buf = [0u8; 65536];
            let _ = socket.read(&mut buf).await;
            let reason = match status {
                200 => "OK",
                404 => "Not Found",
                _ => "Error",
            };
            let resp = format!(
                "HTTP/1.1 {status} {reason}\r\ncontent-type: application/json\r\n\
                 content-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len(),
            );
            let _ = socket.write_all(resp.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });
    format!("http://{addr}")
}

fn make_gateway(keys: &[(&str, &str)], opts: GatewayOptions) -> (tempfile::TempDir, LlmGateway) {
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

fn openai_ok(content: &str) -> String {
    serde_json::json!({
        "choices": [{ "message": { "role": "assistant", "content": content } }],
        "usage": { "prompt_tokens": 3, "completion_tokens": 2 }
    })
    .to_string()
}

#[tokio::test]
async fn anthropic_500_falls_back_to_next_provider() {
    // Anthropic stub always 500s (the client retries it 3 times); the xai
    // stub answers. Fallback order is [xai] so response.model reports xai.
    let anthropic_url = spawn_stub(vec![(500, r#"{"error":"overloaded"}"#.into())]).await;
    let xai_url = spawn_stub(vec![(200, openai_ok("hi from fallback"))]).await;

    let mut opts = GatewayOptions::default();
    opts.fallback_order = vec!["xai".into()];
    opts.base_urls.insert("anthropic".into(), anthropic_url);
    opts.base_urls.insert("xai".into(), xai_url);

    let (_dir, gw) = make_gateway(
        &[("anthropic_api_key", "a-key"), ("xai_api_key", "x-key")],
        opts,
    );

    let result = gw
        .call(
            &[Message::user("hello")],
            CallOptions {
                model: Some("anthropic/claude-sonnet-4-5".into()),
                ..Default::default()
            },
        )
        .await;

    assert!(
        result.model.starts_with("xai/"),
        "expected fallback model, got {}",
        result.model
    );
    assert_eq!(result.content, "hi from fallback");
    assert_eq!(gw.metrics_snapshot().fallbacks, 1);
}

#[tokio::test]
async fn token_overflow_is_surfaced_not_fallen_back() {
    let anthropic_url = spawn_stub(vec![(
        400,
        r#"{"error":{"type":"invalid_request_error","message":"prompt is too long: 250000 tokens > 200000 maximum"}}"#.into(),
    )])
    .await;
    let xai_url = spawn_stub(vec![(200, openai_ok("should never be called"))]).await;

    let mut opts = GatewayOptions::default();
    opts.fallback_order = vec!["xai".into()];
    opts.base_urls.insert("anthropic".into(), anthropic_url);
    opts.base_urls.insert("xai".into(), xai_url);

    let (_dir, gw) = make_gateway(
        &[("anthropic_api_key", "a-key"), ("xai_api_key", "x-key")],
        opts,
    );

    let result = gw
        .call(
            &[Message::user("very long prompt")],
            CallOptions {
                model: Some("anthropic/claude-sonnet-4-5".into()),
                ..Default::default()
            },
        )
        .await;

    assert_eq!(result.error, Some(CallFailure::TokenOverflow));
    assert!(result.content.is_empty());
    assert_eq!(gw.metrics_snapshot().fallbacks, 0, "overflow must not fall back");
}

#[tokio::test]
async fn repeat_call_hits_cache_with_zero_usage() {
    let xai_url = spawn_stub(vec![(200, openai_ok("pong"))]).await;

    let mut opts = GatewayOptions::default();
    opts.base_urls.insert("xai".into(), xai_url);

    let (_dir, gw) = make_gateway(&[("xai_api_key", "x")], opts);
    let call_opts = CallOptions {
        model: Some("xai/grok-3".into()),
        session_id: Some("s1".into()),
        ..Default::default()
    };

    let first = gw.call(&[Message::user("ping")], call_opts.clone()).await;
    assert!(!first.cached);
    assert_eq!(first.content, "pong");

    // Second identical call must be served from cache: same text, zero usage.
    let second = gw.call(&[Message::user("ping")], call_opts).await;
    assert!(second.cached, "second call should hit the cache");
    assert_eq!(second.content, "pong");
    assert_eq!(second.usage.input_tokens, 0);
    assert_eq!(second.usage.output_tokens, 0);
}

#[tokio::test]
async fn all_providers_failing_returns_structured_error() {
    let bad = spawn_stub(vec![(503, r#"{"error":"down"}"#.into())]).await;
    let mut opts = GatewayOptions::default();
    opts.fallback_order = vec![];
    opts.base_urls.insert("xai".into(), bad);

    let (_dir, gw) = make_gateway(&[("xai_api_key", "x")], opts);
    let result = gw
        .call(
            &[Message::user("hi")],
            CallOptions {
                model: Some("xai/grok-3".into()),
                ..Default::default()
            },
        )
        .await;

    assert!(result.content.starts_with("❌ All LLM calls failed"));
    assert!(result.error.is_none());
}

#[tokio::test]
async fn stream_not_a_chat_model_retries_responses_and_memoizes() {
    fn responses_ok(text: &str) -> String {
        serde_json::json!({
            "output": [{
                "type": "message",
                "content": [{ "type": "output_text", "text": text }]
            }],
            "usage": { "input_tokens": 5, "output_tokens": 2 }
        })
        .to_string()
    }

    // Request 1: chat/completions stream attempt → 404 "not a chat model".
    // Request 2: the transparent /responses retry.
    // Request 3: a second stream call, served directly from /responses
    // because the model was memoized (a chat attempt would see a body with
    // no `choices` and produce empty content).
    let openai_url = spawn_stub(vec![
        (
            404,
            r#"{"error":{"message":"This model is not a chat model. Use the responses API."}}"#
                .into(),
        ),
        (200, responses_ok("from responses")),
        (200, responses_ok("memoized")),
    ])
    .await;

    let mut opts = GatewayOptions::default();
    opts.fallback_order = vec![];
    opts.base_urls.insert("openai".into(), openai_url);

    let (_dir, gw) = make_gateway(&[("openai_api_key", "sk")], opts);
    let call_opts = CallOptions {
        model: Some("openai/o3-pro".into()),
        ..Default::default()
    };

    let mut deltas: Vec<String> = Vec::new();
    let result = gw
        .stream(&[Message::user("solve this")], call_opts.clone(), |ev| {
            if let salmalm_model::StreamEvent::TextDelta { text } = ev {
                deltas.push(text.clone());
            }
        })
        .await;
    assert_eq!(result.content, "from responses");
    assert_eq!(result.model, "openai/o3-pro");
    assert_eq!(deltas, vec!["from responses".to_string()]);

    let second = gw
        .stream(&[Message::user("and this")], call_opts, |_| {})
        .await;
    assert_eq!(
        second.content, "memoized",
        "memoized model must skip the chat endpoint on later streams"
    );
}

#[tokio::test]
async fn openai_not_a_chat_model_retries_responses_endpoint() {
    // First request (chat/completions) → 404 "not a chat model".
    // Second request (responses) → success.
    let openai_url = spawn_stub(vec![
        (
            404,
            r#"{"error":{"message":"This model is not a chat model. Use the responses API."}}"#
                .into(),
        ),
        (
            200,
            serde_json::json!({
                "output": [{
                    "type": "message",
                    "content": [{ "type": "output_text", "text": "from responses" }]
                }],
                "usage": { "input_tokens": 5, "output_tokens": 2 }
            })
            .to_string(),
        ),
    ])
    .await;

    let mut opts = GatewayOptions::default();
    opts.fallback_order = vec![];
    opts.base_urls.insert("openai".into(), openai_url);

    let (_dir, gw) = make_gateway(&[("openai_api_key", "sk")], opts);
    let result = gw
        .call(
            &[Message::user("solve this")],
            CallOptions {
                model: Some("openai/o3-pro".into()),
                ..Default::default()
            },
        )
        .await;

    assert_eq!(result.content, "from responses");
    assert_eq!(result.model, "openai/o3-pro");
}
