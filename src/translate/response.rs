//! Batch response decoding and the non-streaming formatters.

use super::anthropic_types::{
    AnthropicResponse, MessagesResponse, MinimalResponse, ResponseContentBlock,
};
use super::canonical::{CanonicalResponse, StopReason, Usage};
use super::openai_types::{ChatCompletionResponse, ChatUsage, Choice, ChoiceMessage};
use super::vertex_types::{VertexContentBlock, VertexResponse};
use crate::config::ResponseShape;
use crate::error::{ProxyError, Result};

/// Parse a complete Vertex response body. Mistyped or missing fields become
/// `MalformedResponse`; the raw body is logged for diagnosis.
pub fn decode_vertex_response(body: &[u8]) -> Result<CanonicalResponse> {
    let resp: VertexResponse = serde_json::from_slice(body).map_err(|e| {
        tracing::error!(
            error = %e,
            body = %truncate(&String::from_utf8_lossy(body), 500),
            "Failed to parse backend response"
        );
        ProxyError::malformed_response(format!("Failed to parse backend response: {e}"))
    })?;

    let content: Vec<String> = resp
        .content
        .into_iter()
        .filter_map(|block| match block {
            VertexContentBlock::Text { text } => Some(text),
            VertexContentBlock::Other => None,
        })
        .collect();

    if content.is_empty() {
        tracing::error!(
            body = %truncate(&String::from_utf8_lossy(body), 500),
            "Backend response has no text content"
        );
        return Err(ProxyError::malformed_response(
            "Backend response has no text content",
        ));
    }

    let usage = resp.usage.unwrap_or_default();

    Ok(CanonicalResponse {
        id: resp.id.unwrap_or_else(new_message_id),
        model: resp.model,
        content,
        stop_reason: resp
            .stop_reason
            .as_deref()
            .map_or(StopReason::EndTurn, StopReason::parse),
        usage: Usage {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
        },
    })
}

/// Render a canonical response for `/v1/messages` in the configured shape.
pub fn canonical_to_anthropic(resp: &CanonicalResponse, shape: ResponseShape) -> AnthropicResponse {
    match shape {
        ResponseShape::Minimal => AnthropicResponse::Minimal(MinimalResponse {
            content: resp.text(),
            model: resp.model.clone(),
            usage: resp.usage,
        }),
        ResponseShape::Full => AnthropicResponse::Full(MessagesResponse {
            id: resp.id.clone(),
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            model: resp.model.clone(),
            content: vec![ResponseContentBlock::Text { text: resp.text() }],
            stop_reason: Some(resp.stop_reason.to_string()),
            stop_sequence: None,
            usage: resp.usage,
        }),
    }
}

/// Render a canonical response for `/v1/chat/completions`. `model` is the
/// name the caller asked for.
pub fn canonical_to_openai(resp: &CanonicalResponse, model: &str, created: i64) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: format!("chatcmpl-{}", resp.id.trim_start_matches("msg_")),
        object: "chat.completion".to_string(),
        created,
        model: model.to_string(),
        usage: ChatUsage {
            prompt_tokens: resp.usage.input_tokens,
            completion_tokens: resp.usage.output_tokens,
            total_tokens: resp
                .usage
                .input_tokens
                .saturating_add(resp.usage.output_tokens),
        },
        choices: vec![Choice {
            index: 0,
            message: ChoiceMessage {
                role: "assistant".to_string(),
                content: resp.text(),
            },
            finish_reason: Some(resp.stop_reason.finish_reason().to_string()),
        }],
    }
}

pub fn new_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

pub(crate) fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &[u8] = br#"{"content":[{"type":"text","text":"Hello"}],"model":"m","stop_reason":"end_turn","usage":{"input_tokens":1,"output_tokens":1}}"#;

    #[test]
    fn test_decode_simple_response() {
        let resp = decode_vertex_response(HELLO).unwrap();
        assert_eq!(resp.text(), "Hello");
        assert_eq!(resp.model, "m");
        assert_eq!(resp.stop_reason, StopReason::EndTurn);
        assert_eq!(resp.usage, Usage { input_tokens: 1, output_tokens: 1 });
        assert!(resp.id.starts_with("msg_"));
    }

    #[test]
    fn test_decode_skips_non_text_blocks() {
        let resp = decode_vertex_response(
            br#"{"id":"msg_01","model":"claude-3-5-sonnet","stop_reason":"max_tokens",
                "content":[{"type":"text","text":"a"},{"type":"tool_use","id":"t","name":"n","input":{}},{"type":"text","text":"b"}]}"#,
        )
        .unwrap();
        assert_eq!(resp.content, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(resp.id, "msg_01");
        assert_eq!(resp.stop_reason, StopReason::MaxTokens);
        assert_eq!(resp.usage, Usage::default());
    }

    #[test]
    fn test_decode_rejects_malformed_bodies() {
        let cases: &[&[u8]] = &[
            b"not json",
            br#"{"content":[],"model":"m"}"#,
            br#"{"model":"m"}"#,
            br#"{"content":[{"type":"text","text":"x"}]}"#,
            br#"{"content":[{"type":"text","text":42}],"model":"m"}"#,
            br#"{"content":"Hello","model":"m"}"#,
            br#"{"content":[{"type":"text","text":"x"}],"model":7}"#,
            br#"{"content":[{"type":"text","text":"x"}],"model":"m","usage":{"input_tokens":-1}}"#,
        ];
        for body in cases {
            let err = decode_vertex_response(body).unwrap_err();
            assert!(
                matches!(err, ProxyError::MalformedResponse { .. }),
                "expected MalformedResponse for {}",
                String::from_utf8_lossy(body)
            );
        }
    }

    #[test]
    fn test_minimal_anthropic_shape() {
        let resp = decode_vertex_response(HELLO).unwrap();
        let json = serde_json::to_value(canonical_to_anthropic(&resp, ResponseShape::Minimal)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "content": "Hello",
                "model": "m",
                "usage": {"input_tokens": 1, "output_tokens": 1}
            })
        );
    }

    #[test]
    fn test_full_anthropic_shape() {
        let resp = decode_vertex_response(HELLO).unwrap();
        let json = serde_json::to_value(canonical_to_anthropic(&resp, ResponseShape::Full)).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["content"][0]["text"], "Hello");
        assert_eq!(json["stop_reason"], "end_turn");
        assert!(json["stop_sequence"].is_null());
    }

    #[test]
    fn test_openai_roundtrip_preserves_text() {
        let resp = CanonicalResponse {
            id: "msg_abc".to_string(),
            model: "claude-3-5-sonnet@20240620".to_string(),
            content: vec!["The capital ".to_string(), "is Berlin.".to_string()],
            stop_reason: StopReason::MaxTokens,
            usage: Usage { input_tokens: 42, output_tokens: 8 },
        };

        let openai = canonical_to_openai(&resp, "gpt-4o", 1_700_000_000);
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&openai).unwrap()).unwrap();

        assert_eq!(json["choices"][0]["message"]["content"], "The capital is Berlin.");
        assert_eq!(json["choices"][0]["finish_reason"], "length");
        assert_eq!(json["object"], "chat.completion");
        assert_eq!(json["model"], "gpt-4o");
        assert_eq!(json["id"], "chatcmpl-abc");
        assert_eq!(json["created"], 1_700_000_000);
        assert_eq!(json["usage"]["total_tokens"], 50);
    }

    #[test]
    fn test_openai_total_tokens_saturates() {
        let resp = decode_vertex_response(
            br#"{"content":[{"type":"text","text":"x"}],"model":"m","usage":{"input_tokens":18446744073709551615,"output_tokens":1}}"#,
        )
        .unwrap();
        let openai = canonical_to_openai(&resp, "gpt-4o", 0);
        assert_eq!(openai.usage.prompt_tokens, u64::MAX);
        assert_eq!(openai.usage.total_tokens, u64::MAX);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("short", 100), "short");
    }
}
