//! Inbound adapters and the outbound encoder.
//!
//! Anthropic- and OpenAI-format bodies are decoded into a [`CanonicalRequest`],
//! normalizing string-or-blocks content into plain text at this boundary.
//! [`canonical_to_vertex`] then renders the Vertex request body.

use super::anthropic_types::{ContentBlock, MessageContent, MessagesRequest};
use super::canonical::{effective_max_tokens, CanonicalRequest, Message, Role};
use super::openai_types::{ChatCompletionRequest, ChatContent, ContentPart};
use super::vertex_types::{BackendCall, VertexMessage, VertexRequest, ANTHROPIC_VERSION};
use crate::error::{ProxyError, Result};
use crate::models::ModelMap;

/// Decode an Anthropic Messages API body.
pub fn anthropic_to_canonical(body: &[u8]) -> Result<CanonicalRequest> {
    let req: MessagesRequest = serde_json::from_slice(body).map_err(|e| {
        ProxyError::malformed_request(format!("Invalid Anthropic request body: {e}"))
    })?;
    anthropic_request_to_canonical(req)
}

pub fn anthropic_request_to_canonical(req: MessagesRequest) -> Result<CanonicalRequest> {
    if req.messages.is_empty() {
        return Err(ProxyError::malformed_request("'messages' must not be empty"));
    }

    let messages = req
        .messages
        .into_iter()
        .map(|m| Message {
            role: m.role,
            content: normalize_content(m.content, ""),
        })
        .collect();

    let system = req
        .system
        .map(|s| normalize_content(s, "\n"))
        .filter(|s| !s.is_empty());

    Ok(CanonicalRequest {
        model: req.model,
        messages,
        system,
        max_tokens: effective_max_tokens(req.max_tokens),
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        stop_sequences: req.stop_sequences,
        stream: req.stream.unwrap_or(false),
    })
}

/// Decode an OpenAI Chat Completions body.
pub fn openai_to_canonical(body: &[u8]) -> Result<CanonicalRequest> {
    let req: ChatCompletionRequest = serde_json::from_slice(body).map_err(|e| {
        ProxyError::malformed_request(format!("Invalid OpenAI request body: {e}"))
    })?;
    openai_request_to_canonical(req)
}

/// System (and `developer`) messages are lifted into `system`; the first one
/// wins and later ones are dropped.
pub fn openai_request_to_canonical(req: ChatCompletionRequest) -> Result<CanonicalRequest> {
    let mut system: Option<String> = None;
    let mut messages = Vec::with_capacity(req.messages.len());

    for (index, msg) in req.messages.into_iter().enumerate() {
        let content = msg.content.map(normalize_chat_content).unwrap_or_default();

        match msg.role.as_str() {
            "system" | "developer" => {
                if system.is_none() {
                    system = Some(content);
                } else {
                    tracing::warn!(index, "Dropping additional system message");
                }
            }
            "user" => messages.push(Message {
                role: Role::User,
                content,
            }),
            "assistant" => messages.push(Message {
                role: Role::Assistant,
                content,
            }),
            other => {
                return Err(ProxyError::malformed_request(format!(
                    "Unsupported message role '{other}' at index {index}"
                )))
            }
        }
    }

    if messages.is_empty() {
        return Err(ProxyError::malformed_request(
            "'messages' must contain at least one non-system message",
        ));
    }

    let requested = req
        .max_tokens
        .filter(|n| *n > 0)
        .or(req.max_completion_tokens);

    Ok(CanonicalRequest {
        model: req.model,
        messages,
        system,
        max_tokens: effective_max_tokens(requested),
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: None,
        stop_sequences: req.stop.map(|s| s.into_vec()),
        stream: req.stream.unwrap_or(false),
    })
}

/// Encode a canonical request for Vertex. The model selects the route and is
/// resolved through the alias table.
pub fn canonical_to_vertex(req: &CanonicalRequest, models: &ModelMap) -> BackendCall {
    let messages = req
        .messages
        .iter()
        .map(|m| VertexMessage {
            role: m.role,
            content: m.content.clone(),
        })
        .collect();

    BackendCall {
        model: models.normalize(&req.model),
        body: VertexRequest {
            anthropic_version: ANTHROPIC_VERSION.to_string(),
            messages,
            system: req.system.clone(),
            max_tokens: req.max_tokens,
            stream: req.stream.then_some(true),
            temperature: req.temperature,
            top_p: req.top_p,
            top_k: req.top_k,
            stop_sequences: req.stop_sequences.clone(),
        },
    }
}

/// Encode a request that arrived in `OpenAI` format. Non-Claude model names
/// are routed to the default model rather than forwarded.
pub fn openai_canonical_to_vertex(req: &CanonicalRequest, models: &ModelMap) -> BackendCall {
    let mut call = canonical_to_vertex(req, models);
    call.model = models.normalize_foreign(&req.model);
    call
}

fn normalize_content(content: MessageContent, separator: &str) -> String {
    match content {
        MessageContent::Text(text) => text,
        MessageContent::Blocks(blocks) => blocks
            .into_iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Unsupported => None,
            })
            .collect::<Vec<_>>()
            .join(separator),
    }
}

fn normalize_chat_content(content: ChatContent) -> String {
    match content {
        ChatContent::Text(text) => text,
        ChatContent::Parts(parts) => parts
            .into_iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text),
                ContentPart::Unsupported => None,
            })
            .collect(),
    }
}
