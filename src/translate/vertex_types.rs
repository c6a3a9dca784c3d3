//! Wire types for Vertex AI's Anthropic publisher endpoint (`:streamRawPredict`).

use serde::{Deserialize, Serialize};

use super::canonical::Role;

/// Protocol tag Vertex requires in place of the `anthropic-version` header.
pub const ANTHROPIC_VERSION: &str = "vertex-2023-10-16";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VertexRequest {
    pub anthropic_version: String,
    pub messages: Vec<VertexMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub max_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VertexResponse {
    #[serde(default)]
    pub id: Option<String>,
    pub content: Vec<VertexContentBlock>,
    pub model: String,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<VertexUsage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum VertexContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VertexUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Payload of a `content_block_delta` stream event. Only text deltas carry
/// `delta.text`; anything else fails to parse and is skipped by the decoder.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentBlockDeltaEvent {
    pub delta: TextDelta,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextDelta {
    pub text: String,
}

/// An encoded backend request: the route's model id plus the JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendCall {
    pub model: String,
    pub body: VertexRequest,
}

impl BackendCall {
    pub fn is_streaming(&self) -> bool {
        self.body.stream.unwrap_or(false)
    }
}
