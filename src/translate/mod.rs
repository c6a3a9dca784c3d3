//! Translation between the caller formats (Anthropic Messages, `OpenAI` Chat
//! Completions) and the Vertex AI Anthropic endpoint.
//!
//! Both inbound formats are normalized into [`canonical`] types, which are then
//! encoded for the backend. Responses and stream events take the reverse path.
//! Everything here is pure; I/O lives in `backend` and `server`.

pub mod anthropic_types;
pub mod canonical;
pub mod openai_types;
pub mod request;
pub mod response;
pub mod streaming;
pub mod vertex_types;
