//! Backend transport: one POST per call to Vertex's `:streamRawPredict`.
//! No retries; a non-2xx status is reported upward immediately.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;

use crate::config::ProxyConfig;
use crate::credentials::TokenSource;
use crate::error::{ProxyError, Result};
use crate::logging::{LogLevel, SharedLogger};
use crate::translate::response::truncate;
use crate::translate::vertex_types::BackendCall;

/// Raw backend body delivered incrementally.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Send a request and return the complete response body.
    async fn send_batch(&self, call: &BackendCall) -> Result<Bytes>;

    /// Send a request and return the response body as a byte stream.
    async fn send_stream(&self, call: &BackendCall) -> Result<ByteStream>;
}

pub struct VertexClient {
    client: reqwest::Client,
    endpoint: String,
    project_id: String,
    region: String,
    tokens: Arc<dyn TokenSource>,
    logger: SharedLogger,
}

impl VertexClient {
    pub fn new(
        client: reqwest::Client,
        config: &ProxyConfig,
        tokens: Arc<dyn TokenSource>,
        logger: SharedLogger,
    ) -> Self {
        Self {
            client,
            endpoint: config.effective_endpoint(),
            project_id: config.vertex.project_id.clone(),
            region: config.vertex.region.clone(),
            tokens,
            logger,
        }
    }

    pub fn url(&self, model: &str) -> String {
        format!(
            "{}/v1/projects/{}/locations/{}/publishers/anthropic/models/{}:streamRawPredict",
            self.endpoint, self.project_id, self.region, model
        )
    }

    async fn post(&self, call: &BackendCall) -> Result<reqwest::Response> {
        let url = self.url(&call.model);
        let token = self.tokens.token().await?;

        self.logger.info(
            "backend",
            format!(
                "POST {} messages={} streaming={}",
                url,
                call.body.messages.len(),
                call.is_streaming()
            ),
        );
        tracing::debug!(url = %url, body = ?call.body, "Sending backend request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&call.body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(
                status = status.as_u16(),
                body = %truncate(&body, 1000),
                "Backend returned non-success status"
            );
            self.logger.log_with_context(
                LogLevel::Error,
                "backend",
                format!("Backend returned status {}", status.as_u16()),
                serde_json::json!({
                    "url": url,
                    "status": status.as_u16(),
                    "body": truncate(&body, 1000),
                }),
            );
            return Err(ProxyError::backend(status.as_u16(), body));
        }

        Ok(response)
    }
}

#[async_trait]
impl Backend for VertexClient {
    async fn send_batch(&self, call: &BackendCall) -> Result<Bytes> {
        let response = self.post(call).await?;
        let body = response.bytes().await?;
        self.logger
            .debug("backend", format!("Response body_len={}", body.len()));
        Ok(body)
    }

    async fn send_stream(&self, call: &BackendCall) -> Result<ByteStream> {
        let response = self.post(call).await?;
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ProxyError::stream_read(e.to_string())));
        Ok(Box::pin(stream))
    }
}
