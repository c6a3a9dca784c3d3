//! OAuth access tokens for the Vertex API.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OnceCell};

use crate::config::{CredentialSource, VertexConfig};
use crate::error::{ProxyError, Result};

/// gcloud access tokens live for an hour; refresh well before that.
const GCLOUD_TOKEN_TTL: Duration = Duration::from_secs(50 * 60);

const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<String>;

    /// Short label for startup logs.
    fn kind(&self) -> &'static str;
}

/// A token supplied through configuration.
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<String> {
        Ok(self.0.clone())
    }

    fn kind(&self) -> &'static str {
        "static"
    }
}

struct CachedToken {
    value: String,
    fetched_at: Instant,
}

/// Tokens from `gcloud auth print-access-token`, cached until close to expiry.
pub struct GcloudToken {
    program: String,
    cached: Mutex<Option<CachedToken>>,
}

impl GcloudToken {
    pub fn new() -> Self {
        Self::with_program("gcloud")
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            cached: Mutex::new(None),
        }
    }

    async fn fetch(&self) -> Result<String> {
        let output = tokio::process::Command::new(&self.program)
            .args(["auth", "print-access-token"])
            .output()
            .await
            .map_err(|e| {
                ProxyError::credentials(format!("Failed to run '{}': {e}", self.program))
            })?;

        if !output.status.success() {
            return Err(ProxyError::credentials(format!(
                "'{} auth print-access-token' exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(ProxyError::credentials("gcloud returned an empty access token"));
        }
        Ok(token)
    }
}

impl Default for GcloudToken {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenSource for GcloudToken {
    async fn token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(ref token) = *cached {
            if token.fetched_at.elapsed() < GCLOUD_TOKEN_TTL {
                return Ok(token.value.clone());
            }
        }

        tracing::debug!(program = %self.program, "Fetching access token");
        let value = self.fetch().await?;
        *cached = Some(CachedToken {
            value: value.clone(),
            fetched_at: Instant::now(),
        });
        Ok(value)
    }

    fn kind(&self) -> &'static str {
        "gcloud"
    }
}

/// Application Default Credentials via `gcp_auth`. The provider is
/// discovered on first use and caches and refreshes tokens itself.
#[derive(Default)]
pub struct AdcToken {
    provider: OnceCell<Arc<dyn gcp_auth::TokenProvider>>,
}

impl AdcToken {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenSource for AdcToken {
    async fn token(&self) -> Result<String> {
        let provider = self
            .provider
            .get_or_try_init(|| async {
                let provider = gcp_auth::provider().await.map_err(|e| {
                    ProxyError::credentials(format!(
                        "No Application Default Credentials found: {e}"
                    ))
                })?;
                tracing::info!("Using Application Default Credentials");
                Ok::<_, ProxyError>(provider)
            })
            .await?;

        let token = provider
            .token(&[CLOUD_PLATFORM_SCOPE])
            .await
            .map_err(|e| ProxyError::credentials(format!("Failed to obtain access token: {e}")))?;
        Ok(token.as_str().to_string())
    }

    fn kind(&self) -> &'static str {
        "adc"
    }
}

/// Static token when configured, otherwise the configured credential source.
pub fn token_source(config: &VertexConfig) -> Arc<dyn TokenSource> {
    match config.access_token {
        Some(ref token) if !token.is_empty() => Arc::new(StaticToken::new(token.clone())),
        _ => match config.credentials {
            CredentialSource::Adc => Arc::new(AdcToken::new()),
            CredentialSource::Gcloud => Arc::new(GcloudToken::new()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token() {
        let config = VertexConfig {
            access_token: Some("ya29.static".to_string()),
            ..VertexConfig::default()
        };
        assert_eq!(token_source(&config).token().await.unwrap(), "ya29.static");
    }

    #[test]
    fn test_source_selection() {
        let mut config = VertexConfig::default();
        assert_eq!(token_source(&config).kind(), "adc");

        config.credentials = CredentialSource::Gcloud;
        assert_eq!(token_source(&config).kind(), "gcloud");

        config.access_token = Some(String::new());
        assert_eq!(token_source(&config).kind(), "gcloud");

        config.access_token = Some("ya29.static".to_string());
        assert_eq!(token_source(&config).kind(), "static");
    }

    #[tokio::test]
    async fn test_missing_program_is_credentials_error() {
        let source = GcloudToken::with_program("/nonexistent/bin/gcloud");
        let err = source.token().await.unwrap_err();
        assert!(matches!(err, ProxyError::Credentials { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_output_is_trimmed_and_cached() {
        // `echo auth print-access-token` stands in for gcloud
        let source = GcloudToken::with_program("echo");
        let first = source.token().await.unwrap();
        assert_eq!(first, "auth print-access-token");
        assert!(source.cached.lock().await.is_some());
        assert_eq!(source.token().await.unwrap(), first);
    }
}
