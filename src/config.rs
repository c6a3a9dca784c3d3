use crate::error::{ProxyError, Result};
use crate::logging::LogLevel;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub vertex: VertexConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    /// Caller model name -> backend model id, layered over the built-in aliases.
    #[serde(default)]
    pub models: HashMap<String, String>,
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub anthropic_response: ResponseShape,
    #[serde(default)]
    pub stream_mode: StreamMode,
    #[serde(default = "default_buffered_chunks")]
    pub buffered_chunks: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VertexConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub region: String,
    /// Backend model used when a request does not name one.
    #[serde(default)]
    pub model: String,
    /// Static OAuth token. Overrides `credentials` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default)]
    pub credentials: CredentialSource,
}

/// Where OAuth tokens come from when no static token is configured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialSource {
    /// Application Default Credentials: `GOOGLE_APPLICATION_CREDENTIALS`,
    /// the gcloud user config, or the metadata server.
    #[default]
    Adc,
    /// `gcloud auth print-access-token` on every refresh.
    Gcloud,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anthropic_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openai_api_key: Option<String>,
}

/// Body shape of non-streaming `/v1/messages` responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseShape {
    /// `{content, model, usage}`
    #[default]
    Minimal,
    /// The Messages API object with typed content blocks.
    Full,
}

/// Source of the text for streamed `/v1/messages` responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Re-frame the backend's own SSE stream.
    #[default]
    Backend,
    /// Make a batch call and split the reply into `buffered_chunks` pieces.
    Buffered,
}

fn default_port() -> u16 {
    8070
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_buffered_chunks() -> usize {
    10
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            vertex: VertexConfig::default(),
            auth: AuthConfig::default(),
            models: HashMap::new(),
            log_level: default_log_level(),
            log_file: None,
            anthropic_response: ResponseShape::default(),
            stream_mode: StreamMode::default(),
            buffered_chunks: default_buffered_chunks(),
        }
    }
}

impl ProxyConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Search standard locations for a config file, falling back to defaults.
    /// Priority: CLI arg > CWD > XDG config > home dir
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        for candidate in &config_search_paths() {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(candidate);
            }
        }

        tracing::info!("No config file found, using defaults and environment");
        Ok(Self::default())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup. Empty values are ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("VERTEX_AI_ENDPOINT") {
            self.vertex.endpoint = Some(v);
        }
        if let Some(v) = get("VERTEX_AI_PROJECT_ID") {
            self.vertex.project_id = v;
        }
        if let Some(v) = get("VERTEX_AI_REGION") {
            self.vertex.region = v;
        }
        if let Some(v) = get("MODEL") {
            self.vertex.model = v;
        }
        if let Some(v) = get("VERTEX_AI_ACCESS_TOKEN") {
            self.vertex.access_token = Some(v);
        }
        if let Some(v) = get("ANTHROPIC_PROXY_API_KEY") {
            self.auth.anthropic_api_key = Some(v);
        }
        if let Some(v) = get("OPENAI_PROXY_API_KEY") {
            self.auth.openai_api_key = Some(v);
        }
        if let Some(v) = get("PORT") {
            self.port = v
                .trim()
                .parse()
                .map_err(|_| ProxyError::config(format!("PORT '{v}' is not a valid port")))?;
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.log_level = v
                .parse()
                .map_err(|_| ProxyError::config(format!("LOG_LEVEL '{v}' is not a valid level")))?;
        }
        Ok(())
    }

    /// Check that everything needed to serve requests is present.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.vertex.project_id.trim().is_empty() {
            missing.push("VERTEX_AI_PROJECT_ID");
        }
        if self.vertex.region.trim().is_empty() {
            missing.push("VERTEX_AI_REGION");
        }
        if self.vertex.model.trim().is_empty() {
            missing.push("MODEL");
        }
        if !missing.is_empty() {
            return Err(ProxyError::config(format!(
                "Missing required settings: {}",
                missing.join(", ")
            )));
        }

        if self.api_keys().is_empty() {
            return Err(ProxyError::config(
                "No proxy API key configured. Set ANTHROPIC_PROXY_API_KEY or OPENAI_PROXY_API_KEY.",
            ));
        }

        if self.buffered_chunks == 0 {
            return Err(ProxyError::config("buffered_chunks must be at least 1"));
        }

        Ok(())
    }

    /// The configured Vertex endpoint, or the regional default.
    pub fn effective_endpoint(&self) -> String {
        match self.vertex.endpoint {
            Some(ref url) => url.trim_end_matches('/').to_string(),
            None => format!("https://{}-aiplatform.googleapis.com", self.vertex.region),
        }
    }

    /// Keys accepted by the auth middleware.
    pub fn api_keys(&self) -> Vec<&str> {
        [&self.auth.anthropic_api_key, &self.auth.openai_api_key]
            .into_iter()
            .filter_map(|k| k.as_deref())
            .filter(|k| !k.is_empty())
            .collect()
    }
}

/// Candidate config file locations, in search order.
pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    paths.push(PathBuf::from("vertex-proxy.toml"));

    if cfg!(target_os = "macos") {
        if let Some(home) = dirs_path() {
            paths.push(
                home.join("Library")
                    .join("Application Support")
                    .join("vertex-proxy")
                    .join("config.toml"),
            );
        }
    } else {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            paths.push(PathBuf::from(xdg).join("vertex-proxy").join("config.toml"));
        }
        if let Some(home) = dirs_path() {
            paths.push(home.join(".config").join("vertex-proxy").join("config.toml"));
        }
    }

    if let Some(home) = dirs_path() {
        paths.push(home.join(".vertex-proxy.toml"));
    }

    paths
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
