use crate::backend::Backend;
use crate::config::{ProxyConfig, StreamMode};
use crate::error::{ProxyError, Result};
use crate::logging::{LogLevel, SharedLogger};
use crate::models::ModelMap;
use crate::translate::canonical::{CanonicalRequest, CanonicalResponse, StreamDelta};
use crate::translate::request::{
    anthropic_to_canonical, canonical_to_vertex, openai_canonical_to_vertex, openai_to_canonical,
};
use crate::translate::response::{canonical_to_anthropic, canonical_to_openai, decode_vertex_response};
use crate::translate::streaming::{chunk_text, decode_sse_stream, openai_chunk, AnthropicFramer};
use crate::translate::vertex_types::BackendCall;

use axum::extract::{Query, Request, State};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub config: ProxyConfig,
    pub models: ModelMap,
    pub backend: Arc<dyn Backend>,
    pub logger: SharedLogger,
}

impl AppState {
    pub fn new(config: ProxyConfig, backend: Arc<dyn Backend>, logger: SharedLogger) -> Self {
        let models = ModelMap::new(&config.models, config.vertex.model.clone());
        Self {
            config,
            models,
            backend,
            logger,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route(
            "/v1/messages",
            post(handle_messages).fallback(method_not_allowed),
        )
        .route(
            "/v1/chat/completions",
            post(handle_chat_completions).fallback(method_not_allowed),
        )
        .route(
            "/set-log-level",
            post(handle_set_log_level).fallback(method_not_allowed),
        )
        .route("/logs", get(handle_logs).fallback(method_not_allowed))
        .route(
            "/refresh-credentials",
            post(handle_refresh_credentials).fallback(method_not_allowed),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/health", get(handle_health).fallback(method_not_allowed))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = extract_api_key(request.headers())
        .is_some_and(|key| state.config.api_keys().contains(&key));

    if !authorized {
        state.logger.warn(
            "auth",
            format!("Rejected {} {}", request.method(), request.uri().path()),
        );
        return ProxyError::Unauthorized.into_response();
    }

    next.run(request).await
}

/// The presented proxy key: `Authorization: Bearer <key>`, else `X-API-Key`.
fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, token) = v.trim().split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        })
        .filter(|t| !t.is_empty());

    bearer.or_else(|| {
        headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|t| !t.is_empty())
    })
}

async fn method_not_allowed() -> ProxyError {
    ProxyError::MethodNotAllowed
}

async fn handle_messages(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Response> {
    let req = anthropic_to_canonical(&body)?;
    log_request(&state, "/v1/messages", &req);

    if !req.stream {
        let resp = call_batch(&state, canonical_to_vertex(&req, &state.models)).await?;
        let body = canonical_to_anthropic(&resp, state.config.anthropic_response);
        return Ok(Json(body).into_response());
    }

    let rx = match state.config.stream_mode {
        StreamMode::Backend => spawn_backend_stream(
            state.backend.clone(),
            canonical_to_vertex(&req, &state.models),
        ),
        StreamMode::Buffered => spawn_buffered_stream(
            state.backend.clone(),
            canonical_to_vertex(&batch_copy(&req), &state.models),
            state.config.buffered_chunks,
        ),
    };

    let mut framer = AnthropicFramer::new();
    sse_response(
        rx,
        move |delta| {
            let event = framer.frame(delta);
            Event::default()
                .event(event.event_name())
                .data(to_json(&event))
        },
        None,
    )
    .await
}

async fn handle_chat_completions(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response> {
    let req = openai_to_canonical(&body)?;
    log_request(&state, "/v1/chat/completions", &req);

    let model = if req.model.is_empty() {
        state.models.default_model().to_string()
    } else {
        req.model.clone()
    };
    let created = chrono::Utc::now().timestamp();

    if !req.stream {
        let resp = call_batch(&state, openai_canonical_to_vertex(&req, &state.models)).await?;
        return Ok(Json(canonical_to_openai(&resp, &model, created)).into_response());
    }

    let rx = spawn_backend_stream(
        state.backend.clone(),
        openai_canonical_to_vertex(&req, &state.models),
    );

    sse_response(
        rx,
        move |delta| match delta {
            StreamDelta::Content(text) => {
                Event::default().data(to_json(&openai_chunk(text, &model, created)))
            }
            StreamDelta::MessageStop => done_event(),
        },
        Some(done_event()),
    )
    .await
}

#[derive(Deserialize)]
struct SetLogLevelRequest {
    level: String,
}

async fn handle_set_log_level(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<serde_json::Value>> {
    let req: SetLogLevelRequest = serde_json::from_slice(&body)
        .map_err(|e| ProxyError::malformed_request(format!("Invalid request body: {e}")))?;
    let level: LogLevel = req.level.parse()?;

    state.logger.set_level(level)?;
    state
        .logger
        .info("server", format!("Log level set to {level}"));

    Ok(Json(serde_json::json!({
        "status": "ok",
        "level": level.as_str(),
    })))
}

const DEFAULT_LOG_LIMIT: usize = 100;

#[derive(Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

/// Most recent request-log entries, newest first.
async fn handle_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> Json<serde_json::Value> {
    let entries = state.logger.recent(query.limit.unwrap_or(DEFAULT_LOG_LIMIT));
    Json(serde_json::json!({
        "level": state.logger.level().as_str(),
        "count": entries.len(),
        "entries": entries,
    }))
}

async fn handle_refresh_credentials(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    state
        .logger
        .info("server", "Credentials refresh requested");
    Json(serde_json::json!({
        "status": "ok",
        "message": "Credentials refresh acknowledged",
    }))
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn log_request(state: &AppState, route: &str, req: &CanonicalRequest) {
    state.logger.info(
        "server",
        format!(
            "Request: route={} model={} streaming={} messages={}",
            route,
            req.model,
            req.stream,
            req.messages.len()
        ),
    );
}

async fn call_batch(state: &AppState, call: BackendCall) -> Result<CanonicalResponse> {
    let body = state.backend.send_batch(&call).await?;
    let resp = decode_vertex_response(&body)?;
    state.logger.info(
        "server",
        format!(
            "Response: model={} stop_reason={} input_tokens={} output_tokens={}",
            resp.model, resp.stop_reason, resp.usage.input_tokens, resp.usage.output_tokens
        ),
    );
    Ok(resp)
}

/// Buffered streaming makes a batch call, so the backend must not stream.
fn batch_copy(req: &CanonicalRequest) -> CanonicalRequest {
    CanonicalRequest {
        stream: false,
        ..req.clone()
    }
}

/// Producer for the real backend stream. Read errors are pushed and end the
/// task; a closed receiver means the client went away.
fn spawn_backend_stream(
    backend: Arc<dyn Backend>,
    call: BackendCall,
) -> mpsc::Receiver<Result<StreamDelta>> {
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let bytes = match backend.send_stream(&call).await {
            Ok(s) => s,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        let deltas = decode_sse_stream(bytes);
        tokio::pin!(deltas);

        while let Some(item) = deltas.next().await {
            let failed = item.is_err();
            if tx.send(item).await.is_err() {
                tracing::debug!("Client disconnected, dropping backend stream");
                return;
            }
            if failed {
                return;
            }
        }
    });

    rx
}

/// Producer for synthetic streaming: one batch call, then the text in pieces.
fn spawn_buffered_stream(
    backend: Arc<dyn Backend>,
    call: BackendCall,
    pieces: usize,
) -> mpsc::Receiver<Result<StreamDelta>> {
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let resp = match backend.send_batch(&call).await {
            Ok(body) => decode_vertex_response(&body),
            Err(e) => Err(e),
        };
        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        for piece in chunk_text(&resp.text(), pieces) {
            if tx.send(Ok(StreamDelta::Content(piece))).await.is_err() {
                tracing::debug!("Client disconnected during buffered stream");
                return;
            }
        }
        let _ = tx.send(Ok(StreamDelta::MessageStop)).await;
    });

    rx
}

/// Consume producer output as an SSE body. The first item is awaited before
/// headers go out so an early failure becomes an HTTP error. Later failures
/// end the body without `trailer`, which is otherwise sent on a clean close
/// that never saw `MessageStop`.
async fn sse_response<F>(
    mut rx: mpsc::Receiver<Result<StreamDelta>>,
    mut frame: F,
    trailer: Option<Event>,
) -> Result<Response>
where
    F: FnMut(StreamDelta) -> Event + Send + 'static,
{
    let first = match rx.recv().await {
        Some(Ok(delta)) => Some(delta),
        Some(Err(e)) => return Err(e),
        None => None,
    };

    let body = async_stream::stream! {
        let mut rest = ReceiverStream::new(rx);
        let mut pending = first;
        let mut stopped = false;
        let mut failed = false;

        loop {
            let delta = match pending.take() {
                Some(d) => d,
                None => match rest.next().await {
                    Some(Ok(d)) => d,
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Stream failed after response started");
                        failed = true;
                        break;
                    }
                    None => break,
                },
            };

            let is_stop = delta == StreamDelta::MessageStop;
            yield Ok::<Event, Infallible>(frame(delta));
            if is_stop {
                stopped = true;
                break;
            }
        }

        if !stopped && !failed {
            if let Some(event) = trailer {
                yield Ok(event);
            }
        }
    };

    Ok(Sse::new(body).keep_alive(KeepAlive::default()).into_response())
}

fn done_event() -> Event {
    Event::default().data("[DONE]")
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to serialize stream event");
        "{}".to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_extract_bearer_token() {
        let h = headers(&[("authorization", "Bearer sk-proxy")]);
        assert_eq!(extract_api_key(&h), Some("sk-proxy"));

        let h = headers(&[("authorization", "bearer  sk-proxy ")]);
        assert_eq!(extract_api_key(&h), Some("sk-proxy"));
    }

    #[test]
    fn test_extract_x_api_key() {
        let h = headers(&[("x-api-key", "sk-proxy")]);
        assert_eq!(extract_api_key(&h), Some("sk-proxy"));
    }

    #[test]
    fn test_bearer_takes_precedence() {
        let h = headers(&[("authorization", "Bearer first"), ("x-api-key", "second")]);
        assert_eq!(extract_api_key(&h), Some("first"));
    }

    #[test]
    fn test_missing_or_malformed_credentials() {
        assert_eq!(extract_api_key(&HeaderMap::new()), None);
        assert_eq!(
            extract_api_key(&headers(&[("authorization", "Basic dXNlcjpwYXNz")])),
            None
        );
        assert_eq!(extract_api_key(&headers(&[("authorization", "Bearer")])), None);
        assert_eq!(extract_api_key(&headers(&[("x-api-key", "")])), None);
    }

    #[test]
    fn test_batch_copy_disables_streaming() {
        let req = CanonicalRequest {
            model: "m".to_string(),
            messages: Vec::new(),
            system: None,
            max_tokens: 10,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            stream: true,
        };
        assert!(!batch_copy(&req).stream);
        assert_eq!(batch_copy(&req).max_tokens, 10);
    }
}
