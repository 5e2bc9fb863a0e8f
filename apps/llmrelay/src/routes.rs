//! The inbound HTTP surface: one thin handler per endpoint that
//! buffers the body, classifies it into an `Endpoint`, and hands it to the
//! `Dispatcher`. All translation, provider selection, and logging happens
//! inside `llmrelay-core` — this module's only job is the HTTP edge.

use std::collections::HashMap;

use axum::body::Bytes as AxumBytes;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use llmrelay_core::{ClientMeta, Endpoint, InboundRequest, RelayedResponse};
use llmrelay_protocol::Platform;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(anthropic_messages))
        .route("/v1/chat/completions", post(openai_chat_completions))
        .route("/chat/completions", post(openai_chat_completions))
        .route("/responses", post(openai_responses))
        .route("/v1beta/models/{*model_action}", post(gemini_post))
        .route("/pc/v1/chat/completions", post(picoclaw_chat_completions))
        .route("/pc/chat/completions", post(picoclaw_chat_completions))
        .route("/health", get(health))
        .route("/readiness", get(readiness))
        .route("/metrics", get(metrics))
        .with_state(state)
}

fn client_meta(headers: &HeaderMap, method: &str, path: &str) -> ClientMeta {
    let user_agent = headers.get("user-agent").and_then(|v| v.to_str().ok()).map(str::to_string);
    let client_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string());
    let user_id = headers.get("x-user-id").and_then(|v| v.to_str().ok()).map(str::to_string);
    let request_id = headers.get("x-request-id").and_then(|v| v.to_str().ok()).map(str::to_string);
    ClientMeta { user_agent, client_ip, user_id, request_id, method: method.to_string(), path: path.to_string() }
}

async fn dispatch(state: &AppState, req: InboundRequest) -> Response {
    match state.dispatcher.dispatch(req).await {
        Ok(relayed) => relayed_to_response(relayed),
        Err(err) => {
            tracing::warn!(error = %err, "dispatch failed");
            dispatch_error_response(&err)
        }
    }
}

/// Maps a terminal `DispatchError` onto a status code — 404 when nothing
/// could even be tried, 400 when every admitted provider was tried and
/// failed — and stamps `X-Trace-ID` on the error response the same as every
/// successful one.
fn dispatch_error_response(err: &llmrelay_core::DispatchError) -> Response {
    use llmrelay_core::DispatchError;

    let status = match err {
        DispatchError::NoProvidersForPlatform(_) | DispatchError::ModelNotSupported { .. } => StatusCode::NOT_FOUND,
        DispatchError::AllProvidersFailed { .. } => StatusCode::BAD_REQUEST,
        DispatchError::UnknownPlatform(_) => StatusCode::NOT_FOUND,
        DispatchError::Repository(_) | DispatchError::Gateway(_) => StatusCode::BAD_GATEWAY,
    };

    let trace_id = llmrelay_common::new_trace_id();
    let body = serde_json::json!({ "error": err.to_string() });
    (status, [("x-trace-id", trace_id)], axum::Json(body)).into_response()
}

/// Turns whatever the dispatcher handed back into a response body. A
/// same-dialect streaming pass-through carries a `live_stream` the dispatcher
/// is still draining from upstream — that one is wired straight into the
/// response body so bytes reach the client as they arrive. Every other case
/// (translated, Gemini-array-reformatted, or a plain non-stream body) was
/// already fully rendered by the dispatcher before it returned.
fn relayed_to_response(relayed: RelayedResponse) -> Response {
    let content_type = if relayed.is_stream { "text/event-stream" } else { "application/json" };

    let mut builder = Response::builder().status(relayed.status).header("content-type", content_type);
    for (name, value) in relayed.headers.iter() {
        builder = builder.header(name, value);
    }

    if let Some(stream) = relayed.live_stream {
        return builder
            .body(axum::body::Body::from_stream(stream))
            .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR, "response_build_failed").into_response());
    }

    let body: Bytes = if relayed.sse_frames.is_empty() {
        relayed.body
    } else {
        let mut joined = Vec::new();
        for frame in &relayed.sse_frames {
            joined.extend_from_slice(frame);
        }
        Bytes::from(joined)
    };

    builder.body(axum::body::Body::from(body)).unwrap_or_else(|_| {
        (StatusCode::INTERNAL_SERVER_ERROR, "response_build_failed").into_response()
    })
}

async fn anthropic_messages(State(state): State<AppState>, headers: HeaderMap, body: AxumBytes) -> Response {
    let meta = client_meta(&headers, "POST", "/v1/messages");
    let req = InboundRequest {
        endpoint: Endpoint::AnthropicMessages,
        body: Bytes::from(body),
        gemini_alt_sse: false,
        headers,
        meta,
        path_model: None,
    };
    dispatch(&state, req).await
}

async fn openai_chat_completions(State(state): State<AppState>, headers: HeaderMap, body: AxumBytes) -> Response {
    let meta = client_meta(&headers, "POST", "/v1/chat/completions");
    let req = InboundRequest {
        endpoint: Endpoint::OpenAiChatCompletions,
        body: Bytes::from(body),
        gemini_alt_sse: false,
        headers,
        meta,
        path_model: None,
    };
    dispatch(&state, req).await
}

async fn openai_responses(State(state): State<AppState>, headers: HeaderMap, body: AxumBytes) -> Response {
    let meta = client_meta(&headers, "POST", "/responses");
    let req = InboundRequest {
        endpoint: Endpoint::OpenAiResponses,
        body: Bytes::from(body),
        gemini_alt_sse: false,
        headers,
        meta,
        path_model: None,
    };
    dispatch(&state, req).await
}

async fn picoclaw_chat_completions(State(state): State<AppState>, headers: HeaderMap, body: AxumBytes) -> Response {
    let meta = client_meta(&headers, "POST", "/pc/chat/completions");
    let req = InboundRequest {
        endpoint: Endpoint::PicoclawChatCompletions,
        body: Bytes::from(body),
        gemini_alt_sse: false,
        headers,
        meta,
        path_model: None,
    };
    dispatch(&state, req).await
}

/// Gemini's two methods share one path shape, `/v1beta/models/{model}:{action}`;
/// axum can't split a literal suffix out of one path segment, so this route
/// captures the whole `{model}:{action}` tail and splits on `:` itself.
async fn gemini_post(
    State(state): State<AppState>,
    Path(model_action): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: AxumBytes,
) -> Response {
    let model_action = model_action.trim_start_matches('/');
    let Some((model, action)) = model_action.split_once(':') else {
        return (StatusCode::BAD_REQUEST, "bad_gemini_model_action").into_response();
    };
    let model = model.trim();
    let action = action.trim();
    if model.is_empty() || action.is_empty() {
        return (StatusCode::BAD_REQUEST, "bad_gemini_model_action").into_response();
    }

    let endpoint = match action {
        "generateContent" => Endpoint::GeminiGenerateContent,
        "streamGenerateContent" => Endpoint::GeminiStreamGenerateContent,
        _ => return (StatusCode::NOT_FOUND, "unknown_gemini_action").into_response(),
    };

    let alt_sse = query
        .as_deref()
        .and_then(|q| serde_urlencoded::from_str::<HashMap<String, String>>(q).ok())
        .map(|params| params.get("alt").map(|v| v == "sse").unwrap_or(false))
        .unwrap_or(false);

    let path = format!("/v1beta/models/{model}:{action}");
    let meta = client_meta(&headers, "POST", &path);
    let req = InboundRequest {
        endpoint,
        body: Bytes::from(body),
        gemini_alt_sse: alt_sse,
        headers,
        meta,
        path_model: Some(model.to_string()),
    };
    dispatch(&state, req).await
}

async fn health(State(state): State<AppState>) -> Response {
    let body = serde_json::json!({
        "status": "ok",
        "service": "llmrelay",
        "version": state.version,
        "timestamp": state.started_at.to_string(),
    });
    (StatusCode::OK, axum::Json(body)).into_response()
}

async fn readiness(State(state): State<AppState>) -> Response {
    if state.has_any_enabled_provider().await {
        (StatusCode::OK, axum::Json(serde_json::json!({ "ready": true }))).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, axum::Json(serde_json::json!({ "ready": false }))).into_response()
    }
}

async fn metrics(State(state): State<AppState>) -> Response {
    let uptime = (time::OffsetDateTime::now_utc() - state.started_at).whole_seconds().max(0);
    let counts = state.enabled_counts_by_platform().await;

    let mut out = String::new();
    out.push_str("# HELP llmrelay_uptime_seconds Seconds since process start.\n");
    out.push_str("# TYPE llmrelay_uptime_seconds gauge\n");
    out.push_str(&format!("llmrelay_uptime_seconds {uptime}\n"));
    out.push_str("# HELP llmrelay_enabled_providers Enabled providers per platform.\n");
    out.push_str("# TYPE llmrelay_enabled_providers gauge\n");
    for (platform, count) in counts {
        out.push_str(&format!("llmrelay_enabled_providers{{platform=\"{}\"}} {count}\n", platform_label(platform)));
    }
    out.push_str("# HELP llmrelay_log_dropped_total Log records dropped because a pipeline channel was full.\n");
    out.push_str("# TYPE llmrelay_log_dropped_total counter\n");
    out.push_str(&format!("llmrelay_log_dropped_total {}\n", state.dispatcher.dropped_log_count()));

    (StatusCode::OK, [("content-type", "text/plain; version=0.0.4")], out).into_response()
}

fn platform_label(platform: Platform) -> &'static str {
    platform.as_str()
}
