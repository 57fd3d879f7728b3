use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Extension, Query, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodRouter, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use caiproxy_core::{AppState, ChatOutcome, ProxyError, ReplyMeta, extract_access_token};
use caiproxy_protocol::openai::chat_completions::ChatCompletionRequestBody;
use caiproxy_protocol::sse;

use crate::conversations;

#[derive(Clone)]
pub struct ProxyState {
    pub app: Arc<AppState>,
}

#[derive(Clone)]
pub(crate) struct RequestTraceId(pub String);

const SSE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const TRACE_ID_HEADER: &str = "x-caiproxy-request-id";
const CHAT_ID_HEADER: &str = "x-chat-id";
const CHARACTER_ID_HEADER: &str = "x-character-id";

pub fn proxy_router(app: Arc<AppState>) -> Router {
    let state = ProxyState { app };

    Router::new()
        .route("/v1/chat/completions", guarded(post(chat_completions)))
        .route("/api/chat/completions", guarded(post(chat_completions)))
        .route("/api/v1/chat/completions", guarded(post(chat_completions)))
        .route("/v1/auth/verify", guarded(get(verify_token)))
        .route("/api/test", guarded(get(verify_token)))
        .route(
            "/v1/conversations/{persona}",
            guarded(
                get(conversations::list)
                    .post(conversations::create)
                    .delete(conversations::forget),
            ),
        )
        .fallback(not_found)
        .layer(middleware::from_fn(downstream_trace))
        .with_state(state)
}

fn guarded(route: MethodRouter<ProxyState>) -> MethodRouter<ProxyState> {
    route.fallback(method_not_allowed)
}

/// Assigns the trace id, answers CORS preflight for every path, and logs the
/// request on the way in and out.
async fn downstream_trace(mut req: Request, next: Next) -> Response {
    let trace_id = uuid::Uuid::now_v7().to_string();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    info!(
        event = "downstream_received",
        trace_id = %trace_id,
        method = %method,
        path = %path
    );

    let mut resp = if method == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        req.extensions_mut()
            .insert(RequestTraceId(trace_id.clone()));
        next.run(req).await
    };

    let headers = resp.headers_mut();
    apply_cors_headers(headers);
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        headers.insert(HeaderName::from_static(TRACE_ID_HEADER), value);
    }
    info!(
        event = "downstream_responded",
        trace_id = %trace_id,
        method = %method,
        path = %path,
        status = resp.status().as_u16()
    );
    resp
}

fn apply_cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Authorization, Content-Type"),
    );
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("X-Chat-Id, X-Character-Id, X-Caiproxy-Request-Id"),
    );
}

async fn chat_completions(
    State(state): State<ProxyState>,
    Extension(trace_id): Extension<RequestTraceId>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // Credential first: a 401 wins over a malformed body.
    let token = match extract_access_token(&headers) {
        Ok(token) => token,
        Err(err) => return error_response(&err),
    };
    let body: ChatCompletionRequestBody = match parse_json_body(&body) {
        Ok(body) => body,
        Err(err) => return error_response(&err),
    };

    match state.app.engine.chat(Some(trace_id.0), token, body).await {
        Ok(ChatOutcome::Json { meta, response }) => match serde_json::to_vec(&response) {
            Ok(bytes) => {
                let mut resp = (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "application/json")],
                    bytes,
                )
                    .into_response();
                apply_reply_headers(resp.headers_mut(), &meta);
                resp
            }
            Err(err) => error_response(&ProxyError::internal(err)),
        },
        Ok(ChatOutcome::Stream { meta, frames }) => sse_response(meta, frames),
        Err(err) => error_response(&err),
    }
}

#[derive(Debug, Deserialize)]
struct VerifyQuery {
    token: Option<String>,
}

async fn verify_token(
    State(state): State<ProxyState>,
    Query(query): Query<VerifyQuery>,
) -> Response {
    match state.app.engine.verify_token(query.token).await {
        Ok(check) => Json(check).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn method_not_allowed(method: Method, uri: Uri) -> Response {
    error_response(
        &ProxyError::method_not_allowed(format!("{method} is not allowed on {}", uri.path()))
            .with_code("method_not_allowed"),
    )
}

async fn not_found(uri: Uri) -> Response {
    error_response(&ProxyError::not_found(format!("no route for {}", uri.path())))
}

pub(crate) fn parse_json_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, ProxyError> {
    serde_json::from_slice(body).map_err(|err| {
        ProxyError::bad_request(format!("invalid JSON body: {err}")).with_code("invalid_json")
    })
}

pub(crate) fn error_response(err: &ProxyError) -> Response {
    (
        err.status(),
        [(header::CONTENT_TYPE, "application/json")],
        err.to_json_bytes(),
    )
        .into_response()
}

fn apply_reply_headers(headers: &mut HeaderMap, meta: &ReplyMeta) {
    if let Ok(value) = HeaderValue::from_str(meta.chat_id.as_str()) {
        headers.insert(HeaderName::from_static(CHAT_ID_HEADER), value);
    }
    if let Ok(value) = HeaderValue::from_str(meta.persona.as_str()) {
        headers.insert(HeaderName::from_static(CHARACTER_ID_HEADER), value);
    }
}

fn sse_response(meta: ReplyMeta, frames: mpsc::Receiver<Bytes>) -> Response {
    let rx = wrap_sse_stream_with_heartbeat(frames);
    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    let mut resp = Response::new(Body::from_stream(stream));
    let headers = resp.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    // Hint common reverse proxies to avoid buffering SSE responses.
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    apply_reply_headers(headers, &meta);
    resp
}

/// Interleave keep-alive comments while waiting on the backend. Closing the
/// downstream side closes the upstream receiver too, which stops the pump.
fn wrap_sse_stream_with_heartbeat(mut upstream_rx: mpsc::Receiver<Bytes>) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SSE_HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip immediate tick; first heartbeat should be sent after the interval.
        ticker.tick().await;

        loop {
            tokio::select! {
                maybe_chunk = upstream_rx.recv() => {
                    let Some(chunk) = maybe_chunk else {
                        break;
                    };
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if tx.send(sse::keepalive_frame()).await.is_err() {
                        break;
                    }
                }
                _ = tx.closed() => break,
            }
        }
    });
    rx
}
