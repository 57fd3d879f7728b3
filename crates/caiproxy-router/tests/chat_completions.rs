use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode, header};
use axum::response::Response;
use serde_json::{Value as JsonValue, json};
use tower::ServiceExt;

use caiproxy_common::{BackendKind, GlobalConfigPatch};
use caiproxy_core::AppState;
use caiproxy_provider_core::{EventHub, ManualClock};
use caiproxy_provider_impl::{CallCounts, ReplyMode, Script, ScriptedBackend};
use caiproxy_router::proxy_router;

const BODY_LIMIT: usize = 1024 * 1024;

struct Harness {
    backend: Arc<ScriptedBackend>,
    router: Router,
}

impl Harness {
    fn new(script: Script) -> Self {
        let backend = Arc::new(ScriptedBackend::new(script));
        let global = GlobalConfigPatch {
            backend: Some(BackendKind::Demo),
            rate_limit_base_delay_ms: Some(1),
            rate_limit_max_delay_ms: Some(5),
            ..Default::default()
        }
        .into_config()
        .unwrap();
        let state = AppState::new(
            global,
            backend.clone(),
            Arc::new(ManualClock::default()),
            EventHub::default(),
        );
        Self {
            backend,
            router: proxy_router(Arc::new(state)),
        }
    }

    fn echo() -> Self {
        Self::new(Script::default())
    }

    fn calls(&self) -> CallCounts {
        self.backend.calls()
    }

    async fn send(&self, req: Request<Body>) -> Response {
        self.router.clone().oneshot(req).await.unwrap()
    }

    async fn chat(&self, path: &str, body: JsonValue) -> Response {
        self.send(
            Request::post(path)
                .header(header::AUTHORIZATION, "Bearer token-a")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }
}

fn chat_body(model: &str) -> JsonValue {
    json!({
        "model": model,
        "messages": [
            {"role": "system", "content": "stay in character"},
            {"role": "user", "content": "hello"}
        ]
    })
}

async fn read_json(resp: Response) -> JsonValue {
    let bytes = to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn read_text(resp: Response) -> String {
    let bytes = to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn header_str<'a>(resp: &'a Response, name: &str) -> Option<&'a str> {
    resp.headers().get(name).and_then(|v| v.to_str().ok())
}

#[tokio::test]
async fn new_conversation_then_pinned_follow_up() {
    let h = Harness::echo();

    let resp = h.chat("/v1/chat/completions", chat_body("abc123")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(header_str(&resp, "x-chat-id"), Some("chat-1"));
    assert_eq!(header_str(&resp, "x-character-id"), Some("abc123"));
    assert!(header_str(&resp, "x-caiproxy-request-id").is_some());
    let body = read_json(resp).await;
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "abc123");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["message"]["content"], "abc123 heard: hello");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["prompt_tokens"], 2);
    assert!(body["usage"]["total_tokens"].as_u64().unwrap() > 2);

    let resp = h.chat("/v1/chat/completions", chat_body("abc123:chat-1")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(header_str(&resp, "x-chat-id"), Some("chat-1"));

    let calls = h.calls();
    assert_eq!(calls.authenticate, 1);
    assert_eq!(calls.create_conversation, 1);
}

#[tokio::test]
async fn route_aliases_serve_the_same_endpoint() {
    let h = Harness::echo();
    for path in ["/api/chat/completions", "/api/v1/chat/completions"] {
        let resp = h.chat(path, chat_body("character-ai:abc123")).await;
        assert_eq!(resp.status(), StatusCode::OK, "{path}");
        assert_eq!(header_str(&resp, "x-character-id"), Some("abc123"));
    }
    assert_eq!(h.calls().create_conversation, 1);
}

#[tokio::test]
async fn missing_authorization_is_401_without_backend_calls() {
    let h = Harness::echo();
    let resp = h
        .send(
            Request::post("/v1/chat/completions")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(chat_body("abc123").to_string()))
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body = read_json(resp).await;
    assert_eq!(body["error"]["type"], "authentication_error");
    assert_eq!(h.calls(), CallCounts::default());
}

#[tokio::test]
async fn validation_failures_are_400() {
    let h = Harness::echo();

    let resp = h.chat("/v1/chat/completions", chat_body(":chat-1")).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = read_json(resp).await;
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert_eq!(body["error"]["code"], "persona_required");

    let resp = h
        .chat("/v1/chat/completions", json!({"model": "abc123", "messages": []}))
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = h
        .send(
            Request::post("/v1/chat/completions")
                .header(header::AUTHORIZATION, "Bearer token-a")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_json(resp).await["error"]["code"], "invalid_json");

    assert_eq!(h.calls().authenticate, 0);
}

#[tokio::test]
async fn wrong_method_is_405_and_preflight_is_200() {
    let h = Harness::echo();

    let resp = h
        .send(Request::get("/v1/chat/completions").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(read_json(resp).await["error"]["type"], "method_not_allowed");

    for path in ["/v1/chat/completions", "/anything/else"] {
        let resp = h
            .send(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri(path)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(header_str(&resp, "access-control-allow-origin"), Some("*"));
        assert!(read_text(resp).await.is_empty());
    }
}

#[tokio::test]
async fn unknown_path_is_404_envelope() {
    let h = Harness::echo();
    let resp = h
        .send(Request::get("/v2/nothing").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(read_json(resp).await["error"]["type"], "not_found_error");
}

#[tokio::test]
async fn streaming_emits_ordered_deltas_then_done() {
    let h = Harness::new(Script {
        reply_mode: ReplyMode::Words,
        replies: vec!["Once upon a time there was a proxy.".to_string()],
        ..Default::default()
    });

    let mut body = chat_body("abc123");
    body["stream"] = json!(true);
    let resp = h.chat("/v1/chat/completions", body).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(header_str(&resp, "content-type"), Some("text/event-stream"));
    assert_eq!(header_str(&resp, "cache-control"), Some("no-cache"));
    assert_eq!(header_str(&resp, "x-chat-id"), Some("chat-1"));

    let text = read_text(resp).await;
    assert!(text.ends_with("data: [DONE]\n\n"));
    let chunks: Vec<JsonValue> = text
        .split("\n\n")
        .filter_map(|frame| frame.strip_prefix("data: "))
        .filter(|data| *data != "[DONE]")
        .map(|data| serde_json::from_str(data).unwrap())
        .collect();
    let joined: String = chunks
        .iter()
        .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(joined, "Once upon a time there was a proxy.");
    assert!(chunks.iter().all(|c| c["object"] == "chat.completion.chunk"));
    assert_eq!(chunks.last().unwrap()["choices"][0]["finish_reason"], "stop");
}

#[tokio::test]
async fn rate_limited_backend_retries_then_fails() {
    let h = Harness::echo();
    h.backend.set_rate_limited_sends(10);

    let resp = h.chat("/v1/chat/completions", chat_body("abc123")).await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = read_json(resp).await;
    assert_eq!(body["error"]["type"], "backend_error");
    assert_eq!(body["error"]["code"], "rate_limited");
    assert_eq!(h.calls().send_message, 3);
}

#[tokio::test]
async fn token_check_endpoint() {
    let h = Harness::echo();
    h.backend.reject_token("bad");

    let resp = h
        .send(Request::get("/v1/auth/verify?token=good").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = read_json(resp).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["user"]["name"], "Demo User");

    let resp = h
        .send(Request::get("/api/test?token=bad").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = h
        .send(Request::get("/api/test").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    assert_eq!(h.calls().fetch_user, 2);
}

#[tokio::test]
async fn conversation_branch_endpoints() {
    let h = Harness::echo();
    let bearer = "Bearer token-a";

    h.chat("/v1/chat/completions", chat_body("abc123")).await;

    let resp = h
        .send(
            Request::post("/v1/conversations/abc123")
                .header(header::AUTHORIZATION, bearer)
                .body(Body::from(json!({"parent_chat_id": "chat-1"}).to_string()))
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = read_json(resp).await;
    assert_eq!(body["chat_id"], "chat-2");

    let resp = h
        .send(
            Request::get("/v1/conversations/abc123")
                .header(header::AUTHORIZATION, bearer)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    let body = read_json(resp).await;
    let conversations = body["conversations"].as_array().unwrap();
    assert_eq!(conversations.len(), 2);
    let active: Vec<&JsonValue> = conversations
        .iter()
        .filter(|c| c["active"] == true)
        .collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0]["chat_id"], "chat-2");
    assert_eq!(active[0]["parent_chat_id"], "chat-1");

    let resp = h
        .send(
            Request::delete("/v1/conversations/abc123")
                .header(header::AUTHORIZATION, bearer)
                .body(Body::from(json!({"chat_id": "chat-2"}).to_string()))
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = h
        .send(
            Request::delete("/v1/conversations/abc123")
                .header(header::AUTHORIZATION, bearer)
                .body(Body::from(json!({"chat_id": "chat-2"}).to_string()))
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = h
        .send(
            Request::get("/v1/conversations/abc123")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    assert_eq!(h.calls().create_conversation, 2);
}
