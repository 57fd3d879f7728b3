use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value as JsonValue, json};
use tokio::task::JoinSet;
use tokio::time::timeout;

use caiproxy_common::{BackendKind, GlobalConfigPatch};
use caiproxy_core::{AppState, ChatOutcome, ErrorKind, ProxyEngine, ProxyError, ReplyMeta};
use caiproxy_protocol::openai::chat_completions::ChatCompletionRequestBody;
use caiproxy_protocol::sse::SseParser;
use caiproxy_provider_core::{AccessToken, ConversationHandle, EventHub, ManualClock, PersonaId};
use caiproxy_provider_impl::{CallCounts, ReplyMode, Script, ScriptedBackend};

struct Harness {
    backend: Arc<ScriptedBackend>,
    clock: Arc<ManualClock>,
    state: AppState,
}

impl Harness {
    fn new(script: Script) -> Self {
        let backend = Arc::new(ScriptedBackend::new(script));
        let clock = Arc::new(ManualClock::default());
        let global = GlobalConfigPatch {
            backend: Some(BackendKind::Demo),
            rate_limit_base_delay_ms: Some(1),
            rate_limit_max_delay_ms: Some(5),
            exchange_timeout_secs: Some(5),
            ..Default::default()
        }
        .into_config()
        .unwrap();
        let state = AppState::new(global, backend.clone(), clock.clone(), EventHub::default());
        Self {
            backend,
            clock,
            state,
        }
    }

    fn echo() -> Self {
        Self::new(Script::default())
    }

    fn engine(&self) -> &ProxyEngine {
        &self.state.engine
    }

    async fn chat(&self, model: &str, stream: bool) -> Result<ChatOutcome, ProxyError> {
        self.engine()
            .chat(None, token(), body(model, "hello", stream))
            .await
    }

    async fn complete(&self, model: &str) -> Result<(ReplyMeta, String), ProxyError> {
        match self.chat(model, false).await? {
            ChatOutcome::Json { meta, response } => {
                Ok((meta, response.choices[0].message.content.clone()))
            }
            ChatOutcome::Stream { .. } => panic!("expected a JSON reply"),
        }
    }
}

fn token() -> AccessToken {
    AccessToken::new("token-a")
}

fn body(model: &str, text: &str, stream: bool) -> ChatCompletionRequestBody {
    serde_json::from_value(json!({
        "model": model,
        "messages": [{"role": "user", "content": text}],
        "stream": stream,
    }))
    .unwrap()
}

async fn drain(mut frames: tokio::sync::mpsc::Receiver<bytes::Bytes>) -> Vec<String> {
    let mut parser = SseParser::new();
    let mut events = Vec::new();
    while let Some(frame) = timeout(Duration::from_secs(5), frames.recv()).await.unwrap() {
        events.extend(parser.push_bytes(&frame).into_iter().map(|e| e.data));
    }
    events.extend(parser.finish().into_iter().map(|e| e.data));
    events
}

#[tokio::test]
async fn first_request_creates_and_follow_up_reuses() {
    let h = Harness::echo();

    let (meta, content) = h.complete("abc123").await.unwrap();
    assert_eq!(meta.chat_id.as_str(), "chat-1");
    assert_eq!(meta.persona.as_str(), "abc123");
    assert_eq!(content, "abc123 heard: hello");

    let (meta, _) = h.complete("abc123:chat-1").await.unwrap();
    assert_eq!(meta.chat_id.as_str(), "chat-1");

    let calls = h.backend.calls();
    assert_eq!(calls.authenticate, 1);
    assert_eq!(calls.create_conversation, 1);
    assert_eq!(calls.continue_conversation, 0);
    assert_eq!(calls.send_message, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_share_one_session_and_conversation() {
    let h = Arc::new(Harness::new(Script {
        auth_delay: Duration::from_millis(50),
        ..Default::default()
    }));

    let mut set = JoinSet::new();
    for _ in 0..8 {
        let h = h.clone();
        set.spawn(async move { h.complete("abc123").await });
    }
    while let Some(joined) = set.join_next().await {
        let (meta, _) = joined.unwrap().unwrap();
        assert_eq!(meta.chat_id.as_str(), "chat-1");
    }

    let calls = h.backend.calls();
    assert_eq!(calls.authenticate, 1);
    assert_eq!(calls.create_conversation, 1);
    assert_eq!(calls.send_message, 8);
}

#[tokio::test]
async fn rate_limited_sends_are_retried_with_backoff() {
    let h = Harness::echo();
    h.backend.set_rate_limited_sends(2);

    let (_, content) = h.complete("abc123").await.unwrap();
    assert_eq!(content, "abc123 heard: hello");
    assert_eq!(h.backend.calls().send_message, 3);
}

#[tokio::test]
async fn persistent_rate_limit_surfaces_after_bounded_attempts() {
    let h = Harness::echo();
    h.backend.set_rate_limited_sends(5);

    let err = h.complete("abc123").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Backend);
    assert_eq!(err.status().as_u16(), 500);
    assert_eq!(err.code.as_deref(), Some("rate_limited"));
    assert_eq!(h.backend.calls().send_message, 3);
}

#[tokio::test]
async fn rate_limited_conversation_creation_is_retried() {
    let h = Harness::echo();
    h.backend.set_rate_limited_creates(2);

    let (meta, content) = h.complete("abc123").await.unwrap();
    assert_eq!(content, "abc123 heard: hello");
    assert_eq!(meta.chat_id.as_str(), "chat-1");
    let calls = h.backend.calls();
    assert_eq!(calls.create_conversation, 3);
    assert_eq!(calls.send_message, 1);
}

#[tokio::test]
async fn persistent_create_rate_limit_is_bounded() {
    let h = Harness::echo();
    h.backend.set_rate_limited_creates(10);

    let err = h.complete("abc123").await.unwrap_err();
    assert_eq!(err.code.as_deref(), Some("rate_limited"));
    let calls = h.backend.calls();
    assert_eq!(calls.create_conversation, 3);
    assert_eq!(calls.send_message, 0);
}

#[tokio::test]
async fn rejected_cached_conversation_is_replaced() {
    let h = Harness::echo();
    h.complete("abc123").await.unwrap();
    h.backend.reject_handle("chat-1");

    let (meta, _) = h.complete("abc123").await.unwrap();
    assert_eq!(meta.chat_id.as_str(), "chat-2");
    assert_eq!(h.backend.calls().create_conversation, 2);
}

#[tokio::test]
async fn rejected_explicit_conversation_is_replaced() {
    let h = Harness::echo();
    h.backend.reject_handle("gone");

    let (meta, _) = h.complete("abc123:gone").await.unwrap();
    assert_eq!(meta.chat_id.as_str(), "chat-1");
    let calls = h.backend.calls();
    assert_eq!(calls.continue_conversation, 1);
    assert_eq!(calls.create_conversation, 1);
}

#[tokio::test]
async fn second_rejection_is_not_retried() {
    let h = Harness::echo();
    h.backend.reject_handle("chat-1");
    h.backend.reject_handle("chat-2");

    let err = h.complete("abc123").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Backend);
    assert_eq!(err.code.as_deref(), Some("continuation_rejected"));
    let calls = h.backend.calls();
    assert_eq!(calls.create_conversation, 2);
    assert_eq!(calls.send_message, 2);
}

#[tokio::test]
async fn explicit_conversation_replaces_cache_only_after_success() {
    let h = Harness::echo();
    h.complete("abc123").await.unwrap();

    h.backend.set_empty_replies(true);
    let err = h.complete("abc123:other").await.unwrap_err();
    assert_eq!(err.code.as_deref(), Some("empty_reply"));
    h.backend.set_empty_replies(false);

    let (meta, _) = h.complete("abc123").await.unwrap();
    assert_eq!(meta.chat_id.as_str(), "chat-1");

    let (meta, _) = h.complete("abc123:other").await.unwrap();
    assert_eq!(meta.chat_id.as_str(), "other");
    let (meta, _) = h.complete("abc123").await.unwrap();
    assert_eq!(meta.chat_id.as_str(), "other");
}

#[tokio::test]
async fn idle_session_reauthenticates_and_keeps_conversation() {
    let h = Harness::echo();
    h.complete("abc123").await.unwrap();

    h.clock.advance(Duration::from_secs(31 * 60));
    let (meta, _) = h.complete("abc123").await.unwrap();
    assert_eq!(meta.chat_id.as_str(), "chat-1");

    let calls = h.backend.calls();
    assert_eq!(calls.authenticate, 2);
    assert_eq!(calls.release, 1);
    assert_eq!(calls.create_conversation, 1);
}

#[tokio::test]
async fn stale_conversation_is_recreated() {
    let h = Harness::echo();
    h.complete("abc123").await.unwrap();

    h.clock.advance(Duration::from_secs(25 * 60 * 60));
    let (meta, _) = h.complete("abc123").await.unwrap();
    assert_eq!(meta.chat_id.as_str(), "chat-2");
    assert_eq!(h.backend.calls().create_conversation, 2);
}

#[tokio::test]
async fn empty_reply_is_a_backend_error() {
    let h = Harness::new(Script {
        empty_replies: true,
        ..Default::default()
    });

    let err = h.complete("abc123").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Backend);
    assert_eq!(err.code.as_deref(), Some("empty_reply"));
}

#[tokio::test]
async fn rejected_token_is_401_and_not_cached() {
    let h = Harness::echo();
    h.backend.reject_token("token-a");

    let err = h.complete("abc123").await.unwrap_err();
    assert_eq!(err.status().as_u16(), 401);
    assert_eq!(h.backend.calls().create_conversation, 0);

    h.backend.allow_token("token-a");
    h.complete("abc123").await.unwrap();
    assert_eq!(h.backend.calls().authenticate, 2);
}

#[tokio::test]
async fn validation_errors_never_reach_the_backend() {
    let h = Harness::echo();

    let err = h.complete(":chat-1").await.unwrap_err();
    assert_eq!(err.status().as_u16(), 400);

    let body: ChatCompletionRequestBody = serde_json::from_value(json!({
        "model": "abc123",
        "messages": [{"role": "system", "content": "be nice"}],
    }))
    .unwrap();
    let err = h.engine().chat(None, token(), body).await.unwrap_err();
    assert_eq!(err.code.as_deref(), Some("user_message_required"));

    let body: ChatCompletionRequestBody = serde_json::from_value(json!({
        "model": "abc123",
        "messages": [
            {"role": "user", "content": "old question"},
            {"role": "assistant", "content": "old answer"},
            {"role": "user", "content": "   "},
        ],
    }))
    .unwrap();
    let err = h.engine().chat(None, token(), body).await.unwrap_err();
    assert_eq!(err.code.as_deref(), Some("user_message_required"));

    assert_eq!(h.backend.calls(), CallCounts::default());
}

#[tokio::test]
async fn streamed_text_matches_non_streamed_text() {
    let h = Harness::new(Script {
        reply_mode: ReplyMode::Words,
        replies: vec!["Hello there, traveller. Welcome back!".to_string()],
        ..Default::default()
    });

    let (_, full) = h.complete("abc123").await.unwrap();

    let ChatOutcome::Stream { meta, frames } = h.chat("abc123", true).await.unwrap() else {
        panic!("expected a stream");
    };
    assert_eq!(meta.chat_id.as_str(), "chat-1");
    let events = drain(frames).await;

    assert_eq!(events.last().map(String::as_str), Some("[DONE]"));
    let chunks: Vec<JsonValue> = events[..events.len() - 1]
        .iter()
        .map(|data| serde_json::from_str(data).unwrap())
        .collect();
    let streamed: String = chunks
        .iter()
        .filter_map(|chunk| chunk["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(streamed, full);

    assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
    let last = chunks.last().unwrap();
    assert_eq!(last["choices"][0]["finish_reason"], "stop");
    assert!(chunks.iter().all(|chunk| chunk["id"] == chunks[0]["id"]));
    assert_eq!(last["system_fingerprint"], "cai_abc123");
}

#[tokio::test]
async fn dropped_stream_releases_the_key() {
    let h = Harness::new(Script {
        reply_mode: ReplyMode::Words,
        replies: vec!["one two three four five six seven eight nine ten".to_string()],
        fragment_delay: Duration::from_millis(20),
        ..Default::default()
    });

    let ChatOutcome::Stream { mut frames, .. } = h.chat("abc123", true).await.unwrap() else {
        panic!("expected a stream");
    };
    frames.recv().await.unwrap();
    drop(frames);

    let next = timeout(Duration::from_secs(2), h.complete("abc123")).await;
    assert!(next.expect("key must be released").is_ok());
}

#[tokio::test]
async fn token_check_calls_backend_directly() {
    let h = Harness::echo();

    let err = h.engine().verify_token(None).await.unwrap_err();
    assert_eq!(err.status().as_u16(), 400);
    assert_eq!(err.code.as_deref(), Some("token_required"));

    let check = h
        .engine()
        .verify_token(Some("token-a".to_string()))
        .await
        .unwrap();
    assert!(check.success);
    assert_eq!(check.message, "Token is valid");

    h.backend.reject_token("token-b");
    let err = h
        .engine()
        .verify_token(Some("token-b".to_string()))
        .await
        .unwrap_err();
    assert_eq!(err.status().as_u16(), 401);

    let calls = h.backend.calls();
    assert_eq!(calls.fetch_user, 2);
    assert_eq!(calls.authenticate, 0);
}

#[tokio::test]
async fn branches_are_created_listed_and_forgotten() {
    let h = Harness::echo();
    let persona = PersonaId::new("abc123");
    h.complete("abc123").await.unwrap();

    let branch = h
        .engine()
        .create_branch(
            token(),
            persona.clone(),
            Some(ConversationHandle::new("chat-1")),
            Some("msg-7".to_string()),
        )
        .await
        .unwrap();
    assert_eq!(branch.as_str(), "chat-2");

    let views = h.engine().list_branches(token(), persona.clone()).await;
    assert_eq!(views.len(), 2);
    let first = views.iter().find(|v| v.chat_id == "chat-1").unwrap();
    assert!(!first.active);
    assert_eq!(first.exchanges, 1);
    let second = views.iter().find(|v| v.chat_id == "chat-2").unwrap();
    assert!(second.active);
    assert_eq!(second.parent_chat_id.as_deref(), Some("chat-1"));
    assert_eq!(second.message_id.as_deref(), Some("msg-7"));

    let (meta, _) = h.complete("abc123").await.unwrap();
    assert_eq!(meta.chat_id.as_str(), "chat-2");

    assert!(
        h.engine()
            .forget_branch(token(), persona.clone(), &branch)
            .await
    );
    let views = h.engine().list_branches(token(), persona).await;
    assert_eq!(views.len(), 1);
    assert!(views.iter().all(|v| !v.active));
}
