use std::time::SystemTime;

use bytes::Bytes;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use caiproxy_protocol::openai::chat_completions::{
    ChatCompletionChoice, ChatCompletionChunk, ChatCompletionChunkObjectType, ChatCompletionDelta,
    ChatCompletionFinishReason, ChatCompletionObjectType, ChatCompletionResponse,
    ChatCompletionResponseMessage, ChatCompletionRole, ChatCompletionStreamChoice,
    CompletionUsage,
};
use caiproxy_protocol::sse;
use caiproxy_provider_core::{PersonaId, UsageEstimate};

use crate::error::ProxyError;

/// Fields shared by every object of one completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionMeta {
    pub id: String,
    pub created: i64,
    pub model: String,
    pub fingerprint: String,
}

impl CompletionMeta {
    pub fn new(model: impl Into<String>, persona: &PersonaId, now: SystemTime) -> Self {
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            created: OffsetDateTime::from(now).unix_timestamp(),
            model: model.into(),
            fingerprint: format!("cai_{persona}"),
        }
    }
}

pub fn usage(estimate: UsageEstimate) -> CompletionUsage {
    CompletionUsage {
        prompt_tokens: estimate.prompt_tokens,
        completion_tokens: estimate.completion_tokens,
        total_tokens: estimate.total_tokens,
    }
}

pub fn completion_response(
    meta: &CompletionMeta,
    text: String,
    estimate: UsageEstimate,
) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: meta.id.clone(),
        object: ChatCompletionObjectType::ChatCompletion,
        created: meta.created,
        model: meta.model.clone(),
        choices: vec![ChatCompletionChoice {
            index: 0,
            message: ChatCompletionResponseMessage {
                role: ChatCompletionRole::Assistant,
                content: text,
            },
            finish_reason: ChatCompletionFinishReason::Stop,
        }],
        usage: usage(estimate),
        system_fingerprint: Some(meta.fingerprint.clone()),
    }
}

fn chunk(
    meta: &CompletionMeta,
    delta: ChatCompletionDelta,
    finish_reason: Option<ChatCompletionFinishReason>,
) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: meta.id.clone(),
        object: ChatCompletionChunkObjectType::ChatCompletionChunk,
        created: meta.created,
        model: meta.model.clone(),
        choices: vec![ChatCompletionStreamChoice {
            index: 0,
            delta,
            finish_reason,
        }],
        system_fingerprint: Some(meta.fingerprint.clone()),
    }
}

/// One text fragment. The first chunk of a stream also announces the role.
pub fn delta_chunk(meta: &CompletionMeta, fragment: String, first: bool) -> ChatCompletionChunk {
    chunk(
        meta,
        ChatCompletionDelta {
            role: first.then_some(ChatCompletionRole::Assistant),
            content: Some(fragment),
        },
        None,
    )
}

/// Empty delta with `finish_reason: "stop"`.
pub fn final_chunk(meta: &CompletionMeta) -> ChatCompletionChunk {
    chunk(
        meta,
        ChatCompletionDelta::default(),
        Some(ChatCompletionFinishReason::Stop),
    )
}

pub fn encode_chunk(chunk: &ChatCompletionChunk) -> Bytes {
    match serde_json::to_string(chunk) {
        Ok(json) => sse::data_frame(&json),
        Err(err) => error_frame(&ProxyError::internal(err)),
    }
}

/// Error envelope as an SSE data frame, for failures after the stream began.
pub fn error_frame(err: &ProxyError) -> Bytes {
    let body = err.to_json_bytes();
    sse::data_frame(&String::from_utf8_lossy(&body))
}

/// RFC 3339 timestamp for listings; falls back to unix seconds.
pub fn rfc3339(at: SystemTime) -> String {
    let at = OffsetDateTime::from(at);
    at.format(&Rfc3339)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}
