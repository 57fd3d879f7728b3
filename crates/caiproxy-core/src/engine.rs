//! Request orchestration: credential + model -> lease -> exchange -> reply.

use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use caiproxy_protocol::openai::chat_completions::{
    ChatCompletionRequestBody, ChatCompletionResponse,
};
use caiproxy_protocol::sse;
use caiproxy_provider_core::{
    AccessToken, BackendError, ConversationBranch, ConversationHandle, ConversationOrigin, Event,
    Exchange, ExchangeEvent, PersonaId, SessionKey, SessionLease, SessionRegistry, UsageEstimate,
};

use crate::continuity::Resolution;
use crate::error::ProxyError;
use crate::exchange::{ExchangeEngine, StreamedReply};
use crate::model::ChatRequest;
use crate::translate::{
    self, CompletionMeta, completion_response, delta_chunk, encode_chunk, error_frame, final_chunk,
};

const STREAM_BUFFER: usize = 32;

/// Identifiers a caller needs to pin a follow-up request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyMeta {
    pub chat_id: ConversationHandle,
    pub persona: PersonaId,
}

#[derive(Debug)]
pub enum ChatOutcome {
    Json {
        meta: ReplyMeta,
        response: ChatCompletionResponse,
    },
    /// Encoded SSE frames, ending with `[DONE]` on success or an error frame
    /// if the backend fails after the first fragment.
    Stream {
        meta: ReplyMeta,
        frames: mpsc::Receiver<Bytes>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenCheck {
    pub success: bool,
    pub message: String,
    pub user: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchView {
    pub chat_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_chat_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub created_at: String,
    pub active: bool,
    pub exchanges: u64,
}

impl BranchView {
    fn from_branch(branch: ConversationBranch, active: Option<&ConversationHandle>) -> Self {
        Self {
            active: active == Some(&branch.chat_id),
            chat_id: branch.chat_id.to_string(),
            parent_chat_id: branch.parent_chat_id.map(|id| id.to_string()),
            message_id: branch.message_id,
            created_at: translate::rfc3339(branch.created_at),
            exchanges: branch.exchanges,
        }
    }
}

#[derive(Clone)]
pub struct ProxyEngine {
    registry: SessionRegistry,
    exchange: ExchangeEngine,
    prefixes: Vec<String>,
    auth_timeout: Duration,
}

impl ProxyEngine {
    pub fn new(
        registry: SessionRegistry,
        exchange: ExchangeEngine,
        prefixes: Vec<String>,
        auth_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            exchange,
            prefixes,
            auth_timeout,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn exchange(&self) -> &ExchangeEngine {
        &self.exchange
    }

    /// Run one chat completion. Streaming requests return once the backend has
    /// produced visible text; the rest is pumped by a task that owns the lease.
    pub async fn chat(
        &self,
        trace_id: Option<String>,
        token: AccessToken,
        body: ChatCompletionRequestBody,
    ) -> Result<ChatOutcome, ProxyError> {
        let ChatRequest {
            model,
            target,
            message,
            stream,
        } = ChatRequest::from_body(body, &self.prefixes)?;

        let mut lease = self.registry.acquire(token, target.persona.clone()).await?;
        let exchanged = match self
            .exchange
            .exchange(&mut lease, target.conversation.as_ref(), &message)
            .await
        {
            Ok(exchanged) => exchanged,
            Err(err) => return Err(abandon(lease, err).await),
        };

        let resolution = exchanged.resolution;
        let reply = exchanged.reply;
        let completion = CompletionMeta::new(model, &target.persona, lease.now());
        let meta = ReplyMeta {
            chat_id: resolution.handle.clone(),
            persona: target.persona,
        };

        if !stream {
            let text = match reply.collect().await {
                Ok(text) => text,
                Err(err) => return Err(abandon(lease, err).await),
            };
            let usage = self
                .record(&mut lease, trace_id, &resolution, &message, &text, false)
                .await;
            return Ok(ChatOutcome::Json {
                meta,
                response: completion_response(&completion, text, usage),
            });
        }

        let (tx, frames) = mpsc::channel(STREAM_BUFFER);
        let engine = self.clone();
        tokio::spawn(async move {
            engine
                .pump(lease, reply, resolution, completion, message, trace_id, tx)
                .await;
        });
        Ok(ChatOutcome::Stream { meta, frames })
    }

    #[allow(clippy::too_many_arguments)]
    async fn pump(
        &self,
        mut lease: SessionLease,
        mut reply: StreamedReply,
        resolution: Resolution,
        completion: CompletionMeta,
        message: String,
        trace_id: Option<String>,
        tx: mpsc::Sender<Bytes>,
    ) {
        let mut first = true;
        loop {
            let next = tokio::select! {
                next = reply.next() => Some(next),
                _ = tx.closed() => None,
            };
            let Some(next) = next else {
                debug!(
                    event = "downstream_disconnected",
                    trace_id = trace_id.as_deref().unwrap_or("-"),
                    chat_id = %resolution.handle,
                    received = reply.text().len()
                );
                return;
            };
            match next {
                Some(Ok(fragment)) => {
                    let frame = encode_chunk(&delta_chunk(&completion, fragment, first));
                    first = false;
                    if tx.send(frame).await.is_err() {
                        return;
                    }
                }
                Some(Err(err)) => {
                    warn!(
                        event = "stream_failed",
                        trace_id = trace_id.as_deref().unwrap_or("-"),
                        chat_id = %resolution.handle,
                        error = %err
                    );
                    let err = abandon(lease, err).await;
                    let _ = tx.send(error_frame(&err)).await;
                    return;
                }
                None => break,
            }
        }

        let text = reply.text().to_string();
        self.record(&mut lease, trace_id, &resolution, &message, &text, true)
            .await;
        drop(lease);

        if tx.send(encode_chunk(&final_chunk(&completion))).await.is_ok() {
            let _ = tx.send(sse::done_frame()).await;
        }
    }

    /// Adopt the handle the exchange ran against and append it to history.
    async fn record(
        &self,
        lease: &mut SessionLease,
        trace_id: Option<String>,
        resolution: &Resolution,
        input: &str,
        output: &str,
        stream: bool,
    ) -> UsageEstimate {
        lease.adopt(resolution.handle.clone(), resolution.origin).await;
        let exchange = Exchange::new(input, output, lease.now());
        let usage = exchange.usage;
        let at = exchange.at;
        lease.record_exchange(exchange);
        debug!(
            event = "exchange_recorded",
            chat_id = %resolution.handle,
            history = lease.conversation().map_or(0, |state| state.history.len())
        );
        self.registry
            .events()
            .emit(Event::Exchange(ExchangeEvent {
                at,
                trace_id,
                account: lease.key().token.fingerprint(),
                persona: lease.persona().to_string(),
                chat_id: resolution.handle.to_string(),
                origin: resolution.origin,
                stream,
                usage,
            }))
            .await;
        usage
    }

    /// Check a token directly against the backend. Nothing is cached.
    pub async fn verify_token(&self, token: Option<String>) -> Result<TokenCheck, ProxyError> {
        let token = token
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                ProxyError::bad_request("token query parameter is required")
                    .with_code("token_required")
            })?;
        let token = AccessToken::new(token);
        let backend = self.registry.backend();
        let token = &token;
        let limit = self.auth_timeout;
        let user = self
            .exchange
            .policy()
            .rate_limit
            .run("token check", move || async move {
                timeout(limit, backend.fetch_user(token))
                    .await
                    .unwrap_or(Err(BackendError::Timeout("token check")))
            })
            .await?;
        Ok(TokenCheck {
            success: true,
            message: "Token is valid".to_string(),
            user,
        })
    }

    pub async fn list_branches(&self, token: AccessToken, persona: PersonaId) -> Vec<BranchView> {
        let key = SessionKey::new(token, persona);
        let (active, branches) = self.registry.listing(&key).await;
        branches
            .into_iter()
            .map(|branch| BranchView::from_branch(branch, active.as_ref()))
            .collect()
    }

    /// Open a fresh backend conversation and make it the active one.
    pub async fn create_branch(
        &self,
        token: AccessToken,
        persona: PersonaId,
        parent_chat_id: Option<ConversationHandle>,
        message_id: Option<String>,
    ) -> Result<ConversationHandle, ProxyError> {
        let mut lease = self.registry.acquire(token, persona).await?;
        let handle = match self.exchange.resolver().create(&lease).await {
            Ok(handle) => handle,
            Err(err) => return Err(abandon(lease, err).await),
        };
        lease
            .adopt(handle.clone(), ConversationOrigin::Created)
            .await;
        let mut branch = ConversationBranch::new(handle.clone(), lease.now());
        branch.parent_chat_id = parent_chat_id;
        branch.message_id = message_id;
        lease.push_branch(branch);
        Ok(handle)
    }

    pub async fn forget_branch(
        &self,
        token: AccessToken,
        persona: PersonaId,
        chat_id: &ConversationHandle,
    ) -> bool {
        let key = SessionKey::new(token, persona);
        self.registry.forget_branch(&key, chat_id).await
    }
}

/// Map a failed exchange to the caller's error. A rejected credential tears
/// the session down so the next request authenticates again.
async fn abandon(lease: SessionLease, err: BackendError) -> ProxyError {
    if err.is_authentication() {
        lease.invalidate().await;
    }
    err.into()
}
