//! In-memory backend with scriptable behaviour.
//!
//! Serves the `demo` backend mode and doubles as the mock backend for tests:
//! every capability call is counted.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tokio::sync::mpsc;

use caiproxy_provider_core::{
    AccessToken, BackendConnection, BackendError, BackendReply, BackendResult, CharacterBackend,
    ConversationHandle, PersonaId,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplyMode {
    /// Whole reply in one piece.
    #[default]
    Complete,
    /// One fragment per word, whitespace kept attached.
    Words,
}

#[derive(Debug, Clone, Default)]
pub struct Script {
    pub reply_mode: ReplyMode,
    /// Replies handed out round-robin. Empty means echo the input.
    pub replies: Vec<String>,
    pub rejected_tokens: HashSet<String>,
    /// Handles for which continue and send report a continuation rejection.
    pub rejected_handles: HashSet<String>,
    pub auth_delay: Duration,
    pub fragment_delay: Duration,
    /// The next N sends fail with a rate-limit error.
    pub rate_limited_sends: usize,
    /// The next N conversation creations fail with a rate-limit error.
    pub rate_limited_creates: usize,
    /// Sends succeed but carry no text.
    pub empty_replies: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub authenticate: usize,
    pub create_conversation: usize,
    pub continue_conversation: usize,
    pub send_message: usize,
    pub release: usize,
    pub fetch_user: usize,
}

#[derive(Default)]
struct Counters {
    authenticate: AtomicUsize,
    create_conversation: AtomicUsize,
    continue_conversation: AtomicUsize,
    send_message: AtomicUsize,
    release: AtomicUsize,
    fetch_user: AtomicUsize,
}

#[derive(Default)]
pub struct ScriptedBackend {
    script: Mutex<Script>,
    counters: Counters,
    next_chat: AtomicU64,
    next_reply: AtomicUsize,
}

const DEMO_REPLIES: &[&str] = &[
    "Hi! Glad you stopped by. How are you doing today?",
    "That is an interesting question. Let's dig into it together.",
    "I see what you mean. I can tell you more if you like.",
    "Great thought! What do you make of it yourself?",
    "Thanks for the message. I'm here to help.",
];

impl ScriptedBackend {
    pub fn new(script: Script) -> Self {
        Self {
            script: Mutex::new(script),
            ..Default::default()
        }
    }

    /// Canned persona replies streamed word by word, no network access.
    pub fn demo() -> Self {
        Self::new(Script {
            reply_mode: ReplyMode::Words,
            replies: DEMO_REPLIES.iter().map(|reply| reply.to_string()).collect(),
            fragment_delay: Duration::from_millis(30),
            ..Default::default()
        })
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn calls(&self) -> CallCounts {
        let c = &self.counters;
        CallCounts {
            authenticate: c.authenticate.load(Ordering::SeqCst),
            create_conversation: c.create_conversation.load(Ordering::SeqCst),
            continue_conversation: c.continue_conversation.load(Ordering::SeqCst),
            send_message: c.send_message.load(Ordering::SeqCst),
            release: c.release.load(Ordering::SeqCst),
            fetch_user: c.fetch_user.load(Ordering::SeqCst),
        }
    }

    pub fn reject_token(&self, token: &str) {
        self.script().rejected_tokens.insert(token.to_string());
    }

    pub fn allow_token(&self, token: &str) {
        self.script().rejected_tokens.remove(token);
    }

    pub fn reject_handle(&self, handle: &str) {
        self.script().rejected_handles.insert(handle.to_string());
    }

    pub fn set_rate_limited_sends(&self, count: usize) {
        self.script().rate_limited_sends = count;
    }

    pub fn set_rate_limited_creates(&self, count: usize) {
        self.script().rate_limited_creates = count;
    }

    pub fn set_empty_replies(&self, empty: bool) {
        self.script().empty_replies = empty;
    }

    pub fn set_auth_delay(&self, delay: Duration) {
        self.script().auth_delay = delay;
    }

    fn check_token(&self, token: &AccessToken) -> BackendResult<()> {
        if self.script().rejected_tokens.contains(token.expose()) {
            return Err(BackendError::Authentication("invalid token".to_string()));
        }
        Ok(())
    }

    fn check_handle(&self, handle: &ConversationHandle) -> BackendResult<()> {
        if self.script().rejected_handles.contains(handle.as_str()) {
            return Err(BackendError::ContinuationRejected(format!(
                "conversation {handle} not found"
            )));
        }
        Ok(())
    }

    fn next_reply(&self, persona: &PersonaId, text: &str) -> String {
        let script = self.script();
        if script.empty_replies {
            return String::new();
        }
        if script.replies.is_empty() {
            return format!("{persona} heard: {text}");
        }
        let index = self.next_reply.fetch_add(1, Ordering::SeqCst) % script.replies.len();
        script.replies[index].clone()
    }
}

#[async_trait]
impl CharacterBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn authenticate(&self, token: &AccessToken) -> BackendResult<BackendConnection> {
        self.counters.authenticate.fetch_add(1, Ordering::SeqCst);
        let delay = self.script().auth_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check_token(token)?;
        let mut conn = BackendConnection::new(token.clone());
        conn.account = Some(format!("demo-{}", token.fingerprint()));
        Ok(conn)
    }

    async fn create_conversation(
        &self,
        _conn: &BackendConnection,
        _persona: &PersonaId,
    ) -> BackendResult<ConversationHandle> {
        self.counters
            .create_conversation
            .fetch_add(1, Ordering::SeqCst);
        {
            let mut script = self.script();
            if script.rate_limited_creates > 0 {
                script.rate_limited_creates -= 1;
                return Err(BackendError::RateLimited { retry_after: None });
            }
        }
        let n = self.next_chat.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ConversationHandle::new(format!("chat-{n}")))
    }

    async fn continue_conversation(
        &self,
        _conn: &BackendConnection,
        _persona: &PersonaId,
        handle: &ConversationHandle,
    ) -> BackendResult<ConversationHandle> {
        self.counters
            .continue_conversation
            .fetch_add(1, Ordering::SeqCst);
        self.check_handle(handle)?;
        Ok(handle.clone())
    }

    async fn send_message(
        &self,
        _conn: &BackendConnection,
        persona: &PersonaId,
        handle: &ConversationHandle,
        text: &str,
    ) -> BackendResult<BackendReply> {
        self.counters.send_message.fetch_add(1, Ordering::SeqCst);
        {
            let mut script = self.script();
            if script.rate_limited_sends > 0 {
                script.rate_limited_sends -= 1;
                return Err(BackendError::RateLimited { retry_after: None });
            }
        }
        self.check_handle(handle)?;

        let reply = self.next_reply(persona, text);
        let (mode, delay) = {
            let script = self.script();
            (script.reply_mode, script.fragment_delay)
        };
        match mode {
            ReplyMode::Complete => Ok(BackendReply::Complete(reply)),
            ReplyMode::Words => {
                let fragments: Vec<String> =
                    reply.split_inclusive(' ').map(str::to_string).collect();
                let (tx, rx) = mpsc::channel(8);
                tokio::spawn(async move {
                    for fragment in fragments {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        if tx.send(Ok(fragment)).await.is_err() {
                            return;
                        }
                    }
                });
                Ok(BackendReply::Incremental(rx))
            }
        }
    }

    async fn release(&self, _conn: &BackendConnection) -> BackendResult<()> {
        self.counters.release.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_user(&self, token: &AccessToken) -> BackendResult<JsonValue> {
        self.counters.fetch_user.fetch_add(1, Ordering::SeqCst);
        self.check_token(token)?;
        Ok(json!({
            "username": format!("demo-{}", token.fingerprint()),
            "name": "Demo User",
        }))
    }
}
