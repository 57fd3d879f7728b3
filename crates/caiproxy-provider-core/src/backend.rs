use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use crate::credential::{AccessToken, ConversationHandle, PersonaId};
use crate::errors::{BackendError, BackendResult};

/// Incremental reply fragments, in backend order. The sender side closes the
/// channel after the last fragment; an `Err` item ends the reply early.
pub type FragmentStream = mpsc::Receiver<BackendResult<String>>;

pub enum BackendReply {
    Complete(String),
    Incremental(FragmentStream),
}

impl std::fmt::Debug for BackendReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendReply::Complete(text) => f.debug_tuple("Complete").field(&text.len()).finish(),
            BackendReply::Incremental(_) => f.write_str("Incremental(..)"),
        }
    }
}

/// An authenticated backend connection.
#[derive(Debug, Clone)]
pub struct BackendConnection {
    pub token: AccessToken,
    /// Account label reported by the backend, if any.
    pub account: Option<String>,
    pub profile: Option<JsonValue>,
}

impl BackendConnection {
    pub fn new(token: AccessToken) -> Self {
        Self {
            token,
            account: None,
            profile: None,
        }
    }
}

/// Capability set every backend transport provides.
#[async_trait]
pub trait CharacterBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn authenticate(&self, token: &AccessToken) -> BackendResult<BackendConnection>;

    async fn create_conversation(
        &self,
        conn: &BackendConnection,
        persona: &PersonaId,
    ) -> BackendResult<ConversationHandle>;

    /// Reopen an existing dialogue. Returns the handle to use from now on,
    /// which is normally the one passed in.
    async fn continue_conversation(
        &self,
        conn: &BackendConnection,
        persona: &PersonaId,
        handle: &ConversationHandle,
    ) -> BackendResult<ConversationHandle>;

    async fn send_message(
        &self,
        conn: &BackendConnection,
        persona: &PersonaId,
        handle: &ConversationHandle,
        text: &str,
    ) -> BackendResult<BackendReply>;

    /// Best-effort teardown of backend-side resources.
    async fn release(&self, _conn: &BackendConnection) -> BackendResult<()> {
        Ok(())
    }

    /// Look up the account behind a token without opening a session.
    async fn fetch_user(&self, _token: &AccessToken) -> BackendResult<JsonValue> {
        Err(BackendError::Unsupported("fetch_user"))
    }
}
