use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::OwnedMutexGuard;

use crate::backend::{BackendConnection, CharacterBackend};
use crate::conversation::{ConversationBranch, ConversationOrigin, ConversationState, Exchange};
use crate::credential::{ConversationHandle, PersonaId, SessionKey};
use crate::events::{ConversationEventKind, EvictionReason, SessionEventKind};

use super::Shared;
use super::slot::Slot;

/// Exclusive access to one (credential, persona) slot.
///
/// Holding a lease holds the key lock. Dropping it marks the session as used
/// now and lets the next request for the key proceed.
pub struct SessionLease {
    key: SessionKey,
    guard: OwnedMutexGuard<Slot>,
    connection: Arc<BackendConnection>,
    shared: Arc<Shared>,
}

impl SessionLease {
    pub(crate) fn new(
        key: SessionKey,
        guard: OwnedMutexGuard<Slot>,
        connection: Arc<BackendConnection>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            key,
            guard,
            connection,
            shared,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn persona(&self) -> &PersonaId {
        &self.key.persona
    }

    pub fn connection(&self) -> &BackendConnection {
        &self.connection
    }

    pub fn backend(&self) -> &Arc<dyn CharacterBackend> {
        &self.shared.backend
    }

    pub fn now(&self) -> SystemTime {
        self.shared.clock.now()
    }

    pub fn conversation(&self) -> Option<&ConversationState> {
        self.guard.conversation.as_ref()
    }

    pub fn active_handle(&self) -> Option<&ConversationHandle> {
        self.guard.conversation.as_ref().map(|state| &state.handle)
    }

    pub fn is_active(&self, handle: &ConversationHandle) -> bool {
        self.active_handle() == Some(handle)
    }

    /// Make `handle` the active conversation, replacing any previous one.
    pub async fn adopt(&mut self, handle: ConversationHandle, origin: ConversationOrigin) {
        if self.is_active(&handle) {
            return;
        }
        let now = self.now();
        if !self.guard.branches.iter().any(|b| b.chat_id == handle) {
            self.guard
                .branches
                .push(ConversationBranch::new(handle.clone(), now));
        }
        let chat_id = handle.to_string();
        self.guard.conversation = Some(ConversationState::new(
            self.key.persona.clone(),
            handle,
            now,
        ));
        self.shared
            .emit_conversation(&self.key, &chat_id, ConversationEventKind::Adopted(origin))
            .await;
    }

    /// Forget the active conversation after the backend rejected it.
    pub async fn discard_conversation(&mut self) -> Option<ConversationHandle> {
        let state = self.guard.conversation.take()?;
        self.shared
            .emit_conversation(
                &self.key,
                state.handle.as_str(),
                ConversationEventKind::Discarded,
            )
            .await;
        Some(state.handle)
    }

    /// Append to the active conversation's history. Returns false when there is
    /// no active conversation to record into.
    pub fn record_exchange(&mut self, exchange: Exchange) -> bool {
        let limit = self.shared.config.history_limit;
        let slot = &mut *self.guard;
        let Some(state) = slot.conversation.as_mut() else {
            return false;
        };
        if let Some(branch) = slot.branches.iter_mut().find(|b| b.chat_id == state.handle) {
            branch.exchanges += 1;
        }
        state.record(exchange, limit);
        true
    }

    /// Record a branch, replacing an existing entry with the same chat id.
    pub fn push_branch(&mut self, branch: ConversationBranch) {
        let branches = &mut self.guard.branches;
        match branches.iter_mut().find(|b| b.chat_id == branch.chat_id) {
            Some(existing) => *existing = branch,
            None => branches.push(branch),
        }
    }

    /// Tear down the session after an unrecoverable backend error. The
    /// conversation state survives; the next request re-authenticates.
    pub async fn invalidate(mut self) {
        let live = self.guard.session.take();
        if let Some(live) = live {
            self.shared
                .release_connection(&self.key, &live.connection)
                .await;
            self.shared
                .emit_session(
                    &self.key,
                    SessionEventKind::Evicted {
                        reason: EvictionReason::Invalidated,
                    },
                )
                .await;
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let now = self.shared.clock.now();
        if let Some(live) = self.guard.session.as_mut()
            && Arc::ptr_eq(&live.connection, &self.connection)
        {
            live.last_used = now;
        }
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("key", &self.key)
            .field("active", &self.active_handle())
            .finish()
    }
}
