//! Session registry: one live backend connection per (credential, persona),
//! with the conversation state that rides on it.
//!
//! Every key owns a `tokio::sync::Mutex`. Acquiring a session takes that lock
//! and keeps it inside the returned [`SessionLease`] until the exchange is
//! done, so authentication and conversation creation are single-flight per key
//! while unrelated keys never wait on each other.

mod lease;
mod slot;
mod sweeper;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::backend::{BackendConnection, CharacterBackend};
use crate::clock::Clock;
use crate::conversation::ConversationBranch;
use crate::credential::{AccessToken, ConversationHandle, PersonaId, SessionKey};
use crate::errors::{BackendError, BackendResult};
use crate::events::{
    ConversationEvent, ConversationEventKind, EvictionReason, Event, EventHub, SessionEvent,
    SessionEventKind,
};
use crate::retry::RateLimitBackoff;

pub use lease::SessionLease;
use slot::{LiveSession, Slot};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub session_idle: Duration,
    pub conversation_idle: Duration,
    pub auth_timeout: Duration,
    pub history_limit: usize,
    /// Applied to authentication when the backend rate limits it.
    pub rate_limit: RateLimitBackoff,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            session_idle: Duration::from_secs(30 * 60),
            conversation_idle: Duration::from_secs(24 * 60 * 60),
            auth_timeout: Duration::from_secs(30),
            history_limit: 32,
            rate_limit: RateLimitBackoff::default(),
        }
    }
}

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions_evicted: usize,
    pub conversations_expired: usize,
    pub slots_removed: usize,
    /// Keys skipped because a request currently holds them.
    pub busy: usize,
}

pub(crate) struct Shared {
    pub backend: Arc<dyn CharacterBackend>,
    pub clock: Arc<dyn Clock>,
    pub config: RegistryConfig,
    pub events: EventHub,
}

impl Shared {
    pub async fn emit_session(&self, key: &SessionKey, kind: SessionEventKind) {
        self.events
            .emit(Event::Session(SessionEvent {
                at: self.clock.now(),
                account: key.token.fingerprint(),
                persona: key.persona.to_string(),
                kind,
            }))
            .await;
    }

    pub async fn emit_conversation(
        &self,
        key: &SessionKey,
        chat_id: &str,
        kind: ConversationEventKind,
    ) {
        self.events
            .emit(Event::Conversation(ConversationEvent {
                at: self.clock.now(),
                account: key.token.fingerprint(),
                persona: key.persona.to_string(),
                chat_id: chat_id.to_string(),
                kind,
            }))
            .await;
    }

    /// Best-effort: failures are logged, never returned.
    pub async fn release_connection(&self, key: &SessionKey, conn: &BackendConnection) {
        if let Err(err) = self.backend.release(conn).await {
            warn!(
                event = "session_release_failed",
                account = %key.token.fingerprint(),
                persona = %key.persona,
                error = %err
            );
        }
    }

    fn session_expired(&self, live: &LiveSession, now: SystemTime) -> bool {
        now.duration_since(live.last_used).unwrap_or_default() > self.config.session_idle
    }

    /// Drop the conversation if it has been idle too long. Known branches go with it.
    async fn expire_conversation(&self, key: &SessionKey, slot: &mut Slot, now: SystemTime) -> bool {
        let stale = slot
            .conversation
            .as_ref()
            .is_some_and(|state| state.is_stale(now, self.config.conversation_idle));
        if !stale {
            return false;
        }
        if let Some(state) = slot.conversation.take() {
            slot.branches.clear();
            self.emit_conversation(key, state.handle.as_str(), ConversationEventKind::Expired)
                .await;
        }
        true
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    shared: Arc<Shared>,
    slots: Arc<RwLock<HashMap<SessionKey, Arc<Mutex<Slot>>>>>,
}

impl SessionRegistry {
    pub fn new(
        backend: Arc<dyn CharacterBackend>,
        clock: Arc<dyn Clock>,
        config: RegistryConfig,
        events: EventHub,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                clock,
                config,
                events,
            }),
            slots: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn backend(&self) -> &Arc<dyn CharacterBackend> {
        &self.shared.backend
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.shared.clock
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.shared.config
    }

    pub fn events(&self) -> &EventHub {
        &self.shared.events
    }

    async fn slot_for(&self, key: &SessionKey) -> Arc<Mutex<Slot>> {
        if let Some(slot) = self.slots.read().await.get(key) {
            return slot.clone();
        }
        self.slots
            .write()
            .await
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Return a lease on the live connection for (token, persona), authenticating
    /// if none exists or the existing one sat idle past the timeout.
    ///
    /// Concurrent callers for the same key queue on the key lock; the second one
    /// finds the first one's connection and reuses it. Authentication failures
    /// leave the slot without a session, so the next request retries.
    pub async fn acquire(
        &self,
        token: AccessToken,
        persona: PersonaId,
    ) -> BackendResult<SessionLease> {
        let key = SessionKey::new(token, persona);
        let slot = self.slot_for(&key).await;
        let mut guard = slot.lock_owned().await;
        let shared = &self.shared;
        let now = shared.clock.now();

        shared.expire_conversation(&key, &mut guard, now).await;

        if let Some(live) = guard.session.as_ref()
            && !shared.session_expired(live, now)
        {
            let connection = live.connection.clone();
            shared.emit_session(&key, SessionEventKind::Reused).await;
            return Ok(SessionLease::new(key, guard, connection, self.shared.clone()));
        }

        if let Some(expired) = guard.session.take() {
            shared.release_connection(&key, &expired.connection).await;
            shared
                .emit_session(
                    &key,
                    SessionEventKind::Evicted {
                        reason: EvictionReason::Idle,
                    },
                )
                .await;
        }

        let backend = &shared.backend;
        let token = &key.token;
        let auth_timeout = shared.config.auth_timeout;
        let authenticated = shared
            .config
            .rate_limit
            .run("authentication", move || async move {
                tokio::time::timeout(auth_timeout, backend.authenticate(token))
                    .await
                    .unwrap_or(Err(BackendError::Timeout("authentication")))
            })
            .await;

        let connection = match authenticated {
            Ok(connection) => Arc::new(connection),
            Err(err) => {
                if err.is_authentication() {
                    shared
                        .emit_session(
                            &key,
                            SessionEventKind::AuthFailed {
                                message: err.to_string(),
                            },
                        )
                        .await;
                }
                return Err(err);
            }
        };

        let now = shared.clock.now();
        guard.session = Some(LiveSession {
            connection: connection.clone(),
            opened_at: now,
            last_used: now,
        });
        shared.emit_session(&key, SessionEventKind::Opened).await;
        Ok(SessionLease::new(key, guard, connection, self.shared.clone()))
    }

    /// Evict the session for `key`, releasing its connection. Conversation state
    /// is kept. Returns whether a live session was found.
    pub async fn release(&self, key: &SessionKey) -> bool {
        let slot = self.slots.read().await.get(key).cloned();
        let Some(slot) = slot else {
            return false;
        };
        let live = slot.lock().await.session.take();
        drop(slot);
        let Some(live) = live else {
            return false;
        };
        self.shared.release_connection(key, &live.connection).await;
        self.shared
            .emit_session(
                key,
                SessionEventKind::Evicted {
                    reason: EvictionReason::Released,
                },
            )
            .await;
        true
    }

    /// Evict idle sessions, expire stale conversations and drop empty slots.
    /// Keys locked by an in-flight request are left for the next pass.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let now = self.shared.clock.now();
        let snapshot: Vec<(SessionKey, Arc<Mutex<Slot>>)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(key, slot)| (key.clone(), slot.clone()))
            .collect();

        let mut to_release = Vec::new();
        for (key, slot) in snapshot {
            let Ok(mut guard) = slot.try_lock() else {
                report.busy += 1;
                continue;
            };
            if self.shared.expire_conversation(&key, &mut guard, now).await {
                report.conversations_expired += 1;
            }
            let idle = guard
                .session
                .as_ref()
                .is_some_and(|live| self.shared.session_expired(live, now));
            if idle && let Some(live) = guard.session.take() {
                to_release.push((key, live));
            }
        }

        for (key, live) in to_release {
            debug!(
                event = "session_idle",
                account = %key.token.fingerprint(),
                persona = %key.persona,
                opened_secs_ago = now.duration_since(live.opened_at).unwrap_or_default().as_secs()
            );
            self.shared.release_connection(&key, &live.connection).await;
            self.shared
                .emit_session(
                    &key,
                    SessionEventKind::Evicted {
                        reason: EvictionReason::Idle,
                    },
                )
                .await;
            report.sessions_evicted += 1;
        }

        report.slots_removed = self.prune().await;
        report
    }

    /// Release every live session. Used on shutdown; waits for in-flight leases.
    pub async fn close_all(&self) -> usize {
        let slots: Vec<(SessionKey, Arc<Mutex<Slot>>)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(key, slot)| (key.clone(), slot.clone()))
            .collect();
        let mut closed = 0;
        for (key, slot) in slots {
            let live = slot.lock().await.session.take();
            if let Some(live) = live {
                self.shared.release_connection(&key, &live.connection).await;
                self.shared
                    .emit_session(
                        &key,
                        SessionEventKind::Evicted {
                            reason: EvictionReason::Shutdown,
                        },
                    )
                    .await;
                closed += 1;
            }
        }
        self.prune().await;
        closed
    }

    /// Number of keys currently holding a live connection. Busy keys are counted.
    pub async fn live_sessions(&self) -> usize {
        let slots: Vec<Arc<Mutex<Slot>>> = self.slots.read().await.values().cloned().collect();
        let mut live = 0;
        for slot in slots {
            match slot.try_lock() {
                Ok(guard) if guard.session.is_some() => live += 1,
                Ok(_) => {}
                Err(_) => live += 1,
            }
        }
        live
    }

    /// Active conversation and known branches for a key. Never authenticates.
    pub async fn listing(
        &self,
        key: &SessionKey,
    ) -> (Option<ConversationHandle>, Vec<ConversationBranch>) {
        let slot = self.slots.read().await.get(key).cloned();
        let Some(slot) = slot else {
            return (None, Vec::new());
        };
        let mut guard = slot.lock().await;
        let now = self.shared.clock.now();
        self.shared.expire_conversation(key, &mut guard, now).await;
        let active = guard.conversation.as_ref().map(|state| state.handle.clone());
        (active, guard.branches.clone())
    }

    /// Forget a branch locally, waiting for any in-flight request on the key.
    pub async fn forget_branch(&self, key: &SessionKey, chat_id: &ConversationHandle) -> bool {
        let slot = self.slots.read().await.get(key).cloned();
        let Some(slot) = slot else {
            return false;
        };
        let forgotten = slot.lock().await.forget(chat_id);
        drop(slot);
        if forgotten {
            self.shared
                .emit_conversation(key, chat_id.as_str(), ConversationEventKind::Forgotten)
                .await;
            self.prune().await;
        }
        forgotten
    }

    async fn prune(&self) -> usize {
        let mut slots = self.slots.write().await;
        let before = slots.len();
        slots.retain(|_, slot| {
            // Another holder of the Arc may be about to lock it.
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(guard) => !guard.is_empty(),
                Err(_) => true,
            }
        });
        before - slots.len()
    }
}
