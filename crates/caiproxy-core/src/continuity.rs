use std::time::Duration;

use tokio::time::timeout;
use tracing::warn;

use caiproxy_provider_core::{
    BackendError, BackendResult, ConversationHandle, ConversationOrigin, RateLimitBackoff,
    SessionLease,
};

/// The conversation an exchange runs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub handle: ConversationHandle,
    pub origin: ConversationOrigin,
}

/// Decides per request whether to reuse, reopen or create a conversation.
///
/// States per (credential, persona): Absent (no handle), Active (handle held
/// by the lease), Stale (rejected, discarded), then Active again once a fresh
/// conversation has been created.
#[derive(Debug, Clone)]
pub struct ContinuityResolver {
    call_timeout: Duration,
    rate_limit: RateLimitBackoff,
}

impl ContinuityResolver {
    pub fn new(call_timeout: Duration, rate_limit: RateLimitBackoff) -> Self {
        Self {
            call_timeout,
            rate_limit,
        }
    }

    /// Pick the handle for this request.
    ///
    /// A caller-supplied handle wins for this request but is only adopted by
    /// the session once the exchange succeeds (see `SessionLease::adopt`).
    /// Newly created handles are adopted immediately.
    pub async fn resolve(
        &self,
        lease: &mut SessionLease,
        explicit: Option<&ConversationHandle>,
    ) -> BackendResult<Resolution> {
        match explicit {
            Some(handle) if lease.is_active(handle) => Ok(Resolution {
                handle: handle.clone(),
                origin: ConversationOrigin::Cached,
            }),
            Some(handle) => match self.continue_existing(lease, handle).await {
                Ok(handle) => Ok(Resolution {
                    handle,
                    origin: ConversationOrigin::Continued,
                }),
                Err(err) if err.is_continuation_rejected() => {
                    warn!(
                        event = "continuation_rejected",
                        persona = %lease.persona(),
                        chat_id = %handle,
                        error = %err
                    );
                    self.recover(lease).await
                }
                Err(err) => Err(err),
            },
            None => match lease.active_handle() {
                Some(handle) => Ok(Resolution {
                    handle: handle.clone(),
                    origin: ConversationOrigin::Cached,
                }),
                None => {
                    let handle = self.create(lease).await?;
                    lease.adopt(handle.clone(), ConversationOrigin::Created).await;
                    Ok(Resolution {
                        handle,
                        origin: ConversationOrigin::Created,
                    })
                }
            },
        }
    }

    /// Active -> Stale -> Active: drop the rejected conversation and replace it
    /// with a fresh one.
    pub async fn recover(&self, lease: &mut SessionLease) -> BackendResult<Resolution> {
        lease.discard_conversation().await;
        let handle = self.create(lease).await?;
        lease
            .adopt(handle.clone(), ConversationOrigin::Recovered)
            .await;
        Ok(Resolution {
            handle,
            origin: ConversationOrigin::Recovered,
        })
    }

    pub async fn create(&self, lease: &SessionLease) -> BackendResult<ConversationHandle> {
        let backend = lease.backend();
        let conn = lease.connection();
        let persona = lease.persona();
        let limit = self.call_timeout;
        self.rate_limit
            .run("conversation creation", move || async move {
                timeout(limit, backend.create_conversation(conn, persona))
                    .await
                    .unwrap_or(Err(BackendError::Timeout("conversation creation")))
            })
            .await
    }

    async fn continue_existing(
        &self,
        lease: &SessionLease,
        handle: &ConversationHandle,
    ) -> BackendResult<ConversationHandle> {
        let backend = lease.backend();
        let conn = lease.connection();
        let persona = lease.persona();
        let limit = self.call_timeout;
        self.rate_limit
            .run("conversation continuation", move || async move {
                timeout(limit, backend.continue_conversation(conn, persona, handle))
                    .await
                    .unwrap_or(Err(BackendError::Timeout("conversation continuation")))
            })
            .await
    }
}
