use std::time::Duration;

use tokio::time::timeout;
use tracing::warn;

use caiproxy_provider_core::{
    BackendError, BackendReply, BackendResult, ConversationHandle, ConversationOrigin,
    FragmentStream, RateLimitBackoff, SessionLease,
};

use crate::continuity::{ContinuityResolver, Resolution};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Shared by every backend call an exchange makes.
    pub rate_limit: RateLimitBackoff,
    /// Bound on each backend call and on every wait for the next fragment.
    pub exchange_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitBackoff::default(),
            exchange_timeout: Duration::from_secs(120),
        }
    }
}

/// Reply fragments in backend order. The text seen so far is kept so the
/// caller can record the exchange once the stream ends.
pub struct StreamedReply {
    head: Option<String>,
    rest: Option<FragmentStream>,
    idle: Duration,
    text: String,
}

impl StreamedReply {
    fn complete(text: String, idle: Duration) -> Self {
        Self {
            head: Some(text),
            rest: None,
            idle,
            text: String::new(),
        }
    }

    /// Wait until the backend produced visible text, so failures before the
    /// first fragment can still be retried or reported with a proper status.
    async fn start(mut rx: FragmentStream, idle: Duration) -> BackendResult<Self> {
        let mut head = String::new();
        loop {
            match timeout(idle, rx.recv()).await {
                Err(_) => return Err(BackendError::Timeout("first reply fragment")),
                Ok(None) => return Err(BackendError::EmptyReply),
                Ok(Some(Err(err))) => return Err(err),
                Ok(Some(Ok(fragment))) => {
                    head.push_str(&fragment);
                    if !head.trim().is_empty() {
                        break;
                    }
                }
            }
        }
        Ok(Self {
            head: Some(head),
            rest: Some(rx),
            idle,
            text: String::new(),
        })
    }

    pub async fn next(&mut self) -> Option<BackendResult<String>> {
        if let Some(head) = self.head.take() {
            self.text.push_str(&head);
            return Some(Ok(head));
        }
        let rx = self.rest.as_mut()?;
        loop {
            match timeout(self.idle, rx.recv()).await {
                Err(_) => {
                    self.rest = None;
                    return Some(Err(BackendError::Timeout("reply fragment")));
                }
                Ok(None) => {
                    self.rest = None;
                    return None;
                }
                Ok(Some(Ok(fragment))) if fragment.is_empty() => continue,
                Ok(Some(Ok(fragment))) => {
                    self.text.push_str(&fragment);
                    return Some(Ok(fragment));
                }
                Ok(Some(Err(err))) => {
                    self.rest = None;
                    return Some(Err(err));
                }
            }
        }
    }

    /// Drain the remaining fragments into the full reply text.
    pub async fn collect(mut self) -> BackendResult<String> {
        while let Some(fragment) = self.next().await {
            fragment?;
        }
        Ok(self.text)
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

impl std::fmt::Debug for StreamedReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamedReply")
            .field("received", &self.text.len())
            .field("open", &self.rest.is_some())
            .finish()
    }
}

/// A successful send: where it went and what came back.
#[derive(Debug)]
pub struct Exchanged {
    pub resolution: Resolution,
    pub reply: StreamedReply,
}

#[derive(Debug, Clone)]
pub struct ExchangeEngine {
    policy: RetryPolicy,
    resolver: ContinuityResolver,
}

impl ExchangeEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        let resolver = ContinuityResolver::new(policy.exchange_timeout, policy.rate_limit.clone());
        Self { policy, resolver }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn resolver(&self) -> &ContinuityResolver {
        &self.resolver
    }

    /// Resolve the conversation, send `text`, and return the reply once it has
    /// produced visible text.
    ///
    /// A continuation rejection triggers exactly one recovery onto a fresh
    /// conversation; a second rejection is returned.
    pub async fn exchange(
        &self,
        lease: &mut SessionLease,
        explicit: Option<&ConversationHandle>,
        text: &str,
    ) -> BackendResult<Exchanged> {
        let mut resolution = self.resolver.resolve(lease, explicit).await?;
        let mut recovered = resolution.origin == ConversationOrigin::Recovered;
        loop {
            match self.attempt(lease, &resolution.handle, text).await {
                Ok(reply) => return Ok(Exchanged { resolution, reply }),
                Err(err) if err.is_continuation_rejected() && !recovered => {
                    warn!(
                        event = "send_rejected_recovering",
                        persona = %lease.persona(),
                        chat_id = %resolution.handle,
                        error = %err
                    );
                    resolution = self.resolver.recover(lease).await?;
                    recovered = true;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt(
        &self,
        lease: &SessionLease,
        handle: &ConversationHandle,
        text: &str,
    ) -> BackendResult<StreamedReply> {
        let idle = self.policy.exchange_timeout;
        match self.send_with_backoff(lease, handle, text).await? {
            BackendReply::Complete(reply) if reply.trim().is_empty() => Err(BackendError::EmptyReply),
            BackendReply::Complete(reply) => Ok(StreamedReply::complete(reply, idle)),
            BackendReply::Incremental(rx) => StreamedReply::start(rx, idle).await,
        }
    }

    async fn send_with_backoff(
        &self,
        lease: &SessionLease,
        handle: &ConversationHandle,
        text: &str,
    ) -> BackendResult<BackendReply> {
        let backend = lease.backend();
        let conn = lease.connection();
        let persona = lease.persona();
        let limit = self.policy.exchange_timeout;
        self.policy
            .rate_limit
            .run("message send", move || async move {
                timeout(limit, backend.send_message(conn, persona, handle, text))
                    .await
                    .unwrap_or(Err(BackendError::Timeout("message send")))
            })
            .await
    }
}
