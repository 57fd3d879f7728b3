//! Core backend abstractions for caiproxy.
//!
//! This crate does not depend on axum or any concrete HTTP client. Adapters
//! implement [`CharacterBackend`]; the [`SessionRegistry`] owns every live
//! backend connection and the conversation state attached to it.

pub mod backend;
pub mod clock;
pub mod conversation;
pub mod credential;
pub mod errors;
pub mod events;
pub mod retry;
pub mod session;

pub use backend::{BackendConnection, BackendReply, CharacterBackend, FragmentStream};
pub use clock::{Clock, ManualClock, SystemClock};
pub use conversation::{
    CHARS_PER_TOKEN, ConversationBranch, ConversationOrigin, ConversationState, Exchange,
    UsageEstimate,
};
pub use credential::{AccessToken, ConversationHandle, PersonaId, SessionKey};
pub use errors::{BackendError, BackendResult};
pub use events::{
    ConversationEvent, ConversationEventKind, EvictionReason, Event, EventHub, EventSink,
    ExchangeEvent, SessionEvent, SessionEventKind, TracingEventSink,
};
pub use retry::RateLimitBackoff;
pub use session::{RegistryConfig, SessionLease, SessionRegistry, SweepReport};
