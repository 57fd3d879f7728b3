use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::conversation::{ConversationOrigin, UsageEstimate};

/// Operational events. Accounts are identified by token fingerprint only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Session(SessionEvent),
    Conversation(ConversationEvent),
    Exchange(ExchangeEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub at: SystemTime,
    pub account: String,
    pub persona: String,
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    Opened,
    Reused,
    Evicted { reason: EvictionReason },
    AuthFailed { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    Idle,
    Invalidated,
    Released,
    Shutdown,
}

impl EvictionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionReason::Idle => "idle",
            EvictionReason::Invalidated => "invalidated",
            EvictionReason::Released => "released",
            EvictionReason::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEvent {
    pub at: SystemTime,
    pub account: String,
    pub persona: String,
    pub chat_id: String,
    pub kind: ConversationEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationEventKind {
    Adopted(ConversationOrigin),
    Expired,
    Discarded,
    Forgotten,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeEvent {
    pub at: SystemTime,
    pub trace_id: Option<String>,
    pub account: String,
    pub persona: String,
    pub chat_id: String,
    pub origin: ConversationOrigin,
    pub stream: bool,
    pub usage: UsageEstimate,
}
