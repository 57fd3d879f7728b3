use std::future::Future;
use std::pin::Pin;

use tracing::{info, warn};

use super::types::{ConversationEventKind, SessionEventKind};
use super::{Event, EventSink};

/// Writes every event as one structured `tracing` record.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl TracingEventSink {
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for TracingEventSink {
    fn write<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            match event {
                Event::Session(ev) => match &ev.kind {
                    SessionEventKind::Opened => info!(
                        event = "session_opened",
                        account = %ev.account,
                        persona = %ev.persona
                    ),
                    SessionEventKind::Reused => info!(
                        event = "session_reused",
                        account = %ev.account,
                        persona = %ev.persona
                    ),
                    SessionEventKind::Evicted { reason } => info!(
                        event = "session_evicted",
                        account = %ev.account,
                        persona = %ev.persona,
                        reason = reason.as_str()
                    ),
                    SessionEventKind::AuthFailed { message } => warn!(
                        event = "session_auth_failed",
                        account = %ev.account,
                        persona = %ev.persona,
                        error = %message
                    ),
                },
                Event::Conversation(ev) => {
                    let kind = match ev.kind {
                        ConversationEventKind::Adopted(origin) => origin.as_str(),
                        ConversationEventKind::Expired => "expired",
                        ConversationEventKind::Discarded => "discarded",
                        ConversationEventKind::Forgotten => "forgotten",
                    };
                    info!(
                        event = "conversation_changed",
                        account = %ev.account,
                        persona = %ev.persona,
                        chat_id = %ev.chat_id,
                        kind
                    );
                }
                Event::Exchange(ev) => info!(
                    event = "exchange_completed",
                    trace_id = ev.trace_id.as_deref().unwrap_or("-"),
                    account = %ev.account,
                    persona = %ev.persona,
                    chat_id = %ev.chat_id,
                    origin = ev.origin.as_str(),
                    stream = ev.stream,
                    prompt_tokens = ev.usage.prompt_tokens,
                    completion_tokens = ev.usage.completion_tokens
                ),
            }
        })
    }
}
