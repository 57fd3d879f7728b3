mod hub;
mod tracing_sink;
mod types;

pub use hub::{EventHub, EventSink};
pub use tracing_sink::TracingEventSink;
pub use types::{
    ConversationEvent, ConversationEventKind, EvictionReason, Event, ExchangeEvent, SessionEvent,
    SessionEventKind,
};
