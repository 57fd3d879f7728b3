//! Concrete [`CharacterBackend`](caiproxy_provider_core::CharacterBackend) adapters.

pub mod characterai;
pub mod client;
pub mod scripted;

pub use characterai::{CharacterAiBackend, CharacterAiConfig};
pub use client::{ClientCache, HttpClientConfig};
pub use scripted::{CallCounts, ReplyMode, Script, ScriptedBackend};
