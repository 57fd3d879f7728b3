use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::credential::{ConversationHandle, PersonaId};

/// Characters per estimated token.
///
/// Usage numbers are an approximation: `ceil(chars / CHARS_PER_TOKEN)` over
/// Unicode scalar values. No tokenizer is involved.
pub const CHARS_PER_TOKEN: u64 = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEstimate {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl UsageEstimate {
    pub fn estimate(prompt: &str, completion: &str) -> Self {
        let prompt_tokens = estimate_tokens(prompt);
        let completion_tokens = estimate_tokens(completion);
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(CHARS_PER_TOKEN)
}

/// One request/response cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub input: String,
    pub output: String,
    pub usage: UsageEstimate,
    pub at: SystemTime,
}

impl Exchange {
    pub fn new(input: impl Into<String>, output: impl Into<String>, at: SystemTime) -> Self {
        let input = input.into();
        let output = output.into();
        let usage = UsageEstimate::estimate(&input, &output);
        Self {
            input,
            output,
            usage,
            at,
        }
    }
}

/// How the handle used for an exchange was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationOrigin {
    /// No conversation was known; a new one was created.
    Created,
    /// The cached handle was reused as-is.
    Cached,
    /// A caller-supplied handle was reopened on the backend.
    Continued,
    /// Continuation was rejected and a fresh conversation replaced it.
    Recovered,
}

impl ConversationOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationOrigin::Created => "created",
            ConversationOrigin::Cached => "cached",
            ConversationOrigin::Continued => "continued",
            ConversationOrigin::Recovered => "recovered",
        }
    }
}

/// A conversation known for a (credential, persona) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationBranch {
    pub chat_id: ConversationHandle,
    pub parent_chat_id: Option<ConversationHandle>,
    pub message_id: Option<String>,
    pub created_at: SystemTime,
    pub exchanges: u64,
}

impl ConversationBranch {
    pub fn new(chat_id: ConversationHandle, created_at: SystemTime) -> Self {
        Self {
            chat_id,
            parent_chat_id: None,
            message_id: None,
            created_at,
            exchanges: 0,
        }
    }
}

/// The active conversation of a session slot.
#[derive(Debug, Clone)]
pub struct ConversationState {
    pub persona: PersonaId,
    pub handle: ConversationHandle,
    pub last_activity: SystemTime,
    pub history: VecDeque<Exchange>,
}

impl ConversationState {
    pub fn new(persona: PersonaId, handle: ConversationHandle, now: SystemTime) -> Self {
        Self {
            persona,
            handle,
            last_activity: now,
            history: VecDeque::new(),
        }
    }

    pub fn is_stale(&self, now: SystemTime, idle: Duration) -> bool {
        now.duration_since(self.last_activity).unwrap_or_default() > idle
    }

    /// Append an exchange, keeping at most `limit` entries.
    pub fn record(&mut self, exchange: Exchange, limit: usize) {
        self.last_activity = exchange.at;
        if limit == 0 {
            return;
        }
        while self.history.len() >= limit {
            self.history.pop_front();
        }
        self.history.push_back(exchange);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_rounds_up_per_side() {
        let usage = UsageEstimate::estimate("hello", "hi");
        assert_eq!(usage.prompt_tokens, 2);
        assert_eq!(usage.completion_tokens, 1);
        assert_eq!(usage.total_tokens, 3);
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
    }

    #[test]
    fn usage_counts_characters_not_bytes() {
        assert_eq!(estimate_tokens("héllo"), 2);
        assert_eq!(estimate_tokens("日本語です"), 2);
    }

    #[test]
    fn history_is_bounded() {
        let now = SystemTime::UNIX_EPOCH;
        let mut state = ConversationState::new("p".into(), "c".into(), now);
        for i in 0..5u64 {
            let at = now + Duration::from_secs(i);
            state.record(Exchange::new(format!("in{i}"), "out", at), 3);
        }
        assert_eq!(state.history.len(), 3);
        assert_eq!(state.history[0].input, "in2");
        assert_eq!(state.last_activity, now + Duration::from_secs(4));
    }

    #[test]
    fn staleness_uses_last_activity() {
        let now = SystemTime::UNIX_EPOCH;
        let state = ConversationState::new("p".into(), "c".into(), now);
        let idle = Duration::from_secs(60);
        assert!(!state.is_stale(now + Duration::from_secs(60), idle));
        assert!(state.is_stale(now + Duration::from_secs(61), idle));
    }
}
