use serde::{Deserialize, Serialize};

use crate::openai::chat_completions::types::ChatCompletionMessage;

/// Downstream request body.
///
/// `model` and `messages` are optional at the serde layer so their absence
/// surfaces as a validation error instead of a deserialization rejection.
/// Sampling fields are accepted and ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatCompletionRequestBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<ChatCompletionMessage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl ChatCompletionRequestBody {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// Text of the most recent user message. `None` when that message is
    /// blank; earlier user turns are never considered.
    pub fn last_user_text(&self) -> Option<String> {
        self.messages
            .as_deref()?
            .iter()
            .rev()
            .find(|message| message.is_user())?
            .text()
            .filter(|text| !text.trim().is_empty())
    }
}
