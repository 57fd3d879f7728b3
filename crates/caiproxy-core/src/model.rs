use caiproxy_protocol::openai::chat_completions::ChatCompletionRequestBody;
use caiproxy_provider_core::{ConversationHandle, PersonaId};

use crate::error::ProxyError;

/// Separates persona and conversation in the `model` field.
pub const MODEL_DELIMITER: char = ':';

/// Persona and optional conversation encoded in the `model` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelTarget {
    pub persona: PersonaId,
    pub conversation: Option<ConversationHandle>,
}

impl ModelTarget {
    /// Parse `persona` or `persona:conversation`, after stripping the first
    /// matching namespace prefix. Only surrounding whitespace is trimmed.
    pub fn parse(model: &str, prefixes: &[String]) -> Result<Self, ProxyError> {
        let trimmed = model.trim();
        let unprefixed = prefixes
            .iter()
            .filter(|prefix| !prefix.is_empty())
            .find_map(|prefix| trimmed.strip_prefix(prefix.as_str()))
            .unwrap_or(trimmed);

        let (persona, conversation) = match unprefixed.split_once(MODEL_DELIMITER) {
            Some((persona, conversation)) => (persona.trim(), Some(conversation.trim())),
            None => (unprefixed, None),
        };

        if persona.is_empty() {
            return Err(
                ProxyError::bad_request("model must name a persona: `persona[:conversation]`")
                    .with_code("persona_required"),
            );
        }
        if conversation.is_some_and(|c| c.contains(MODEL_DELIMITER)) {
            return Err(
                ProxyError::bad_request("model must be `persona` or `persona:conversation`")
                    .with_code("invalid_model"),
            );
        }

        Ok(Self {
            persona: PersonaId::new(persona),
            conversation: conversation
                .filter(|c| !c.is_empty())
                .map(ConversationHandle::new),
        })
    }
}

/// A validated chat-completions request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// `model` exactly as the caller sent it, echoed back in replies.
    pub model: String,
    pub target: ModelTarget,
    /// Latest user message text.
    pub message: String,
    pub stream: bool,
}

impl ChatRequest {
    pub fn from_body(
        body: ChatCompletionRequestBody,
        prefixes: &[String],
    ) -> Result<Self, ProxyError> {
        let model = body
            .model
            .clone()
            .filter(|model| !model.trim().is_empty())
            .ok_or_else(|| ProxyError::bad_request("model is required").with_code("model_required"))?;
        if body.messages.as_ref().is_none_or(Vec::is_empty) {
            return Err(
                ProxyError::bad_request("messages must be a non-empty array")
                    .with_code("messages_required"),
            );
        }
        let target = ModelTarget::parse(&model, prefixes)?;
        let message = body.last_user_text().ok_or_else(|| {
            ProxyError::bad_request("messages must contain a user message with text")
                .with_code("user_message_required")
        })?;
        Ok(Self {
            model,
            target,
            message,
            stream: body.is_stream(),
        })
    }
}
