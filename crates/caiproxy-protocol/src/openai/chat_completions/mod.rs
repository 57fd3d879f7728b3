pub mod request;
pub mod response;
pub mod stream;
pub mod types;

pub use request::ChatCompletionRequestBody;
pub use response::{ChatCompletionChoice, ChatCompletionObjectType, ChatCompletionResponse};
pub use stream::{
    ChatCompletionChunk, ChatCompletionChunkObjectType, ChatCompletionStreamChoice,
};
pub use types::{
    ChatCompletionDelta, ChatCompletionFinishReason, ChatCompletionMessage,
    ChatCompletionResponseMessage, ChatCompletionRole, CompletionUsage, ContentPart,
    MessageContent,
};
