//! Wire types spoken on the downstream side of the proxy: the OpenAI
//! chat-completions shapes, the error envelope, and SSE framing.

pub mod error;
pub mod openai;
pub mod sse;
