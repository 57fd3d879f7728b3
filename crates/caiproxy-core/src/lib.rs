pub mod auth;
pub mod bootstrap;
pub mod continuity;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod model;
pub mod state;
pub mod translate;

pub use auth::extract_access_token;
pub use continuity::{ContinuityResolver, Resolution};
pub use engine::{BranchView, ChatOutcome, ProxyEngine, ReplyMeta, TokenCheck};
pub use error::{ErrorKind, ProxyError};
pub use exchange::{ExchangeEngine, Exchanged, RetryPolicy, StreamedReply};
pub use model::{ChatRequest, ModelTarget};
pub use state::AppState;
