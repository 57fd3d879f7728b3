//! HTTP surface of caiproxy.

mod conversations;
mod proxy;

pub use proxy::{ProxyState, proxy_router};
