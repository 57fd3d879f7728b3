use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use caiproxy_provider_core::{AccessToken, BackendError};
use http::HeaderMap;
use http::header::RETRY_AFTER;
use wreq::{Client, Proxy};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Idle bound between body reads; streaming replies rely on it.
    pub read_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(300),
            read_timeout: Duration::from_secs(120),
        }
    }
}

/// One `wreq` client per authenticated access token. Dropped on release,
/// rebuilt on next use.
pub struct ClientCache {
    config: HttpClientConfig,
    clients: Mutex<HashMap<AccessToken, Client>>,
}

impl ClientCache {
    pub fn new(config: HttpClientConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, token: &AccessToken) -> Result<Client, BackendError> {
        let mut guard = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = guard.get(token) {
            return Ok(client.clone());
        }
        let client = build_client(&self.config).map_err(map_wreq_error)?;
        guard.insert(token.clone(), client.clone());
        Ok(client)
    }

    /// Cached client for `token`, or a throwaway one. Never inserts, so
    /// unverified tokens leave nothing behind.
    pub fn peek(&self, token: &AccessToken) -> Result<Client, BackendError> {
        let cached = self
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .cloned();
        match cached {
            Some(client) => Ok(client),
            None => build_client(&self.config).map_err(map_wreq_error),
        }
    }

    pub fn evict(&self, token: &AccessToken) -> bool {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) fn normalize_proxy(value: Option<&str>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}

pub fn build_client(config: &HttpClientConfig) -> Result<Client, wreq::Error> {
    let mut builder = Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .read_timeout(config.read_timeout);

    if let Some(proxy) = normalize_proxy(config.proxy.as_deref()) {
        builder = builder.proxy(Proxy::all(proxy)?);
    }

    builder.build()
}

pub(crate) fn map_wreq_error(err: wreq::Error) -> BackendError {
    if err.is_timeout() {
        return BackendError::Timeout("request");
    }
    BackendError::Transport(err.to_string())
}

/// `Retry-After` as delta-seconds or an HTTP date.
pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    httpdate::parse_http_date(value)
        .ok()?
        .duration_since(SystemTime::now())
        .ok()
}
