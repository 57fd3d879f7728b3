//! HTTP adapter for the character-chat service.

mod ndjson;

use async_trait::async_trait;
use futures_util::StreamExt;
use http::header::{ACCEPT, ACCEPT_LANGUAGE, AUTHORIZATION, CONTENT_TYPE, ORIGIN, REFERER, USER_AGENT};
use http::{HeaderMap, HeaderValue, StatusCode};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use caiproxy_provider_core::{
    AccessToken, BackendConnection, BackendError, BackendReply, BackendResult, CharacterBackend,
    ConversationHandle, PersonaId,
};

use crate::client::{ClientCache, HttpClientConfig, map_wreq_error, retry_after};

pub use ndjson::{LineDecoder, ReplyAccumulator};

pub const DEFAULT_BASE_URL: &str = "https://beta.character.ai";
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const WEB_ORIGIN: &str = "https://character.ai";
const ERROR_BODY_PREVIEW: usize = 200;

#[derive(Debug, Clone)]
pub struct CharacterAiConfig {
    pub base_url: String,
    pub http: HttpClientConfig,
}

impl Default for CharacterAiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            http: HttpClientConfig::default(),
        }
    }
}

pub struct CharacterAiBackend {
    base_url: String,
    clients: ClientCache,
}

/// Which failure statuses mean "this conversation cannot be continued".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    User,
    Create,
    Continue,
    Streaming,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(alias = "history_external_id")]
    external_id: Option<String>,
}

impl CharacterAiBackend {
    pub fn new(config: CharacterAiConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            clients: ClientCache::new(config.http),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn headers(token: &AccessToken) -> BackendResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ORIGIN, HeaderValue::from_static(WEB_ORIGIN));
        headers.insert(REFERER, HeaderValue::from_static("https://character.ai/"));
        let mut auth = HeaderValue::from_str(&format!("Token {}", token.expose()))
            .map_err(|_| BackendError::Authentication("token is not a valid header value".to_string()))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        Ok(headers)
    }

    async fn get_user(&self, token: &AccessToken) -> BackendResult<JsonValue> {
        // Tokens are unverified here; only calls on an authenticated
        // connection populate the cache.
        let client = self.clients.peek(token)?;
        let response = client
            .get(self.url("chat/user/"))
            .headers(Self::headers(token)?)
            .send()
            .await
            .map_err(map_wreq_error)?;
        let response = ensure_success(response, Endpoint::User).await?;
        response
            .json::<JsonValue>()
            .await
            .map_err(|err| BackendError::Malformed(format!("user profile: {err}")))
    }

    async fn post_history(
        &self,
        conn: &BackendConnection,
        endpoint: Endpoint,
        path: &str,
        body: JsonValue,
    ) -> BackendResult<ConversationHandle> {
        let client = self.clients.get(&conn.token)?;
        let response = client
            .post(self.url(path))
            .headers(Self::headers(&conn.token)?)
            .json(&body)
            .send()
            .await
            .map_err(map_wreq_error)?;
        let response = ensure_success(response, endpoint).await?;
        let parsed = response
            .json::<HistoryResponse>()
            .await
            .map_err(|err| BackendError::Malformed(format!("history reply: {err}")))?;
        parsed
            .external_id
            .filter(|id| !id.trim().is_empty())
            .map(ConversationHandle::new)
            .ok_or_else(|| BackendError::Malformed("history reply without external_id".to_string()))
    }
}

async fn ensure_success(response: wreq::Response, endpoint: Endpoint) -> BackendResult<wreq::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let wait = retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    let message: String = body.chars().take(ERROR_BODY_PREVIEW).collect();
    Err(classify_status(status, wait, message, endpoint))
}

fn classify_status(
    status: StatusCode,
    retry_after: Option<std::time::Duration>,
    message: String,
    endpoint: Endpoint,
) -> BackendError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::Authentication(message),
        StatusCode::TOO_MANY_REQUESTS => BackendError::RateLimited { retry_after },
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND
            if matches!(endpoint, Endpoint::Continue | Endpoint::Streaming) =>
        {
            BackendError::ContinuationRejected(message)
        }
        _ => BackendError::Status {
            status: status.as_u16(),
            message,
        },
    }
}

fn account_label(profile: &JsonValue) -> Option<String> {
    ["/user/user/username", "/user/username", "/user/name", "/username"]
        .iter()
        .find_map(|path| profile.pointer(path).and_then(JsonValue::as_str))
        .map(str::to_string)
}

#[async_trait]
impl CharacterBackend for CharacterAiBackend {
    fn name(&self) -> &'static str {
        "characterai"
    }

    async fn authenticate(&self, token: &AccessToken) -> BackendResult<BackendConnection> {
        let profile = self.get_user(token).await?;
        let mut conn = BackendConnection::new(token.clone());
        conn.account = account_label(&profile);
        conn.profile = Some(profile);
        debug!(
            event = "backend_authenticated",
            account = %token.fingerprint(),
            label = conn.account.as_deref().unwrap_or("-")
        );
        Ok(conn)
    }

    async fn create_conversation(
        &self,
        conn: &BackendConnection,
        persona: &PersonaId,
    ) -> BackendResult<ConversationHandle> {
        self.post_history(
            conn,
            Endpoint::Create,
            "chat/history/create/",
            json!({ "character_external_id": persona.as_str() }),
        )
        .await
    }

    async fn continue_conversation(
        &self,
        conn: &BackendConnection,
        persona: &PersonaId,
        handle: &ConversationHandle,
    ) -> BackendResult<ConversationHandle> {
        self.post_history(
            conn,
            Endpoint::Continue,
            "chat/history/continue/",
            json!({
                "character_external_id": persona.as_str(),
                "history_external_id": handle.as_str(),
            }),
        )
        .await
    }

    async fn send_message(
        &self,
        conn: &BackendConnection,
        persona: &PersonaId,
        handle: &ConversationHandle,
        text: &str,
    ) -> BackendResult<BackendReply> {
        let client = self.clients.get(&conn.token)?;
        let response = client
            .post(self.url("chat/streaming/"))
            .headers(Self::headers(&conn.token)?)
            .json(&json!({
                "character_external_id": persona.as_str(),
                "history_external_id": handle.as_str(),
                "text": text,
            }))
            .send()
            .await
            .map_err(map_wreq_error)?;
        let response = ensure_success(response, Endpoint::Streaming).await?;

        let (tx, rx) = mpsc::channel::<BackendResult<String>>(32);
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut lines = LineDecoder::default();
            let mut reply = ReplyAccumulator::default();

            while let Some(item) = body.next().await {
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        let _ = tx.send(Err(map_wreq_error(err))).await;
                        return;
                    }
                };
                for line in lines.push(&chunk) {
                    if !forward(&mut reply, &line, &tx).await {
                        return;
                    }
                }
            }
            if let Some(line) = lines.finish()
                && !forward(&mut reply, &line, &tx).await
            {
                return;
            }
            if reply.text().is_empty() {
                let _ = tx.send(Err(BackendError::EmptyReply)).await;
            } else if !reply.is_finished() {
                warn!(event = "backend_stream_truncated", received = reply.text().len());
            }
        });
        Ok(BackendReply::Incremental(rx))
    }

    async fn release(&self, conn: &BackendConnection) -> BackendResult<()> {
        self.clients.evict(&conn.token);
        Ok(())
    }

    async fn fetch_user(&self, token: &AccessToken) -> BackendResult<JsonValue> {
        let profile = self.get_user(token).await?;
        Ok(profile.get("user").cloned().unwrap_or(profile))
    }
}

/// Push one NDJSON line through the accumulator. Returns false once the
/// stream is over, either because the reply ended or the receiver went away.
async fn forward(
    reply: &mut ReplyAccumulator,
    line: &str,
    tx: &mpsc::Sender<BackendResult<String>>,
) -> bool {
    if reply.is_finished() {
        return false;
    }
    match reply.apply(line) {
        Ok(Some(delta)) => {
            if tx.send(Ok(delta)).await.is_err() {
                return false;
            }
        }
        Ok(None) => {}
        Err(err) => {
            let _ = tx.send(Err(err)).await;
            return false;
        }
    }
    !reply.is_finished()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_per_endpoint() {
        let rejected = classify_status(StatusCode::NOT_FOUND, None, "gone".into(), Endpoint::Continue);
        assert!(rejected.is_continuation_rejected());

        let not_found = classify_status(StatusCode::NOT_FOUND, None, "gone".into(), Endpoint::Create);
        assert_eq!(
            not_found,
            BackendError::Status {
                status: 404,
                message: "gone".into()
            }
        );

        let auth = classify_status(StatusCode::FORBIDDEN, None, String::new(), Endpoint::Streaming);
        assert!(auth.is_authentication());

        let limited = classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            Some(std::time::Duration::from_secs(3)),
            String::new(),
            Endpoint::Streaming,
        );
        assert_eq!(
            limited.retry_after(),
            Some(Some(std::time::Duration::from_secs(3)))
        );
    }

    #[test]
    fn account_label_prefers_nested_username() {
        let profile = json!({"user": {"user": {"username": "alice"}, "name": "Alice"}});
        assert_eq!(account_label(&profile).as_deref(), Some("alice"));
        let profile = json!({"user": {"name": "Bob"}});
        assert_eq!(account_label(&profile).as_deref(), Some("Bob"));
        assert_eq!(account_label(&json!({})), None);
    }

    #[test]
    fn token_header_is_marked_sensitive() {
        let headers = CharacterAiBackend::headers(&AccessToken::new("t0ken")).unwrap();
        let auth = headers.get(AUTHORIZATION).unwrap();
        assert!(auth.is_sensitive());
        assert_eq!(auth.to_str().unwrap(), "Token t0ken");
    }

    #[tokio::test]
    async fn unverified_tokens_are_not_cached() {
        let backend = CharacterAiBackend::new(CharacterAiConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            ..Default::default()
        });
        for i in 0..3 {
            let token = AccessToken::new(format!("bad-{i}"));
            assert!(backend.authenticate(&token).await.is_err());
            assert!(backend.fetch_user(&token).await.is_err());
        }
        assert!(backend.clients.is_empty());

        let conn = BackendConnection::new(AccessToken::new("bad-0"));
        let _ = backend
            .create_conversation(&conn, &PersonaId::new("p"))
            .await;
        assert_eq!(backend.clients.len(), 1);
        backend.release(&conn).await.unwrap();
        assert!(backend.clients.is_empty());
    }

    #[test]
    fn base_url_is_normalised() {
        let backend = CharacterAiBackend::new(CharacterAiConfig {
            base_url: "https://example.test/".to_string(),
            ..Default::default()
        });
        assert_eq!(backend.url("/chat/user/"), "https://example.test/chat/user/");
    }
}
