//! `/v1/conversations/{persona}`: branches known for the caller's credential.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;

use caiproxy_core::{ProxyError, extract_access_token};
use caiproxy_provider_core::{AccessToken, ConversationHandle, PersonaId};

use crate::proxy::{ProxyState, error_response, parse_json_body};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CreateBranchBody {
    parent_chat_id: Option<String>,
    message_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ForgetBranchBody {
    chat_id: Option<String>,
}

fn caller(headers: &HeaderMap, persona: &str) -> Result<(AccessToken, PersonaId), ProxyError> {
    let token = extract_access_token(headers)?;
    let persona = persona.trim();
    if persona.is_empty() {
        return Err(ProxyError::bad_request("persona is required").with_code("persona_required"));
    }
    Ok((token, PersonaId::new(persona)))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) async fn list(
    State(state): State<ProxyState>,
    Path(persona): Path<String>,
    headers: HeaderMap,
) -> Response {
    let (token, persona) = match caller(&headers, &persona) {
        Ok(caller) => caller,
        Err(err) => return error_response(&err),
    };
    let conversations = state.app.engine.list_branches(token, persona).await;
    Json(json!({
        "success": true,
        "conversations": conversations,
    }))
    .into_response()
}

pub(crate) async fn create(
    State(state): State<ProxyState>,
    Path(persona): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (token, persona) = match caller(&headers, &persona) {
        Ok(caller) => caller,
        Err(err) => return error_response(&err),
    };
    // An empty body means "branch from nothing".
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        CreateBranchBody::default()
    } else {
        match parse_json_body::<CreateBranchBody>(&body) {
            Ok(body) => body,
            Err(err) => return error_response(&err),
        }
    };

    let parent = non_blank(body.parent_chat_id).map(ConversationHandle::new);
    match state
        .app
        .engine
        .create_branch(token, persona, parent, non_blank(body.message_id))
        .await
    {
        Ok(chat_id) => Json(json!({
            "success": true,
            "chat_id": chat_id,
        }))
        .into_response(),
        Err(err) => error_response(&err),
    }
}

pub(crate) async fn forget(
    State(state): State<ProxyState>,
    Path(persona): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (token, persona) = match caller(&headers, &persona) {
        Ok(caller) => caller,
        Err(err) => return error_response(&err),
    };
    let body: ForgetBranchBody = match parse_json_body(&body) {
        Ok(body) => body,
        Err(err) => return error_response(&err),
    };
    let Some(chat_id) = non_blank(body.chat_id) else {
        return error_response(
            &ProxyError::bad_request("chat_id is required").with_code("chat_id_required"),
        );
    };

    let chat_id = ConversationHandle::new(chat_id);
    if state.app.engine.forget_branch(token, persona, &chat_id).await {
        Json(json!({
            "success": true,
            "chat_id": chat_id,
        }))
        .into_response()
    } else {
        error_response(
            &ProxyError::not_found(format!("unknown conversation {chat_id}"))
                .with_code("conversation_not_found"),
        )
    }
}
