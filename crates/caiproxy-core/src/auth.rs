use http::HeaderMap;
use http::header::AUTHORIZATION;

use caiproxy_provider_core::AccessToken;

use crate::error::ProxyError;

/// Pull the backend access token out of `Authorization: Bearer <token>`.
/// The scheme is matched case-insensitively.
pub fn extract_access_token(headers: &HeaderMap) -> Result<AccessToken, ProxyError> {
    let raw = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| {
            ProxyError::unauthorized("missing Authorization header").with_code("missing_token")
        })?
        .to_str()
        .map_err(|_| ProxyError::unauthorized("malformed Authorization header"))?
        .trim();

    let (scheme, token) = raw
        .split_once(' ')
        .ok_or_else(|| ProxyError::unauthorized("expected `Authorization: Bearer <token>`"))?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(ProxyError::unauthorized(
            "expected `Authorization: Bearer <token>`",
        ));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(ProxyError::unauthorized("empty bearer token").with_code("missing_token"));
    }
    Ok(AccessToken::new(token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn bearer_token_is_extracted() {
        let token = extract_access_token(&headers("Bearer abc.def")).unwrap();
        assert_eq!(token.expose(), "abc.def");
        let token = extract_access_token(&headers("bearer   spaced  ")).unwrap();
        assert_eq!(token.expose(), "spaced");
    }

    #[test]
    fn missing_or_malformed_header_is_unauthorized() {
        for value in ["Token abc", "Bearer", "Bearer    ", "abc"] {
            let err = extract_access_token(&headers(value)).unwrap_err();
            assert_eq!(err.status(), http::StatusCode::UNAUTHORIZED, "{value}");
        }
        let err = extract_access_token(&HeaderMap::new()).unwrap_err();
        assert_eq!(err.code.as_deref(), Some("missing_token"));
    }
}
