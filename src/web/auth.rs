use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use tracing::debug;

use crate::error::{PatrickError, Result};
use crate::web::WebState;

const TOKEN_SCHEMES: [&str; 4] = ["bearer", "token", "github", "oauth"];

/// Pulls the token out of `Authorization: <scheme> <token>`.
pub fn request_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();
    let known = TOKEN_SCHEMES
        .iter()
        .any(|s| scheme.eq_ignore_ascii_case(s));
    (known && !token.is_empty()).then_some(token)
}

/// Rejects requests without a token the identity service accepts.
pub async fn require_token(
    State(state): State<WebState>,
    request: Request,
    next: Next,
) -> Result<Response> {
    let token = request_token(request.headers())
        .ok_or_else(|| PatrickError::Unauthorized("token required".to_string()))?;
    if !state.identity.validate_token(token).await? {
        debug!(path = %request.uri().path(), "Rejected request token");
        return Err(PatrickError::Unauthorized("invalid token".to_string()));
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, value.parse().unwrap());
        headers
    }

    #[test]
    fn accepts_known_schemes() {
        assert_eq!(request_token(&headers("Bearer abc")), Some("abc"));
        assert_eq!(request_token(&headers("github abc")), Some("abc"));
        assert_eq!(request_token(&headers("oauth  abc ")), Some("abc"));
        assert_eq!(request_token(&headers("token abc")), Some("abc"));
    }

    #[test]
    fn rejects_unknown_or_empty() {
        assert_eq!(request_token(&headers("Basic abc")), None);
        assert_eq!(request_token(&headers("Bearer")), None);
        assert_eq!(request_token(&HeaderMap::new()), None);
    }
}
