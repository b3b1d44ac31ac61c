//! JWT validation middleware for the protected API surface.

use crate::auth::{jwt::JwtHandler, Claims};
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;

/// Validates the bearer token (or `?token=` query parameter, used by the
/// WebSocket handshake) and stashes the decoded claims in request
/// extensions for handlers.
pub async fn auth_middleware(
    State(jwt_handler): State<Arc<JwtHandler>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let token_from_query = req.uri().query().and_then(|query| {
        query
            .split('&')
            .find(|pair| pair.starts_with("token="))
            .and_then(|pair| pair.split('=').nth(1))
            .map(str::to_string)
    });

    let token_from_header = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::to_string);

    let token = token_from_query
        .or(token_from_header)
        .ok_or(AuthError::MissingToken)?;

    let claims = jwt_handler
        .validate_token(&token)
        .map_err(|_| AuthError::InvalidToken)?;

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

/// Owner gate for ownership-scoped handlers. Use after `auth_middleware`.
pub fn require_owner(claims: &Claims) -> Result<(), AuthError> {
    if claims.is_owner() {
        Ok(())
    } else {
        Err(AuthError::OwnerRequired)
    }
}

#[derive(Debug)]
pub enum AuthError {
    MissingToken,
    InvalidToken,
    OwnerRequired,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingToken => (StatusCode::UNAUTHORIZED, "Missing authorization token"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
            AuthError::OwnerRequired => (StatusCode::FORBIDDEN, "Owner access required"),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request as HttpRequest};

    #[test]
    fn test_auth_error_status_codes() {
        assert_eq!(
            AuthError::MissingToken.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthError::InvalidToken.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthError::OwnerRequired.into_response().status(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_require_owner() {
        let user = Claims {
            sub: "0xa".into(),
            role: "user".into(),
            iat: 0,
            exp: 0,
        };
        assert!(require_owner(&user).is_err());

        let owner = Claims {
            sub: "0xa".into(),
            role: "owner".into(),
            iat: 0,
            exp: 0,
        };
        assert!(require_owner(&owner).is_ok());
    }

    #[test]
    fn test_claims_live_in_extensions() {
        let mut req = HttpRequest::new(Body::empty());
        assert!(req.extensions().get::<Claims>().is_none());

        req.extensions_mut().insert(Claims {
            sub: "0xabc".into(),
            role: "user".into(),
            iat: 0,
            exp: 0,
        });
        assert_eq!(req.extensions().get::<Claims>().unwrap().sub, "0xabc");
    }
}
