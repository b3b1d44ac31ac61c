//! SIWE authentication endpoints.

use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use tracing::info;

use crate::auth::siwe;

use super::{api_error, internal_error, ApiResult, AppState};

/// POST /api/auth/nonce
pub async fn nonce(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let nonce = state.store.create_nonce().await.map_err(internal_error)?;
    Ok(Json(json!({ "nonce": nonce })))
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub message: String,
    pub signature: String,
}

/// POST /api/auth/verify
///
/// Verifies the SIWE signature, checks the nonce was issued by us and is
/// unconsumed, enforces the whitelist (owner exempt), and issues a JWT.
pub async fn verify(
    State(state): State<AppState>,
    Json(body): Json<VerifyRequest>,
) -> ApiResult<Json<Value>> {
    if body.message.is_empty() || body.signature.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "Missing message or signature"));
    }

    let fields = siwe::verify_message(&body.message, &body.signature)
        .map_err(|e| api_error(StatusCode::UNAUTHORIZED, format!("SIWE verification failed: {e}")))?;
    let address = fields.address;

    let is_owner = state
        .owner_address
        .as_deref()
        .map(|owner| owner == address)
        .unwrap_or(false);
    let role = if is_owner { "owner" } else { "user" };

    if state.whitelist_enabled.load(Ordering::Relaxed) && !is_owner {
        let whitelisted = state
            .store
            .is_whitelisted(&address)
            .await
            .map_err(internal_error)?;
        if !whitelisted {
            return Err(api_error(
                StatusCode::FORBIDDEN,
                "Wallet not whitelisted. Contact the operator for access.",
            ));
        }
    }

    let user = state
        .store
        .upsert_user(&address, role)
        .await
        .map_err(internal_error)?;
    let (token, expires_at) = state
        .jwt
        .generate_token(&address, &user.role)
        .map_err(internal_error)?;

    // The nonce must have been issued by us and never used before.
    let consumed = state
        .store
        .consume_nonce(&fields.nonce, &address, &token, &expires_at.to_rfc3339())
        .await
        .map_err(internal_error)?;
    if !consumed {
        return Err(api_error(StatusCode::UNAUTHORIZED, "Invalid or expired nonce"));
    }

    info!(address = %address, role = %user.role, "wallet authenticated");
    Ok(Json(json!({
        "token": token,
        "address": address,
        "role": user.role,
    })))
}

/// GET /api/auth/session — echoes the decoded token, if valid.
pub async fn session(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> ApiResult<Json<Value>> {
    let token = headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "No token"))?;

    let claims = state
        .jwt
        .validate_token(token)
        .map_err(|_| api_error(StatusCode::UNAUTHORIZED, "Invalid token"))?;

    Ok(Json(json!({
        "authenticated": true,
        "address": claims.sub,
        "role": claims.role,
    })))
}
