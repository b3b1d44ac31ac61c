//! Whitelist management (owner only).

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use tracing::info;

use crate::auth::{require_owner, Claims};

use super::{api_error, bad_request, internal_error, not_found, validate_address, ApiResult, AppState};

/// GET /api/whitelist
pub async fn list(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Value>> {
    require_owner(&claims).map_err(|e| e.into_api_error())?;
    let entries = state.store.list_whitelist().await.map_err(internal_error)?;
    Ok(Json(json!(entries)))
}

#[derive(Debug, Deserialize)]
pub struct AddRequest {
    pub address: String,
}

/// POST /api/whitelist
pub async fn add(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<AddRequest>,
) -> ApiResult<Json<Value>> {
    require_owner(&claims).map_err(|e| e.into_api_error())?;
    let address = validate_address(&body.address)?;
    let added = state
        .store
        .add_whitelist(&address, &claims.sub)
        .await
        .map_err(internal_error)?;
    if added {
        Ok(Json(json!({ "message": format!("Added {address} to whitelist") })))
    } else {
        Err(api_error(StatusCode::CONFLICT, "Already whitelisted"))
    }
}

/// DELETE /api/whitelist/:address — the owner cannot be removed.
pub async fn remove(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(address): Path<String>,
) -> ApiResult<Json<Value>> {
    require_owner(&claims).map_err(|e| e.into_api_error())?;
    let address = validate_address(&address)?;
    let removed = state
        .store
        .remove_whitelist(&address, state.owner_address.as_deref())
        .await
        .map_err(bad_request)?;
    if removed {
        Ok(Json(json!({ "message": format!("Removed {address} from whitelist") })))
    } else {
        Err(not_found("Not found"))
    }
}

/// GET /api/whitelist/settings
pub async fn settings(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Value>> {
    require_owner(&claims).map_err(|e| e.into_api_error())?;
    Ok(Json(json!({
        "enabled": state.whitelist_enabled.load(Ordering::Relaxed),
    })))
}

#[derive(Debug, Deserialize)]
pub struct SettingsRequest {
    pub enabled: Option<bool>,
}

/// PATCH /api/whitelist/settings — toggle enforcement.
pub async fn update_settings(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<SettingsRequest>,
) -> ApiResult<Json<Value>> {
    require_owner(&claims).map_err(|e| e.into_api_error())?;
    let Some(enabled) = body.enabled else {
        return Err(bad_request("Missing 'enabled' field"));
    };
    state.whitelist_enabled.store(enabled, Ordering::Relaxed);
    let label = if enabled { "enabled" } else { "disabled" };
    info!(by = %claims.sub, "whitelist enforcement {label}");
    Ok(Json(json!({
        "message": format!("Whitelist enforcement {label}"),
        "enabled": enabled,
    })))
}
