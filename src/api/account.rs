//! Caller-scoped account endpoints: profile, cross-strategy history,
//! preferences, venue credentials, engine events.

use axum::{
    extract::{Query, State},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::Claims;
use crate::models::Strategy;
use crate::store::{ApiCredentials, TradeFilter};

use super::copy::HistoryQuery;
use super::{bad_request, internal_error, not_found, ApiResult, AppState};

/// GET /api/me
pub async fn me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Value>> {
    let user = state
        .store
        .get_user(&claims.sub)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found("User not found"))?;
    Ok(Json(json!(user)))
}

/// GET /api/trades — caller-scoped, all strategies.
pub async fn trades(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Value>> {
    let trades = state
        .store
        .list_trades(&TradeFilter {
            strategy: None,
            user_address: Some(claims.sub.clone()),
            status: query.status,
            search: query.search,
            limit: query.limit.unwrap_or(50),
            offset: query.offset.unwrap_or(0),
        })
        .await
        .map_err(internal_error)?;
    Ok(Json(json!(trades)))
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub strategy: Option<String>,
    pub limit: Option<usize>,
}

/// GET /api/events — caller-scoped engine event log.
pub async fn events(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Value>> {
    let strategy = match query.strategy.as_deref() {
        None => None,
        Some("copy") => Some(Strategy::Copy),
        Some("arbitrage") => Some(Strategy::Arbitrage),
        Some("fund") => Some(Strategy::Fund),
        Some(other) => return Err(bad_request(format!("Unknown strategy: {other}"))),
    };
    let events = state
        .store
        .list_events(Some(&claims.sub), strategy, query.limit.unwrap_or(100))
        .await
        .map_err(internal_error)?;
    Ok(Json(json!(events)))
}

/// GET /api/preferences
pub async fn get_preferences(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Value>> {
    let prefs = state
        .store
        .get_preferences(&claims.sub)
        .await
        .map_err(internal_error)?;
    Ok(Json(prefs))
}

/// PATCH /api/preferences — shallow merge; null values delete keys.
pub async fn patch_preferences(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(patch): Json<Value>,
) -> ApiResult<Json<Value>> {
    if !patch.is_object() {
        return Err(bad_request("Expected a JSON object"));
    }
    let merged = state
        .store
        .merge_preferences(&claims.sub, &patch)
        .await
        .map_err(internal_error)?;
    Ok(Json(merged))
}

/// GET /api/credentials — presence flags only, never the secrets.
pub async fn get_credentials(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Value>> {
    let creds = state
        .store
        .get_credentials(&claims.sub)
        .await
        .map_err(internal_error)?;
    match creds {
        Some(creds) => Ok(Json(json!({
            "configured": true,
            "has_api_key": !creds.api_key.is_empty(),
            "has_api_secret": !creds.api_secret.is_empty(),
            "has_api_passphrase": !creds.api_passphrase.is_empty(),
        }))),
        None => Ok(Json(json!({ "configured": false }))),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CredentialsRequest {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub api_passphrase: String,
}

/// PUT /api/credentials — partial update; empty fields preserve stored
/// values.
pub async fn put_credentials(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<CredentialsRequest>,
) -> ApiResult<Json<Value>> {
    if body.api_key.trim().is_empty()
        && body.api_secret.trim().is_empty()
        && body.api_passphrase.trim().is_empty()
    {
        return Err(bad_request("No credential fields provided"));
    }
    state
        .store
        .save_credentials(
            &claims.sub,
            &ApiCredentials {
                api_key: body.api_key,
                api_secret: body.api_secret,
                api_passphrase: body.api_passphrase,
            },
        )
        .await
        .map_err(internal_error)?;
    Ok(Json(json!({ "message": "Credentials saved" })))
}

/// DELETE /api/credentials
pub async fn delete_credentials(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Value>> {
    let deleted = state
        .store
        .delete_credentials(&claims.sub)
        .await
        .map_err(internal_error)?;
    if deleted {
        Ok(Json(json!({ "message": "Credentials deleted" })))
    } else {
        Err(not_found("No credentials stored"))
    }
}
