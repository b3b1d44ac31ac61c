//! Copy-trading endpoints: engine control, followed traders, history.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::Claims;
use crate::engines::{CopyTrader, EngineKey, EngineKind};
use crate::models::{OrderMode, Strategy};
use crate::store::{TradeFilter, TraderOverridePatch};

use super::{api_error, bad_request, internal_error, not_found, validate_address, ApiResult, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub dry_run: bool,
}

/// POST /api/copy/start
pub async fn start(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    body: Option<Json<StartRequest>>,
) -> ApiResult<Json<Value>> {
    let dry_run = body.map(|Json(b)| b.dry_run).unwrap_or(false);
    let user = claims.sub.clone();

    if !dry_run && !state.has_trading_credentials(&user).await {
        return Err(bad_request(
            "No trading credentials configured. Add venue API credentials or run in dry-run mode.",
        ));
    }

    let follows = state
        .store
        .list_follows(&user, false)
        .await
        .map_err(internal_error)?;
    if follows.is_empty() {
        return Err(bad_request("No traders followed. Add traders first."));
    }

    let gateway = Arc::new(state.gateway_for(&user).await);
    let worker = CopyTrader::new(
        state.store.clone(),
        gateway,
        Some(state.notifier.clone()),
        state.config.copy_defaults(),
        Duration::from_secs(state.config.poll_interval_secs),
        &user,
        dry_run,
    );

    let started = state
        .supervisor
        .start(EngineKey::new(&user, EngineKind::Copy), |cancel| worker.run(cancel));
    if !started {
        return Err(bad_request("Copy trading already running"));
    }

    super::positions_routes::ensure_position_tracker(&state);
    Ok(Json(json!({ "message": "Copy trading started", "dry_run": dry_run })))
}

/// POST /api/copy/stop
pub async fn stop(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Value>> {
    if state
        .supervisor
        .stop(&EngineKey::new(&claims.sub, EngineKind::Copy))
    {
        Ok(Json(json!({ "message": "Copy trading stopped" })))
    } else {
        Err(bad_request("Not running"))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListTradersQuery {
    #[serde(default)]
    pub include_inactive: bool,
}

/// GET /api/copy/traders
pub async fn list_traders(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<ListTradersQuery>,
) -> ApiResult<Json<Value>> {
    let traders = state
        .store
        .list_follows(&claims.sub, query.include_inactive)
        .await
        .map_err(internal_error)?;
    Ok(Json(json!(traders)))
}

#[derive(Debug, Deserialize)]
pub struct AddTraderRequest {
    pub address: String,
    #[serde(default)]
    pub alias: String,
}

/// POST /api/copy/traders
pub async fn add_trader(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<AddTraderRequest>,
) -> ApiResult<Json<Value>> {
    let address = validate_address(&body.address)?;
    let added = state
        .store
        .add_follow(&claims.sub, &address, &body.alias)
        .await
        .map_err(internal_error)?;
    if added {
        Ok(Json(json!({ "message": format!("Added {address}") })))
    } else {
        Err(api_error(StatusCode::CONFLICT, "Already following"))
    }
}

/// DELETE /api/copy/traders/:address
pub async fn remove_trader(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(address): Path<String>,
) -> ApiResult<Json<Value>> {
    let address = validate_address(&address)?;
    let removed = state
        .store
        .remove_follow(&claims.sub, &address)
        .await
        .map_err(internal_error)?;
    if removed {
        Ok(Json(json!({ "message": format!("Removed {address}") })))
    } else {
        Err(not_found("Not found"))
    }
}

/// PATCH /api/copy/traders/:address
///
/// Body carries any subset of the per-trader settings. Explicit nulls
/// clear an override back to the user default; absent fields are
/// untouched.
pub async fn update_trader(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(address): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let address = validate_address(&address)?;
    let object = body
        .as_object()
        .ok_or_else(|| bad_request("Expected a JSON object"))?;

    let mut patch = TraderOverridePatch::default();
    for (key, value) in object {
        match key.as_str() {
            "alias" => {
                patch.alias = Some(
                    value
                        .as_str()
                        .ok_or_else(|| bad_request("alias must be a string"))?
                        .to_string(),
                );
            }
            "active" => {
                patch.active = Some(
                    value
                        .as_bool()
                        .ok_or_else(|| bad_request("active must be a boolean"))?,
                );
            }
            "order_mode" => {
                patch.order_mode = Some(if value.is_null() {
                    None
                } else {
                    let raw = value
                        .as_str()
                        .ok_or_else(|| bad_request("order_mode must be a string"))?;
                    Some(
                        OrderMode::parse(raw)
                            .ok_or_else(|| bad_request("order_mode must be 'market' or 'limit'"))?,
                    )
                });
            }
            "copy_percentage" | "min_copy_size" | "max_copy_size" | "max_daily_spend"
            | "limit_order_pct" => {
                let parsed = if value.is_null() {
                    None
                } else {
                    let number = value
                        .as_f64()
                        .ok_or_else(|| bad_request(format!("{key} must be a number")))?;
                    if number < 0.0 {
                        return Err(bad_request(format!("{key} must be >= 0")));
                    }
                    Some(number)
                };
                match key.as_str() {
                    "copy_percentage" => patch.copy_percentage = Some(parsed),
                    "min_copy_size" => patch.min_copy_size = Some(parsed),
                    "max_copy_size" => patch.max_copy_size = Some(parsed),
                    "max_daily_spend" => patch.max_daily_spend = Some(parsed),
                    _ => patch.limit_order_pct = Some(parsed),
                }
            }
            _ => {} // unknown fields are ignored
        }
    }

    if patch.is_empty() {
        return Err(bad_request("No valid settings provided"));
    }

    let updated = state
        .store
        .update_follow_overrides(&claims.sub, &address, &patch)
        .await
        .map_err(internal_error)?;
    if updated {
        Ok(Json(json!({ "message": format!("Updated settings for {address}") })))
    } else {
        Err(not_found("Trader not found"))
    }
}

/// GET /api/copy/traders/:address/profile — live positions and trades of a
/// followed wallet. Works without trading credentials.
pub async fn trader_profile(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> ApiResult<Json<Value>> {
    use crate::gateway::Gateway;

    let address = validate_address(&address)?;
    let positions = state.gateway.get_trader_positions(&address).await;
    let trades = state.gateway.get_trader_trades(&address, 200).await;

    let trades: Vec<Value> = trades
        .iter()
        .map(|t| {
            json!({
                "fingerprint": t.fingerprint,
                "token_id": t.token_id,
                "side": t.raw_side,
                "size": t.size,
                "price": t.price,
                "timestamp": t.timestamp.map(|ts| ts.to_rfc3339()),
                "market": t.market,
            })
        })
        .collect();

    Ok(Json(json!({ "positions": positions, "trades": trades })))
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub status: Option<String>,
    pub search: Option<String>,
    pub days: Option<i64>,
}

/// GET /api/copy/trades
pub async fn trades(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Value>> {
    let trades = state
        .store
        .list_trades(&TradeFilter {
            strategy: Some(Strategy::Copy),
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

/// GET /api/copy/stats
pub async fn stats(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Value>> {
    let stats = state
        .store
        .strategy_stats(&claims.sub, Strategy::Copy)
        .await
        .map_err(internal_error)?;
    let daily_spend = state
        .store
        .daily_executed_spend(&claims.sub, Strategy::Copy, None)
        .await
        .map_err(internal_error)?;

    Ok(Json(json!({
        "total_trades": stats.total_trades,
        "total_spent": stats.total_spent,
        "total_executed": stats.total_executed,
        "failed_trades": stats.failed_trades,
        "unique_traders_copied": stats.unique_traders_copied,
        "daily_spend": daily_spend,
        "daily_limit": state.config.max_daily_spend,
        "order_mode": state.config.order_mode.as_str(),
        "max_slippage": state.config.max_slippage,
    })))
}

/// GET /api/copy/pnl
pub async fn pnl(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Value>> {
    let series = state
        .store
        .pnl_series(&claims.sub, Some(Strategy::Copy), query.days.unwrap_or(30))
        .await
        .map_err(internal_error)?;
    Ok(Json(json!(series)))
}
